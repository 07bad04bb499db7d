//! Peer discovery (§4.4): DNS is the only source of peer identity. A
//! headless-service FQDN resolves to the IP of every fleet member; the
//! local pod's own IP is filtered out; everything else is assumed to run
//! an instance of this same core (§6 DNS contract).

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::error::P2pError;
use crate::types::PeerEndpoint;

/// Resolve the configured peers service through a context-aware resolver
/// so cancellation propagates, then filter out the local pod.
///
/// An empty result is not an error — the caller (the distributor facade)
/// is the one that turns "zero peers" into `NoPeers`.
#[instrument(skip_all, fields(peers_service = config.peers_service.as_deref().unwrap_or("")))]
pub async fn discover(
    config: &Config,
    cancellation: &CancellationToken,
) -> Result<Vec<PeerEndpoint>, P2pError> {
    let Some(service) = config.peers_service.as_deref() else {
        return Err(P2pError::NoPeerService);
    };

    let lookup_target = format!("{service}:{}", config.torrent_port);
    let resolved = tokio::select! {
        () = cancellation.cancelled() => return Err(P2pError::Cancelled),
        result = tokio::net::lookup_host(lookup_target) => {
            result.map_err(P2pError::DnsFailed)?
        }
    };

    let self_ip: Option<IpAddr> = config.pod_ip.parse().ok();
    let peers: Vec<PeerEndpoint> = resolved
        .filter(|addr| self_ip.map(|self_ip| addr.ip() != self_ip).unwrap_or(true))
        .map(|addr| PeerEndpoint {
            ip: addr.ip(),
            torrent_port: config.torrent_port,
        })
        .collect();

    debug!(peer_count = peers.len(), "discovered fleet peers");
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            data_dir: PathBuf::from("/var/lib/p2p"),
            namespace: "fleet".into(),
            pod_name: "pod-0".into(),
            pod_ip: "10.0.0.1".into(),
            peers_service: None,
            torrent_port: 6881,
            metainfo_port: 8081,
            max_download_rate: 0,
            max_upload_rate: 0,
            enable_encryption: false,
            require_encryption: false,
            lease_duration_seconds: 120,
            lease_renew_interval_seconds: 30,
            p2p_timeout_seconds: 30,
            enable_p2p: true,
        }
    }

    #[tokio::test]
    async fn unconfigured_service_fails_fast() {
        let config = base_config();
        let token = CancellationToken::new();
        let err = discover(&config, &token).await.unwrap_err();
        assert!(matches!(err, P2pError::NoPeerService));
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_resolving() {
        let mut config = base_config();
        config.peers_service = Some("fleet-peers.default.svc.cluster.local".into());
        let token = CancellationToken::new();
        token.cancel();
        let err = discover(&config, &token).await.unwrap_err();
        assert!(matches!(err, P2pError::Cancelled));
    }
}
