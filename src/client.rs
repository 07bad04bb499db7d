//! Metainfo exchange client (§4.5): fetch a torrent descriptor from the
//! first peer in discovery order that can serve one. Bounded per-peer
//! deadlines and idle-connection limits keep a silent peer from stalling
//! the whole discovery round (§5).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::error::P2pError;
use crate::metainfo::Metainfo;
use crate::types::{ArtifactId, PeerEndpoint};

/// Recommended per-peer deadline (§4.5): a 1 TB artifact's metainfo can
/// approach several MB, so this is generous relative to the overall
/// caller-supplied deadline that still bounds the whole operation.
const PER_PEER_TIMEOUT: Duration = Duration::from_secs(120);

pub fn build_http_client() -> Result<reqwest::Client, P2pError> {
    reqwest::Client::builder()
        .timeout(PER_PEER_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|err| P2pError::InvalidConfig(format!("failed to build http client: {err}")))
}

/// Iterate `peers` in discovery order, returning the first metainfo that
/// parses and validates. Fails with `NoMetainfo` once every peer has been
/// tried.
pub async fn fetch_metainfo(
    client: &reqwest::Client,
    config: &Config,
    peers: &[PeerEndpoint],
    id: &ArtifactId,
    cancellation: &CancellationToken,
) -> Result<Metainfo, P2pError> {
    let mut last_cause = "no peers were offered".to_string();

    for peer in peers {
        if cancellation.is_cancelled() {
            return Err(P2pError::Cancelled);
        }

        let url = format!(
            "http://{}:{}/metainfo/{}",
            peer.ip,
            config.metainfo_port,
            id.as_str()
        );

        match fetch_one(client, &url).await {
            Ok(metainfo) => match metainfo.validate(id.as_str()) {
                Ok(()) => return Ok(metainfo),
                Err(err) => {
                    debug!(peer = %peer, artifact_id = %id, error = %err, "peer served invalid metainfo");
                    last_cause = err.to_string();
                }
            },
            Err(cause) => {
                debug!(peer = %peer, artifact_id = %id, %cause, "peer could not serve metainfo");
                last_cause = cause;
            }
        }
    }

    Err(P2pError::NoMetainfo {
        id: id.to_string(),
        cause: last_cause,
    })
}

async fn fetch_one(client: &reqwest::Client, url: &str) -> Result<Metainfo, String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| format!("transport error: {err}"))?;

    if !response.status().is_success() {
        return Err(format!("peer responded with status {}", response.status()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| format!("failed to read response body: {err}"))?;

    Metainfo::from_bytes(&bytes).map_err(|err| format!("failed to parse metainfo: {err}"))
}
