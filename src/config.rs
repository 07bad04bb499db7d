//! Typed, validated process configuration (§4.9, §6).
//!
//! [`Config`] is deserialisable from prefixed environment variables via
//! `envy`, or built directly as a struct literal in tests. Every field from
//! §6's configuration table lives here; [`Config::validate`] is always
//! called before a [`crate::distributor::Distributor`] may be constructed,
//! so a misconfigured process fails fast instead of misbehaving at the
//! first download.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::P2pError;

fn default_torrent_port() -> u16 {
    6881
}

fn default_metainfo_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

fn default_lease_duration_seconds() -> u64 {
    120
}

fn default_lease_renew_interval_seconds() -> u64 {
    30
}

fn default_p2p_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Staging root `D` under which artifact bytes and `.torrent` caches
    /// live.
    pub data_dir: PathBuf,

    /// Logical namespace; also used to scope metric labels and the
    /// `tracing` subscriber's default directive.
    pub namespace: String,

    pub pod_name: String,
    pub pod_ip: String,

    /// FQDN resolved to discover fleet peers. Optional: if unset,
    /// [`crate::discovery::Discovery::discover`] fails fast with
    /// `NoPeerService` rather than blocking on an empty lookup.
    #[serde(default)]
    pub peers_service: Option<String>,

    #[serde(default = "default_torrent_port")]
    pub torrent_port: u16,
    #[serde(default = "default_metainfo_port")]
    pub metainfo_port: u16,

    #[serde(default)]
    pub max_download_rate: i64,
    #[serde(default)]
    pub max_upload_rate: i64,

    #[serde(default)]
    pub enable_encryption: bool,
    #[serde(default)]
    pub require_encryption: bool,

    #[serde(default = "default_lease_duration_seconds")]
    pub lease_duration_seconds: u64,
    #[serde(default = "default_lease_renew_interval_seconds")]
    pub lease_renew_interval_seconds: u64,
    #[serde(default = "default_p2p_timeout_seconds")]
    pub p2p_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub enable_p2p: bool,
}

impl Config {
    /// Load configuration from environment variables prefixed
    /// `<NAMESPACE>_P2P_`-independent `P2P_` (e.g. `P2P_DATA_DIR`), then
    /// validate it.
    pub fn from_env() -> Result<Self, P2pError> {
        let config: Config = envy::prefixed("P2P_")
            .from_env()
            .map_err(|err| P2pError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Construction-time validation (§4.9, §8 property 7). Every invalid
    /// config named in the design is rejected here, synchronously, before
    /// any I/O happens.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(P2pError::InvalidConfig("data_dir must not be empty".into()));
        }
        if self.namespace.is_empty() {
            return Err(P2pError::InvalidConfig("namespace must not be empty".into()));
        }
        if self.pod_name.is_empty() {
            return Err(P2pError::InvalidConfig("pod_name must not be empty".into()));
        }
        if self.pod_ip.is_empty() {
            return Err(P2pError::InvalidConfig("pod_ip must not be empty".into()));
        }
        if self.torrent_port == self.metainfo_port {
            return Err(P2pError::InvalidConfig(
                "torrent_port and metainfo_port must differ".into(),
            ));
        }
        if self.torrent_port == 0 || self.metainfo_port == 0 {
            return Err(P2pError::InvalidConfig(
                "torrent_port and metainfo_port must be in 1..65535".into(),
            ));
        }
        if self.max_download_rate < 0 || self.max_upload_rate < 0 {
            return Err(P2pError::InvalidConfig(
                "rate limits must not be negative".into(),
            ));
        }
        if self.lease_duration_seconds == 0 {
            return Err(P2pError::InvalidConfig(
                "lease_duration_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            data_dir: PathBuf::from("/var/lib/p2p"),
            namespace: "fleet".into(),
            pod_name: "pod-0".into(),
            pod_ip: "10.0.0.1".into(),
            peers_service: Some("fleet-peers.default.svc".into()),
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

    #[test]
    fn accepts_a_sane_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_empty_data_dir() {
        let mut config = base();
        config.data_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_matching_ports() {
        let mut config = base();
        config.metainfo_port = config.torrent_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut config = base();
        config.torrent_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_rate() {
        let mut config = base();
        config.max_upload_rate = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_lease_duration() {
        let mut config = base();
        config.lease_duration_seconds = 0;
        assert!(config.validate().is_err());
    }
}
