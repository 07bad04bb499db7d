//! Distributor facade (§4.7) — the public contract of the core. Every
//! method short-circuits to `P2pDisabled` when `EnableP2P` is false,
//! without touching discovery, the swarm engine, or the active-torrent
//! map, so a caller that falls back to an origin store on any facade
//! error gets that fallback for free.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::client;
use crate::config::Config;
use crate::discovery;
use crate::error::P2pError;
use crate::metainfo::{self, Metainfo};
use crate::metrics;
use crate::swarm::{ActiveTorrents, SwarmClient};
use crate::types::ArtifactId;

pub struct Stats {
    pub active_torrents: usize,
    pub total_bytes_uploaded: u64,
    pub total_bytes_downloaded: u64,
    pub active_peers: usize,
}

pub struct Distributor {
    config: Config,
    swarm: Arc<dyn SwarmClient>,
    active: ActiveTorrents,
    http_client: reqwest::Client,
}

impl Distributor {
    pub fn new(config: Config, swarm: Arc<dyn SwarmClient>) -> Self {
        let http_client = client::build_http_client().expect("default http client config is always valid");
        Self {
            config,
            swarm,
            active: ActiveTorrents::new(),
            http_client,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Try to obtain `id` from fleet peers and place the verified result at
    /// `dest_path` (§4.7).
    #[instrument(skip(self, cancellation), fields(artifact_id = %id))]
    pub async fn try_p2p_download(
        &self,
        id: &ArtifactId,
        dest_path: &std::path::Path,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<(), P2pError> {
        if !self.config.enable_p2p {
            return Err(P2pError::P2pDisabled);
        }
        if cancellation.is_cancelled() {
            return Err(P2pError::Cancelled);
        }

        let started = Instant::now();
        metrics::download_started(&self.config.namespace, "p2p", id.as_str());

        let result = self.try_p2p_download_inner(id, dest_path, timeout, cancellation).await;

        match &result {
            Ok(()) => {
                metrics::download_completed(&self.config.namespace, "p2p", id.as_str(), started.elapsed());
            }
            Err(err) => {
                metrics::download_failed(&self.config.namespace, id.as_str(), err.metric_reason());
            }
        }
        result
    }

    async fn try_p2p_download_inner(
        &self,
        id: &ArtifactId,
        dest_path: &std::path::Path,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<(), P2pError> {
        let peers = discovery::discover(&self.config, cancellation).await?;
        if peers.is_empty() {
            return Err(P2pError::NoPeers { id: id.to_string() });
        }
        metrics::peers_discovered(&self.config.namespace, id.as_str(), peers.len());

        let metainfo = client::fetch_metainfo(&self.http_client, &self.config, &peers, id, cancellation).await?;

        let handle = self.swarm.add_torrent(&metainfo).await?;

        tokio::select! {
            () = cancellation.cancelled() => {
                handle.stop();
                return Err(P2pError::Cancelled);
            }
            result = handle.wait_got_info() => result?,
        }

        if metainfo.info.total_length() == 0 || metainfo.info.piece_count() == 0 {
            handle.stop();
            return Err(P2pError::CorruptMetainfo { id: id.to_string() });
        }

        handle.add_peers(&peers)?;

        // Registration happens BEFORE DownloadAll so this pod can reshare
        // pieces as soon as they verify, not only after the whole artifact
        // completes (§4.7, §5).
        self.active.register(id.clone(), handle.clone())?;
        metrics::peers_connected(&self.config.namespace, id.as_str(), peers.len());

        if let Err(err) = handle.download_all() {
            self.active.drop_one(id);
            handle.stop();
            return Err(err);
        }

        let deadline = Duration::min(timeout, Duration::from_secs(self.config.p2p_timeout_seconds));
        let wait_result = tokio::select! {
            () = cancellation.cancelled() => Err(P2pError::Cancelled),
            result = tokio::time::timeout(deadline, handle.wait_complete()) => match result {
                Ok(inner) => inner,
                Err(_) => Err(P2pError::Incomplete { id: id.to_string() }),
            },
        };

        if let Err(err) = wait_result {
            self.active.drop_one(id);
            handle.stop();
            return Err(err);
        }

        self.relocate(id, dest_path);
        self.refresh_seeding_gauge();
        Ok(())
    }

    fn relocate(&self, id: &ArtifactId, dest_path: &std::path::Path) {
        let staging_path = match id.staging_path(&self.config.data_dir) {
            Ok(path) => path,
            Err(err) => {
                warn!(artifact_id = %id, error = %err, "refusing to relocate path-unsafe id");
                return;
            }
        };

        if let Err(err) = self.try_relocate(&staging_path, dest_path) {
            warn!(artifact_id = %id, error = %err, "failed to relocate downloaded artifact into place");
        }
    }

    fn try_relocate(&self, staging_path: &std::path::Path, dest_path: &std::path::Path) -> Result<(), std::io::Error> {
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest_path.exists() {
            if dest_path.is_dir() {
                std::fs::remove_dir_all(dest_path)?;
            } else {
                std::fs::remove_file(dest_path)?;
            }
        }
        std::fs::rename(staging_path, dest_path)?;

        #[cfg(unix)]
        {
            if let Err(err) = std::os::unix::fs::symlink(dest_path, staging_path) {
                warn!(error = %err, "failed to recreate back-seeding symlink after relocation");
            }
        }
        Ok(())
    }

    /// Seed an existing local artifact tree (§4.7). Idempotent: a second
    /// call for an id already active succeeds without rebuilding metainfo.
    #[instrument(skip(self), fields(artifact_id = %id))]
    pub async fn seed_model(&self, path: &std::path::Path, id: &ArtifactId) -> Result<(), P2pError> {
        if !self.config.enable_p2p {
            return Err(P2pError::P2pDisabled);
        }
        if self.active.is_active(id) {
            return Ok(());
        }

        let staging_path = id.staging_path(&self.config.data_dir)?;
        if let Some(parent) = staging_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        replace_with_symlink(path, &staging_path)?;

        let built = metainfo::build(path, id)?;
        metainfo::save_to_cache(&self.config.data_dir, id, &built);

        let handle = self.swarm.add_torrent(&built).await?;
        handle.wait_got_info().await?;

        match self.active.register(id.clone(), handle.clone()) {
            Ok(()) => {
                metrics::seeding_torrents(&self.config.namespace, self.active.len());
                Ok(())
            }
            Err(P2pError::AlreadyActive { .. }) => {
                // A sibling call won the race; ours is a no-op success (§9
                // open question: first winner wins, second is a no-op).
                handle.stop();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Stop seeding `id`; a no-op if it is not active (§4.7).
    #[instrument(skip(self), fields(artifact_id = %id))]
    pub fn stop_seeding(&self, id: &ArtifactId) {
        if let Some(handle) = self.active.drop_one(id) {
            handle.stop();
            self.refresh_seeding_gauge();
        }
    }

    /// Probe whether any peer currently has `id` (§4.7). Cancellation is
    /// treated as "false", never surfaced as an error.
    pub async fn has_peers(&self, id: &ArtifactId, cancellation: &CancellationToken) -> bool {
        if !self.config.enable_p2p {
            return false;
        }
        if cancellation.is_cancelled() {
            return false;
        }
        let peers = match discovery::discover(&self.config, cancellation).await {
            Ok(peers) => peers,
            Err(_) => return false,
        };
        if peers.is_empty() {
            return false;
        }
        client::fetch_metainfo(&self.http_client, &self.config, &peers, id, cancellation)
            .await
            .is_ok()
    }

    pub fn get_metainfo(&self, id: &ArtifactId) -> Result<Option<Metainfo>, P2pError> {
        if !self.config.enable_p2p {
            return Err(P2pError::P2pDisabled);
        }
        if let Some(handle) = self.active.lookup(id) {
            return Ok(Some(Metainfo::from_bytes(&handle.metainfo_bytes()?)?));
        }
        metainfo::load_from_cache(&self.config.data_dir, id)
    }

    pub fn active_metainfo_bytes(&self, id: &ArtifactId) -> Option<Vec<u8>> {
        self.active.lookup(id).and_then(|handle| handle.metainfo_bytes().ok())
    }

    pub fn is_seeding(&self, id: &ArtifactId) -> bool {
        self.config.enable_p2p && self.active.is_active(id)
    }

    pub fn aggregate_stats(&self) -> Stats {
        let snapshot = self.active.snapshot_stats();
        let total_bytes_uploaded = snapshot.iter().map(|(_, s)| s.bytes_written).sum();
        let total_bytes_downloaded = snapshot.iter().map(|(_, s)| s.bytes_read).sum();
        let active_peers = snapshot.iter().map(|(_, s)| s.active_peers).sum();
        Stats {
            active_torrents: snapshot.len(),
            total_bytes_uploaded,
            total_bytes_downloaded,
            active_peers,
        }
    }

    pub fn get_stats(&self) -> Stats {
        self.aggregate_stats()
    }

    pub fn get_data_dir(&self) -> PathBuf {
        self.config.data_dir.clone()
    }

    /// Drop every active torrent; called once at process shutdown (§4.7).
    pub fn close(&self) {
        for id in self.active.ids() {
            if let Some(handle) = self.active.drop_one(&id) {
                handle.stop();
            }
        }
    }

    fn refresh_seeding_gauge(&self) {
        metrics::seeding_torrents(&self.config.namespace, self.active.len());
    }
}

fn replace_with_symlink(target: &std::path::Path, link: &std::path::Path) -> Result<(), std::io::Error> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(link)?,
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(link)?,
        Ok(_) => std::fs::remove_file(link)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        std::os::windows::fs::symlink_dir(target, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{FileEntry, Info};
    use crate::swarm::test_support::{MockSwarmClient, MockSwarmHandle};
    use std::io::Write;
    use tempfile::tempdir;

    fn base_config(data_dir: PathBuf, enable_p2p: bool) -> Config {
        Config {
            data_dir,
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
            enable_p2p,
        }
    }

    #[tokio::test]
    async fn p2p_disabled_short_circuits_without_discovery() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path().to_path_buf(), false);
        let swarm = MockSwarmClient::new();
        let distributor = Distributor::new(config, swarm);

        let id = ArtifactId::parse("abc").unwrap();
        let token = CancellationToken::new();
        let err = distributor
            .try_p2p_download(&id, &dir.path().join("out"), Duration::from_secs(1), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::P2pDisabled));
        assert!(!distributor.has_peers(&id, &token).await);
    }

    #[tokio::test]
    async fn try_download_with_no_peers_fails_fast() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path().to_path_buf(), true);
        let swarm = MockSwarmClient::new();
        let distributor = Distributor::new(config, swarm);

        let id = ArtifactId::parse("abc").unwrap();
        let token = CancellationToken::new();
        let err = distributor
            .try_p2p_download(&id, &dir.path().join("out"), Duration::from_secs(1), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::NoPeers { .. }));
    }

    #[tokio::test]
    async fn seed_model_is_idempotent() {
        let data_dir = tempdir().unwrap();
        let artifact_dir = tempdir().unwrap();
        std::fs::File::create(artifact_dir.path().join("w.bin"))
            .unwrap()
            .write_all(b"weights")
            .unwrap();

        let config = base_config(data_dir.path().to_path_buf(), true);
        let swarm = MockSwarmClient::new();
        let distributor = Distributor::new(config, swarm);

        let id = ArtifactId::parse("model-a").unwrap();
        distributor.seed_model(artifact_dir.path(), &id).await.unwrap();
        assert!(distributor.is_seeding(&id));
        distributor.seed_model(artifact_dir.path(), &id).await.unwrap();
        assert_eq!(distributor.aggregate_stats().active_torrents, 1);
    }

    #[tokio::test]
    async fn get_metainfo_is_absent_until_seeded() {
        let data_dir = tempdir().unwrap();
        let artifact_dir = tempdir().unwrap();
        std::fs::File::create(artifact_dir.path().join("w.bin"))
            .unwrap()
            .write_all(b"weights")
            .unwrap();

        let config = base_config(data_dir.path().to_path_buf(), true);
        let swarm = MockSwarmClient::new();
        let distributor = Distributor::new(config, swarm);

        let id = ArtifactId::parse("model-b").unwrap();
        assert!(distributor.get_metainfo(&id).unwrap().is_none());

        distributor.seed_model(artifact_dir.path(), &id).await.unwrap();
        let fetched = distributor.get_metainfo(&id).unwrap().unwrap();
        assert!(fetched.info.total_length() > 0);
    }

    #[test]
    fn stop_seeding_absent_id_is_a_no_op() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path().to_path_buf(), true);
        let swarm = MockSwarmClient::new();
        let distributor = Distributor::new(config, swarm);
        let id = ArtifactId::parse("never-seeded").unwrap();
        distributor.stop_seeding(&id);
    }
}
