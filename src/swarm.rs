//! Swarm engine (§4.1, §9): a narrow trait wrapping the BitTorrent
//! wire-protocol library so the core never implements peer framing,
//! choking, or request pipelining itself — those concerns are licensed out
//! to `librqbit`, exactly as a from-scratch client would license out its
//! handshake and message codec. The trait boundary also lets tests swap in
//! a double with no real socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::error::P2pError;
use crate::metainfo::Metainfo;
use crate::types::{ArtifactId, PeerEndpoint};

#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub active_peers: usize,
}

/// One running torrent session, as handed back by [`SwarmClient::add_torrent`].
#[async_trait]
pub trait SwarmHandle: Send + Sync {
    /// Wait for the `info` dictionary to be known. Immediate whenever
    /// `add_torrent` was given a complete metainfo, which is always true
    /// here (§4.1).
    async fn wait_got_info(&self) -> Result<(), P2pError>;

    /// Manually introduce peers. Only valid once info has been acquired.
    fn add_peers(&self, peers: &[PeerEndpoint]) -> Result<(), P2pError>;

    /// Start pulling every piece.
    fn download_all(&self) -> Result<(), P2pError>;

    /// Level-triggered wait for every piece to be verified present on
    /// disk. Callers layer their own deadline around this with
    /// `tokio::time::timeout` (§5) rather than this trait polling.
    async fn wait_complete(&self) -> Result<(), P2pError>;

    /// Cease participation and forget pieces.
    fn stop(&self);

    /// The canonical serialised metainfo bytes for this handle — the
    /// info-hash of which equals the hash under which the torrent was
    /// added. Never re-derived from a freshly built `Info` (§4.6, §9).
    fn metainfo_bytes(&self) -> Result<Vec<u8>, P2pError>;

    fn stats(&self) -> SwarmStats;
}

/// Construct swarm sessions bound to a fixed TCP port, rooted at the
/// staging directory, with DHT and external trackers disabled (§4.1).
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Idempotent per info-hash on the underlying library; the crate's own
    /// idempotency (one handle per `ArtifactId`) is enforced one layer up,
    /// by [`ActiveTorrents::register`].
    async fn add_torrent(&self, metainfo: &Metainfo) -> Result<Arc<dyn SwarmHandle>, P2pError>;
}

/// `librqbit`-backed implementation of [`SwarmClient`] (§9): the sibling
/// tooling this codebase already depends on for the BitTorrent engine,
/// wrapped behind the trait above rather than used directly anywhere else
/// in the crate.
pub struct LibrqbitSwarmClient {
    session: Arc<librqbit::Session>,
}

impl LibrqbitSwarmClient {
    pub async fn new(config: &Config) -> Result<Self, P2pError> {
        let opts = librqbit::SessionOptions {
            disable_dht: true,
            disable_dht_persistence: true,
            persistence: None,
            listen_port: Some(config.torrent_port),
            enable_upnp_port_forwarding: false,
            download_bps_limit: non_zero_rate(config.max_download_rate),
            upload_bps_limit: non_zero_rate(config.max_upload_rate),
            ..Default::default()
        };

        let session = librqbit::Session::new_with_opts(config.data_dir.clone(), opts)
            .await
            .map_err(|err| P2pError::InvalidConfig(format!("failed to start swarm engine: {err}")))?;

        info!(port = config.torrent_port, data_dir = %config.data_dir.display(), "swarm engine listening");
        Ok(Self { session })
    }
}

fn non_zero_rate(rate: i64) -> Option<u32> {
    if rate > 0 {
        Some(rate as u32)
    } else {
        None
    }
}

#[async_trait]
impl SwarmClient for LibrqbitSwarmClient {
    async fn add_torrent(&self, metainfo: &Metainfo) -> Result<Arc<dyn SwarmHandle>, P2pError> {
        let name = metainfo.info.name.clone();
        let bytes = metainfo.to_bytes()?;

        let response = self
            .session
            .add_torrent(
                librqbit::AddTorrent::from_bytes(bytes),
                Some(librqbit::AddTorrentOptions {
                    paused: true,
                    overwrite: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|source| P2pError::SwarmAdd {
                id: name.clone(),
                source,
            })?;

        let handle = response.into_handle().ok_or_else(|| P2pError::SwarmAdd {
            id: name,
            source: anyhow::anyhow!("swarm engine returned a list-only response for a full metainfo add"),
        })?;

        Ok(Arc::new(LibrqbitHandle { handle }))
    }
}

struct LibrqbitHandle {
    handle: librqbit::ManagedTorrentHandle,
}

#[async_trait]
impl SwarmHandle for LibrqbitHandle {
    async fn wait_got_info(&self) -> Result<(), P2pError> {
        self.handle
            .wait_until_initialized()
            .await
            .map_err(|source| P2pError::SwarmAdd {
                id: self.handle.info_hash().as_string(),
                source,
            })
    }

    fn add_peers(&self, peers: &[PeerEndpoint]) -> Result<(), P2pError> {
        for peer in peers {
            self.handle
                .add_peer(SocketAddr::new(peer.ip, peer.torrent_port));
        }
        Ok(())
    }

    fn download_all(&self) -> Result<(), P2pError> {
        self.handle.start(true);
        Ok(())
    }

    async fn wait_complete(&self) -> Result<(), P2pError> {
        self.handle
            .wait_until_completed()
            .await
            .map_err(|source| P2pError::SwarmAdd {
                id: self.handle.info_hash().as_string(),
                source,
            })
    }

    fn stop(&self) {
        self.handle.forget();
    }

    fn metainfo_bytes(&self) -> Result<Vec<u8>, P2pError> {
        Ok(self.handle.metadata_bytes())
    }

    fn stats(&self) -> SwarmStats {
        let stats = self.handle.stats();
        SwarmStats {
            bytes_read: stats.downloaded_bytes,
            bytes_written: stats.uploaded_bytes,
            active_peers: stats.live_peers as usize,
        }
    }
}

/// The only shared mutable core state (§5, §9): `ArtifactId` → running
/// torrent handle. Locks stay inside this wrapper; callers never see the
/// bare map, only its four operations. Lookups take the read lock;
/// insertions and removals take the write lock. No I/O happens while
/// either lock is held.
pub struct ActiveTorrents {
    entries: RwLock<HashMap<ArtifactId, Arc<dyn SwarmHandle>>>,
}

impl ActiveTorrents {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert `handle` under `id`. Fails with `AlreadyActive` if another
    /// handle is already registered for this id — the caller decides
    /// whether that is an error (internal double-registration, §7) or
    /// success (idempotent `SeedModel`, §4.7).
    pub fn register(&self, id: ArtifactId, handle: Arc<dyn SwarmHandle>) -> Result<(), P2pError> {
        let mut entries = self.entries.write().expect("active-torrent lock poisoned");
        if entries.contains_key(&id) {
            return Err(P2pError::AlreadyActive { id: id.to_string() });
        }
        entries.insert(id, handle);
        Ok(())
    }

    pub fn drop_one(&self, id: &ArtifactId) -> Option<Arc<dyn SwarmHandle>> {
        self.entries
            .write()
            .expect("active-torrent lock poisoned")
            .remove(id)
    }

    pub fn lookup(&self, id: &ArtifactId) -> Option<Arc<dyn SwarmHandle>> {
        self.entries
            .read()
            .expect("active-torrent lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn is_active(&self, id: &ArtifactId) -> bool {
        self.entries
            .read()
            .expect("active-torrent lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("active-torrent lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time snapshot of every active id and its stats, used by
    /// `/stats` and `GetStats` (§4.6, §4.7). Taken entirely under the read
    /// lock but the per-handle `.stats()` call itself performs no I/O.
    pub fn snapshot_stats(&self) -> Vec<(ArtifactId, SwarmStats)> {
        self.entries
            .read()
            .expect("active-torrent lock poisoned")
            .iter()
            .map(|(id, handle)| (id.clone(), handle.stats()))
            .collect()
    }

    pub fn ids(&self) -> Vec<ArtifactId> {
        self.entries
            .read()
            .expect("active-torrent lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for ActiveTorrents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory [`SwarmHandle`] double: no socket, no library, just enough
    /// state for the distributor facade's control flow to be exercised
    /// (§9 "swarm-library abstraction").
    pub struct MockSwarmHandle {
        pub metainfo: Metainfo,
        pub completes: AtomicBool,
        pub peers_added: Mutex<Vec<PeerEndpoint>>,
        pub downloads_started: AtomicBool,
        pub stopped: AtomicBool,
        pub bytes_written: AtomicU64,
    }

    impl MockSwarmHandle {
        pub fn new(metainfo: Metainfo, completes: bool) -> Arc<Self> {
            Arc::new(Self {
                metainfo,
                completes: AtomicBool::new(completes),
                peers_added: Mutex::new(Vec::new()),
                downloads_started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                bytes_written: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl SwarmHandle for MockSwarmHandle {
        async fn wait_got_info(&self) -> Result<(), P2pError> {
            Ok(())
        }

        fn add_peers(&self, peers: &[PeerEndpoint]) -> Result<(), P2pError> {
            self.peers_added.lock().unwrap().extend_from_slice(peers);
            Ok(())
        }

        fn download_all(&self) -> Result<(), P2pError> {
            self.downloads_started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_complete(&self) -> Result<(), P2pError> {
            if self.completes.load(Ordering::SeqCst) {
                Ok(())
            } else {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn metainfo_bytes(&self) -> Result<Vec<u8>, P2pError> {
            self.metainfo.to_bytes()
        }

        fn stats(&self) -> SwarmStats {
            SwarmStats {
                bytes_read: 0,
                bytes_written: self.bytes_written.load(Ordering::SeqCst),
                active_peers: self.peers_added.lock().unwrap().len(),
            }
        }
    }

    pub struct MockSwarmClient {
        pub handles: Mutex<HashMap<String, Arc<MockSwarmHandle>>>,
    }

    impl MockSwarmClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                handles: Mutex::new(HashMap::new()),
            })
        }

        pub fn preset(&self, id: &str, handle: Arc<MockSwarmHandle>) {
            self.handles.lock().unwrap().insert(id.to_string(), handle);
        }
    }

    #[async_trait]
    impl SwarmClient for MockSwarmClient {
        async fn add_torrent(&self, metainfo: &Metainfo) -> Result<Arc<dyn SwarmHandle>, P2pError> {
            let mut handles = self.handles.lock().unwrap();
            let handle = handles
                .entry(metainfo.info.name.clone())
                .or_insert_with(|| MockSwarmHandle::new(metainfo.clone(), true))
                .clone();
            Ok(handle as Arc<dyn SwarmHandle>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::metainfo::{FileEntry, Info};

    fn sample_metainfo(name: &str) -> Metainfo {
        Metainfo {
            info: Info {
                files: vec![FileEntry {
                    length: 10,
                    path: vec!["a.bin".into()],
                }],
                name: name.into(),
                piece_length: crate::hasher::PIECE_LENGTH,
                pieces: vec![0u8; 20],
            },
        }
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let active = ActiveTorrents::new();
        let id = ArtifactId::parse("abc").unwrap();
        let handle = MockSwarmHandle::new(sample_metainfo("abc"), true);
        active.register(id.clone(), handle.clone()).unwrap();
        let err = active.register(id, handle).unwrap_err();
        assert!(matches!(err, P2pError::AlreadyActive { .. }));
    }

    #[test]
    fn drop_removes_from_map() {
        let active = ActiveTorrents::new();
        let id = ArtifactId::parse("abc").unwrap();
        let handle = MockSwarmHandle::new(sample_metainfo("abc"), true);
        active.register(id.clone(), handle).unwrap();
        assert!(active.is_active(&id));
        assert!(active.drop_one(&id).is_some());
        assert!(!active.is_active(&id));
    }
}
