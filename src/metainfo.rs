//! Metainfo builder and on-disk cache (§4.3), wire-encoded as bencode per
//! BEP-3 (§3, §6). The info dictionary always carries an explicit `files`
//! list — a one-entry list is never collapsed back to the flat `length`
//! form — so the builder and the parser share a single code path instead of
//! branching on single- vs multi-file artifacts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::P2pError;
use crate::hasher::{self, PIECE_LENGTH};
use crate::types::ArtifactId;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Info {
    pub files: Vec<FileEntry>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
}

impl Info {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// SHA-1 of the bencoded info dictionary exactly as produced — the
    /// info-hash that identifies the torrent in the swarm (§3).
    pub fn info_hash(&self) -> Result<[u8; 20], P2pError> {
        let encoded = serde_bencode::to_bytes(self)
            .map_err(|err| P2pError::InvalidConfig(format!("failed to bencode info dict: {err}")))?;
        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }
}

/// A complete torrent descriptor: the info dictionary, with no announce
/// list (§6 — peers are discovered from DNS, not trackers).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, P2pError> {
        serde_bencode::to_bytes(self)
            .map_err(|err| P2pError::InvalidConfig(format!("failed to bencode metainfo: {err}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, P2pError> {
        serde_bencode::from_bytes(bytes)
            .map_err(|err| P2pError::InvalidConfig(format!("failed to parse metainfo: {err}")))
    }

    /// Post-parse sanity checks shared by the exchange client (§4.5) and
    /// the swarm engine (§4.1) as a defense against corrupt or truncated
    /// transfers.
    pub fn validate(&self, id: &str) -> Result<(), P2pError> {
        let total_length = self.info.total_length();
        let piece_count = self.info.piece_count();
        if total_length == 0 || piece_count == 0 {
            return Err(P2pError::CorruptMetainfo { id: id.to_string() });
        }
        Ok(())
    }
}

/// Build the full metainfo for an on-disk artifact tree (§4.3, uses the
/// piece hasher, component A).
pub fn build(root: &Path, id: &ArtifactId) -> Result<Metainfo, P2pError> {
    let hashed = hasher::hash_artifact(root).map_err(|source| P2pError::PieceHash {
        id: id.to_string(),
        source,
    })?;

    let files = hashed
        .files
        .iter()
        .map(|segment| FileEntry {
            length: segment.length,
            path: segment.relative_components.clone(),
        })
        .collect();

    Ok(Metainfo {
        info: Info {
            files,
            name: id.to_string(),
            piece_length: hashed.piece_length,
            pieces: hashed.pieces,
        },
    })
}

/// Best-effort write of the `<D>/<id>.torrent` cache using a
/// write-then-rename pattern, so a reader never observes a partially
/// written file. Failure is logged but never fails the caller (§4.3, §7).
pub fn save_to_cache(data_dir: &Path, id: &ArtifactId, metainfo: &Metainfo) {
    if let Err(err) = try_save_to_cache(data_dir, id, metainfo) {
        warn!(artifact_id = %id, error = %err, "failed to cache metainfo; will regenerate on demand");
    }
}

fn try_save_to_cache(data_dir: &Path, id: &ArtifactId, metainfo: &Metainfo) -> Result<(), P2pError> {
    let bytes = metainfo.to_bytes()?;
    let final_path = id.torrent_cache_path(data_dir);
    let tmp_path = final_path.with_extension("torrent.tmp");
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, &final_path)?;
    debug!(artifact_id = %id, path = %final_path.display(), "cached metainfo");
    Ok(())
}

/// Load the cached metainfo for `id` if present. Absence is not an error;
/// a corrupt cache file is returned to the caller without attempting
/// regeneration (§4.3).
pub fn load_from_cache(data_dir: &Path, id: &ArtifactId) -> Result<Option<Metainfo>, P2pError> {
    let path = id.torrent_cache_path(data_dir);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(Metainfo::from_bytes(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(P2pError::Io(err)),
    }
}
