//! Crate-wide error taxonomy (§4.10, §7).
//!
//! A single [`P2pError`] enum carries one variant per error kind named in
//! the design. Every variant that wraps a lower-level cause derives its
//! `#[source]`/`#[from]` link from `thiserror` so the chain survives to the
//! log line, and conversions happen at the boundary where the cause is
//! first observed rather than deeper in the call stack.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no peers available for artifact {id}")]
    NoPeers { id: String },

    #[error("no peer served usable metainfo for artifact {id}: {cause}")]
    NoMetainfo { id: String, cause: String },

    #[error("metainfo for artifact {id} failed validation (zero length or zero pieces)")]
    CorruptMetainfo { id: String },

    #[error("swarm engine rejected artifact {id}")]
    SwarmAdd {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("artifact {id} is already active")]
    AlreadyActive { id: String },

    #[error("download of artifact {id} did not complete before the deadline")]
    Incomplete { id: String },

    #[error("failed to relocate artifact {id} into place")]
    Relocate {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to hash pieces for artifact {id}")]
    PieceHash {
        id: String,
        #[source]
        source: PieceHashError,
    },

    #[error("artifact id {raw:?} is not path-safe")]
    PathUnsafe { raw: String },

    #[error("p2p distribution is disabled by configuration")]
    P2pDisabled,

    #[error("peers service is not configured")]
    NoPeerService,

    #[error("DNS lookup of the peers service failed")]
    DnsFailed(#[source] std::io::Error),

    #[error("request was cancelled before completion")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl P2pError {
    /// Label used for the `reason` dimension of `download_failures_total`
    /// (§6, §7) — one stable short token per variant, never the `Display`
    /// message (which may embed user-controlled data).
    pub fn metric_reason(&self) -> &'static str {
        match self {
            P2pError::InvalidConfig(_) => "invalid_config",
            P2pError::NoPeers { .. } => "no_peers",
            P2pError::NoMetainfo { .. } => "no_metainfo",
            P2pError::CorruptMetainfo { .. } => "corrupt_metainfo",
            P2pError::SwarmAdd { .. } => "swarm_add",
            P2pError::AlreadyActive { .. } => "already_active",
            P2pError::Incomplete { .. } => "incomplete",
            P2pError::Relocate { .. } => "relocate",
            P2pError::PieceHash { .. } => "piece_hash",
            P2pError::PathUnsafe { .. } => "path_unsafe",
            P2pError::P2pDisabled => "p2p_disabled",
            P2pError::NoPeerService => "no_peer_service",
            P2pError::DnsFailed(_) => "dns_failed",
            P2pError::Cancelled => "cancelled",
            P2pError::Io(_) => "io",
        }
    }
}

/// Failure modes of the piece hasher (§4.2 step 6): any short read is fatal
/// for the whole build, as is an artifact tree with no files.
#[derive(Error, Debug)]
pub enum PieceHashError {
    #[error("artifact tree at {0:?} contains no files")]
    EmptyArtifact(PathBuf),

    #[error(
        "short read in {path:?} while hashing piece {piece}: expected {expected} bytes, got {actual}"
    )]
    ShortRead {
        path: PathBuf,
        piece: usize,
        expected: usize,
        actual: usize,
    },

    #[error("failed to walk artifact tree at {root:?}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
