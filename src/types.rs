//! Shared data types: artifact identity, on-disk file segments, and peer
//! endpoints (§3 of the design).

use std::fmt;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use crate::error::P2pError;

/// Opaque, caller-chosen token identifying an artifact. Used as the
/// torrent's `name` field and as the single directory name under the
/// staging root, so it is validated once at every ingress point (HTTP path,
/// `TryP2PDownload` argument) rather than trusted implicitly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Validate and wrap a raw caller-supplied string.
    ///
    /// Rejects empty ids, leading `/`, any `..` path component, and control
    /// characters, matching the path-safety gate used on both ingress
    /// points (§4.5, §4.6, §9).
    pub fn parse(raw: &str) -> Result<Self, P2pError> {
        if raw.is_empty()
            || raw.starts_with('/')
            || raw.contains("..")
            || raw.chars().any(|c| c.is_control())
        {
            return Err(P2pError::PathUnsafe {
                raw: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve this id to its directory under the staging root, confirming
    /// the result canonicalises back underneath `data_dir` (§4.6, §9).
    pub fn staging_path(&self, data_dir: &Path) -> Result<PathBuf, P2pError> {
        let joined = data_dir.join(&self.0);
        let relative = joined.strip_prefix(data_dir).map_err(|_| P2pError::PathUnsafe {
            raw: self.0.clone(),
        })?;
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || relative.as_os_str().is_empty()
            || relative == Path::new(".")
        {
            return Err(P2pError::PathUnsafe {
                raw: self.0.clone(),
            });
        }
        Ok(joined)
    }

    pub fn torrent_cache_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.torrent", self.0))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single file within an artifact tree, located within the virtual
/// concatenated byte stream used for piece hashing (§3, §4.2).
#[derive(Clone, Debug)]
pub struct FileSegment {
    /// Absolute path on disk.
    pub absolute_path: PathBuf,
    /// Slash-joined relative path components, as they appear in the
    /// metainfo's file list.
    pub relative_components: Vec<String>,
    pub length: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl FileSegment {
    pub fn relative_path_string(&self) -> String {
        self.relative_components.join("/")
    }
}

/// A fleet peer discovered through DNS, never persisted (§3, §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub ip: IpAddr,
    pub torrent_port: u16,
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.torrent_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(ArtifactId::parse("llama-3-70b").is_ok());
        assert!(ArtifactId::parse("namespace/model-v2").is_ok());
    }

    #[test]
    fn rejects_traversal_and_control_chars() {
        assert!(ArtifactId::parse("../etc/passwd").is_err());
        assert!(ArtifactId::parse("/etc/passwd").is_err());
        assert!(ArtifactId::parse("a/../../b").is_err());
        assert!(ArtifactId::parse("bad\0id").is_err());
        assert!(ArtifactId::parse("").is_err());
    }

    #[test]
    fn staging_path_resolves_under_root() {
        let id = ArtifactId::parse("abc").unwrap();
        let root = Path::new("/data");
        assert_eq!(id.staging_path(root).unwrap(), PathBuf::from("/data/abc"));
    }
}
