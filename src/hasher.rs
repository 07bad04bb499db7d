//! Parallel piece hashing (§4.2) — the hardest subsystem.
//!
//! A piece can straddle a file boundary, so hashing per-file in parallel is
//! wrong: the hash of piece `k` may depend on bytes from two or more files.
//! This module instead hands out *piece indices* to a small scoped worker
//! pool over a bounded queue behind a shared receiver — the same job-queue
//! idiom as a generic thread-pool map, specialised here so each worker can
//! keep a reusable piece-sized buffer and abort early without losing the
//! first error.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::error::PieceHashError;
use crate::types::FileSegment;

/// Fixed piece length for every artifact (§3): large enough that even a
/// 1 TB artifact's metainfo stays a few MB, small enough to keep swarm
/// parallelism healthy.
pub const PIECE_LENGTH: u64 = 4 * 1024 * 1024;

/// Maximum hash worker count, independent of hardware parallelism and
/// piece count (§4.2 step 4, §5).
const MAX_WORKERS: usize = 16;

pub struct HashedArtifact {
    pub files: Vec<FileSegment>,
    pub total_length: u64,
    pub piece_length: u64,
    pub pieces: Vec<u8>,
}

/// Walk `root`, hash every piece of the virtual concatenated byte stream in
/// parallel, and return the resulting file table and piece digests.
///
/// The output is bit-identical to a sequential reference implementation
/// using the same sort order and piece length (§8 property 1) — the only
/// thing parallelism changes is which worker computes which piece, never
/// the bytes fed into any one piece's hash.
pub fn hash_artifact(root: &Path) -> Result<HashedArtifact, PieceHashError> {
    let files = collect_files(root)?;
    let total_length: u64 = files.iter().map(|f| f.length).sum();
    if total_length == 0 {
        return Err(PieceHashError::EmptyArtifact(root.to_path_buf()));
    }

    let piece_count = ceil_div(total_length, PIECE_LENGTH) as usize;
    let workers = worker_count(piece_count);

    let files = Arc::new(files);
    let pieces = Arc::new(Mutex::new(vec![0u8; piece_count * 20]));
    let error_slot: Arc<Mutex<Option<PieceHashError>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = sync_channel::<usize>(workers.max(1) * 4);
    let rx = Arc::new(Mutex::new(rx));

    thread::scope(|scope| {
        for _ in 0..workers {
            let files = Arc::clone(&files);
            let pieces = Arc::clone(&pieces);
            let error_slot = Arc::clone(&error_slot);
            let rx = Arc::clone(&rx);
            scope.spawn(move || worker_loop(&files, total_length, &pieces, &error_slot, &rx));
        }

        for piece_idx in 0..piece_count {
            if tx.send(piece_idx).is_err() {
                break;
            }
        }
        drop(tx);
    });

    if let Some(err) = Arc::try_unwrap(error_slot)
        .expect("all workers joined by thread::scope before this point")
        .into_inner()
        .expect("error mutex is never poisoned by a panicking worker")
    {
        return Err(err);
    }

    let pieces = Arc::try_unwrap(pieces)
        .expect("all workers joined by thread::scope before this point")
        .into_inner()
        .expect("pieces mutex is never poisoned by a panicking worker");
    let files = Arc::try_unwrap(files).expect("no worker retains its clone after joining");

    Ok(HashedArtifact {
        files,
        total_length,
        piece_length: PIECE_LENGTH,
        pieces,
    })
}

fn worker_loop(
    files: &[FileSegment],
    total_length: u64,
    pieces: &Mutex<Vec<u8>>,
    error_slot: &Mutex<Option<PieceHashError>>,
    rx: &Mutex<Receiver<usize>>,
) {
    let mut buf = vec![0u8; PIECE_LENGTH as usize];
    loop {
        let piece_idx = match rx.lock().expect("job queue mutex is never poisoned").recv() {
            Ok(idx) => idx,
            Err(_) => break,
        };

        if error_slot
            .lock()
            .expect("error mutex is never poisoned")
            .is_some()
        {
            continue;
        }

        match hash_piece(files, total_length, piece_idx, &mut buf) {
            Ok(digest) => {
                let mut pieces = pieces.lock().expect("pieces mutex is never poisoned");
                pieces[piece_idx * 20..piece_idx * 20 + 20].copy_from_slice(&digest);
            }
            Err(err) => {
                let mut slot = error_slot.lock().expect("error mutex is never poisoned");
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
    }
}

fn hash_piece(
    files: &[FileSegment],
    total_length: u64,
    piece_idx: usize,
    buf: &mut [u8],
) -> Result<[u8; 20], PieceHashError> {
    let piece_start = piece_idx as u64 * PIECE_LENGTH;
    let piece_end = (piece_start + PIECE_LENGTH).min(total_length);

    let mut hasher = Sha1::new();
    let mut pos = piece_start;
    while pos < piece_end {
        let file_idx = files.partition_point(|seg| seg.end_offset <= pos);
        let seg = &files[file_idx];
        let to_read = (seg.end_offset.min(piece_end) - pos) as usize;
        let chunk = &mut buf[..to_read];

        let mut file = File::open(&seg.absolute_path)?;
        file.seek(SeekFrom::Start(pos - seg.start_offset))?;
        file.read_exact(chunk).map_err(|source| {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                PieceHashError::ShortRead {
                    path: seg.absolute_path.clone(),
                    piece: piece_idx,
                    expected: to_read,
                    actual: 0,
                }
            } else {
                PieceHashError::Io(source)
            }
        })?;

        hasher.update(&chunk[..]);
        pos += to_read as u64;
    }

    Ok(hasher.finalize().into())
}

fn worker_count(piece_count: usize) -> usize {
    let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    hardware.min(MAX_WORKERS).min(piece_count).max(1)
}

fn ceil_div(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}

/// Walk `root`, collect every regular file with its size and slash-joined
/// relative path, sort ascending by relative path, and assign each a
/// contiguous byte range in the virtual concatenated stream (§3, §4.2 steps
/// 1-2). This ordering must be identical on every pod so piece hashes match
/// bit-for-bit.
fn collect_files(root: &Path) -> Result<Vec<FileSegment>, PieceHashError> {
    let mut entries: Vec<(Vec<String>, u64, std::path::PathBuf)> = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|source| PieceHashError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir entries are always rooted under the walked path");
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        let length = entry.metadata().map_err(|source| PieceHashError::Walk {
            root: root.to_path_buf(),
            source,
        })?.len();
        entries.push((components, length, entry.path().to_path_buf()));
    }

    entries.sort_by(|a, b| a.0.join("/").cmp(&b.0.join("/")));

    let mut offset = 0u64;
    let files = entries
        .into_iter()
        .map(|(relative_components, length, absolute_path)| {
            let start_offset = offset;
            offset += length;
            FileSegment {
                absolute_path,
                relative_components,
                length,
                start_offset,
                end_offset: offset,
            }
        })
        .collect();

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, relative: &str, contents: &[u8]) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    /// Reference implementation: sequential concatenate-then-hash, used to
    /// assert bit-identical output against the parallel hasher (§8 property
    /// 1).
    fn reference_hash(files: &[FileSegment], total_length: u64) -> Vec<u8> {
        let piece_count = ceil_div(total_length, PIECE_LENGTH) as usize;
        let mut out = Vec::with_capacity(piece_count * 20);
        let mut buf = vec![0u8; PIECE_LENGTH as usize];
        for piece_idx in 0..piece_count {
            let digest = hash_piece(files, total_length, piece_idx, &mut buf).unwrap();
            out.extend_from_slice(&digest);
        }
        out
    }

    #[test]
    fn single_small_file() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.bin", b"hello world");
        let hashed = hash_artifact(dir.path()).unwrap();
        assert_eq!(hashed.total_length, 11);
        assert_eq!(hashed.pieces.len(), 20);
        assert_eq!(hashed.pieces, reference_hash(&hashed.files, hashed.total_length));
    }

    #[test]
    fn file_larger_than_one_piece() {
        let dir = tempdir().unwrap();
        let size = PIECE_LENGTH as usize + 12345;
        write_file(dir.path(), "big.bin", &vec![0x42u8; size]);
        let hashed = hash_artifact(dir.path()).unwrap();
        assert_eq!(hashed.total_length, size as u64);
        assert_eq!(hashed.pieces, reference_hash(&hashed.files, hashed.total_length));
    }

    #[test]
    fn many_files_unaligned_to_piece_boundaries() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a", &vec![1u8; PIECE_LENGTH as usize - 1]);
        write_file(dir.path(), "b", &vec![2u8; 1]);
        write_file(dir.path(), "c", &vec![3u8; PIECE_LENGTH as usize + 1]);
        write_file(dir.path(), "d", &vec![4u8; PIECE_LENGTH as usize - 1]);
        let hashed = hash_artifact(dir.path()).unwrap();
        assert_eq!(hashed.pieces, reference_hash(&hashed.files, hashed.total_length));
    }

    #[test]
    fn nested_subdirectories_and_empty_file_interleaved() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "sub/a.bin", &vec![9u8; 100 * 1024]);
        write_file(dir.path(), "empty.bin", b"");
        write_file(dir.path(), "sub/nested/b.bin", &vec![7u8; 200 * 1024]);
        let hashed = hash_artifact(dir.path()).unwrap();
        assert_eq!(hashed.files.len(), 3);
        assert_eq!(hashed.files[0].relative_path_string(), "empty.bin");
        assert_eq!(hashed.files[0].length, 0);
        assert_eq!(ceil_div(hashed.total_length, PIECE_LENGTH) as usize, 1);
        assert_eq!(hashed.pieces.len(), 20);
        assert_eq!(hashed.pieces, reference_hash(&hashed.files, hashed.total_length));
    }

    #[test]
    fn single_file_tree() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "only.bin", &vec![5u8; 42]);
        let hashed = hash_artifact(dir.path()).unwrap();
        assert_eq!(hashed.files.len(), 1);
        assert_eq!(hashed.pieces, reference_hash(&hashed.files, hashed.total_length));
    }

    #[test]
    fn empty_tree_is_rejected() {
        let dir = tempdir().unwrap();
        let err = hash_artifact(dir.path()).unwrap_err();
        assert!(matches!(err, PieceHashError::EmptyArtifact(_)));
    }
}
