//! Recursive tree hashing
//!
//! Walks a directory tree depth-first and produces one [`Digest`] per
//! visited path, the root included under its own full path. The digest of a
//! path folds, in this exact order:
//!
//! 1. the UTF-8 bytes of the path's own file name;
//! 2. for a regular file, its content streamed in 64 KiB chunks; for a
//!    directory, the digests of its children in lexicographic full-path
//!    order.
//!
//! The fold order and the child sort order are externally observable: maps
//! recorded by earlier runs are compared digest-by-digest against freshly
//! computed ones, so neither may change. The algorithm is SHA-1 (20-byte
//! output) for the same reason.
//!
//! A path that cannot be listed or read folds an empty byte sequence
//! instead and still receives a digest; a persistently unreadable path is
//! therefore stable across runs. These local failures are silent (logged,
//! not reported) and never abort the walk. A symlink to a regular file is
//! hashed through the link like a file; directory symlinks, dangling links
//! and special files are treated as unreadable leaves, which also
//! neutralises symlink loops.

use crate::checksum::{ChecksumMap, Digest};
use crate::error::{CopySnapError, Result};
use crate::progress::ProgressTracker;
use crate::utils::{classify_path, sorted_children, PathKind};
use sha1::{Digest as _, Sha1};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Chunk size for streaming file content through the hash
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the checksum map of a directory tree
///
/// Fails only if `root` itself is not readable at all; every failure below
/// the root is local and folds empty bytes as described in the module docs.
/// Emits one progress tick per directory and one per file successfully
/// hashed.
pub fn compute_checksum_map(root: &Path, tracker: &mut ProgressTracker) -> Result<ChecksumMap> {
    if fs::metadata(root).is_err() {
        return Err(CopySnapError::SourceUnreadable(root.to_path_buf()));
    }
    let mut map = ChecksumMap::new();
    hash_path(root, &mut map, tracker);
    Ok(map)
}

/// Hash one path, recursing into directories, and record it in the map
fn hash_path(path: &Path, map: &mut ChecksumMap, tracker: &mut ProgressTracker) -> Digest {
    let mut hasher = Sha1::new();
    if let Some(name) = path.file_name() {
        hasher.update(name.to_string_lossy().as_bytes());
    }

    match classify_path(path) {
        PathKind::Directory => match sorted_children(path) {
            Ok(children) => {
                for child in &children {
                    let child_digest = hash_path(child, map, tracker);
                    hasher.update(child_digest.as_bytes());
                }
                tracker.directory_hashed();
            }
            Err(e) => {
                debug!("skipping unlistable directory {:?}: {}", path, e);
            }
        },
        PathKind::File => match fold_file_content(path, &mut hasher) {
            Ok(()) => tracker.file_hashed(),
            Err(e) => {
                debug!("skipping unreadable file {:?}: {}", path, e);
            }
        },
        PathKind::Other => {
            // hashed by name only; never recursed into
            debug!("not following non-regular path {:?}", path);
        }
    }

    let digest = Digest::from_bytes(hasher.finalize().into());
    map.insert(path.to_path_buf(), digest);
    digest
}

/// Stream a file's bytes into the hasher in fixed-size chunks
fn fold_file_content(path: &Path, hasher: &mut Sha1) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn build_tree(root: &Path) {
        fs::create_dir(root.join("a")).unwrap();
        fs::write(root.join("a/b.txt"), b"hi").unwrap();
        fs::write(root.join("a/c.txt"), b"yo").unwrap();
        fs::write(root.join("d.txt"), b"top").unwrap();
    }

    #[test]
    fn test_every_path_has_exactly_one_entry() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let map = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        // root, a, a/b.txt, a/c.txt, d.txt
        assert_eq!(map.len(), 5);
        assert!(map.contains_path(dir.path()));
        assert!(map.contains_path(&dir.path().join("a/b.txt")));
    }

    #[test]
    fn test_repeated_hash_is_identical() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let first = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        let second = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_modification_changes_path_and_ancestors_only() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let before = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        fs::write(dir.path().join("a/b.txt"), b"bye").unwrap();
        let after = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();

        let changed = |p: PathBuf| before.get(&p) != after.get(&p);
        assert!(changed(dir.path().join("a/b.txt")));
        assert!(changed(dir.path().join("a")));
        assert!(changed(dir.path().to_path_buf()));
        // siblings keep their digests
        assert!(!changed(dir.path().join("a/c.txt")));
        assert!(!changed(dir.path().join("d.txt")));
    }

    #[test]
    fn test_name_bytes_are_folded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.txt"), b"same").unwrap();
        fs::write(dir.path().join("two.txt"), b"same").unwrap();

        let map = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        // equal content under different names must not collide
        assert_ne!(
            map.get(&dir.path().join("one.txt")),
            map.get(&dir.path().join("two.txt"))
        );
    }

    #[test]
    fn test_progress_ticks_per_path() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let mut tracker = ProgressTracker::silent();
        compute_checksum_map(dir.path(), &mut tracker).unwrap();
        let progress = tracker.progress();
        assert_eq!(progress.directories_seen(), 2); // root, a
        assert_eq!(progress.files_seen(), 3);
        assert_eq!(progress.total_seen(), 5);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = compute_checksum_map(
            &dir.path().join("does-not-exist"),
            &mut ProgressTracker::silent(),
        )
        .unwrap_err();
        assert!(matches!(err, CopySnapError::SourceUnreadable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_symlink_hashes_as_its_target_content() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        let linked = dir.path().join("linked");
        fs::create_dir(&real).unwrap();
        fs::create_dir(&linked).unwrap();
        fs::write(real.join("c.txt"), b"yo").unwrap();
        std::os::unix::fs::symlink(real.join("c.txt"), linked.join("c.txt")).unwrap();

        let real_map = compute_checksum_map(&real, &mut ProgressTracker::silent()).unwrap();
        let linked_map = compute_checksum_map(&linked, &mut ProgressTracker::silent()).unwrap();
        assert_eq!(
            real_map.get(&real.join("c.txt")),
            linked_map.get(&linked.join("c.txt"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlink_is_not_followed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/file.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let map = compute_checksum_map(dir.path(), &mut ProgressTracker::silent()).unwrap();
        // the link gets its own entry, its target's contents are not walked
        // through it
        assert!(map.contains_path(&dir.path().join("link")));
        assert!(!map.contains_path(&dir.path().join("link/file.txt")));
        assert!(map.contains_path(&dir.path().join("real/file.txt")));
    }
}
