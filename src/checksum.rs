//! Checksum map data model
//!
//! A [`ChecksumMap`] is the fingerprint of one directory tree: one
//! fixed-length [`Digest`] per visited path, directories included (a
//! directory digest folds in all of its children, see the hashing module).
//! Two derived views drive the delta-copy algorithm:
//!
//! - [`ChecksumMap::redirect`] rebases every key from the source tree onto a
//!   run directory, producing the map that is persisted with a completed
//!   run;
//! - [`ChecksumMap::invert`] flips the persisted map into digest → path
//!   form, which is how a later run finds the prior-run location to link
//!   unchanged content to.
//!
//! Iteration order matters everywhere in this crate: consumers walk the map
//! in lexicographic order of the path string ([`ChecksumMap::sorted_paths`])
//! so digests, copy decisions and problem reports are reproducible across
//! runs.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::utils::compare_paths;

/// Length of a [`Digest`] in bytes
pub const DIGEST_LEN: usize = 20;

/// Fixed-length content digest of one path
///
/// 20 bytes, produced by the tree-hashing routine. Digest equality is the
/// sole identity test in this engine: two paths with equal digests are
/// treated as byte-identical without any secondary verification. That
/// trusts the collision resistance of the fixed hash algorithm; the
/// algorithm cannot be swapped without invalidating every previously
/// recorded map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering (40 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest from its 40-character hex rendering
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Digest(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::from_hex(&raw).map_err(D::Error::custom)
    }
}

/// Mapping from absolute path to content digest
///
/// Keys are unique. Insertion order is irrelevant; deterministic consumers
/// go through [`sorted_paths`](Self::sorted_paths).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumMap {
    entries: HashMap<PathBuf, Digest>,
}

impl ChecksumMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the digest for a path
    pub fn insert(&mut self, path: PathBuf, digest: Digest) {
        self.entries.insert(path, digest);
    }

    /// Digest recorded for a path
    pub fn get(&self, path: &Path) -> Option<Digest> {
        self.entries.get(path).copied()
    }

    /// Whether a path has an entry
    pub fn contains_path(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Iterate over entries in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Digest)> {
        self.entries.iter()
    }

    /// All keys in lexicographic order of the path string
    pub fn sorted_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = self.entries.keys().map(PathBuf::as_path).collect();
        paths.sort_by(|a, b| compare_paths(a, b));
        paths
    }

    /// Rebase every key onto a new base path
    ///
    /// The replaced portion is all but the last name component of the
    /// shortest key (string-order minimum), which for a map produced by the
    /// tree hasher is the parent of the hashed root. The relative suffix is
    /// preserved:
    ///
    /// ```text
    /// keys:        a/b/c, a/b/c/d/e, a/b/c/d/f
    /// replaced:    a/b
    /// new base:    x/y/z
    /// result keys: x/y/z/c, x/y/z/c/d/e, x/y/z/c/d/f
    /// ```
    ///
    /// An empty map redirects to an empty map.
    pub fn redirect(&self, new_base: &Path) -> ChecksumMap {
        let Some(shortest) = self.entries.keys().min_by(|a, b| compare_paths(a, b)) else {
            return ChecksumMap::new();
        };
        let base_offset = name_components(shortest).count().saturating_sub(1);

        let mut redirected = HashMap::with_capacity(self.entries.len());
        for (path, digest) in &self.entries {
            let mut key = new_base.to_path_buf();
            for component in name_components(path).skip(base_offset) {
                key.push(component);
            }
            redirected.insert(key, *digest);
        }
        ChecksumMap {
            entries: redirected,
        }
    }

    /// Flip the map into digest → path form
    ///
    /// When several paths share a digest exactly one representative
    /// survives: entries are inserted in sorted path order and later
    /// inserts win, so the result is deterministic. Any representative is
    /// equally valid as a link target since equal digests mean equal
    /// content.
    pub fn invert(&self) -> InvertedChecksumMap {
        let mut inverted = HashMap::with_capacity(self.entries.len());
        for path in self.sorted_paths() {
            inverted.insert(self.entries[path], path.to_path_buf());
        }
        InvertedChecksumMap { entries: inverted }
    }
}

/// Digest → path lookup derived from a prior run's [`ChecksumMap`]
#[derive(Debug, Clone, Default)]
pub struct InvertedChecksumMap {
    entries: HashMap<Digest, PathBuf>,
}

impl InvertedChecksumMap {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the lookup holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path recorded for a digest, if any
    pub fn path_for(&self, digest: &Digest) -> Option<&Path> {
        self.entries.get(digest).map(PathBuf::as_path)
    }
}

/// Name components of a path (root and prefix components skipped)
fn name_components(path: &Path) -> impl Iterator<Item = &OsStr> {
    path.components().filter_map(|component| match component {
        Component::Normal(name) => Some(name),
        _ => None,
    })
}

// Persisted as a JSON object of path string -> hex digest, with stable key
// order on output.
impl Serialize for ChecksumMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let ordered: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|(path, digest)| (path.to_string_lossy().into_owned(), digest.to_hex()))
            .collect();
        ordered.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChecksumMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = HashMap::<String, String>::deserialize(deserializer)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (path, digest) in raw {
            let digest = Digest::from_hex(&digest).map_err(D::Error::custom)?;
            entries.insert(PathBuf::from(path), digest);
        }
        Ok(ChecksumMap { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: u8) -> Digest {
        Digest::from_bytes([seed; DIGEST_LEN])
    }

    #[test]
    fn test_digest_hex_round_trip() {
        let d = digest(0xab);
        let parsed = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_digest_rejects_wrong_length() {
        assert!(Digest::from_hex("abcd").is_err());
        // valid hex but 21 bytes
        assert!(Digest::from_hex(&"ab".repeat(21)).is_err());
    }

    #[test]
    fn test_sorted_paths_is_string_order() {
        let mut map = ChecksumMap::new();
        map.insert(PathBuf::from("/a/bc"), digest(1));
        map.insert(PathBuf::from("/a/b"), digest(2));
        map.insert(PathBuf::from("/a/b/x"), digest(3));

        let paths = map.sorted_paths();
        assert_eq!(
            paths,
            vec![
                Path::new("/a/b"),
                Path::new("/a/b/x"),
                Path::new("/a/bc")
            ]
        );
    }

    #[test]
    fn test_redirect_replaces_all_but_last_component_of_shortest_key() {
        let mut map = ChecksumMap::new();
        map.insert(PathBuf::from("/a/b/c"), digest(1));
        map.insert(PathBuf::from("/a/b/c/d/e"), digest(2));
        map.insert(PathBuf::from("/a/b/c/d/f"), digest(3));

        let redirected = map.redirect(Path::new("/x/y/z"));
        assert_eq!(redirected.get(Path::new("/x/y/z/c")), Some(digest(1)));
        assert_eq!(redirected.get(Path::new("/x/y/z/c/d/e")), Some(digest(2)));
        assert_eq!(redirected.get(Path::new("/x/y/z/c/d/f")), Some(digest(3)));
        assert_eq!(redirected.len(), 3);
    }

    #[test]
    fn test_redirect_invert_round_trip() {
        let mut map = ChecksumMap::new();
        map.insert(PathBuf::from("/src/tree"), digest(1));
        map.insert(PathBuf::from("/src/tree/a.txt"), digest(2));
        map.insert(PathBuf::from("/src/tree/sub"), digest(3));
        map.insert(PathBuf::from("/src/tree/sub/b.txt"), digest(4));

        let redirected = map.redirect(Path::new("/runs/0001"));
        let inverted = redirected.invert();

        // every original digest resolves to the rebased location of its path
        assert_eq!(
            inverted.path_for(&digest(4)),
            Some(Path::new("/runs/0001/tree/sub/b.txt"))
        );
        assert_eq!(
            inverted.path_for(&digest(1)),
            Some(Path::new("/runs/0001/tree"))
        );
    }

    #[test]
    fn test_invert_duplicate_digests_deterministic() {
        let mut map = ChecksumMap::new();
        map.insert(PathBuf::from("/t/one.txt"), digest(7));
        map.insert(PathBuf::from("/t/two.txt"), digest(7));

        // sorted-order last write wins: the larger path string survives
        let inverted = map.invert();
        assert_eq!(inverted.len(), 1);
        assert_eq!(inverted.path_for(&digest(7)), Some(Path::new("/t/two.txt")));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut map = ChecksumMap::new();
        map.insert(PathBuf::from("/t/a"), digest(1));
        map.insert(PathBuf::from("/t/b"), digest(2));

        let json = serde_json::to_string(&map).unwrap();
        let back: ChecksumMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
    }
}
