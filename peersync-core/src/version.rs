//! Peer identity, version vectors and commits

use crate::object::ObjectId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Identity of a peer, stable across sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(uuid::Uuid);

impl UserId {
    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Load the identity from a file, creating and persisting a new one
    /// if the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read user id from {:?}", path))?;
            let uuid = text
                .trim()
                .parse::<uuid::Uuid>()
                .with_context(|| "Failed to parse user id")?;
            return Ok(Self(uuid));
        }

        let id = Self::random();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", id.0))
            .with_context(|| format!("Failed to write user id to {:?}", path))?;
        Ok(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Causality stamp: one counter per peer that has modified the branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    versions: BTreeMap<UserId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter of the given peer
    pub fn increment(&mut self, user: UserId) {
        *self.versions.entry(user).or_insert(0) += 1;
    }

    /// Counter of the given peer (zero if absent)
    pub fn version_of(&self, user: &UserId) -> u64 {
        self.versions.get(user).copied().unwrap_or(0)
    }

    /// Pointwise maximum of two vectors
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut result = self.clone();
        for (user, version) in &other.versions {
            let entry = result.versions.entry(*user).or_insert(0);
            *entry = (*entry).max(*version);
        }
        result
    }

    /// True when every counter in `self` is at most the corresponding
    /// counter in `other`.
    pub fn happened_before(&self, other: &VersionVector) -> bool {
        self.versions
            .iter()
            .all(|(user, version)| *version <= other.version_of(user))
    }
}

/// A branch tip: the root of an object tree plus its causality stamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub root_id: ObjectId,
    pub stamp: VersionVector,
}

impl Commit {
    pub fn new(root_id: ObjectId, stamp: VersionVector) -> Self {
        Self { root_id, stamp }
    }

    /// Commit with an empty stamp, used for branches seeded from scratch
    pub fn from_root(root_id: ObjectId) -> Self {
        Self {
            root_id,
            stamp: VersionVector::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Blob;
    use tempfile::TempDir;

    #[test]
    fn test_user_id_load_or_create() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("user_id");

        let first = UserId::load_or_create(&path).unwrap();
        let second = UserId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_version_vector_increment_and_merge() {
        let alice = UserId::random();
        let bob = UserId::random();

        let mut a = VersionVector::new();
        a.increment(alice);
        a.increment(alice);

        let mut b = VersionVector::new();
        b.increment(alice);
        b.increment(bob);

        let merged = a.merge(&b);
        assert_eq!(merged.version_of(&alice), 2);
        assert_eq!(merged.version_of(&bob), 1);
    }

    #[test]
    fn test_version_vector_ordering() {
        let alice = UserId::random();
        let bob = UserId::random();

        let mut a = VersionVector::new();
        a.increment(alice);

        let mut b = a.clone();
        b.increment(bob);

        assert!(a.happened_before(&b));
        assert!(!b.happened_before(&a));

        let mut c = VersionVector::new();
        c.increment(bob);
        // Concurrent: neither precedes the other
        assert!(!a.happened_before(&c));
        assert!(!c.happened_before(&a));
    }

    #[test]
    fn test_commit_equality_by_contents() {
        let root = Blob::from_bytes(b"root".to_vec()).calculate_id();
        let a = Commit::from_root(root);
        let b = Commit::from_root(root);
        assert_eq!(a, b);
    }
}
