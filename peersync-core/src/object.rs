//! Content-addressed object model
//!
//! Blobs hold opaque file bytes, trees map entry names to child ids.
//! Both are named by a Sha256 digest of their tagged serialized form,
//! so a blob and a tree can never collide even on identical payloads.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier for any stored object
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute an ObjectId from tagged data
    pub fn from_tagged(tag: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full hex is unwieldy in assertion output
        write!(f, "ObjectId({}..)", &self.to_hex()[..8])
    }
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Raw content data
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from data
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID
    pub fn calculate_id(&self) -> ObjectId {
        ObjectId::from_tagged(b"blob", &self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Directory object mapping entry names to child ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Sorted entries for deterministic hashing
    entries: BTreeMap<String, ObjectId>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entry
    pub fn insert(&mut self, name: impl Into<String>, id: ObjectId) {
        self.entries.insert(name.into(), id);
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<ObjectId> {
        self.entries.remove(name)
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&ObjectId> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ObjectId)> {
        self.entries.iter()
    }

    /// The set of directly referenced child ids.
    ///
    /// Distinct names may point at the same object, so this can be
    /// smaller than `len()`.
    pub fn children(&self) -> BTreeSet<ObjectId> {
        self.entries.values().copied().collect()
    }

    /// Compute the object ID
    pub fn calculate_id(&self) -> ObjectId {
        let payload = bincode::serialize(&self.entries).expect("tree serialization is infallible");
        ObjectId::from_tagged(b"tree", &payload)
    }
}

/// Generic object that can be either kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
}

impl Object {
    /// Compute the object ID
    pub fn calculate_id(&self) -> ObjectId {
        match self {
            Object::Blob(blob) => blob.calculate_id(),
            Object::Tree(tree) => tree.calculate_id(),
        }
    }

    /// Child ids directly referenced by this object (empty for blobs)
    pub fn children(&self) -> BTreeSet<ObjectId> {
        match self {
            Object::Blob(_) => BTreeSet::new(),
            Object::Tree(tree) => tree.children(),
        }
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl From<Blob> for Object {
    fn from(blob: Blob) -> Self {
        Object::Blob(blob)
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Object::Tree(tree)
    }
}
