//! Point-in-time pinning views over a branch's object graph
//!
//! A snapshot keeps the objects of one commit alive while a transfer is
//! in flight, independently of the branch that created it. Nodes are
//! classified Missing / Incomplete / Complete; incomplete nodes hold a
//! direct refcount unit, complete nodes a recursive one, missing nodes
//! none. Completion propagates upward along parent back-edges, and a
//! fully subsumed child is folded out of the node map, leaving the pin
//! on the highest complete ancestor.

use crate::archive;
use crate::error::Result;
use crate::object::ObjectId;
use crate::options::SyncOptions;
use crate::refcount;
use crate::store::ObjectStore;
use crate::version::{Commit, UserId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Classification of a node within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Referenced by some parent but not integrated yet
    Missing,
    /// Present in the store, some descendants still pending
    Incomplete,
    /// Entire subtree present
    Complete,
}

impl NodeType {
    fn tag_byte(self) -> u8 {
        match self {
            NodeType::Missing => 0,
            NodeType::Incomplete => 1,
            NodeType::Complete => 2,
        }
    }
}

/// A node's immediate children, partitioned by their classification at
/// the time they were recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Children {
    pub missing: BTreeSet<ObjectId>,
    pub incomplete: BTreeSet<ObjectId>,
    pub complete: BTreeSet<ObjectId>,
}

impl Children {
    fn is_settled(&self) -> bool {
        self.missing.is_empty() && self.incomplete.is_empty()
    }
}

/// One object within the snapshot's graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub typ: NodeType,
    /// Ids of nodes referencing this one, used for upward propagation
    pub parents: BTreeSet<ObjectId>,
    pub children: Children,
}

impl Node {
    fn missing() -> Self {
        Self {
            typ: NodeType::Missing,
            parents: BTreeSet::new(),
            children: Children::default(),
        }
    }
}

const NAME_TAG_LEN: usize = 16;

/// The serialized portion of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotState {
    commit: Commit,
    name_tag: [u8; NAME_TAG_LEN],
    nodes: BTreeMap<ObjectId, Node>,
}

/// Independently pinning view of a commit's (possibly partial) subgraph
pub struct Snapshot {
    path: PathBuf,
    options: SyncOptions,
    store: ObjectStore,
    state: SnapshotState,
    forgotten: bool,
}

impl Snapshot {
    /// Create an empty snapshot of the given commit, seeded with the
    /// root as a missing node, and persist it under a fresh random name
    /// tag.
    pub fn create(commit: Commit, options: SyncOptions) -> Result<Self> {
        let store = ObjectStore::new(options.objects_dir.clone())?;
        let name_tag: [u8; NAME_TAG_LEN] = rand::thread_rng().gen();
        let path = options.snapshots_dir.join(hex::encode(name_tag));

        let mut nodes = BTreeMap::new();
        nodes.insert(commit.root_id, Node::missing());

        let snapshot = Self {
            path,
            options,
            store,
            state: SnapshotState {
                commit,
                name_tag,
                nodes,
            },
            forgotten: false,
        };
        snapshot.store_self()?;
        Ok(snapshot)
    }

    /// Restore a snapshot from its state file. The restored instance
    /// owns the refcount holdings the persisted one took.
    pub fn load(path: PathBuf, options: SyncOptions) -> Result<Self> {
        let store = ObjectStore::new(options.objects_dir.clone())?;
        let state = archive::load(&path)?;
        Ok(Self {
            path,
            options,
            store,
            state,
            forgotten: false,
        })
    }

    pub fn commit(&self) -> &Commit {
        &self.state.commit
    }

    /// Opaque identity used to pick the on-disk file path
    pub fn name_tag(&self) -> &[u8; NAME_TAG_LEN] {
        &self.state.name_tag
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn nodes(&self) -> &BTreeMap<ObjectId, Node> {
        &self.state.nodes
    }

    /// Content-derived identifier over the commit root and the node
    /// classifications, used for grouping
    pub fn calculate_id(&self) -> ObjectId {
        let mut hasher = Sha256::new();
        hasher.update(b"Snapshot");
        hasher.update(self.state.commit.root_id.as_bytes());
        for (id, node) in &self.state.nodes {
            hasher.update([node.typ.tag_byte()]);
            hasher.update(id.as_bytes());
        }
        ObjectId::new(hasher.finalize().into())
    }

    /// Classify candidate children against the store and the refcount
    /// table: absent ids are missing, recursively pinned ids are
    /// complete, the rest are incomplete.
    fn sort_children(&self, children: &BTreeSet<ObjectId>) -> Result<Children> {
        let mut sorted = Children::default();
        for child in children {
            if !self.store.exists(child) {
                sorted.missing.insert(*child);
            } else if refcount::read(&self.store, child)?.recursive_count() > 0 {
                sorted.complete.insert(*child);
            } else {
                sorted.incomplete.insert(*child);
            }
        }
        Ok(sorted)
    }

    /// Integrate a freshly received object whose immediate children are
    /// `children`. Only ids currently anticipated as missing are
    /// accepted; anything else belongs to another snapshot or commit
    /// and is ignored. Returns whether the object was integrated.
    pub fn insert_object(&mut self, id: ObjectId, children: &BTreeSet<ObjectId>) -> Result<bool> {
        match self.state.nodes.get(&id) {
            Some(node) if node.typ == NodeType::Missing => {}
            _ => return Ok(false),
        }

        let sorted = self.sort_children(children)?;

        // Record the back-edge for every child, lazily creating missing
        // placeholder nodes, even for children already settled.
        for child in children {
            let node = self
                .state
                .nodes
                .entry(*child)
                .or_insert_with(Node::missing);
            node.parents.insert(id);
        }

        let node = self.state.nodes.get_mut(&id).unwrap();
        node.children = sorted;

        if node.children.is_settled() {
            node.typ = NodeType::Complete;
            tracing::debug!(%id, "snapshot node complete");
            refcount::increment_recursive(&self.store, &id)?;
            self.fold_complete_children(&id)?;
            self.propagate_completion(id)?;
        } else {
            node.typ = NodeType::Incomplete;
            tracing::debug!(%id, "snapshot node incomplete");
            refcount::increment_direct(&self.store, &id)?;
        }

        self.store_self()?;
        Ok(true)
    }

    /// Walk completions upward along parent back-edges. Worklist form,
    /// so deep graphs cannot overflow the stack.
    fn propagate_completion(&mut self, completed: ObjectId) -> Result<()> {
        let mut worklist: Vec<(ObjectId, ObjectId)> = self.state.nodes[&completed]
            .parents
            .iter()
            .map(|parent| (completed, *parent))
            .collect();

        while let Some((child, parent_id)) = worklist.pop() {
            let promoted = {
                let parent = self
                    .state
                    .nodes
                    .get_mut(&parent_id)
                    .expect("parent back-edge points at a vanished node");

                let was_missing = parent.children.missing.remove(&child);
                let was_incomplete = parent.children.incomplete.remove(&child);
                assert!(
                    was_missing ^ was_incomplete,
                    "completed child {} not tracked in exactly one pending bucket of {}",
                    child,
                    parent_id
                );
                parent.children.complete.insert(child);

                if parent.children.is_settled() {
                    parent.typ = NodeType::Complete;
                    true
                } else {
                    false
                }
            };

            if !promoted {
                continue;
            }

            tracing::trace!(parent = %parent_id, "snapshot node promoted");
            refcount::promote(&self.store, &parent_id)?;
            self.fold_complete_children(&parent_id)?;

            let grandparents: Vec<_> = self.state.nodes[&parent_id]
                .parents
                .iter()
                .copied()
                .collect();
            for grandparent in grandparents {
                worklist.push((parent_id, grandparent));
            }
        }
        Ok(())
    }

    /// Drop the node entries of complete children that no pending node
    /// still waits on: their refcount is subsumed by the recursive pins
    /// of their completed ancestors.
    ///
    /// The check scans the nodes still tracked rather than chasing the
    /// child's recorded parent ids: a parent folded out of the map
    /// earlier completed by definition, so its absence must not read as
    /// "incomplete". Only a node that is present and not yet complete
    /// can block a fold.
    fn fold_complete_children(&mut self, id: &ObjectId) -> Result<()> {
        let children: Vec<_> = self.state.nodes[id].children.complete.iter().copied().collect();
        for child in children {
            match self.state.nodes.get(&child) {
                Some(node) if node.typ == NodeType::Complete => {}
                _ => continue,
            }
            let still_awaited = self.state.nodes.values().any(|node| {
                node.typ != NodeType::Complete
                    && (node.children.missing.contains(&child)
                        || node.children.incomplete.contains(&child)
                        || node.children.complete.contains(&child))
            });
            if !still_awaited {
                tracing::trace!(%child, "folding snapshot node into parent pin");
                self.state.nodes.remove(&child);
                refcount::decrement_recursive(&self.store, &child)?;
            }
        }
        Ok(())
    }

    /// Capture a received-but-incomplete object from a branch: an
    /// incomplete node holding one direct unit.
    pub fn capture_flat_object(
        &mut self,
        id: ObjectId,
        parents: BTreeSet<ObjectId>,
        children: &BTreeSet<ObjectId>,
    ) -> Result<()> {
        let sorted = self.sort_children(children)?;
        for child in children {
            let node = self
                .state
                .nodes
                .entry(*child)
                .or_insert_with(Node::missing);
            node.parents.insert(id);
        }

        let node = self.state.nodes.entry(id).or_insert_with(Node::missing);
        node.typ = NodeType::Incomplete;
        node.parents.extend(parents);
        node.children = sorted;
        refcount::increment_direct(&self.store, &id)?;
        Ok(())
    }

    /// Capture a fully present object from a branch: a complete node
    /// holding one recursive unit.
    pub fn capture_full_object(&mut self, id: ObjectId) -> Result<()> {
        let node = self.state.nodes.entry(id).or_insert_with(Node::missing);
        node.typ = NodeType::Complete;
        refcount::increment_recursive(&self.store, &id)?;
        Ok(())
    }

    /// Produce an independent snapshot of the same graph under a fresh
    /// name tag. Every surviving node re-takes the refcount matching
    /// its type.
    pub fn clone_snapshot(&self) -> Result<Snapshot> {
        let name_tag: [u8; NAME_TAG_LEN] = rand::thread_rng().gen();
        let path = self.options.snapshots_dir.join(hex::encode(name_tag));

        for (id, node) in &self.state.nodes {
            match node.typ {
                NodeType::Complete => {
                    refcount::increment_recursive(&self.store, id)?;
                }
                NodeType::Incomplete => {
                    refcount::increment_direct(&self.store, id)?;
                }
                NodeType::Missing => {}
            }
        }

        let snapshot = Self {
            path,
            options: self.options.clone(),
            store: self.store.clone(),
            state: SnapshotState {
                commit: self.state.commit.clone(),
                name_tag,
                nodes: self.state.nodes.clone(),
            },
            forgotten: false,
        };
        snapshot.store_self()?;
        Ok(snapshot)
    }

    /// Release every refcount this snapshot holds and delete its state
    /// file. Idempotent; called implicitly on drop. A failure while
    /// releasing would silently corrupt the store's bookkeeping, so it
    /// is fatal.
    pub fn forget(&mut self) {
        if self.forgotten {
            return;
        }
        self.forgotten = true;

        let nodes = std::mem::take(&mut self.state.nodes);

        // Incomplete nodes only hold direct units, release them first
        for (id, node) in &nodes {
            if node.typ == NodeType::Incomplete {
                if let Err(e) = refcount::flat_remove(&self.store, id) {
                    Self::release_failed(id, &e);
                }
            }
        }
        for (id, node) in &nodes {
            if node.typ == NodeType::Complete {
                if let Err(e) = refcount::deep_remove(&self.store, id) {
                    Self::release_failed(id, &e);
                }
            }
        }

        if let Err(e) = archive::remove(&self.path) {
            tracing::warn!(path = ?self.path, error = %e, "failed to remove snapshot file");
        }
    }

    fn release_failed(id: &ObjectId, error: &crate::error::Error) -> ! {
        tracing::error!(%id, %error, "failed to release snapshot refcount");
        std::process::abort();
    }

    /// Persist the snapshot state
    pub fn store_self(&self) -> Result<()> {
        archive::store(&self.path, &self.state)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.forget();
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("commit", &self.state.commit)
            .field("name_tag", &hex::encode(self.state.name_tag))
            .field("nodes", &self.state.nodes.len())
            .finish()
    }
}

/// Ordered association of peers to their snapshots, hashed into a
/// single identifier used as a transfer epoch key. Dropping the group
/// forgets every snapshot it owns.
pub struct SnapshotGroup {
    id: ObjectId,
    snapshots: BTreeMap<UserId, Snapshot>,
}

impl SnapshotGroup {
    pub fn new(snapshots: BTreeMap<UserId, Snapshot>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"SnapshotGroup");
        hasher.update((snapshots.len() as u32).to_be_bytes());
        for (user, snapshot) in &snapshots {
            hasher.update(user.as_bytes());
            hasher.update(snapshot.calculate_id().as_bytes());
        }
        let id = ObjectId::new(hasher.finalize().into());

        Self { id, snapshots }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, user: &UserId) -> Option<&Snapshot> {
        self.snapshots.get(user)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &Snapshot)> {
        self.snapshots.iter()
    }
}
