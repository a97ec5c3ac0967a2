//! Per-peer ingest state machine
//!
//! A remote branch tracks the progressive download of one peer's object
//! tree. Objects arrive one at a time and are only accepted when some
//! previously ingested parent (or the commit root) announced them, so
//! the branch always knows why it is holding a given object. Every
//! tracked object is in exactly one of three states: missing (announced
//! but not yet received), incomplete (received, some descendants still
//! pending) or complete (entire subtree present locally).
//!
//! Refcount discipline: incomplete objects hold one direct unit,
//! complete objects hold one recursive unit, and the promotion from
//! incomplete to complete swaps the two in a single update. When every
//! parent waiting on a completed child has itself been promoted, the
//! child's own unit is released and the subtree stays pinned through
//! its parents ("folding").

use crate::archive;
use crate::error::{Error, Result};
use crate::object::{Blob, Object, ObjectId, Tree};
use crate::options::SyncOptions;
use crate::refcount;
use crate::snapshot::Snapshot;
use crate::store::ObjectStore;
use crate::version::Commit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Bookkeeping for one received-but-incomplete object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Ids waiting for this object to complete
    parents: BTreeSet<ObjectId>,
    /// Children still missing from the store or incomplete in this branch
    pending_children: BTreeSet<ObjectId>,
    /// Children whose subtrees are already fully present
    complete_children: BTreeSet<ObjectId>,
}

impl ObjectEntry {
    pub fn parents(&self) -> &BTreeSet<ObjectId> {
        &self.parents
    }

    pub fn pending_children(&self) -> &BTreeSet<ObjectId> {
        &self.pending_children
    }

    pub fn complete_children(&self) -> &BTreeSet<ObjectId> {
        &self.complete_children
    }
}

/// The serialized portion of a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchState {
    commit: Commit,
    missing_objects: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
    incomplete_objects: BTreeMap<ObjectId, ObjectEntry>,
    complete_objects: BTreeSet<ObjectId>,
}

/// Ingest state machine for a single remote peer's branch
pub struct RemoteBranch {
    filepath: PathBuf,
    options: SyncOptions,
    store: ObjectStore,
    state: BranchState,
}

impl RemoteBranch {
    /// Create a fresh branch aimed at the given commit and persist it
    pub fn create(commit: Commit, filepath: PathBuf, options: SyncOptions) -> Result<Self> {
        let store = ObjectStore::new(options.objects_dir.clone())?;
        let mut missing_objects = BTreeMap::new();
        missing_objects.insert(commit.root_id, BTreeSet::new());

        let branch = Self {
            filepath,
            options,
            store,
            state: BranchState {
                commit,
                missing_objects,
                incomplete_objects: BTreeMap::new(),
                complete_objects: BTreeSet::new(),
            },
        };
        branch.store_self()?;
        Ok(branch)
    }

    /// Restore a branch from its state file
    pub fn load(filepath: PathBuf, options: SyncOptions) -> Result<Self> {
        let store = ObjectStore::new(options.objects_dir.clone())?;
        let state = archive::load(&filepath)?;
        Ok(Self {
            filepath,
            options,
            store,
            state,
        })
    }

    pub fn commit(&self) -> &Commit {
        &self.state.commit
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn missing_objects(&self) -> &BTreeMap<ObjectId, BTreeSet<ObjectId>> {
        &self.state.missing_objects
    }

    pub fn incomplete_objects(&self) -> &BTreeMap<ObjectId, ObjectEntry> {
        &self.state.incomplete_objects
    }

    pub fn complete_objects(&self) -> &BTreeSet<ObjectId> {
        &self.state.complete_objects
    }

    /// Ingest a leaf object
    pub async fn insert_blob(&mut self, blob: &Blob) -> Result<ObjectId> {
        self.insert_object(&blob.clone().into())
    }

    /// Ingest a directory object
    pub async fn insert_tree(&mut self, tree: &Tree) -> Result<ObjectId> {
        self.insert_object(&tree.clone().into())
    }

    /// Reduce a candidate child set to the ids not yet present in the
    /// store. Used by the transfer layer to decide what to request.
    pub fn filter_missing(&self, objects: BTreeSet<ObjectId>) -> BTreeSet<ObjectId> {
        objects
            .into_iter()
            .filter(|id| !self.store.exists(id))
            .collect()
    }

    fn insert_object(&mut self, object: &Object) -> Result<ObjectId> {
        let id = object.calculate_id();

        // Only announced objects are accepted; anything else is a
        // duplicate or an unsolicited send. Checked before any mutation.
        if !self.state.missing_objects.contains_key(&id) {
            return Err(Error::ProtocolViolation {
                id,
                reason: "object was not announced by any ingested parent",
            });
        }

        // A store failure here is retryable: no state has changed yet
        self.store.store_new(object)?;
        let parents = self.state.missing_objects.remove(&id).unwrap();

        let mut pending_children = BTreeSet::new();
        let mut complete_children = BTreeSet::new();
        for child in object.children() {
            if !self.store.exists(&child) {
                self.state
                    .missing_objects
                    .entry(child)
                    .or_default()
                    .insert(id);
                pending_children.insert(child);
            } else if let Some(entry) = self.state.incomplete_objects.get_mut(&child) {
                entry.parents.insert(id);
                pending_children.insert(child);
            } else {
                complete_children.insert(child);
            }
        }

        if pending_children.is_empty() {
            tracing::debug!(%id, "object complete on arrival");
            self.state.complete_objects.insert(id);
            refcount::increment_recursive(&self.store, &id)?;
            self.fold_complete_children(&complete_children)?;
            self.propagate_completion(id, parents)?;
        } else {
            tracing::debug!(%id, pending = pending_children.len(), "object incomplete");
            self.state.incomplete_objects.insert(
                id,
                ObjectEntry {
                    parents,
                    pending_children,
                    complete_children,
                },
            );
            refcount::increment_direct(&self.store, &id)?;
        }

        self.store_self()?;
        Ok(id)
    }

    /// Walk completions upward. Each waiting parent loses the completed
    /// child from its pending set; a parent left with nothing pending is
    /// promoted to complete and its own parents are visited in turn.
    /// Worklist form, so arbitrarily deep graphs cannot overflow the
    /// stack.
    fn propagate_completion(
        &mut self,
        completed: ObjectId,
        parents: BTreeSet<ObjectId>,
    ) -> Result<()> {
        let mut worklist: Vec<(ObjectId, BTreeSet<ObjectId>)> = vec![(completed, parents)];

        while let Some((child, parents)) = worklist.pop() {
            for parent in parents {
                let entry = self
                    .state
                    .incomplete_objects
                    .get_mut(&parent)
                    .expect("waiting parent is not tracked as incomplete");

                entry.pending_children.remove(&child);
                entry.complete_children.insert(child);

                if !entry.pending_children.is_empty() {
                    continue;
                }

                // Promote: the last pending descendant just completed
                tracing::trace!(%parent, "promoting to complete");
                let entry = self.state.incomplete_objects.remove(&parent).unwrap();
                self.state.complete_objects.insert(parent);
                refcount::promote(&self.store, &parent)?;
                self.fold_complete_children(&entry.complete_children)?;
                worklist.push((parent, entry.parents));
            }
        }
        Ok(())
    }

    /// Release the membership pin of complete children that no
    /// incomplete object is waiting on anymore: their subtrees stay
    /// alive through the recursive pins of their promoted parents.
    fn fold_complete_children(&mut self, children: &BTreeSet<ObjectId>) -> Result<()> {
        for child in children {
            if !self.state.complete_objects.contains(child) {
                continue;
            }
            let still_listed = self
                .state
                .incomplete_objects
                .values()
                .any(|e| e.pending_children.contains(child) || e.complete_children.contains(child));
            if !still_listed {
                tracing::trace!(%child, "folding into parent pins");
                self.state.complete_objects.remove(child);
                refcount::decrement_recursive(&self.store, child)?;
            }
        }
        Ok(())
    }

    /// Atomically retarget the branch: all progress toward the previous
    /// commit is discarded and its pins are released.
    pub async fn introduce_commit(&mut self, commit: Commit) -> Result<()> {
        tracing::debug!(root = %commit.root_id, "introducing commit");
        self.state.commit = commit;

        // Missing objects never held refcounts
        self.state.missing_objects.clear();

        let incomplete_objects = std::mem::take(&mut self.state.incomplete_objects);
        let complete_objects = std::mem::take(&mut self.state.complete_objects);

        // Incompletes only own direct units, so they go first
        for id in incomplete_objects.keys() {
            refcount::flat_remove(&self.store, id)?;
        }
        for id in &complete_objects {
            refcount::deep_remove(&self.store, id)?;
        }

        self.state
            .missing_objects
            .insert(self.state.commit.root_id, BTreeSet::new());

        self.store_self()
    }

    /// Capture the currently known subgraph into an independently
    /// pinning snapshot: every incomplete id flat, every complete id
    /// full.
    pub fn create_snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::create(self.state.commit.clone(), self.options.clone())?;

        for (id, entry) in &self.state.incomplete_objects {
            let children = entry
                .pending_children
                .iter()
                .chain(entry.complete_children.iter())
                .copied()
                .collect();
            snapshot.capture_flat_object(*id, entry.parents.clone(), &children)?;
        }
        for id in &self.state.complete_objects {
            snapshot.capture_full_object(*id)?;
        }

        snapshot.store_self()?;
        Ok(snapshot)
    }

    /// Persist the branch state. Called after every mutation so the
    /// on-disk archive never lags the in-memory collections.
    pub fn store_self(&self) -> Result<()> {
        archive::store(&self.filepath, &self.state)
    }

    /// Verify the structural invariants of the three collections.
    /// Intended for tests and debugging.
    pub fn sanity_check(&self) -> Result<()> {
        let missing: BTreeSet<_> = self.state.missing_objects.keys().copied().collect();
        let incomplete: BTreeSet<_> = self.state.incomplete_objects.keys().copied().collect();
        let complete = &self.state.complete_objects;

        if missing.intersection(&incomplete).next().is_some()
            || missing.intersection(complete).next().is_some()
            || incomplete.intersection(complete).next().is_some()
        {
            return Err(Error::Corrupt(
                "missing/incomplete/complete are not disjoint".into(),
            ));
        }

        for id in &incomplete {
            if !self.store.exists(id) {
                return Err(Error::Corrupt(format!(
                    "incomplete object {} is not in the store",
                    id
                )));
            }
        }

        for id in complete {
            if !self.store.is_complete(id)? {
                return Err(Error::Corrupt(format!(
                    "complete object {} has missing descendants",
                    id
                )));
            }
        }

        for (child, parents) in &self.state.missing_objects {
            for parent in parents {
                let listed = self
                    .state
                    .incomplete_objects
                    .get(parent)
                    .map(|e| e.pending_children.contains(child))
                    .unwrap_or(false);
                if !listed {
                    return Err(Error::Corrupt(format!(
                        "missing object {} is not pending under its parent {}",
                        child, parent
                    )));
                }
            }
        }

        // Converse direction: a pending child is either awaited through
        // the missing map or tracked as incomplete itself
        for (parent, entry) in &self.state.incomplete_objects {
            for child in &entry.pending_children {
                let tracked = if self.store.exists(child) {
                    self.state.incomplete_objects.contains_key(child)
                } else {
                    self.state
                        .missing_objects
                        .get(child)
                        .map(|parents| parents.contains(parent))
                        .unwrap_or(false)
                };
                if !tracked {
                    return Err(Error::Corrupt(format!(
                        "pending child {} of {} is not tracked",
                        child, parent
                    )));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RemoteBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBranch")
            .field("commit", &self.state.commit)
            .field("missing", &self.state.missing_objects.len())
            .field("incomplete", &self.state.incomplete_objects.len())
            .field("complete", &self.state.complete_objects.len())
            .finish()
    }
}
