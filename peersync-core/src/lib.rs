//! Peersync Core Library
//!
//! Core synchronization and bookkeeping engine for content-addressed,
//! peer-to-peer file replication:
//! - Object model (Blob, Tree) named by Sha256 digests
//! - Content-addressed filesystem object store
//! - Dual reference counting (direct / recursive) with subtree sweeps
//! - Per-peer RemoteBranch ingest state machine
//! - Snapshots and snapshot groups pinning in-flight transfers
//! - Peer identities, version vectors and commits

pub mod archive;
pub mod error;
pub mod object;
pub mod options;
pub mod refcount;
pub mod remote_branch;
pub mod snapshot;
pub mod store;
pub mod version;

pub use error::{Error, Result};
pub use object::{Blob, Object, ObjectId, Tree};
pub use options::SyncOptions;
pub use remote_branch::{ObjectEntry, RemoteBranch};
pub use snapshot::{Children, Node, NodeType, Snapshot, SnapshotGroup};
pub use store::ObjectStore;
pub use version::{Commit, UserId, VersionVector};
