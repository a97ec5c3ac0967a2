//! End-to-end tests of the branch / snapshot interplay

use peersync_core::{
    refcount, Blob, Commit, NodeType, ObjectId, RemoteBranch, Snapshot, SyncOptions, Tree, UserId,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

struct Environment {
    _tmp: TempDir,
    options: SyncOptions,
}

impl Environment {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let options = SyncOptions::under(tmp.path());
        options.create_dirs().unwrap();
        Self { _tmp: tmp, options }
    }

    fn branch(&self, root: ObjectId) -> RemoteBranch {
        let filepath = self.options.branch_state_path(&UserId::random());
        RemoteBranch::create(Commit::from_root(root), filepath, self.options.clone()).unwrap()
    }
}

fn blob(data: &[u8]) -> Blob {
    Blob::from_bytes(data.to_vec())
}

#[tokio::test]
async fn test_snapshot_outlives_commit_switch() {
    let env = Environment::new();

    let file_a = blob(b"contents of a");
    let file_b = blob(b"contents of b");
    let a_id = file_a.calculate_id();
    let b_id = file_b.calculate_id();
    let mut root = Tree::new();
    root.insert("a", a_id);
    root.insert("b", b_id);
    let root_id = root.calculate_id();

    let mut branch = env.branch(root_id);
    branch.insert_tree(&root).await.unwrap();
    branch.insert_blob(&file_a).await.unwrap();
    branch.sanity_check().unwrap();

    // Pin the half-finished graph: the incomplete root flat, the
    // completed child full.
    let snapshot = branch.create_snapshot().unwrap();
    assert_eq!(snapshot.nodes()[&root_id].typ, NodeType::Incomplete);
    assert_eq!(snapshot.nodes()[&a_id].typ, NodeType::Complete);

    // The branch moves on to a different commit and releases everything
    // it held, but the snapshot's own pins keep the objects alive.
    let next_root = blob(b"next").calculate_id();
    branch
        .introduce_commit(Commit::from_root(next_root))
        .await
        .unwrap();
    branch.sanity_check().unwrap();

    assert!(branch.store().exists(&root_id));
    assert!(branch.store().exists(&a_id));

    drop(snapshot);
    assert!(!branch.store().exists(&root_id));
    assert!(!branch.store().exists(&a_id));
    assert_eq!(branch.store().object_file_count().unwrap(), 0);
}

#[tokio::test]
async fn test_full_sync_then_retarget() {
    let env = Environment::new();

    let file_a = blob(b"a");
    let file_b = blob(b"b");
    let mut subdir = Tree::new();
    subdir.insert("b", file_b.calculate_id());
    let mut root = Tree::new();
    root.insert("a", file_a.calculate_id());
    root.insert("sub", subdir.calculate_id());
    let root_id = root.calculate_id();

    let mut branch = env.branch(root_id);

    // The transfer layer asks which children it still needs
    branch.insert_tree(&root).await.unwrap();
    let wanted = branch.filter_missing(root.children());
    assert_eq!(wanted.len(), 2);

    branch.insert_blob(&file_a).await.unwrap();
    branch.insert_tree(&subdir).await.unwrap();
    branch.insert_blob(&file_b).await.unwrap();
    branch.sanity_check().unwrap();

    // Everything folded into the root's single recursive pin
    assert_eq!(branch.complete_objects().len(), 1);
    assert!(branch.complete_objects().contains(&root_id));
    assert_eq!(
        refcount::read(branch.store(), &root_id)
            .unwrap()
            .recursive_count(),
        1
    );

    // Retargeting wipes the graph and the store alike
    let next_root = blob(b"v2").calculate_id();
    branch
        .introduce_commit(Commit::from_root(next_root))
        .await
        .unwrap();
    branch.sanity_check().unwrap();

    assert_eq!(branch.missing_objects().len(), 1);
    assert!(branch.missing_objects().contains_key(&next_root));
    assert_eq!(branch.store().object_file_count().unwrap(), 0);
}

#[tokio::test]
async fn test_branch_restart_resumes_ingest() {
    let env = Environment::new();

    let file_a = blob(b"a");
    let file_b = blob(b"b");
    let mut root = Tree::new();
    root.insert("a", file_a.calculate_id());
    root.insert("b", file_b.calculate_id());
    let root_id = root.calculate_id();

    let filepath = env.options.branch_state_path(&UserId::random());
    let mut branch = RemoteBranch::create(
        Commit::from_root(root_id),
        filepath.clone(),
        env.options.clone(),
    )
    .unwrap();
    branch.insert_tree(&root).await.unwrap();
    branch.insert_blob(&file_a).await.unwrap();
    drop(branch);

    // A restarted process picks up where the persisted state left off
    let mut branch = RemoteBranch::load(filepath, env.options.clone()).unwrap();
    branch.sanity_check().unwrap();
    assert!(branch.missing_objects().contains_key(&file_b.calculate_id()));

    branch.insert_blob(&file_b).await.unwrap();
    branch.sanity_check().unwrap();
    assert_eq!(
        branch.complete_objects(),
        &[root_id].into_iter().collect::<BTreeSet<_>>()
    );
}

#[tokio::test]
async fn test_snapshot_completes_independently_of_branch() {
    let env = Environment::new();

    let file = blob(b"payload");
    let file_id = file.calculate_id();
    let mut root = Tree::new();
    root.insert("f", file_id);
    let root_id = root.calculate_id();

    let mut branch = env.branch(root_id);
    branch.insert_tree(&root).await.unwrap();

    let mut snapshot = branch.create_snapshot().unwrap();
    assert_eq!(snapshot.nodes()[&root_id].typ, NodeType::Incomplete);

    // The object arrives: the branch ingests it and the snapshot is
    // told as well, completing its own view.
    branch.insert_blob(&file).await.unwrap();
    assert!(snapshot
        .insert_object(file_id, &BTreeSet::new())
        .unwrap());

    assert_eq!(snapshot.nodes()[&root_id].typ, NodeType::Complete);

    // Branch and snapshot each hold one recursive unit on the root
    assert_eq!(
        refcount::read(branch.store(), &root_id)
            .unwrap()
            .recursive_count(),
        2
    );

    drop(snapshot);
    assert_eq!(
        refcount::read(branch.store(), &root_id)
            .unwrap()
            .recursive_count(),
        1
    );
}

#[tokio::test]
async fn test_snapshot_diamond_completion_releases_shared_child() {
    let env = Environment::new();

    let shared = blob(b"shared");
    let shared_id = shared.calculate_id();
    let mut left = Tree::new();
    left.insert("s", shared_id);
    let mut right = Tree::new();
    right.insert("s", shared_id);
    right.insert("marker", shared_id);
    let mut root = Tree::new();
    root.insert("l", left.calculate_id());
    root.insert("r", right.calculate_id());
    let root_id = root.calculate_id();

    let mut branch = env.branch(root_id);
    branch.insert_tree(&root).await.unwrap();
    branch.insert_tree(&left).await.unwrap();
    branch.insert_tree(&right).await.unwrap();

    // Snapshot captured mid-diamond: three flat nodes, shared still a
    // placeholder awaited by both interior trees.
    let mut snapshot = branch.create_snapshot().unwrap();
    assert_eq!(snapshot.nodes()[&shared_id].typ, NodeType::Missing);

    branch.insert_blob(&shared).await.unwrap();
    branch.sanity_check().unwrap();
    assert!(snapshot
        .insert_object(shared_id, &BTreeSet::new())
        .unwrap());

    // Both parent branches promoted; the shared child's own unit is
    // released on disk, in the branch's view and the snapshot's alike.
    assert_eq!(snapshot.nodes().len(), 1);
    assert_eq!(snapshot.nodes()[&root_id].typ, NodeType::Complete);
    let shared_rc = refcount::read(branch.store(), &shared_id).unwrap();
    assert_eq!(shared_rc.recursive_count(), 0);
    assert_eq!(shared_rc.direct_count(), 0);
    assert!(branch.store().exists(&shared_id));
    // One recursive unit from the branch, one from the snapshot
    assert_eq!(
        refcount::read(branch.store(), &root_id)
            .unwrap()
            .recursive_count(),
        2
    );

    branch
        .introduce_commit(Commit::from_root(blob(b"next").calculate_id()))
        .await
        .unwrap();
    assert!(branch.store().exists(&shared_id));

    drop(snapshot);
    assert!(!branch.store().exists(&shared_id));
    assert_eq!(branch.store().object_file_count().unwrap(), 0);
}

#[tokio::test]
async fn test_grouped_snapshots_release_together() {
    let env = Environment::new();

    let root_a = blob(b"peer a root");
    let root_b = blob(b"peer b root");

    let mut branch_a = env.branch(root_a.calculate_id());
    branch_a.insert_blob(&root_a).await.unwrap();
    let mut branch_b = env.branch(root_b.calculate_id());
    branch_b.insert_blob(&root_b).await.unwrap();

    let group = peersync_core::SnapshotGroup::new(
        [
            (UserId::random(), branch_a.create_snapshot().unwrap()),
            (UserId::random(), branch_b.create_snapshot().unwrap()),
        ]
        .into_iter()
        .collect(),
    );
    assert_eq!(group.len(), 2);
    let group_id = *group.id();

    // Both branches abandon their commits; the group keeps the roots
    branch_a
        .introduce_commit(Commit::from_root(blob(b"na").calculate_id()))
        .await
        .unwrap();
    branch_b
        .introduce_commit(Commit::from_root(blob(b"nb").calculate_id()))
        .await
        .unwrap();
    assert!(branch_a.store().exists(&root_a.calculate_id()));
    assert!(branch_b.store().exists(&root_b.calculate_id()));

    drop(group);
    assert!(!branch_a.store().exists(&root_a.calculate_id()));
    assert!(!branch_b.store().exists(&root_b.calculate_id()));
    assert_ne!(group_id, ObjectId::new([0u8; 32]));
}

#[test]
fn test_snapshot_restore_after_restart() {
    let env = Environment::new();

    let root = blob(b"root");
    let store = peersync_core::ObjectStore::new(env.options.objects_dir.clone()).unwrap();
    let root_id = store.store(&root.into()).unwrap();

    let mut snapshot = Snapshot::create(Commit::from_root(root_id), env.options.clone()).unwrap();
    snapshot.insert_object(root_id, &BTreeSet::new()).unwrap();
    let path = snapshot.path().clone();
    std::mem::forget(snapshot);

    // After a process restart the archived snapshot still owns its pins
    let restored = Snapshot::load(path, env.options.clone()).unwrap();
    assert_eq!(restored.nodes()[&root_id].typ, NodeType::Complete);
    drop(restored);
    assert!(!store.exists(&root_id));
}
