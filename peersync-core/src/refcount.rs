//! Reference counting for stored objects
//!
//! Two counters per object, kept in a `.rc` sidecar next to the object
//! file (two big-endian u32s: recursive, then direct). The recursive
//! count is for holders that pin the object together with its whole
//! subtree; the direct count is for holders of the object alone, which
//! is what incomplete objects get while their descendants are still
//! being fetched.
//!
//! An object is eligible for deletion once both counts are zero.
//! Releasing the last recursive unit sweeps the subtree: children that
//! are themselves unreferenced are deleted along with the object, while
//! children holding their own counts are left alone.
//!
//! Decrementing a zero counter means the bookkeeping has diverged from
//! the store and there is no safe way to continue; it aborts.

use crate::error::Result;
use crate::object::{Object, ObjectId};
use crate::store::ObjectStore;
use std::fs;
use std::path::PathBuf;

/// Loaded refcount record of one object
#[derive(Debug)]
pub struct Rc {
    path: PathBuf,
    recursive: u32,
    direct: u32,
}

impl Rc {
    /// Load the record, treating a missing sidecar as two zero counts
    pub fn load(store: &ObjectStore, id: &ObjectId) -> Result<Self> {
        let mut path = store.object_path(id).into_os_string();
        path.push(".rc");
        let path = PathBuf::from(path);

        match fs::read(&path) {
            Ok(data) if data.len() == 8 => Ok(Self {
                path,
                recursive: u32::from_be_bytes(data[0..4].try_into().unwrap()),
                direct: u32::from_be_bytes(data[4..8].try_into().unwrap()),
            }),
            Ok(_) => panic!("refcount sidecar has invalid length: {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                path,
                recursive: 0,
                direct: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recursive_count(&self) -> u32 {
        self.recursive
    }

    pub fn direct_count(&self) -> u32 {
        self.direct
    }

    pub fn both_are_zero(&self) -> bool {
        self.recursive == 0 && self.direct == 0
    }

    pub fn increment_recursive(&mut self) -> Result<()> {
        self.recursive += 1;
        self.commit()
    }

    pub fn increment_direct(&mut self) -> Result<()> {
        self.direct += 1;
        self.commit()
    }

    pub fn decrement_recursive(&mut self) -> Result<()> {
        assert!(self.recursive > 0, "recursive refcount underflow: {:?}", self.path);
        self.recursive -= 1;
        self.commit()
    }

    pub fn decrement_direct(&mut self) -> Result<()> {
        assert!(self.direct > 0, "direct refcount underflow: {:?}", self.path);
        self.direct -= 1;
        self.commit()
    }

    /// Exchange a direct unit for a recursive one in a single update,
    /// so no observer sees the object transiently unpinned.
    pub fn promote(&mut self) -> Result<()> {
        assert!(self.direct > 0, "direct refcount underflow: {:?}", self.path);
        self.direct -= 1;
        self.recursive += 1;
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&self.recursive.to_be_bytes());
        data[4..8].copy_from_slice(&self.direct.to_be_bytes());
        fs::write(&self.path, data)?;
        Ok(())
    }
}

/// Read both counts of an object
pub fn read(store: &ObjectStore, id: &ObjectId) -> Result<Rc> {
    Rc::load(store, id)
}

/// Take one recursive unit, returning the new count
pub fn increment_recursive(store: &ObjectStore, id: &ObjectId) -> Result<u32> {
    let mut rc = Rc::load(store, id)?;
    rc.increment_recursive()?;
    Ok(rc.recursive_count())
}

/// Take one direct unit, returning the new count
pub fn increment_direct(store: &ObjectStore, id: &ObjectId) -> Result<u32> {
    let mut rc = Rc::load(store, id)?;
    rc.increment_direct()?;
    Ok(rc.direct_count())
}

/// Release one recursive unit without deleting anything.
///
/// Used when a completed child is folded into its parent: the child's
/// own unit is released and the subtree stays alive through the
/// parent's recursive pin.
pub fn decrement_recursive(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let mut rc = Rc::load(store, id)?;
    rc.decrement_recursive()
}

/// Exchange a direct unit for a recursive one (incomplete → complete)
pub fn promote(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let mut rc = Rc::load(store, id)?;
    rc.promote()
}

/// Release a direct unit and delete the object file once both counts
/// are zero. Children of a tree are kept.
pub fn flat_remove(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let mut rc = Rc::load(store, id)?;
    rc.decrement_direct()?;
    if rc.both_are_zero() {
        store.remove(id)?;
    }
    Ok(())
}

/// Release a recursive unit. When both counts reach zero the object is
/// deleted and the sweep descends into children that are themselves
/// unreferenced.
pub fn deep_remove(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let mut rc = Rc::load(store, id)?;
    rc.decrement_recursive()?;
    if rc.both_are_zero() {
        sweep(store, id)?;
    }
    Ok(())
}

/// Delete an unreferenced object and any unreferenced descendants.
/// A child holding either count stops the sweep there. Worklist form,
/// so arbitrarily deep graphs cannot overflow the stack.
fn sweep(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let mut worklist = vec![*id];
    while let Some(id) = worklist.pop() {
        if !store.exists(&id) {
            // Already removed through another path of the DAG
            continue;
        }
        let object = store.load(&id)?;
        store.remove(&id)?;
        if let Object::Tree(tree) = object {
            for child in tree.children() {
                if Rc::load(store, &child)?.both_are_zero() {
                    worklist.push(child);
                }
            }
        }
    }
    Ok(())
}
