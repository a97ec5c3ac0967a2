//! Content-addressed filesystem object store
//!
//! Objects are bincode archives stored under a two-level fan-out derived
//! from the hex id: the first three characters name a subdirectory, the
//! rest name the file. Each object may have a `.rc` sidecar maintained
//! by the refcount layer.

use crate::error::{Error, Result};
use crate::object::{Object, ObjectId};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};

const PREFIX_LEN: usize = 3;

/// Relative path of an object inside the store
pub fn id_to_path(id: &ObjectId) -> PathBuf {
    let hex = id.to_hex();
    let (prefix, rest) = hex.split_at(PREFIX_LEN);
    PathBuf::from(prefix).join(rest)
}

/// Store rooted at an objects directory
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects_dir: PathBuf,
}

impl ObjectStore {
    /// Open the store, creating the root directory if needed
    pub fn new(objects_dir: impl Into<PathBuf>) -> Result<Self> {
        let objects_dir = objects_dir.into();
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Absolute path of an object file
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(id_to_path(id))
    }

    /// Write an object unconditionally, returning its id
    pub fn store(&self, object: &Object) -> Result<ObjectId> {
        let id = object.calculate_id();
        self.store_at(&self.object_path(&id), object)?;
        Ok(id)
    }

    /// Write an object unless it already exists.
    /// Returns the id and whether a write happened.
    pub fn store_new(&self, object: &Object) -> Result<(ObjectId, bool)> {
        let id = object.calculate_id();
        let path = self.object_path(&id);
        if path.exists() {
            return Ok((id, false));
        }
        self.store_at(&path, object)?;
        Ok((id, true))
    }

    fn store_at(&self, path: &Path, object: &Object) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = object.to_bytes()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Check if an object is present
    pub fn exists(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }

    /// Check if an object and its entire subtree are present
    pub fn is_complete(&self, id: &ObjectId) -> Result<bool> {
        if !self.exists(id) {
            return Ok(false);
        }
        match self.load(id)? {
            Object::Blob(_) => Ok(true),
            Object::Tree(tree) => {
                for child in tree.children() {
                    if !self.is_complete(&child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Load an object by id
    pub fn load(&self, id: &ObjectId) -> Result<Object> {
        let path = self.object_path(id);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(*id)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Object::from_bytes(&data)?)
    }

    /// Load an object if present
    pub fn maybe_load(&self, id: &ObjectId) -> Result<Option<Object>> {
        match self.load(id) {
            Ok(object) => Ok(Some(object)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read the raw archived bytes of an object, for the transfer layer
    pub fn read(&self, id: &ObjectId) -> Result<Bytes> {
        let path = self.object_path(id);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(*id)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    /// Remove a single object file and its refcount sidecar.
    /// Children of a tree are kept. Returns whether the object existed.
    pub fn remove(&self, id: &ObjectId) -> Result<bool> {
        let path = self.object_path(id);
        let mut rc_path = path.clone().into_os_string();
        rc_path.push(".rc");
        let _ = fs::remove_file(rc_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of regular files under the store, refcount sidecars excluded.
    /// Intended for tests and diagnostics.
    pub fn object_file_count(&self) -> Result<usize> {
        fn walk(dir: &Path, count: &mut usize) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, count)?;
                } else if path.extension().map(|e| e != "rc").unwrap_or(true) {
                    *count += 1;
                }
            }
            Ok(())
        }
        let mut count = 0;
        walk(&self.objects_dir, &mut count)?;
        Ok(count)
    }
}
