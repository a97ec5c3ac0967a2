//! Atomic binary state persistence
//!
//! Branch and snapshot state files are bincode archives written through a
//! temp file and renamed into place, so a crash mid-write leaves the
//! previous state intact.

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::Path;

/// Serialize `value` and atomically replace the file at `path`.
pub fn store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = bincode::serialize(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a value previously written with [`store`].
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(bincode::deserialize(&data)?)
}

/// Remove a state file if it exists.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_store_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state");

        let value: BTreeMap<String, u64> = [("a".to_string(), 1), ("b".to_string(), 2)]
            .into_iter()
            .collect();
        store(&path, &value).unwrap();

        let loaded: BTreeMap<String, u64> = load(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_store_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state");

        store(&path, &1u32).unwrap();
        store(&path, &2u32).unwrap();
        let loaded: u32 = load(&path).unwrap();
        assert_eq!(loaded, 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state");

        store(&path, &1u32).unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
