//! Backing stores for metadata entries.
//!
//! Two implementations: a local directory and an in-memory map. Writes are
//! atomic everywhere: content lands under a shadow name first and is renamed
//! into place, so a crash never leaves a half-written checkpoint.

use crate::error::{RedoError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Named-blob store for checkpoints and the schema snapshot.
pub trait MetadataStore: Send + Sync {
    fn read(&self, name: &str, max_size: usize) -> Result<Option<Vec<u8>>>;
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;
    fn drop_entry(&self, name: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<String>>;
}

/// Local-directory store; entry name == file name.
pub struct DirStore {
    base_dir: PathBuf,
}

impl DirStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(DirStore { base_dir })
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(RedoError::data(30003, format!("invalid metadata entry name: {name}")));
        }
        Ok(self.base_dir.join(name))
    }
}

impl MetadataStore for DirStore {
    fn read(&self, name: &str, max_size: usize) -> Result<Option<Vec<u8>>> {
        let path = self.path(name)?;
        match fs::metadata(&path) {
            Ok(meta) => {
                if meta.len() as usize > max_size {
                    return Err(RedoError::data(
                        30004,
                        format!("metadata entry {name} exceeds {max_size} bytes"),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(fs::read(&path)?))
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        let shadow = self.base_dir.join(format!("{name}.tmp"));
        {
            let mut file = fs::File::create(&shadow)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&shadow, &path)?;
        Ok(())
    }

    fn drop_entry(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-memory store; stands in for a key-value service and backs tests.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemStore {
    fn read(&self, name: &str, max_size: usize) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read();
        match entries.get(name) {
            Some(bytes) if bytes.len() > max_size => Err(RedoError::data(
                30004,
                format!("metadata entry {name} exceeds {max_size} bytes"),
            )),
            Some(bytes) => Ok(Some(bytes.clone())),
            None => Ok(None),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn drop_entry(&self, name: &str) -> Result<()> {
        self.entries.write().remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dir_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        assert_eq!(store.read("x", 1024).unwrap(), None);
        store.write("x", b"payload").unwrap();
        assert_eq!(store.read("x", 1024).unwrap().unwrap(), b"payload");
        assert_eq!(store.list().unwrap(), vec!["x"]);
        store.drop_entry("x").unwrap();
        assert_eq!(store.read("x", 1024).unwrap(), None);
    }

    #[test]
    fn dir_store_write_is_shadowed() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        store.write("chk", b"v1").unwrap();
        store.write("chk", b"v2").unwrap();
        assert_eq!(store.read("chk", 16).unwrap().unwrap(), b"v2");
        // No shadow files are visible.
        assert_eq!(store.list().unwrap(), vec!["chk"]);
    }

    #[test]
    fn dir_store_rejects_path_escapes() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        assert!(store.write("../evil", b"x").is_err());
        assert!(store.write("", b"x").is_err());
    }

    #[test]
    fn size_limit_enforced() {
        let store = MemStore::new();
        store.write("big", &[0u8; 100]).unwrap();
        assert!(store.read("big", 10).is_err());
        assert!(store.read("big", 100).is_ok());
    }

    #[test]
    fn mem_store_round_trip() {
        let store = MemStore::new();
        store.write("a", b"1").unwrap();
        store.write("b", b"2").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a", "b"]);
        store.drop_entry("a").unwrap();
        assert_eq!(store.list().unwrap(), vec!["b"]);
    }
}
