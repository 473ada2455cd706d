// src/plates/store.rs
//
// Persistent plate ↔ identity associations. Callers treat every error as
// non-fatal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub trait PlateStore: Send {
    fn lookup_by_plate(&mut self, plate: &str) -> Result<Option<u32>>;
    fn upsert(&mut self, id: u32, plate: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlateDocument {
    plates: BTreeMap<String, u32>,
}

/// JSON document on disk, rewritten atomically on every upsert
pub struct JsonFilePlateStore {
    path: PathBuf,
    doc: PlateDocument,
}

impl JsonFilePlateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plate store {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse plate store {}", path.display()))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create plate store directory {}", parent.display())
                })?;
            }
            PlateDocument::default()
        };
        info!(
            "Plate store {} opened ({} plates)",
            path.display(),
            doc.plates.len()
        );
        Ok(Self { path, doc })
    }

    fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&self.doc)?;
        fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl PlateStore for JsonFilePlateStore {
    fn lookup_by_plate(&mut self, plate: &str) -> Result<Option<u32>> {
        Ok(self.doc.plates.get(plate).copied())
    }

    fn upsert(&mut self, id: u32, plate: &str) -> Result<()> {
        let previous = self.doc.plates.insert(plate.to_string(), id);
        if let Err(e) = self.persist() {
            // Keep memory and disk consistent so the write can be replayed
            match previous {
                Some(prev) => self.doc.plates.insert(plate.to_string(), prev),
                None => self.doc.plates.remove(plate),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPlateStore {
    plates: BTreeMap<String, u32>,
}

impl MemoryPlateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlateStore for MemoryPlateStore {
    fn lookup_by_plate(&mut self, plate: &str) -> Result<Option<u32>> {
        Ok(self.plates.get(plate).copied())
    }

    fn upsert(&mut self, id: u32, plate: &str) -> Result<()> {
        self.plates.insert(plate.to_string(), id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("safedrive-store-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.json", name));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryPlateStore::new();
        assert_eq!(store.lookup_by_plate("AB123CD").unwrap(), None);
        store.upsert(4, "AB123CD").unwrap();
        assert_eq!(store.lookup_by_plate("AB123CD").unwrap(), Some(4));
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let path = temp_store_path("reopen");
        {
            let mut store = JsonFilePlateStore::open(&path).unwrap();
            assert!(store.doc.plates.is_empty());
            store.upsert(11, "GH456JK").unwrap();
        }
        let mut store = JsonFilePlateStore::open(&path).unwrap();
        assert_eq!(store.lookup_by_plate("GH456JK").unwrap(), Some(11));
        assert_eq!(store.lookup_by_plate("ZZ000ZZ").unwrap(), None);
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let path = temp_store_path("corrupt");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFilePlateStore::open(&path).is_err());
    }

    #[test]
    fn test_open_creates_missing_parent_directory() {
        let root = temp_store_path("fresh").with_extension("d");
        let _ = fs::remove_dir_all(&root);
        let path = root.join("data").join("plates.json");

        let mut store = JsonFilePlateStore::open(&path).unwrap();
        store.upsert(3, "CAR0001").unwrap();
        assert!(path.is_file());
        assert_eq!(
            JsonFilePlateStore::open(&path)
                .unwrap()
                .lookup_by_plate("CAR0001")
                .unwrap(),
            Some(3)
        );
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let root = temp_store_path("vanished").with_extension("d");
        let _ = fs::remove_dir_all(&root);
        let path = root.join("nested").join("plates.json");
        let mut store = JsonFilePlateStore::open(&path).unwrap();

        // Directory disappears after open, so persisting fails
        fs::remove_dir_all(&root).unwrap();
        assert!(store.upsert(1, "AB123CD").is_err());
        assert_eq!(store.lookup_by_plate("AB123CD").unwrap(), None);
    }
}
