use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{MetadataStore, normalize_path};
use crate::error::{Error, Result};
use crate::model::FileMetadata;

/// In-process metadata store backed by an ordered concurrent map.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<String, FileMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, path: &str) -> Result<FileMetadata> {
        let path = normalize_path(path);
        self.records
            .read()
            .get(&path)
            .cloned()
            .ok_or(Error::NotFound(path))
    }

    fn put(&self, path: &str, metadata: FileMetadata) -> Result<()> {
        metadata.validate()?;
        self.records.write().insert(normalize_path(path), metadata);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.records.write().remove(&normalize_path(path));
        Ok(())
    }

    fn update(
        &self,
        path: &str,
        apply: &mut dyn FnMut(&mut FileMetadata) -> bool,
    ) -> Result<FileMetadata> {
        let path = normalize_path(path);
        let mut records = self.records.write();
        let current = records.get_mut(&path).ok_or(Error::NotFound(path))?;

        let mut edited = current.clone();
        if apply(&mut edited) {
            edited.validate()?;
            *current = edited.clone();
            return Ok(edited);
        }
        Ok(current.clone())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(true);
        }
        let prefix = format!("{path}/");
        let guard = self.records.read();
        Ok(guard
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix)))
    }
}
