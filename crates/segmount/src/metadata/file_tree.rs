//! Tree-layout metadata store.
//!
//! Each logical path maps to `<root>/<sanitized components>.meta` holding a JSON document
//! with the original path and its [`FileMetadata`]. Directories on disk mirror the logical
//! hierarchy, so `is_dir` is a filesystem check.
//!
//! Writes go to a temporary sibling first and are renamed into place.
//!
//! Sanitizing is lossy, so distinct logical paths can map to one file. The stored path
//! is authoritative: a record is only returned, replaced or removed for the exact path
//! it was written under.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{MetadataStore, normalize_path};
use crate::error::{Error, Result};
use crate::model::FileMetadata;

const RECORD_SUFFIX: &str = "meta";

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    path: String,
    metadata: FileMetadata,
}

/// Metadata store persisting one JSON document per path under `root`.
#[derive(Clone, Debug)]
pub struct FileTreeMetadataStore {
    root: PathBuf,
    // Serializes writers within this process.
    writes: Arc<Mutex<()>>,
}

impl FileTreeMetadataStore {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            writes: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_path(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for raw in normalize_path(path).split('/') {
            let clean = sanitize_component(raw);
            if !clean.is_empty() {
                out.push(clean);
            }
        }
        out
    }

    fn record_path(&self, path: &str) -> Result<PathBuf> {
        let dir = self.dir_path(path);
        if dir == self.root {
            return Err(Error::InvalidParams("root path cannot hold a record"));
        }
        let mut name = dir
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or(Error::InvalidParams("path has no file name"))?;
        name.push(".");
        name.push(RECORD_SUFFIX);
        Ok(dir.with_file_name(name))
    }

    fn read_record(file: &Path) -> Result<Option<StoredRecord>> {
        match fs::read(file) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record stored for exactly `normalized`. A file holding another path's record is
    /// reported as a collision.
    fn load_exact(normalized: &str, file: &Path) -> Result<Option<StoredRecord>> {
        match Self::read_record(file)? {
            Some(rec) if rec.path != normalized => {
                Err(Error::InvalidParams("path collides with another stored record"))
            }
            other => Ok(other),
        }
    }

    fn write_record(file: &Path, rec: &StoredRecord) -> Result<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(rec)?;

        let tmp = file.with_extension(format!("{RECORD_SUFFIX}.tmp"));
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, file)?;

        trace!(
            "metadata: persisted path='{}' ({} bytes) -> '{}'",
            rec.path,
            data.len(),
            file.display()
        );
        Ok(())
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let p = entry.path();
            if file_type.is_dir() {
                self.collect(&p, out)?;
            } else if p.extension().is_some_and(|ext| ext == RECORD_SUFFIX) {
                match Self::read_record(&p) {
                    Ok(Some(rec)) => out.push(rec.path),
                    Ok(None) => {}
                    Err(e) => {
                        // One unreadable record must not hide the rest.
                        trace!("metadata: skipping unreadable record '{}': {}", p.display(), e);
                    }
                }
            }
        }
        Ok(())
    }
}

impl MetadataStore for FileTreeMetadataStore {
    fn get(&self, path: &str) -> Result<FileMetadata> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            return Err(Error::NotFound(normalized));
        }
        let file = self.record_path(&normalized)?;
        match Self::read_record(&file)? {
            Some(rec) if rec.path == normalized => Ok(rec.metadata),
            _ => Err(Error::NotFound(normalized)),
        }
    }

    fn put(&self, path: &str, metadata: FileMetadata) -> Result<()> {
        metadata.validate()?;

        let normalized = normalize_path(path);
        let file = self.record_path(&normalized)?;

        let _writes = self.writes.lock();
        Self::load_exact(&normalized, &file)?;
        Self::write_record(
            &file,
            &StoredRecord {
                path: normalized,
                metadata,
            },
        )
    }

    fn delete(&self, path: &str) -> Result<()> {
        let normalized = normalize_path(path);
        let file = self.record_path(&normalized)?;

        let _writes = self.writes.lock();
        match Self::read_record(&file)? {
            Some(rec) if rec.path == normalized => {}
            _ => return Ok(()),
        }
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        path: &str,
        apply: &mut dyn FnMut(&mut FileMetadata) -> bool,
    ) -> Result<FileMetadata> {
        let normalized = normalize_path(path);
        let file = self.record_path(&normalized)?;

        let _writes = self.writes.lock();
        let Some(mut rec) = Self::load_exact(&normalized, &file)? else {
            return Err(Error::NotFound(normalized));
        };
        if apply(&mut rec.metadata) {
            rec.metadata.validate()?;
            Self::write_record(&file, &rec)?;
        }
        Ok(rec.metadata)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.collect(&self.root, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.dir_path(path).is_dir())
    }
}

/// Sanitize a single path component so it is safe to use under the store root.
///
/// Rejects traversal and absolute components, replaces control characters and
/// platform separators with `_`. Unlike cache keys, readable names are preserved.
fn sanitize_component(s: &str) -> String {
    if s == "." || s == ".." {
        return String::new();
    }

    let p = Path::new(s);
    for c in p.components() {
        match c {
            Component::Normal(_) => {}
            _ => return String::new(),
        }
    }

    s.chars()
        .map(|c| {
            if c.is_control() || c == '\\' || c == ':' {
                '_'
            } else {
                c
            }
        })
        .collect()
}
