//! Metadata persistence.
//!
//! The engine reads and writes one [`FileMetadata`] record per logical path through the
//! [`MetadataStore`] trait. Two implementations ship with the crate:
//! - [`MemoryMetadataStore`]: a concurrent in-process map.
//! - [`FileTreeMetadataStore`]: one JSON document per path under a root directory.
//!
//! Paths are slash-separated and normalized with [`normalize_path`] before use, so
//! `"movies//a.mkv/"` and `"/movies/a.mkv"` address the same record.

mod file_tree;
mod memory;

pub use file_tree::FileTreeMetadataStore;
pub use memory::MemoryMetadataStore;

use crate::error::Result;
use crate::model::FileMetadata;

/// Logical persistence contract for file records. No business logic lives here.
pub trait MetadataStore: Send + Sync + 'static {
    /// Returns the record for `path`, or [`crate::Error::NotFound`].
    fn get(&self, path: &str) -> Result<FileMetadata>;

    /// Inserts or replaces the record for `path`. The record is validated first.
    fn put(&self, path: &str, metadata: FileMetadata) -> Result<()>;

    /// Removes the record for `path`. Removing a missing record is not an error.
    fn delete(&self, path: &str) -> Result<()>;

    /// Read-modify-write of the current record for `path`.
    ///
    /// `apply` edits the record in place and returns whether it should be written back.
    /// Returns the record as stored afterwards, or [`crate::Error::NotFound`] when the
    /// path has no record. The default implementation is not atomic; both shipped stores
    /// serialize it against their other writers.
    fn update(
        &self,
        path: &str,
        apply: &mut dyn FnMut(&mut FileMetadata) -> bool,
    ) -> Result<FileMetadata> {
        let mut current = self.get(path)?;
        if apply(&mut current) {
            self.put(path, current.clone())?;
        }
        Ok(current)
    }

    /// All file paths currently stored.
    fn list(&self) -> Result<Vec<String>>;

    /// True when `path` is a container of other records rather than a file.
    fn is_dir(&self, path: &str) -> Result<bool>;
}

/// Normalizes a logical path: leading `/`, no empty or `.` components, no trailing `/`.
///
/// `..` components are dropped rather than resolved.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." || comp == ".." {
            continue;
        }
        out.push('/');
        out.push_str(comp);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
