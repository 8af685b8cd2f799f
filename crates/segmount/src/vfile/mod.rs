//! Segmented virtual files.
//!
//! A [`VirtualFile`] exposes one metadata record as a seekable byte source. Reads map
//! `[offset, offset + len)` onto the overlapping segments (binary search over the
//! contiguous segment list), fetch them through the [`ProviderPool`] with bounded
//! read-ahead, decode them when the file is encrypted and slice the requested bytes out.
//!
//! Corrupted-region handling is a per-request choice ([`ReadOptions::show_corrupted`]):
//! - off: any segment that cannot be fetched fails the whole read;
//! - on: the segment's byte range is returned zero-filled and the read continues.
//!
//! The persisted [`FileStatus`] is reported through [`FileStat`] but never changes how a
//! read behaves.

use std::io::SeekFrom;
use std::ops::Range;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::metadata::{MetadataStore, normalize_path};
use crate::model::{EncryptionMode, FileMetadata, FileStatus, SegmentInfo};
use crate::pool::ProviderPool;
use crate::settings::EngineSettings;

mod decode;

pub use decode::{
    Aes128CbcDecoder, DecodeContext, DecoderRegistry, KeyResolver, SegmentByteStream,
    SegmentDecoder, decode_segment,
};

/// Per-request read policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Zero-fill segments that cannot be fetched instead of failing the read.
    pub show_corrupted: bool,
}

impl ReadOptions {
    pub fn show_corrupted(mut self, v: bool) -> Self {
        self.show_corrupted = v;
        self
    }
}

/// Result of `stat` on a path or an open file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
    pub mod_time: SystemTime,
    /// `None` for directories.
    pub status: Option<FileStatus>,
}

/// Opens virtual files from a metadata store.
#[derive(Clone)]
pub struct FileOpener {
    store: Arc<dyn MetadataStore>,
    pool: ProviderPool,
    decoders: DecoderRegistry,
    settings: Arc<EngineSettings>,
}

impl std::fmt::Debug for FileOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOpener")
            .field("pool", &self.pool)
            .field("decoders", &self.decoders)
            .finish_non_exhaustive()
    }
}

impl FileOpener {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pool: ProviderPool,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            store,
            pool,
            decoders: DecoderRegistry::new(),
            settings,
        }
    }

    pub fn with_decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = decoders;
        self
    }

    /// Opens `path` for reading.
    ///
    /// Fails with [`Error::IsDirectory`] for containers and [`Error::NotFound`] when the
    /// path has no record.
    pub fn open(&self, path: &str, options: ReadOptions) -> Result<VirtualFile> {
        let path = normalize_path(path);
        let meta = match self.store.get(&path) {
            Ok(meta) => meta,
            Err(Error::NotFound(_)) if self.store.is_dir(&path)? => {
                return Err(Error::IsDirectory(path));
            }
            Err(e) => return Err(e),
        };
        Ok(VirtualFile::new(
            path,
            meta,
            self.pool.clone(),
            &self.decoders,
            options,
            &self.settings,
        ))
    }

    /// Stats a path without opening it.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize_path(path);
        match self.store.get(&path) {
            Ok(meta) => Ok(FileStat::of(&meta)),
            Err(Error::NotFound(_)) if self.store.is_dir(&path)? => Ok(FileStat {
                size: 0,
                is_directory: true,
                mod_time: SystemTime::UNIX_EPOCH,
                status: None,
            }),
            Err(e) => Err(e),
        }
    }
}

impl FileStat {
    fn of(meta: &FileMetadata) -> Self {
        Self {
            size: meta.file_size,
            is_directory: false,
            mod_time: meta.modified_at,
            status: Some(meta.status),
        }
    }
}

struct FileShared {
    path: String,
    meta: FileMetadata,
    pool: ProviderPool,
    // `Err(mode)` when no decoder is registered for the file's mode.
    decoder: std::result::Result<Option<Arc<dyn SegmentDecoder>>, EncryptionMode>,
    options: ReadOptions,
    read_ahead: usize,
    cache: Mutex<LruCache<usize, Bytes>>,
}

/// A seekable view over one file's segments.
///
/// Holds a snapshot of the metadata taken at open; a later repair does not affect
/// already open files.
pub struct VirtualFile {
    shared: Arc<FileShared>,
    cancel: CancellationToken,
    offset: u64,
}

impl std::fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFile")
            .field("path", &self.shared.path)
            .field("size", &self.shared.meta.file_size)
            .field("offset", &self.offset)
            .field("options", &self.shared.options)
            .finish()
    }
}

impl VirtualFile {
    fn new(
        path: String,
        meta: FileMetadata,
        pool: ProviderPool,
        decoders: &DecoderRegistry,
        options: ReadOptions,
        settings: &EngineSettings,
    ) -> Self {
        let decoder = decoders.resolve(meta.encryption).map_err(|_| meta.encryption);
        Self {
            shared: Arc::new(FileShared {
                path,
                meta,
                pool,
                decoder,
                options,
                read_ahead: settings.read_ahead_segments.max(1),
                cache: Mutex::new(LruCache::new(settings.segment_cache_capacity)),
            }),
            cancel: CancellationToken::new(),
            offset: 0,
        }
    }

    /// Uses `cancel` for every fetch issued by this file.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.shared.meta
    }

    pub fn size(&self) -> u64 {
        self.shared.meta.file_size
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn stat(&self) -> FileStat {
        FileStat::of(&self.shared.meta)
    }

    /// Reads at the current offset, advancing it. Returns `0` at or past EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if buf.is_empty() || self.offset >= size {
            return Ok(0);
        }
        let end = self.offset.saturating_add(buf.len() as u64).min(size);
        let data = self.read_range(self.offset, end).await?;
        buf[..data.len()].copy_from_slice(&data);
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    /// Moves the logical offset. Seeking past EOF is allowed; seeking before 0 is not.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
        };
        let target = target.ok_or(Error::InvalidParams("seek before start of file"))?;
        self.offset = target;
        Ok(target)
    }

    /// Reads `[start, end)` without moving the offset. The range is clamped to the file.
    ///
    /// The whole range is buffered in memory; large ranges should go through
    /// [`stream_range`](Self::stream_range).
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let end = end.min(self.size());
        if start >= end {
            return Ok(Bytes::new());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let range = self.shared.meta.segments_overlapping(start, end);
        trace!(
            path = %self.shared.path,
            start,
            end,
            segments = ?range,
            "vfile: read range"
        );

        let mut out = BytesMut::with_capacity(initial_capacity(start, end)?);
        let mut parts = stream::iter(range)
            .map(|idx| {
                let shared = &self.shared;
                let cancel = &self.cancel;
                async move { shared.load_segment(idx, cancel).await.map(|b| (idx, b)) }
            })
            .buffered(self.shared.read_ahead);

        while let Some(part) = parts.next().await {
            let (idx, body) = part?;
            let seg = &self.shared.meta.segments[idx];
            out.extend_from_slice(&body[slice_bounds(seg, start, end)]);
        }
        Ok(out.freeze())
    }

    /// Streams `[start, end)` as one chunk per overlapping segment.
    pub fn stream_range(&self, start: u64, end: u64) -> SegmentByteStream {
        let end = end.min(self.size());
        let range = if start < end {
            self.shared.meta.segments_overlapping(start, end)
        } else {
            0..0
        };

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        stream::iter(range)
            .map(move |idx| {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                async move {
                    let body = shared.load_segment(idx, &cancel).await?;
                    let bounds = slice_bounds(&shared.meta.segments[idx], start, end);
                    Ok(body.slice(bounds))
                }
            })
            .buffered(self.shared.read_ahead)
            .boxed()
    }
}

impl FileShared {
    /// Full decoded body of segment `idx`, from cache when possible.
    async fn load_segment(&self, idx: usize, cancel: &CancellationToken) -> Result<Bytes> {
        let cached = self.cache.lock().get(&idx).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let seg = &self.meta.segments[idx];
        if seg.unreachable && self.options.show_corrupted {
            trace!(
                path = %self.path,
                segment = idx,
                "vfile: zero-filling segment marked unreachable"
            );
            return Ok(zeroed(seg.size));
        }

        match self.fetch_decoded(idx, seg, cancel).await {
            Ok(body) => {
                self.cache.lock().put(idx, body.clone());
                Ok(body)
            }
            Err(e) if self.options.show_corrupted && e.is_segment_failure() => {
                warn!(
                    path = %self.path,
                    segment = idx,
                    remote_id = %seg.remote_id,
                    "vfile: zero-filling unavailable segment: {}",
                    e
                );
                Ok(zeroed(seg.size))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_decoded(
        &self,
        idx: usize,
        seg: &SegmentInfo,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let decoder = self
            .decoder
            .clone()
            .map_err(Error::UnsupportedEncryption)?;

        let raw = self
            .pool
            .fetch_segment_bytes(cancel, &seg.remote_id, &seg.groups)
            .await?;

        let body = match decoder {
            Some(d) => {
                let ctx = DecodeContext {
                    remote_id: &seg.remote_id,
                    segment_index: idx,
                    password: self.meta.password.as_deref(),
                };
                decode_segment(d.as_ref(), &ctx, raw).await?
            }
            None => raw,
        };

        let expected = seg.size as usize;
        if body.len() < expected {
            return Err(Error::SegmentUnavailable {
                remote_id: seg.remote_id.clone(),
                reason: format!("short body: {} of {} bytes", body.len(), expected),
            });
        }
        Ok(body.slice(..expected))
    }
}

/// Upper bound on what `read_range` reserves before any segment arrives.
const MAX_PREALLOC: usize = 8 * 1024 * 1024;

fn initial_capacity(start: u64, end: u64) -> Result<usize> {
    let len = usize::try_from(end - start)
        .map_err(|_| Error::InvalidParams("range does not fit in memory; use stream_range"))?;
    Ok(len.min(MAX_PREALLOC))
}

fn zeroed(size: u64) -> Bytes {
    Bytes::from(vec![0u8; size as usize])
}

/// Part of `seg`'s body that falls inside `[start, end)`, relative to the segment.
fn slice_bounds(seg: &SegmentInfo, start: u64, end: u64) -> Range<usize> {
    let lo = start.max(seg.start_offset) - seg.start_offset;
    let hi = end.min(seg.end_offset) - seg.start_offset;
    lo as usize..hi as usize
}
