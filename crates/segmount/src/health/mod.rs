//! Health engine: segment reachability checks, status transitions and repair.
//!
//! Every check or repair is single-flight per path: a second request for a busy path
//! fails with [`Error::ConflictingOperation`](crate::Error::ConflictingOperation).
//! On-demand requests and the background worker share the same guard.
//!
//! Status policy (`k` unreachable out of `n` segments):
//! - `k == 0` → [`FileStatus::Healthy`]
//! - `k == n`, or reachable ratio below `health_corrupted_threshold` → [`FileStatus::Corrupted`]
//! - otherwise → [`FileStatus::Partial`]
//!
//! Outcomes are written to the metadata store; they are never raised as errors.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::metadata::{MetadataStore, normalize_path};
use crate::model::{FileMetadata, FileStatus, SegmentInfo};
use crate::pool::ProviderPool;
use crate::settings::EngineSettings;

mod single_flight;
mod worker;

use single_flight::SingleFlight;
pub use worker::{HealthWorkerStatus, PassProgress, PassSummary};

/// Re-resolves an unreachable segment to a replacement (e.g. from an alternate source
/// descriptor).
#[async_trait]
pub trait SegmentResolver: Send + Sync + 'static {
    /// Returns a replacement covering the same byte range, or `None` if there is none.
    async fn resolve(
        &self,
        path: &str,
        metadata: &FileMetadata,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<SegmentInfo>>;
}

/// Outcome of one repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    pub status: FileStatus,
    /// Segments replaced by the resolver.
    pub replaced: usize,
    /// Segments still unreachable.
    pub unresolved: usize,
}

/// Classifies a file from its probe results.
pub fn classify(total: usize, unreachable: usize, corrupted_threshold: f64) -> FileStatus {
    if unreachable == 0 || total == 0 {
        return FileStatus::Healthy;
    }
    if unreachable >= total {
        return FileStatus::Corrupted;
    }
    let reachable_ratio = (total - unreachable) as f64 / total as f64;
    if reachable_ratio < corrupted_threshold {
        FileStatus::Corrupted
    } else {
        FileStatus::Partial
    }
}

pub(crate) struct HealthInner {
    store: Arc<dyn MetadataStore>,
    pool: ProviderPool,
    settings: Arc<EngineSettings>,
    resolver: Option<Arc<dyn SegmentResolver>>,
    flights: SingleFlight,
    shutdown: CancellationToken,
    worker: Mutex<HealthWorkerStatus>,
}

/// Shared handle to the health engine. Cloning is cheap.
#[derive(Clone)]
pub struct HealthEngine {
    inner: Arc<HealthInner>,
}

impl std::fmt::Debug for HealthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEngine")
            .field("has_resolver", &self.inner.resolver.is_some())
            .field("worker", &*self.inner.worker.lock())
            .finish_non_exhaustive()
    }
}

impl HealthEngine {
    /// Creates the engine. Without a `resolver`, repair only re-probes.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pool: ProviderPool,
        settings: Arc<EngineSettings>,
        resolver: Option<Arc<dyn SegmentResolver>>,
    ) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                store,
                pool,
                settings,
                resolver,
                flights: SingleFlight::default(),
                shutdown: CancellationToken::new(),
                worker: Mutex::new(HealthWorkerStatus::default()),
            }),
        }
    }

    // ----------------------------
    // Public API
    // ----------------------------

    /// Probes every segment of `path`, records the outcome and returns the new status.
    pub async fn check_now(&self, path: &str) -> Result<FileStatus> {
        self.check_with_parent(path, &self.inner.shutdown).await
    }

    /// Re-probes `path`, asks the resolver for replacements of unreachable segments and
    /// writes a new record.
    #[instrument(skip(self))]
    pub async fn repair(&self, path: &str) -> Result<RepairReport> {
        let path = normalize_path(path);
        let guard = self.inner.flights.acquire(&path, &self.inner.shutdown)?;
        let cancel = guard.token();

        let meta = self.inner.store.get(&path)?;
        let reachable = self.probe_all(&meta, cancel).await?;

        let mut segments = meta.segments.clone();
        let mut replaced = 0usize;
        for (idx, ok) in reachable.iter().enumerate() {
            segments[idx].unreachable = !ok;
            if *ok {
                continue;
            }
            if let Some(replacement) = self.try_replace(&path, &meta, idx, cancel).await? {
                segments[idx] = replacement;
                replaced += 1;
            }
        }

        let unresolved = segments.iter().filter(|s| s.unreachable).count();
        let status = classify(
            segments.len(),
            unresolved,
            self.inner.settings.health_corrupted_threshold,
        );

        let now = SystemTime::now();
        let mut previous = meta.status;
        let mut written = false;
        let stored = self.inner.store.update(&path, &mut |current| {
            previous = current.status;
            if !same_layout(&current.segments, &meta.segments) {
                return false;
            }
            current.segments = segments.clone();
            current.status = status;
            current.last_health_check = Some(now);
            if replaced > 0 {
                current.modified_at = now;
            }
            written = true;
            true
        })?;

        if !written {
            warn!(path = %path, "health: record changed during repair, result discarded");
            return Ok(RepairReport {
                status: stored.status,
                replaced: 0,
                unresolved: stored.unreachable_count(),
            });
        }

        info!(
            path = %path,
            replaced,
            unresolved,
            from = %previous,
            to = %status,
            "health: repair finished"
        );
        Ok(RepairReport {
            status,
            replaced,
            unresolved,
        })
    }

    /// Cooperatively stops a running check or repair for `path`.
    pub fn cancel(&self, path: &str) -> bool {
        let cancelled = self.inner.flights.cancel(&normalize_path(path));
        if cancelled {
            debug!(path, "health: cancellation requested");
        }
        cancelled
    }

    /// Persisted status of `path`.
    pub fn status(&self, path: &str) -> Result<FileStatus> {
        Ok(self.inner.store.get(&normalize_path(path))?.status)
    }

    /// Whether a check or repair is currently running for `path`.
    pub fn is_busy(&self, path: &str) -> bool {
        self.inner.flights.is_active(&normalize_path(path))
    }

    /// Cancels every running operation and stops future ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    // ----------------------------
    // Internals
    // ----------------------------

    #[instrument(skip(self, parent))]
    pub(crate) async fn check_with_parent(
        &self,
        path: &str,
        parent: &CancellationToken,
    ) -> Result<FileStatus> {
        let path = normalize_path(path);
        let guard = self.inner.flights.acquire(&path, parent)?;
        let cancel = guard.token();

        let meta = self.inner.store.get(&path)?;
        let reachable = self.probe_all(&meta, cancel).await?;

        let unreachable = reachable.iter().filter(|ok| !**ok).count();
        let status = classify(
            reachable.len(),
            unreachable,
            self.inner.settings.health_corrupted_threshold,
        );

        let now = SystemTime::now();
        let mut previous = meta.status;
        let mut written = false;
        let stored = self.inner.store.update(&path, &mut |current| {
            previous = current.status;
            if !same_layout(&current.segments, &meta.segments) {
                return false;
            }
            for (seg, ok) in current.segments.iter_mut().zip(&reachable) {
                seg.unreachable = !ok;
            }
            current.status = status;
            current.last_health_check = Some(now);
            written = true;
            true
        })?;

        if !written {
            warn!(path = %path, "health: record changed during check, result discarded");
            return Ok(stored.status);
        }

        if previous != status {
            info!(
                path = %path,
                from = %previous,
                to = %status,
                unreachable,
                "health: status changed"
            );
        } else {
            debug!(path = %path, status = %status, "health: status unchanged");
        }
        Ok(status)
    }

    /// Probes every segment, preserving segment order in the result.
    async fn probe_all(
        &self,
        meta: &FileMetadata,
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        let concurrency = self.inner.settings.health_probe_concurrency.max(1);
        // Owned futures keep the caller's future `Send` for spawning.
        let probes: Vec<_> = meta
            .segments
            .iter()
            .map(|seg| {
                let engine = self.clone();
                let seg = seg.clone();
                let cancel = cancel.clone();
                async move { engine.probe(&seg, &cancel).await }
            })
            .collect();

        stream::iter(probes)
            .buffered(concurrency)
            .try_collect()
            .await
    }

    async fn probe(&self, seg: &SegmentInfo, cancel: &CancellationToken) -> Result<bool> {
        match self
            .inner
            .pool
            .stat_segment(cancel, &seg.remote_id, &seg.groups)
            .await
        {
            Ok(found) => Ok(found),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!(remote_id = %seg.remote_id, "health: probe failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn try_replace(
        &self,
        path: &str,
        meta: &FileMetadata,
        idx: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<SegmentInfo>> {
        let Some(resolver) = &self.inner.resolver else {
            return Ok(None);
        };
        let original = &meta.segments[idx];

        let candidate = match resolver.resolve(path, meta, idx, cancel).await {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(None),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(path, segment = idx, "health: resolver failed: {}", e);
                return Ok(None);
            }
        };

        if candidate.start_offset != original.start_offset || candidate.size != original.size {
            warn!(
                path,
                segment = idx,
                "health: resolver returned a segment with a different byte range"
            );
            return Ok(None);
        }

        if !self.probe(&candidate, cancel).await? {
            debug!(
                path,
                segment = idx,
                remote_id = %candidate.remote_id,
                "health: replacement unreachable"
            );
            return Ok(None);
        }

        Ok(Some(SegmentInfo {
            end_offset: original.end_offset,
            unreachable: false,
            ..candidate
        }))
    }
}

/// Same segments at the same offsets, ignoring health flags.
fn same_layout(a: &[SegmentInfo], b: &[SegmentInfo]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.remote_id == y.remote_id && x.start_offset == y.start_offset && x.size == y.size
        })
}
