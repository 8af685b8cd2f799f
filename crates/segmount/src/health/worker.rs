use std::time::{Duration, SystemTime};

use futures_util::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::HealthEngine;
use crate::error::{Error, Result};

/// Background worker state, for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthWorkerStatus {
    pub running: bool,
    pub current_pass: Option<PassProgress>,
    pub last_run_at: Option<SystemTime>,
    pub last_pass_checked: usize,
    pub last_pass_failed: usize,
}

/// Progress of the pass currently running.
#[derive(Debug, Clone, PartialEq)]
pub struct PassProgress {
    pub total: usize,
    pub completed: usize,
    pub started_at: SystemTime,
}

/// Counters for one finished pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub due: usize,
    pub checked: usize,
    pub failed: usize,
    /// Busy with an on-demand operation, or deleted since listing.
    pub skipped: usize,
}

impl HealthEngine {
    pub fn worker_status(&self) -> HealthWorkerStatus {
        self.inner.worker.lock().clone()
    }

    /// Paths due for re-verification, oldest-checked first (never-checked files lead).
    pub fn due_files(&self) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let recheck_after = self.inner.settings.health_recheck_after;

        let mut due: Vec<(Option<SystemTime>, String)> = Vec::new();
        for path in self.inner.store.list()? {
            let meta = match self.inner.store.get(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %path, "health: skipping unreadable record: {}", e);
                    continue;
                }
            };
            let is_due = match meta.last_health_check {
                None => true,
                Some(at) => now.duration_since(at).unwrap_or(Duration::ZERO) >= recheck_after,
            };
            if is_due {
                due.push((meta.last_health_check, path));
            }
        }

        due.sort();
        Ok(due.into_iter().map(|(_, path)| path).collect())
    }

    /// Runs one background pass over every due file at bounded concurrency.
    #[instrument(skip(self, cancel))]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary> {
        let due = self.due_files()?;
        let mut summary = PassSummary {
            due: due.len(),
            ..PassSummary::default()
        };

        self.inner.worker.lock().current_pass = Some(PassProgress {
            total: due.len(),
            completed: 0,
            started_at: SystemTime::now(),
        });

        let concurrency = self.inner.settings.health_background_concurrency.max(1);
        let checks: Vec<_> = due
            .into_iter()
            .map(|path| {
                let engine = self.clone();
                let cancel = cancel.clone();
                async move {
                    let res = engine.check_with_parent(&path, &cancel).await;
                    (path, res)
                }
            })
            .collect();
        let mut results = stream::iter(checks).buffer_unordered(concurrency);

        let mut cancelled = false;
        while let Some((path, res)) = results.next().await {
            match res {
                Ok(_) => summary.checked += 1,
                Err(Error::ConflictingOperation(_)) | Err(Error::NotFound(_)) => {
                    debug!(path = %path, "health: skipped in background pass");
                    summary.skipped += 1;
                }
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    warn!(path = %path, "health: background check failed: {}", e);
                    summary.failed += 1;
                }
            }
            if let Some(progress) = self.inner.worker.lock().current_pass.as_mut() {
                progress.completed += 1;
            }
        }
        drop(results);

        {
            let mut worker = self.inner.worker.lock();
            worker.current_pass = None;
            worker.last_run_at = Some(SystemTime::now());
            worker.last_pass_checked = summary.checked;
            worker.last_pass_failed = summary.failed;
        }

        if cancelled || cancel.is_cancelled() {
            debug!("health: background pass cancelled");
            return Err(Error::Cancelled);
        }

        info!(
            due = summary.due,
            checked = summary.checked,
            failed = summary.failed,
            skipped = summary.skipped,
            "health: background pass finished"
        );
        Ok(summary)
    }

    /// Spawns the periodic scheduler. The first pass starts immediately.
    pub fn spawn_worker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.inner.worker.lock().running = true;

            let period = engine
                .inner
                .settings
                .health_check_interval
                .max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = engine.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                match engine.run_pass(&cancel).await {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => error!("health: background pass failed: {}", e),
                }
            }

            engine.inner.worker.lock().running = false;
            debug!("health: worker stopped");
        })
    }
}
