//! Live stream tracking.
//!
//! Every open read session gets an entry holding its identity, progress counters and a
//! cancellation token. Progress counters are atomics written by the reading path; derived
//! values (rate, average, ETA, status) are recomputed by a periodic snapshot pass.
//!
//! Two independent reapers bound how long an entry may live:
//! - the snapshot pass removes entries without a progress update for
//!   `stream_idle_timeout`;
//! - the sweep removes entries older than `stream_absolute_timeout`, active or not.
//!
//! Removal (explicit, kill, or reaping) cancels the entry's token, records final totals
//! as `Completed` in a bounded history and drops the live entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::settings::EngineSettings;

mod reader;
mod session;

pub use reader::TrackedReader;
pub use session::{ActiveStream, SessionKey, StreamStatus, aggregate, compute_eta};
use session::{derive_status, rate};

struct EntryState {
    last_read: Instant,
    last_snapshot_at: Instant,
    last_snapshot_bytes: u64,
    bytes_per_second: u64,
    speed_avg: u64,
    eta: i64,
    status: StreamStatus,
}

struct StreamEntry {
    id: String,
    key: SessionKey,
    total_size: u64,
    cancel: CancellationToken,
    started_at: SystemTime,
    started: Instant,
    bytes_sent: AtomicU64,
    current_offset: AtomicU64,
    buffered_offset: AtomicU64,
    state: Mutex<EntryState>,
}

impl StreamEntry {
    fn view(&self) -> ActiveStream {
        let st = self.state.lock();
        ActiveStream {
            id: self.id.clone(),
            key: self.key.clone(),
            current_offset: self.current_offset.load(Ordering::Relaxed),
            buffered_offset: self.buffered_offset.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            total_size: self.total_size,
            bytes_per_second: st.bytes_per_second,
            speed_avg: st.speed_avg,
            eta: st.eta,
            status: st.status,
            total_connections: 1,
            started_at: self.started_at,
            // Wall time derived from the monotonic clock.
            last_activity: self.started_at + st.last_read.saturating_duration_since(self.started),
        }
    }

    /// Recomputes derived values. Returns `true` when the entry has been idle too long.
    fn snapshot(&self, now: Instant, settings: &EngineSettings) -> bool {
        let bytes = self.bytes_sent.load(Ordering::Relaxed);
        let offset = self.current_offset.load(Ordering::Relaxed);
        let mut st = self.state.lock();

        let delta = bytes.saturating_sub(st.last_snapshot_bytes);
        if delta > 0 {
            st.bytes_per_second = rate(delta, now.saturating_duration_since(st.last_snapshot_at));
            st.last_snapshot_at = now;
            st.last_snapshot_bytes = bytes;
        }

        st.speed_avg = rate(bytes, now.saturating_duration_since(self.started));
        st.status = derive_status(
            bytes,
            now.saturating_duration_since(st.last_read),
            settings.stream_stall_after,
        );
        if st.status == StreamStatus::Stalled {
            st.bytes_per_second = 0;
        }
        st.eta = compute_eta(self.total_size, offset, st.bytes_per_second);

        // Idle is measured from the last progress update.
        now.saturating_duration_since(st.last_read) >= settings.stream_idle_timeout
    }
}

struct TrackerInner {
    entries: RwLock<HashMap<String, Arc<StreamEntry>>>,
    history: Mutex<VecDeque<ActiveStream>>,
    settings: Arc<EngineSettings>,
}

/// Registry of live read sessions. Cloning is cheap.
#[derive(Clone)]
pub struct StreamTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTracker")
            .field("live", &self.inner.entries.read().len())
            .field("history", &self.inner.history.lock().len())
            .finish()
    }
}

impl StreamTracker {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                entries: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                settings,
            }),
        }
    }

    /// Registers a new read session and returns its id.
    ///
    /// `cancel` is cancelled when the entry is removed, killed or reaped.
    pub fn add(&self, key: SessionKey, total_size: u64, cancel: CancellationToken) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let entry = Arc::new(StreamEntry {
            id: id.clone(),
            key,
            total_size,
            cancel,
            started_at: SystemTime::now(),
            started: now,
            bytes_sent: AtomicU64::new(0),
            current_offset: AtomicU64::new(0),
            buffered_offset: AtomicU64::new(0),
            state: Mutex::new(EntryState {
                last_read: now,
                last_snapshot_at: now,
                last_snapshot_bytes: 0,
                bytes_per_second: 0,
                speed_avg: 0,
                eta: -1,
                status: StreamStatus::Starting,
            }),
        });

        debug!(
            id = %id,
            path = %entry.key.file_path,
            source = %entry.key.source,
            "tracker: stream added"
        );
        self.inner.entries.write().insert(id.clone(), entry);
        id
    }

    fn entry(&self, id: &str) -> Option<Arc<StreamEntry>> {
        self.inner.entries.read().get(id).cloned()
    }

    /// Records `bytes_read` more bytes delivered, advancing the current offset.
    pub fn update_progress(&self, id: &str, bytes_read: u64) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        entry.bytes_sent.fetch_add(bytes_read, Ordering::Relaxed);
        entry.current_offset.fetch_add(bytes_read, Ordering::Relaxed);
        entry.state.lock().last_read = Instant::now();
    }

    /// Sets the current offset (after a seek or for a range starting mid-file).
    pub fn set_offset(&self, id: &str, offset: u64) {
        if let Some(entry) = self.entry(id) {
            entry.current_offset.store(offset, Ordering::Relaxed);
        }
    }

    pub fn update_buffered_offset(&self, id: &str, offset: u64) {
        if let Some(entry) = self.entry(id) {
            entry.buffered_offset.store(offset, Ordering::Relaxed);
        }
    }

    /// Ends a session, moving its final totals into history.
    pub fn remove(&self, id: &str) -> Option<ActiveStream> {
        let entry = self.inner.entries.write().remove(id)?;
        Some(self.finish(&entry))
    }

    /// Cancels a session on behalf of an external caller.
    pub fn kill(&self, id: &str) -> bool {
        let killed = self.remove(id).is_some();
        if killed {
            debug!(id, "tracker: stream killed");
        }
        killed
    }

    /// One physical stream, unaggregated.
    pub fn get(&self, id: &str) -> Option<ActiveStream> {
        self.entry(id).map(|e| e.view())
    }

    /// Live sessions, aggregated by [`SessionKey`].
    pub fn get_all(&self) -> Vec<ActiveStream> {
        let views: Vec<ActiveStream> = self
            .inner
            .entries
            .read()
            .values()
            .map(|e| e.view())
            .collect();
        aggregate(views)
    }

    /// Recently finished sessions, newest first.
    pub fn get_history(&self) -> Vec<ActiveStream> {
        self.inner.history.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recomputes every entry and reaps idle ones. Returns how many were reaped.
    pub fn snapshot_pass(&self) -> usize {
        let now = Instant::now();
        let entries: Vec<Arc<StreamEntry>> = self.inner.entries.read().values().cloned().collect();

        let mut reaped = 0;
        for entry in entries {
            if entry.snapshot(now, &self.inner.settings) && self.remove(&entry.id).is_some() {
                debug!(id = %entry.id, "tracker: reaped idle stream");
                reaped += 1;
            }
        }
        trace!(live = self.len(), reaped, "tracker: snapshot pass");
        reaped
    }

    /// Removes entries older than the absolute timeout. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let max_age = self.inner.settings.stream_absolute_timeout;
        let expired: Vec<String> = self
            .inner
            .entries
            .read()
            .values()
            .filter(|e| now.saturating_duration_since(e.started) >= max_age)
            .map(|e| e.id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.remove(&id).is_some() {
                debug!(id = %id, "tracker: removed stream past absolute timeout");
                removed += 1;
            }
        }
        removed
    }

    /// Spawns the periodic snapshot loop.
    pub fn spawn_snapshot_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.inner.settings.stream_snapshot_interval;
        let tracker = self.clone();
        spawn_periodic(period, cancel, move || {
            tracker.snapshot_pass();
        })
    }

    /// Spawns the periodic absolute-timeout sweep.
    pub fn spawn_sweep_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.inner.settings.stream_sweep_interval;
        let tracker = self.clone();
        spawn_periodic(period, cancel, move || {
            tracker.sweep_expired();
        })
    }

    /// Removes every live entry (used at shutdown).
    pub fn clear(&self) {
        let drained: Vec<Arc<StreamEntry>> = self
            .inner
            .entries
            .write()
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in drained {
            self.finish(&entry);
        }
    }

    fn finish(&self, entry: &StreamEntry) -> ActiveStream {
        entry.cancel.cancel();
        entry.snapshot(Instant::now(), &self.inner.settings);

        let mut view = entry.view();
        view.status = StreamStatus::Completed;

        let cap = self.inner.settings.stream_history_capacity;
        if cap > 0 {
            let mut history = self.inner.history.lock();
            history.push_back(view.clone());
            while history.len() > cap {
                history.pop_front();
            }
        }

        debug!(
            id = %view.id,
            path = %view.key.file_path,
            bytes = view.bytes_sent,
            "tracker: stream finished"
        );
        view
    }
}

fn spawn_periodic<F>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let start = Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick(),
            }
        }
    })
}
