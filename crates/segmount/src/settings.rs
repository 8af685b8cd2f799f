//! Unified configuration for the engine.
//!
//! One flat structure covers every component:
//! - provider pool (timeouts, retries, idle lifetime, speed test limits)
//! - virtual file reads (read-ahead, decoded segment cache)
//! - health engine (scheduling, thresholds, concurrency)
//! - stream tracker (snapshot cadence, stall/idle/absolute timeouts, history size)
//!
//! Loading settings from disk is left to the embedding application.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Unified engine settings.
#[derive(Clone, PartialEq)]
pub struct EngineSettings {
    // ----------------------------
    // Provider pool
    // ----------------------------
    /// Timeout for a single provider operation (connect, body, stat).
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Extra attempts against the same provider after a transient failure.
    /// Default: 2.
    pub max_retries_per_provider: u32,

    /// Fixed delay between attempts against the same provider.
    /// Default: 250ms.
    pub retry_delay: Duration,

    /// Idle connections older than this are closed instead of reused.
    /// Default: 60 seconds.
    pub connection_idle_timeout: Duration,

    /// Hard ceiling on concurrent fetches during a speed test.
    /// Default: 50.
    pub speed_test_max_connections: usize,

    /// Time budget for one speed test run.
    /// Default: 30 seconds.
    pub speed_test_budget: Duration,

    // ----------------------------
    // Virtual file
    // ----------------------------
    /// Segments fetched concurrently while serving one read.
    /// Default: 4.
    pub read_ahead_segments: usize,

    /// Decoded segments kept per open file.
    /// Default: 8.
    pub segment_cache_capacity: NonZeroUsize,

    // ----------------------------
    // Health engine
    // ----------------------------
    /// How often the background scheduler looks for files due for re-verification.
    /// Default: 15 minutes.
    pub health_check_interval: Duration,

    /// A file is due when its last check is older than this.
    /// Default: 24 hours.
    pub health_recheck_after: Duration,

    /// Reachable ratio below which a partially reachable file counts as corrupted.
    /// Default: 0.0 (only fully unreachable files are corrupted).
    pub health_corrupted_threshold: f64,

    /// Files checked concurrently by one background pass.
    /// Default: 2.
    pub health_background_concurrency: usize,

    /// Segment probes issued concurrently for one file.
    /// Default: 16.
    pub health_probe_concurrency: usize,

    // ----------------------------
    // Stream tracker
    // ----------------------------
    /// Cadence of the throughput/ETA snapshot pass.
    /// Default: 2 seconds.
    pub stream_snapshot_interval: Duration,

    /// No read for this long marks a stream as stalled.
    /// Default: 10 seconds.
    pub stream_stall_after: Duration,

    /// No snapshot progress for this long removes the stream.
    /// Default: 30 minutes.
    pub stream_idle_timeout: Duration,

    /// Streams older than this are removed regardless of activity.
    /// Default: 4 hours.
    pub stream_absolute_timeout: Duration,

    /// Cadence of the absolute-timeout sweep.
    /// Default: 5 minutes.
    pub stream_sweep_interval: Duration,

    /// Completed sessions kept for display.
    /// Default: 50.
    pub stream_history_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries_per_provider: 2,
            retry_delay: Duration::from_millis(250),
            connection_idle_timeout: Duration::from_secs(60),
            speed_test_max_connections: 50,
            speed_test_budget: Duration::from_secs(30),

            read_ahead_segments: 4,
            segment_cache_capacity: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),

            health_check_interval: Duration::from_secs(15 * 60),
            health_recheck_after: Duration::from_secs(24 * 60 * 60),
            health_corrupted_threshold: 0.0,
            health_background_concurrency: 2,
            health_probe_concurrency: 16,

            stream_snapshot_interval: Duration::from_secs(2),
            stream_stall_after: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(30 * 60),
            stream_absolute_timeout: Duration::from_secs(4 * 60 * 60),
            stream_sweep_interval: Duration::from_secs(5 * 60),
            stream_history_capacity: 50,
        }
    }
}

impl fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            // Pool
            .field("request_timeout", &self.request_timeout)
            .field("max_retries_per_provider", &self.max_retries_per_provider)
            .field("retry_delay", &self.retry_delay)
            .field("connection_idle_timeout", &self.connection_idle_timeout)
            .field(
                "speed_test_max_connections",
                &self.speed_test_max_connections,
            )
            .field("speed_test_budget", &self.speed_test_budget)
            // Virtual file
            .field("read_ahead_segments", &self.read_ahead_segments)
            .field("segment_cache_capacity", &self.segment_cache_capacity)
            // Health
            .field("health_check_interval", &self.health_check_interval)
            .field("health_recheck_after", &self.health_recheck_after)
            .field(
                "health_corrupted_threshold",
                &self.health_corrupted_threshold,
            )
            .field(
                "health_background_concurrency",
                &self.health_background_concurrency,
            )
            .field("health_probe_concurrency", &self.health_probe_concurrency)
            // Tracker
            .field("stream_snapshot_interval", &self.stream_snapshot_interval)
            .field("stream_stall_after", &self.stream_stall_after)
            .field("stream_idle_timeout", &self.stream_idle_timeout)
            .field("stream_absolute_timeout", &self.stream_absolute_timeout)
            .field("stream_sweep_interval", &self.stream_sweep_interval)
            .field("stream_history_capacity", &self.stream_history_capacity)
            .finish()
    }
}

impl EngineSettings {
    // -------------------------
    // Constructors
    // -------------------------

    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for flaky or high-latency providers.
    /// - Longer timeouts
    /// - More same-provider retries
    pub fn patient(mut self) -> Self {
        self.request_timeout = Duration::from_secs(60);
        self.max_retries_per_provider = 4;
        self.retry_delay = Duration::from_millis(500);
        self
    }

    // -------------------------
    // Pool setters
    // -------------------------

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn max_retries_per_provider(mut self, v: u32) -> Self {
        self.max_retries_per_provider = v;
        self
    }

    pub fn retry_delay(mut self, v: Duration) -> Self {
        self.retry_delay = v;
        self
    }

    pub fn connection_idle_timeout(mut self, v: Duration) -> Self {
        self.connection_idle_timeout = v;
        self
    }

    pub fn speed_test_max_connections(mut self, v: usize) -> Self {
        self.speed_test_max_connections = v;
        self
    }

    pub fn speed_test_budget(mut self, v: Duration) -> Self {
        self.speed_test_budget = v;
        self
    }

    // -------------------------
    // Virtual file setters
    // -------------------------

    pub fn read_ahead_segments(mut self, v: usize) -> Self {
        self.read_ahead_segments = v;
        self
    }

    pub fn segment_cache_capacity(mut self, v: NonZeroUsize) -> Self {
        self.segment_cache_capacity = v;
        self
    }

    // -------------------------
    // Health setters
    // -------------------------

    pub fn health_check_interval(mut self, v: Duration) -> Self {
        self.health_check_interval = v;
        self
    }

    pub fn health_recheck_after(mut self, v: Duration) -> Self {
        self.health_recheck_after = v;
        self
    }

    pub fn health_corrupted_threshold(mut self, v: f64) -> Self {
        self.health_corrupted_threshold = v.clamp(0.0, 1.0);
        self
    }

    pub fn health_background_concurrency(mut self, v: usize) -> Self {
        self.health_background_concurrency = v;
        self
    }

    pub fn health_probe_concurrency(mut self, v: usize) -> Self {
        self.health_probe_concurrency = v;
        self
    }

    // -------------------------
    // Tracker setters
    // -------------------------

    pub fn stream_snapshot_interval(mut self, v: Duration) -> Self {
        self.stream_snapshot_interval = v;
        self
    }

    pub fn stream_stall_after(mut self, v: Duration) -> Self {
        self.stream_stall_after = v;
        self
    }

    pub fn stream_idle_timeout(mut self, v: Duration) -> Self {
        self.stream_idle_timeout = v;
        self
    }

    pub fn stream_absolute_timeout(mut self, v: Duration) -> Self {
        self.stream_absolute_timeout = v;
        self
    }

    pub fn stream_sweep_interval(mut self, v: Duration) -> Self {
        self.stream_sweep_interval = v;
        self
    }

    pub fn stream_history_capacity(mut self, v: usize) -> Self {
        self.stream_history_capacity = v;
        self
    }
}
