use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Lifecycle of one read session. Serializes to the stable display strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StreamStatus {
    #[default]
    Starting,
    Buffering,
    Streaming,
    Stalled,
    Completed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Starting => "Starting",
            StreamStatus::Buffering => "Buffering",
            StreamStatus::Streaming => "Streaming",
            StreamStatus::Stalled => "Stalled",
            StreamStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is reading what, through which surface.
///
/// Physical connections sharing a key are presented as one logical session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub file_path: String,
    pub user_name: String,
    pub source: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl SessionKey {
    pub fn new(file_path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn user_name(mut self, v: impl Into<String>) -> Self {
        self.user_name = v.into();
        self
    }

    pub fn client_ip(mut self, v: impl Into<String>) -> Self {
        self.client_ip = v.into();
        self
    }

    pub fn user_agent(mut self, v: impl Into<String>) -> Self {
        self.user_agent = v.into();
        self
    }
}

/// Point-in-time view of one live (or finished) stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStream {
    pub id: String,
    #[serde(flatten)]
    pub key: SessionKey,
    pub current_offset: u64,
    pub buffered_offset: u64,
    pub bytes_sent: u64,
    /// `0` when unknown.
    pub total_size: u64,
    pub bytes_per_second: u64,
    pub speed_avg: u64,
    /// Seconds remaining, `-1` when unknown.
    pub eta: i64,
    pub status: StreamStatus,
    pub total_connections: usize,
    pub started_at: SystemTime,
    pub last_activity: SystemTime,
}

/// Seconds until `total_size` is reached from `current_offset` at `bytes_per_second`.
pub fn compute_eta(total_size: u64, current_offset: u64, bytes_per_second: u64) -> i64 {
    if total_size == 0 || bytes_per_second == 0 {
        return -1;
    }
    let remaining = total_size.saturating_sub(current_offset);
    i64::try_from(remaining.div_ceil(bytes_per_second)).unwrap_or(i64::MAX)
}

/// Bytes per second over `elapsed`; `0` for an empty window.
pub(crate) fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

/// Status from lifetime bytes and time since the last read.
pub(crate) fn derive_status(
    bytes_sent: u64,
    since_last_read: Duration,
    stall_after: Duration,
) -> StreamStatus {
    if bytes_sent == 0 {
        StreamStatus::Buffering
    } else if since_last_read >= stall_after {
        StreamStatus::Stalled
    } else {
        StreamStatus::Streaming
    }
}

/// Collapses physical streams sharing a [`SessionKey`] into logical sessions.
///
/// Bytes and rates are summed; offset, activity and status follow the most recently
/// active connection; `started_at` is the earliest; `eta` is recomputed from the totals.
pub fn aggregate(streams: Vec<ActiveStream>) -> Vec<ActiveStream> {
    let mut groups: HashMap<SessionKey, Vec<ActiveStream>> = HashMap::new();
    for s in streams {
        groups.entry(s.key.clone()).or_default().push(s);
    }

    let mut out: Vec<ActiveStream> = groups
        .into_values()
        .filter_map(|mut members| {
            members.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
            let latest = members.iter().max_by_key(|s| s.last_activity)?.clone();
            let first = members.first()?;

            let bytes_sent = members.iter().map(|s| s.bytes_sent).sum();
            let bytes_per_second = members.iter().map(|s| s.bytes_per_second).sum();
            let speed_avg = members.iter().map(|s| s.speed_avg).sum();
            let total_size = members.iter().map(|s| s.total_size).max().unwrap_or(0);

            Some(ActiveStream {
                id: first.id.clone(),
                key: first.key.clone(),
                started_at: first.started_at,
                bytes_sent,
                bytes_per_second,
                speed_avg,
                total_size,
                eta: compute_eta(total_size, latest.current_offset, bytes_per_second),
                total_connections: members.len(),
                ..latest
            })
        })
        .collect();

    out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    out
}
