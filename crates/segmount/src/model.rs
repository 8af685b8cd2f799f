//! Data model shared by every component.
//!
//! - [`FileMetadata`] is the persisted record for one logical file path.
//! - [`SegmentInfo`] describes one remotely stored segment and the byte range it covers.
//! - [`ProviderConfig`] describes one upstream provider in the failover chain.
//!
//! Status and encryption vocabularies serialize to stable lowercase strings.

use std::fmt;
use std::ops::Range;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Health classification of a file. Mutated only by the health engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Unspecified,
    Healthy,
    Partial,
    Corrupted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Unspecified => "unspecified",
            FileStatus::Healthy => "healthy",
            FileStatus::Partial => "partial",
            FileStatus::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where (if anywhere) decoding applies in the read pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionMode {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Encryption parameters travel in provider-side headers of each segment.
    #[serde(rename = "headers")]
    ProviderSideHeaders,
    /// The whole file is wrapped by an external encryption layer.
    #[serde(rename = "rclone")]
    ExternalWrapper,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::ProviderSideHeaders => "headers",
            EncryptionMode::ExternalWrapper => "rclone",
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remotely stored segment and the logical byte range it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInfo {
    pub remote_id: String,
    /// Groups the segment was posted to (unique, in posting order).
    pub groups: Vec<String>,
    pub start_offset: u64,
    /// Exclusive.
    pub end_offset: u64,
    pub size: u64,
    /// Set by the health engine when the last probe could not reach this segment.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreachable: bool,
}

impl SegmentInfo {
    /// Lays out `(remote_id, groups, size)` triples back to back starting at offset 0.
    pub fn layout<I, G>(parts: I) -> Vec<SegmentInfo>
    where
        I: IntoIterator<Item = (String, G, u64)>,
        G: IntoIterator<Item = String>,
    {
        let mut offset = 0u64;
        parts
            .into_iter()
            .map(|(remote_id, groups, size)| {
                let mut unique: Vec<String> = Vec::new();
                for g in groups {
                    if !unique.contains(&g) {
                        unique.push(g);
                    }
                }
                let seg = SegmentInfo {
                    remote_id,
                    groups: unique,
                    start_offset: offset,
                    end_offset: offset + size,
                    size,
                    unreachable: false,
                };
                offset += size;
                seg
            })
            .collect()
    }

    #[inline]
    pub fn range(&self) -> Range<u64> {
        self.start_offset..self.end_offset
    }
}

/// Persisted record for one logical file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_size: u64,
    pub source_descriptor: String,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub encryption: EncryptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub segments: Vec<SegmentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<SystemTime>,
}

impl FileMetadata {
    /// Builds an unencrypted record whose size is the sum of its segment sizes.
    pub fn new(source_descriptor: impl Into<String>, segments: Vec<SegmentInfo>) -> Self {
        let now = SystemTime::now();
        let file_size = segments.last().map(|s| s.end_offset).unwrap_or(0);
        Self {
            file_size,
            source_descriptor: source_descriptor.into(),
            created_at: now,
            modified_at: now,
            status: FileStatus::Unspecified,
            encryption: EncryptionMode::None,
            password: None,
            segments,
            last_health_check: None,
        }
    }

    pub fn with_encryption(mut self, mode: EncryptionMode, password: Option<String>) -> Self {
        self.encryption = mode;
        self.password = password;
        self
    }

    /// Checks that segments are contiguous, gapless and cover exactly `[0, file_size)`.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return if self.file_size == 0 {
                Ok(())
            } else {
                Err(Error::InvalidParams("non-empty file without segments"))
            };
        }

        let mut expected_start = 0u64;
        for seg in &self.segments {
            if seg.start_offset != expected_start {
                return Err(Error::InvalidParams("segments are not contiguous"));
            }
            if seg.end_offset.checked_sub(seg.start_offset) != Some(seg.size) {
                return Err(Error::InvalidParams("segment size does not match its range"));
            }
            expected_start = seg.end_offset;
        }

        if expected_start != self.file_size {
            return Err(Error::InvalidParams("segments do not end at file size"));
        }
        Ok(())
    }

    /// Index of the segment containing `offset`, or `None` at/after EOF.
    pub fn segment_index_at(&self, offset: u64) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.end_offset <= offset);
        (idx < self.segments.len()).then_some(idx)
    }

    /// Indices of segments overlapping `[start, end)`.
    pub fn segments_overlapping(&self, start: u64, end: u64) -> Range<usize> {
        let end = end.min(self.file_size);
        if start >= end {
            return 0..0;
        }
        let first = self.segments.partition_point(|s| s.end_offset <= start);
        let last = self.segments.partition_point(|s| s.start_offset < end);
        first..last
    }

    pub fn unreachable_count(&self) -> usize {
        self.segments.iter().filter(|s| s.unreachable).count()
    }
}

/// One upstream provider in the priority-ordered failover chain.
///
/// Lower `priority` values are tried first.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    pub max_connections: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_speed_test_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_speed_test_time: Option<SystemTime>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            username: None,
            password: None,
            tls: false,
            max_connections: 10,
            priority: 0,
            last_speed_test_mbps: None,
            last_speed_test_time: None,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn tls(mut self, v: bool) -> Self {
        self.tls = v;
        self
    }

    pub fn max_connections(mut self, v: usize) -> Self {
        self.max_connections = v;
        self
    }

    pub fn priority(mut self, v: i32) -> Self {
        self.priority = v;
        self
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of logs.
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("tls", &self.tls)
            .field("max_connections", &self.max_connections)
            .field("priority", &self.priority)
            .field("last_speed_test_mbps", &self.last_speed_test_mbps)
            .field("last_speed_test_time", &self.last_speed_test_time)
            .finish_non_exhaustive()
    }
}
