//! Segment-addressed remote content exposed as seekable virtual files.
//!
//! Files are described by metadata records listing the remote segments (articles) that
//! make them up. The engine serves random-access reads by fetching those segments from a
//! priority-ordered chain of upstream providers, tracks who is reading what, and keeps
//! re-verifying that segments are still reachable.
//!
//! This crate is composed of several modules:
//! - `model`: Metadata records, segment layout and provider configuration.
//! - `metadata`: The `MetadataStore` trait with in-memory and file-tree stores.
//! - `pool`: `ProviderPool` with bounded concurrency, retries, failover and speed tests.
//! - `vfile`: `VirtualFile` range reads, seeking and the segment decoding pipeline.
//! - `health`: `HealthEngine` checks, repair and the background scheduler.
//! - `tracker`: `StreamTracker` live session accounting and `TrackedReader`.
//! - `engine`: `Engine`, which wires everything together and owns background loops.
//! - `settings`: Unified `EngineSettings`.
//! - `error`: Unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from the internal
//! modules to form the public API of the `segmount` crate.

mod engine;
mod error;
mod health;
mod metadata;
mod model;
mod pool;
mod settings;
mod tracker;
mod vfile;

pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{Error, Result};
pub use crate::settings::EngineSettings;

pub use crate::model::{EncryptionMode, FileMetadata, FileStatus, ProviderConfig, SegmentInfo};

// Metadata persistence
pub use crate::metadata::{
    FileTreeMetadataStore, MemoryMetadataStore, MetadataStore, normalize_path,
};

// Provider pool
#[cfg(feature = "http-connector")]
pub use crate::pool::HttpConnector;
pub use crate::pool::{Connection, Connector, FetchHandle, ProviderPool, SpeedTestResult};

// Virtual files and decoding
pub use crate::vfile::{
    Aes128CbcDecoder, DecodeContext, DecoderRegistry, FileOpener, FileStat, KeyResolver,
    ReadOptions, SegmentByteStream, SegmentDecoder, VirtualFile, decode_segment,
};

// Health
pub use crate::health::{
    HealthEngine, HealthWorkerStatus, PassProgress, PassSummary, RepairReport, SegmentResolver,
    classify,
};

// Stream tracking
pub use crate::tracker::{
    ActiveStream, SessionKey, StreamStatus, StreamTracker, TrackedReader, aggregate, compute_eta,
};
