//! Unified crate-level error types.
//!
//! A single [`Error`] is returned from every layer (metadata store, provider pool,
//! virtual file, health engine, stream tracker). Some variants are only ever seen
//! inside the provider pool: transient connection failures are retried and failed
//! over there, and only exhaustion is surfaced to callers.

use std::io;

use crate::model::EncryptionMode;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the `segmount` crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Invalid parameters provided by the caller.
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),

    /// The path has no metadata record.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path resolves to a container, not a file.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// One segment stayed unreachable after every provider was tried.
    #[error("segment unavailable: {remote_id} ({reason})")]
    SegmentUnavailable {
        /// Remote identifier of the segment.
        remote_id: String,
        /// Last failure observed while resolving it.
        reason: String,
    },

    /// Every configured provider failed at the connection level.
    #[error("all providers exhausted for {remote_id}")]
    AllProvidersExhausted {
        /// Remote identifier of the segment being fetched.
        remote_id: String,
    },

    /// A health check or repair is already running for this path.
    #[error("conflicting operation in progress for {0}")]
    ConflictingOperation(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Transient connection or protocol failure against one provider.
    #[error("connection error on provider {provider}: {message}")]
    Connection {
        /// Provider id.
        provider: String,
        /// What went wrong.
        message: String,
    },

    /// The provider answered definitively that it does not hold the article.
    #[error("article {remote_id} not found on provider {provider}")]
    ArticleNotFound {
        /// Provider id.
        provider: String,
        /// Remote identifier of the segment.
        remote_id: String,
    },

    /// HTTP request failed.
    #[error("HTTP error: {status} for {url}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// Decoding (decryption) of fetched bytes failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// No decoder is registered for the file's encryption mode.
    #[error("no decoder registered for encryption mode `{0}`")]
    UnsupportedEncryption(EncryptionMode),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Extra context around a lower-level error.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }

    /// Attach static context to an existing error.
    pub fn with_context(self, context: &'static str) -> Self {
        Error::Context {
            context,
            source: Box::new(self),
        }
    }

    pub(crate) fn connection(provider: &str, message: impl Into<String>) -> Self {
        Error::Connection {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Strips any [`Error::Context`] layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Failures the pool retries against the same provider before failing over.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::Connection { .. } | Error::Timeout(_) | Error::Io(_) | Error::HttpError { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// Failures that a "show corrupted" read may replace with zero-filled bytes.
    pub fn is_segment_failure(&self) -> bool {
        matches!(
            self.root(),
            Error::SegmentUnavailable { .. } | Error::AllProvidersExhausted { .. }
        )
    }
}
