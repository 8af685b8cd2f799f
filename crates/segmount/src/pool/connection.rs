//! Provider connection seam.
//!
//! The pool never speaks a wire protocol itself. A [`Connector`] opens live
//! [`Connection`]s to one provider; the pool keeps them, reuses them while idle, and
//! classifies their errors:
//! - [`Error::ArticleNotFound`](crate::Error::ArticleNotFound) (or `stat` returning `false`)
//!   is a definitive miss on that provider;
//! - anything transient (see [`Error::is_transient`](crate::Error::is_transient)) is retried
//!   and eventually failed over.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::ProviderConfig;

/// Opens live connections to a provider.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, provider: &ProviderConfig) -> Result<Box<dyn Connection>>;
}

/// One live connection to a provider. Used by at most one request at a time.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Fetches the full body of one segment.
    async fn body(&mut self, remote_id: &str, groups: &[String]) -> Result<Bytes>;

    /// Lightweight existence probe.
    async fn stat(&mut self, remote_id: &str, groups: &[String]) -> Result<bool>;

    /// Politely ends the session. Dropping the connection must also be safe.
    async fn close(&mut self) {}
}
