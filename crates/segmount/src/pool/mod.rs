//! Provider pool: bounded, failover-aware segment fetching.
//!
//! The pool owns every live connection to every configured provider. Callers see a
//! single "fetch segment body" (and "probe segment") operation:
//! - an in-flight semaphore sized from the sum of providers' `max_connections` caps
//!   concurrently running requests; excess callers queue behind it;
//! - providers are tried in priority order (lower `priority` first);
//! - transient failures are retried against the same provider with a fixed delay,
//!   then the request fails over to the next provider;
//! - a definitive "not found" fails over immediately.
//!
//! Exhaustion yields [`Error::SegmentUnavailable`] when at least one provider answered
//! "not found", and [`Error::AllProvidersExhausted`] when every provider failed at the
//! connection level. Transient errors never leave this module.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::model::ProviderConfig;
use crate::settings::EngineSettings;

mod connection;
#[cfg(feature = "http-connector")]
mod http;

pub use connection::{Connection, Connector};
#[cfg(feature = "http-connector")]
pub use http::HttpConnector;
pub use speed_test::SpeedTestResult;

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct ProviderSlot {
    id: Arc<str>,
    config: RwLock<ProviderConfig>,
    // Per-provider connection cap.
    permits: Semaphore,
    idle: Mutex<Vec<IdleConnection>>,
}

struct PoolInner {
    // Sorted by priority, lowest first.
    providers: Vec<ProviderSlot>,
    connector: Arc<dyn Connector>,
    in_flight: Semaphore,
    in_flight_capacity: usize,
    settings: Arc<EngineSettings>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Body,
    Stat,
}

enum Response {
    Body(Bytes),
    Stat(bool),
}

/// Shared handle to the provider pool. Cloning is cheap.
#[derive(Clone)]
pub struct ProviderPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderPool")
            .field("providers", &self.inner.providers.len())
            .field("in_flight_capacity", &self.inner.in_flight_capacity)
            .finish_non_exhaustive()
    }
}

impl ProviderPool {
    /// Creates a pool over `providers`, opening connections lazily through `connector`.
    pub fn new(
        mut providers: Vec<ProviderConfig>,
        connector: Arc<dyn Connector>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        providers.sort_by_key(|p| p.priority);

        let in_flight_capacity: usize = providers.iter().map(|p| p.max_connections.max(1)).sum();
        let providers = providers
            .into_iter()
            .map(|config| ProviderSlot {
                id: Arc::from(config.id.as_str()),
                permits: Semaphore::new(config.max_connections.max(1)),
                config: RwLock::new(config),
                idle: Mutex::new(Vec::new()),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                providers,
                connector,
                in_flight: Semaphore::new(in_flight_capacity),
                in_flight_capacity,
                settings,
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ----------------------------
    // Public API: fetching
    // ----------------------------

    /// Fetches one segment body into `sink`, returning the number of bytes written.
    pub async fn fetch_segment<W>(
        &self,
        cancel: &CancellationToken,
        remote_id: &str,
        groups: &[String],
        sink: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let body = self.fetch_segment_bytes(cancel, remote_id, groups).await?;
        sink.write_all(&body).await?;
        Ok(body.len() as u64)
    }

    /// Fetches one segment body into memory.
    pub async fn fetch_segment_bytes(
        &self,
        cancel: &CancellationToken,
        remote_id: &str,
        groups: &[String],
    ) -> Result<Bytes> {
        match self.execute(cancel, Request::Body, remote_id, groups).await? {
            Response::Body(b) => Ok(b),
            Response::Stat(_) => Err(Error::msg("unexpected probe response to body request")),
        }
    }

    /// Spawns a body fetch and returns immediately.
    ///
    /// The spawned request still queues behind the in-flight semaphore.
    pub fn fetch_segment_async(
        &self,
        cancel: CancellationToken,
        remote_id: impl Into<String>,
        groups: Vec<String>,
    ) -> FetchHandle<Bytes> {
        let pool = self.clone();
        let remote_id = remote_id.into();
        FetchHandle::spawn(async move {
            pool.fetch_segment_bytes(&cancel, &remote_id, &groups).await
        })
    }

    /// Existence probe with the same failover policy as body fetches.
    ///
    /// Returns `Ok(false)` when providers answered but none holds the segment.
    pub async fn stat_segment(
        &self,
        cancel: &CancellationToken,
        remote_id: &str,
        groups: &[String],
    ) -> Result<bool> {
        match self.execute(cancel, Request::Stat, remote_id, groups).await {
            Ok(Response::Stat(found)) => Ok(found),
            Ok(Response::Body(_)) => Err(Error::msg("unexpected body response to probe")),
            Err(Error::SegmentUnavailable { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Spawns an existence probe and returns immediately.
    pub fn stat_segment_async(
        &self,
        cancel: CancellationToken,
        remote_id: impl Into<String>,
        groups: Vec<String>,
    ) -> FetchHandle<bool> {
        let pool = self.clone();
        let remote_id = remote_id.into();
        FetchHandle::spawn(async move { pool.stat_segment(&cancel, &remote_id, &groups).await })
    }

    /// Fetches from one specific provider only (same-provider retries, no failover).
    pub async fn fetch_from(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        remote_id: &str,
        groups: &[String],
    ) -> Result<Bytes> {
        let slot = self.slot(provider_id)?;
        let _in_flight = self.acquire_in_flight(cancel).await?;
        match self
            .run_on_provider(slot, cancel, Request::Body, remote_id, groups)
            .await?
        {
            Some(Response::Body(b)) => Ok(b),
            Some(Response::Stat(_)) => Err(Error::msg("unexpected probe response to body request")),
            None => Err(Error::SegmentUnavailable {
                remote_id: remote_id.to_string(),
                reason: format!("not found on provider {provider_id}"),
            }),
        }
    }

    // ----------------------------
    // Public API: introspection / lifecycle
    // ----------------------------

    /// Snapshot of provider configurations in failover order.
    pub fn providers(&self) -> Vec<ProviderConfig> {
        self.inner
            .providers
            .iter()
            .map(|s| s.config.read().clone())
            .collect()
    }

    /// Configuration of one provider.
    pub fn provider(&self, provider_id: &str) -> Result<ProviderConfig> {
        Ok(self.slot(provider_id)?.config.read().clone())
    }

    /// Requests currently holding an in-flight permit.
    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight_capacity
            .saturating_sub(self.inner.in_flight.available_permits())
    }

    pub fn in_flight_capacity(&self) -> usize {
        self.inner.in_flight_capacity
    }

    /// Idle live connections kept for `provider_id`.
    pub fn idle_connections(&self, provider_id: &str) -> usize {
        self.slot(provider_id)
            .map(|s| s.idle.lock().len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Releases every connection and fails all queued and future requests with
    /// [`Error::Cancelled`].
    pub async fn quit(&self) {
        self.inner.cancel.cancel();
        self.inner.in_flight.close();

        for slot in &self.inner.providers {
            slot.permits.close();
            let drained = std::mem::take(&mut *slot.idle.lock());
            let count = drained.len();
            for mut idle in drained {
                idle.conn.close().await;
            }
            debug!(provider = %slot.id, closed = count, "pool: released idle connections");
        }

        info!("pool: closed");
    }

    // ----------------------------
    // Internals: failover
    // ----------------------------

    async fn execute(
        &self,
        cancel: &CancellationToken,
        req: Request,
        remote_id: &str,
        groups: &[String],
    ) -> Result<Response> {
        if self.inner.providers.is_empty() {
            return Err(Error::AllProvidersExhausted {
                remote_id: remote_id.to_string(),
            });
        }

        let _in_flight = self.acquire_in_flight(cancel).await?;

        let mut missing_on = 0usize;
        let mut last_error: Option<Error> = None;

        for slot in &self.inner.providers {
            match self
                .run_on_provider(slot, cancel, req, remote_id, groups)
                .await
            {
                Ok(Some(resp)) => {
                    trace!(provider = %slot.id, remote_id, request = ?req, "pool: request served");
                    return Ok(resp);
                }
                Ok(None) => {
                    debug!(provider = %slot.id, remote_id, "pool: segment missing, failing over");
                    missing_on += 1;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        provider = %slot.id,
                        remote_id,
                        "pool: provider failed, failing over: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if missing_on > 0 {
            if matches!(req, Request::Stat) {
                return Ok(Response::Stat(false));
            }
            let reason = match last_error {
                Some(e) => format!("missing on {missing_on} provider(s); last error: {e}"),
                None => format!("missing on {missing_on} provider(s)"),
            };
            return Err(Error::SegmentUnavailable {
                remote_id: remote_id.to_string(),
                reason,
            });
        }

        warn!(remote_id, "pool: all providers exhausted");
        Err(Error::AllProvidersExhausted {
            remote_id: remote_id.to_string(),
        })
    }

    /// Runs `req` against one provider with bounded same-provider retries.
    ///
    /// `Ok(None)` means the provider definitively does not hold the segment.
    async fn run_on_provider(
        &self,
        slot: &ProviderSlot,
        cancel: &CancellationToken,
        req: Request,
        remote_id: &str,
        groups: &[String],
    ) -> Result<Option<Response>> {
        let max_retries = self.inner.settings.max_retries_per_provider;
        let mut last_error: Option<Error> = None;

        for attempt in 0..=max_retries {
            if cancel.is_cancelled() || self.inner.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.attempt_once(slot, cancel, req, remote_id, groups).await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(
                            provider = %slot.id,
                            remote_id,
                            attempts = attempt + 1,
                            "pool: request succeeded after retry"
                        );
                    }
                    return Ok(v);
                }
                Err(e) if e.is_cancelled() || !e.is_transient() => return Err(e),
                Err(e) => {
                    debug!(
                        provider = %slot.id,
                        remote_id,
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        "pool: attempt failed: {}",
                        e
                    );
                    last_error = Some(e);

                    if attempt < max_retries {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(self.inner.settings.retry_delay) => {},
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::connection(&slot.id, "request failed with no error")))
    }

    async fn attempt_once(
        &self,
        slot: &ProviderSlot,
        cancel: &CancellationToken,
        req: Request,
        remote_id: &str,
        groups: &[String],
    ) -> Result<Option<Response>> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            p = slot.permits.acquire() => p.map_err(|_| Error::Cancelled)?,
        };

        let mut conn = self.checkout(slot, cancel).await?;
        let request_timeout = self.inner.settings.request_timeout;

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(request_timeout, async {
                match req {
                    Request::Body => conn.body(remote_id, groups).await.map(Response::Body),
                    Request::Stat => conn.stat(remote_id, groups).await.map(Response::Stat),
                }
            }) => r,
        };

        match res {
            Ok(Ok(Response::Stat(false))) => {
                self.checkin(slot, conn);
                Ok(None)
            }
            Ok(Ok(resp)) => {
                self.checkin(slot, conn);
                Ok(Some(resp))
            }
            Ok(Err(e)) if matches!(e.root(), Error::ArticleNotFound { .. }) => {
                self.checkin(slot, conn);
                Ok(None)
            }
            // The connection is in an unknown state; drop it.
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("{} ({})", remote_id, slot.id))),
        }
    }

    // ----------------------------
    // Internals: connection reuse
    // ----------------------------

    async fn checkout(
        &self,
        slot: &ProviderSlot,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        let idle_timeout = self.inner.settings.connection_idle_timeout;

        loop {
            let candidate = slot.idle.lock().pop();
            match candidate {
                Some(idle) if idle.since.elapsed() <= idle_timeout => return Ok(idle.conn),
                Some(mut expired) => {
                    trace!(provider = %slot.id, "pool: closing expired idle connection");
                    expired.conn.close().await;
                }
                None => break,
            }
        }

        let config = slot.config.read().clone();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(
                self.inner.settings.request_timeout,
                self.inner.connector.connect(&config),
            ) => r,
        };

        match res {
            Ok(Ok(conn)) => {
                trace!(provider = %slot.id, "pool: opened connection");
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("connect to {}", slot.id))),
        }
    }

    fn checkin(&self, slot: &ProviderSlot, conn: Box<dyn Connection>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        slot.idle.lock().push(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    async fn acquire_in_flight(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            p = self.inner.in_flight.acquire() => p.map_err(|_| Error::Cancelled),
        }
    }

    fn slot(&self, provider_id: &str) -> Result<&ProviderSlot> {
        self.inner
            .providers
            .iter()
            .find(|s| &*s.id == provider_id)
            .ok_or_else(|| Error::NotFound(format!("provider {provider_id}")))
    }
}

/// Handle to a spawned fetch. Await it for the result; dropping it detaches the task.
#[derive(Debug)]
pub struct FetchHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> FetchHandle<T> {
    fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: tokio::spawn(fut),
        }
    }

    /// Aborts the underlying task; awaiting afterwards yields [`Error::Cancelled`].
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for FetchHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(Error::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::msg(format!("fetch task failed: {e}")))),
            Poll::Pending => Poll::Pending,
        }
    }
}
