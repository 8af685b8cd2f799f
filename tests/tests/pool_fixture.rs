#![allow(dead_code)]
//! In-memory article network for pool, virtual file and health tests.
//!
//! Each provider id owns its own article table. Faults are injected per provider:
//! refused connections, a number of transient body/stat failures, and response latency.
//! Counters record what the pool actually did.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use segmount::{
    Connection, Connector, EngineSettings, Error, FileMetadata, MemoryMetadataStore,
    MetadataStore, ProviderConfig, ProviderPool, Result, SegmentInfo,
};

#[derive(Default)]
struct ProviderState {
    articles: HashMap<String, Bytes>,
    refuse: bool,
    fail_next: usize,
    delay: Duration,
    connects: usize,
    body_calls: usize,
    stat_calls: usize,
    closed: usize,
}

#[derive(Default)]
struct Shared {
    providers: Mutex<HashMap<String, ProviderState>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Fault-injecting [`Connector`] over in-memory article tables.
#[derive(Clone, Default)]
pub struct ArticleNetwork {
    shared: Arc<Shared>,
}

impl ArticleNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn with<R>(&self, provider: &str, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        let mut providers = self.shared.providers.lock();
        f(providers.entry(provider.to_string()).or_default())
    }

    pub fn insert(&self, provider: &str, remote_id: &str, body: impl Into<Bytes>) {
        let body = body.into();
        self.with(provider, |p| {
            p.articles.insert(remote_id.to_string(), body);
        });
    }

    pub fn remove(&self, provider: &str, remote_id: &str) {
        self.with(provider, |p| {
            p.articles.remove(remote_id);
        });
    }

    pub fn refuse_connections(&self, provider: &str, refuse: bool) {
        self.with(provider, |p| p.refuse = refuse);
    }

    /// The next `n` body/stat calls on `provider` fail with a transient error.
    pub fn fail_next(&self, provider: &str, n: usize) {
        self.with(provider, |p| p.fail_next = n);
    }

    pub fn set_delay(&self, provider: &str, delay: Duration) {
        self.with(provider, |p| p.delay = delay);
    }

    pub fn connects(&self, provider: &str) -> usize {
        self.with(provider, |p| p.connects)
    }

    pub fn body_calls(&self, provider: &str) -> usize {
        self.with(provider, |p| p.body_calls)
    }

    pub fn stat_calls(&self, provider: &str) -> usize {
        self.with(provider, |p| p.stat_calls)
    }

    pub fn closed(&self, provider: &str) -> usize {
        self.with(provider, |p| p.closed)
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ArticleNetwork {
    async fn connect(&self, provider: &ProviderConfig) -> Result<Box<dyn Connection>> {
        let refuse = self.with(&provider.id, |p| {
            p.connects += 1;
            p.refuse
        });
        if refuse {
            return Err(Error::Connection {
                provider: provider.id.clone(),
                message: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeConnection {
            provider: provider.id.clone(),
            network: self.clone(),
        }))
    }
}

struct FakeConnection {
    provider: String,
    network: ArticleNetwork,
}

enum Call {
    Body,
    Stat,
}

impl FakeConnection {
    async fn serve(&self, call: Call, remote_id: &str) -> Result<Option<Bytes>> {
        let (delay, fail, article) = self.network.with(&self.provider, |p| {
            match call {
                Call::Body => p.body_calls += 1,
                Call::Stat => p.stat_calls += 1,
            }
            let fail = p.fail_next > 0;
            if fail {
                p.fail_next -= 1;
            }
            (p.delay, fail, p.articles.get(remote_id).cloned())
        });

        let shared = &self.network.shared;
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err(Error::Connection {
                provider: self.provider.clone(),
                message: "injected transient failure".into(),
            });
        }
        Ok(article)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn body(&mut self, remote_id: &str, _groups: &[String]) -> Result<Bytes> {
        match self.serve(Call::Body, remote_id).await? {
            Some(b) => Ok(b),
            None => Err(Error::ArticleNotFound {
                provider: self.provider.clone(),
                remote_id: remote_id.to_string(),
            }),
        }
    }

    async fn stat(&mut self, remote_id: &str, _groups: &[String]) -> Result<bool> {
        Ok(self.serve(Call::Stat, remote_id).await?.is_some())
    }

    async fn close(&mut self) {
        self.network.with(&self.provider, |p| p.closed += 1);
    }
}

/// Deterministic, position-dependent payload so misplaced bytes are detectable.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Test settings: fast retries, everything else default.
pub fn fast_settings() -> EngineSettings {
    EngineSettings::default()
        .retry_delay(Duration::from_millis(10))
        .request_timeout(Duration::from_secs(5))
}

pub fn provider(id: &str, priority: i32, max_connections: usize) -> ProviderConfig {
    ProviderConfig::new(id, format!("{id}.news.test"), 119)
        .priority(priority)
        .max_connections(max_connections)
}

pub fn pool(
    network: &ArticleNetwork,
    providers: Vec<ProviderConfig>,
    settings: EngineSettings,
) -> ProviderPool {
    ProviderPool::new(providers, network.connector(), Arc::new(settings))
}

/// A file split into segments whose bodies live on `provider`.
pub struct SegmentedFile {
    pub path: String,
    pub bodies: Vec<Vec<u8>>,
    pub metadata: FileMetadata,
}

impl SegmentedFile {
    pub fn new(path: &str, sizes: &[usize]) -> Self {
        let bodies: Vec<Vec<u8>> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| pattern(size, (i as u8).wrapping_mul(17).wrapping_add(1)))
            .collect();
        let segments = SegmentInfo::layout(sizes.iter().enumerate().map(|(i, &size)| {
            (
                format!("{}-part{i}@test", path.trim_start_matches('/')),
                vec!["alt.binaries.test".to_string()],
                size as u64,
            )
        }));
        Self {
            path: path.to_string(),
            bodies,
            metadata: FileMetadata::new(format!("{path}.nzb"), segments),
        }
    }

    pub fn remote_id(&self, idx: usize) -> &str {
        &self.metadata.segments[idx].remote_id
    }

    /// All bodies concatenated.
    pub fn content(&self) -> Vec<u8> {
        self.bodies.concat()
    }

    /// Publishes every segment on `provider`.
    pub fn publish(&self, network: &ArticleNetwork, provider: &str) {
        for (idx, body) in self.bodies.iter().enumerate() {
            network.insert(provider, self.remote_id(idx), body.clone());
        }
    }

    pub fn store_in(&self, store: &dyn MetadataStore) {
        store.put(&self.path, self.metadata.clone()).unwrap();
    }
}

pub fn memory_store() -> Arc<MemoryMetadataStore> {
    Arc::new(MemoryMetadataStore::new())
}
