//! Process-wide engine instance.
//!
//! [`Engine`] wires the metadata store, provider pool, virtual file opener, stream
//! tracker and health engine together and owns the background loops:
//! - tracker snapshot pass (`stream_snapshot_interval`)
//! - tracker absolute-timeout sweep (`stream_sweep_interval`)
//! - health scheduler (`health_check_interval`)
//!
//! Each loop has its own cancellation token. [`Engine::shutdown`] cancels and awaits all
//! of them, ends live streams and quits the pool.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::health::{HealthEngine, SegmentResolver};
use crate::metadata::MetadataStore;
use crate::model::ProviderConfig;
use crate::pool::{Connector, ProviderPool};
use crate::settings::EngineSettings;
use crate::tracker::{SessionKey, StreamTracker, TrackedReader};
use crate::vfile::{DecoderRegistry, FileOpener, FileStat, ReadOptions, VirtualFile};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn MetadataStore>,
    providers: Vec<ProviderConfig>,
    connector: Option<Arc<dyn Connector>>,
    settings: EngineSettings,
    decoders: DecoderRegistry,
    resolver: Option<Arc<dyn SegmentResolver>>,
}

impl EngineBuilder {
    pub fn providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SegmentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builds the engine. Background loops are started separately with
    /// [`Engine::start_background`].
    pub fn build(self) -> Result<Engine> {
        let connector = match self.connector {
            Some(c) => c,
            #[cfg(feature = "http-connector")]
            None => Arc::new(crate::pool::HttpConnector::new()),
            #[cfg(not(feature = "http-connector"))]
            None => return Err(Error::InvalidParams("no connector configured")),
        };

        let settings = Arc::new(self.settings);
        let pool = ProviderPool::new(self.providers, connector, Arc::clone(&settings));
        let opener = FileOpener::new(Arc::clone(&self.store), pool.clone(), Arc::clone(&settings))
            .with_decoders(self.decoders);
        let tracker = StreamTracker::new(Arc::clone(&settings));
        let health = HealthEngine::new(
            Arc::clone(&self.store),
            pool.clone(),
            Arc::clone(&settings),
            self.resolver,
        );

        debug!(providers = pool.providers().len(), "engine: built");
        Ok(Engine {
            settings,
            store: self.store,
            pool,
            opener,
            tracker,
            health,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

struct BackgroundTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The engine. Construct once per process with [`Engine::builder`].
pub struct Engine {
    settings: Arc<EngineSettings>,
    store: Arc<dyn MetadataStore>,
    pool: ProviderPool,
    opener: FileOpener,
    tracker: StreamTracker,
    health: HealthEngine,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pool", &self.pool)
            .field("tracker", &self.tracker)
            .field("health", &self.health)
            .field("background_tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(store: Arc<dyn MetadataStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            providers: Vec::new(),
            connector: None,
            settings: EngineSettings::default(),
            decoders: DecoderRegistry::new(),
            resolver: None,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn tracker(&self) -> &StreamTracker {
        &self.tracker
    }

    pub fn health(&self) -> &HealthEngine {
        &self.health
    }

    pub fn open(&self, path: &str, options: ReadOptions) -> Result<VirtualFile> {
        self.ensure_running()?;
        self.opener.open(path, options)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        self.opener.stat(path)
    }

    /// Opens `path` and registers the read with the stream tracker.
    pub fn open_tracked(
        &self,
        path: &str,
        options: ReadOptions,
        key: SessionKey,
    ) -> Result<TrackedReader> {
        let file = self.open(path, options)?;
        Ok(TrackedReader::new(file, &self.tracker, key))
    }

    /// Spawns the snapshot loop, the sweep loop and the health scheduler.
    ///
    /// Calling it again while the loops run is a no-op.
    pub fn start_background(&self) -> Result<()> {
        self.ensure_running()?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let snapshot = CancellationToken::new();
        tasks.push(BackgroundTask {
            name: "tracker-snapshot",
            handle: self.tracker.spawn_snapshot_loop(snapshot.clone()),
            cancel: snapshot,
        });

        let sweep = CancellationToken::new();
        tasks.push(BackgroundTask {
            name: "tracker-sweep",
            handle: self.tracker.spawn_sweep_loop(sweep.clone()),
            cancel: sweep,
        });

        let health = CancellationToken::new();
        tasks.push(BackgroundTask {
            name: "health-scheduler",
            handle: self.health.spawn_worker(health.clone()),
            cancel: health,
        });

        info!("engine: background loops started");
        Ok(())
    }

    /// Stops every background loop, ends live streams and releases all connections.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.cancel.cancel();
        }
        self.health.shutdown();

        for task in tasks {
            if let Err(e) = task.handle.await {
                warn!(task = task.name, "engine: background task ended abnormally: {}", e);
            }
        }

        self.tracker.clear();
        self.pool.quit().await;
        info!("engine: shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
