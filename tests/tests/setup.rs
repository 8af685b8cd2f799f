#![allow(dead_code)]

use std::sync::{LazyLock, Once};

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Runtime that hosts fixture servers so they outlive individual test runtimes.
pub static SERVER_RT: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
});

static TRACING: Once = Once::new();

/// Installs a test subscriber once per test binary. `RUST_LOG` overrides the default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy()
            .add_directive("segmount=debug".parse().unwrap());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_line_number(false)
            .with_file(false)
            .try_init();
    });
}
