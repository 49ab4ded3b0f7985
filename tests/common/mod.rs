//! Shared helpers for the integration tests.
//!
//! Every test passes its own `low` port so tests running in parallel never
//! draw from the same pool.

#![allow(dead_code)]

use dbfixture::{InstanceSettings, PortAllocator, PortRange, Registry, SupervisorConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Process kind resolved through `bin_dir` to the stub server built with the
/// test suite.
pub const STUB_KIND: &str = "stub-dbserver";

pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Ports handed to each test, starting at its `low`.
pub const PORTS_PER_TEST: u16 = 20;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn stub_bin_dir() -> PathBuf {
    Path::new(env!("CARGO_BIN_EXE_stub-dbserver"))
        .parent()
        .expect("stub binary has a parent directory")
        .to_path_buf()
}

pub fn config(dir: &TempDir, low: u16) -> SupervisorConfig {
    SupervisorConfig {
        persistence_path: Some(dir.path().join("registry.db")),
        bin_dir: Some(stub_bin_dir()),
        releases: Default::default(),
        default_release: None,
        work_dir: Some(dir.path().join("work")),
        host: None,
        port_range: PortRange::new(low, low + PORTS_PER_TEST - 1).unwrap(),
        start_timeout: Some("10s".to_string()),
        grace_period: Some("2s".to_string()),
    }
}

pub async fn registry(dir: &TempDir, low: u16) -> Registry {
    init_tracing();
    Registry::open(&config(dir, low)).await.unwrap()
}

pub fn settings(dir: &TempDir) -> InstanceSettings {
    InstanceSettings {
        host: "127.0.0.1".to_string(),
        bin_dir: Some(stub_bin_dir()),
        work_dir: dir.path().join("work"),
        grace_period: Duration::from_secs(2),
        ..InstanceSettings::default()
    }
}

pub fn ports(low: u16) -> Arc<PortAllocator> {
    Arc::new(PortAllocator::new(PortRange::new(low, low + PORTS_PER_TEST - 1).unwrap()).unwrap())
}

pub async fn can_connect(endpoint: &str) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(endpoint)
        )
        .await,
        Ok(Ok(_))
    )
}
