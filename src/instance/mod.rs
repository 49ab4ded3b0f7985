//! Lifecycle control of one database-server process.
//!
//! An [`Instance`] owns a reserved port, a generated configuration file, a
//! data directory and (while running) an OS process. `start`/`stop`/`restart`
//! are serialized per instance; `info` can be called at any time.

mod info;
mod options;
mod process;

pub use info::{InstanceInfo, ProcInfo};
pub use options::{
    parse_config, parse_port, read_config_file, resolve_binary, write_config_file,
    InstanceSettings, Params, BIND_IP_PARAM, CONFIG_FILE_NAME, DBPATH_PARAM, LOGPATH_PARAM,
    LOG_FILE_NAME, PORT_PARAM, VERSION_PARAM,
};
pub(crate) use process::is_pid_alive;

use crate::error::{validate_pid_start_time, Error, Result};
use crate::healthcheck::{
    wait_for, wait_for_closed, HealthChecker, TcpChecker, VersionProbe, DEFAULT_CONNECT_TIMEOUT,
    POLL_INTERVAL, VERSION_PROBE_TIMEOUT,
};
use crate::port::{PortAllocator, PortLease};
use crate::state::InstanceRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATUS_REACHABLE: &str = "reachable";
const SERVER_INFO_VERSION: &str = "version";
const CRASH_LOG_LINES: usize = 15;

/// One supervised server process.
pub struct Instance {
    kind: String,
    binary: PathBuf,
    host: String,
    port: u16,
    params: Params,
    config_path: PathBuf,
    instance_dir: PathBuf,
    grace_period: Duration,
    ports: Arc<PortAllocator>,
    lease: SyncMutex<Option<PortLease>>,
    /// Child handle for servers spawned by this process; `None` when
    /// re-attached by pid
    process: Mutex<Option<Child>>,
    pid: SyncMutex<Option<u32>>,
    started_at: SyncMutex<Option<DateTime<Utc>>>,
    statuses: RwLock<BTreeMap<String, Value>>,
    server_info: RwLock<BTreeMap<String, Value>>,
    destroyed: AtomicBool,
    /// Serializes start/stop/restart/cleanup
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint())
            .field("pid", &self.pid())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Instance {
    /// Prepare an instance without starting it.
    ///
    /// Resolves the binary, reserves a port (or claims `params["port"]`),
    /// creates the data directory and writes the configuration file. Nothing
    /// is left behind on failure.
    #[tracing::instrument(skip(params, settings, ports))]
    pub fn new(
        kind: &str,
        params: Params,
        settings: &InstanceSettings,
        ports: Arc<PortAllocator>,
    ) -> Result<Self> {
        let binary = settings.locate_binary(kind, &params)?;

        let mut params = params;
        let lease = match parse_port(&params)? {
            Some(port) => ports.claim(port)?,
            None => {
                let lease = ports.reserve_lease()?;
                params.insert(PORT_PARAM.to_string(), lease.port.to_string());
                lease
            }
        };

        let instance_dir = settings.work_dir.join(format!(
            "{}-{}",
            options::sanitize_component(kind),
            Uuid::new_v4().simple()
        ));
        let (params, config_path) =
            match prepare_footprint(&instance_dir, params, &settings.host) {
                Ok(prepared) => prepared,
                Err(e) => {
                    ports.release_lease(&lease);
                    let _ = std::fs::remove_dir_all(&instance_dir);
                    return Err(e);
                }
            };

        debug!(
            "Prepared {} on {}:{} in {}",
            kind,
            settings.host,
            lease.port,
            instance_dir.display()
        );

        Ok(Self {
            kind: kind.to_string(),
            binary,
            host: settings.host.clone(),
            port: lease.port,
            params,
            config_path,
            instance_dir,
            grace_period: settings.grace_period,
            ports,
            lease: SyncMutex::new(Some(lease)),
            process: Mutex::new(None),
            pid: SyncMutex::new(None),
            started_at: SyncMutex::new(None),
            statuses: RwLock::new(BTreeMap::new()),
            server_info: RwLock::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    /// Rebuild an instance from a persisted record.
    ///
    /// Re-attaches to the recorded pid if that process is still alive and was
    /// started when the record says. Port conflicts and a vanished binary are
    /// logged rather than fatal so the record can still be torn down.
    pub fn restore(
        record: &InstanceRecord,
        settings: &InstanceSettings,
        ports: Arc<PortAllocator>,
    ) -> Self {
        let binary = settings.locate_binary(&record.kind, &record.params).unwrap_or_else(|e| {
            debug!("Restored '{}' without a binary: {}", record.id, e);
            PathBuf::from(&record.kind)
        });

        let lease = match ports.reclaim(record.port) {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!("Restored '{}' could not reclaim its port: {}", record.id, e);
                None
            }
        };

        let live_pid = record.pid.filter(|&pid| {
            let alive = is_pid_alive(pid)
                && record
                    .started_at
                    .map_or(true, |started| validate_pid_start_time(pid, started));
            if !alive {
                debug!("Recorded pid {} for '{}' is gone", pid, record.id);
            }
            alive
        });

        let instance_dir = record
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| settings.work_dir.clone());

        Self {
            kind: record.kind.clone(),
            binary,
            host: record.host.clone(),
            port: record.port,
            params: record.params.clone(),
            config_path: record.config_path.clone(),
            instance_dir,
            grace_period: settings.grace_period,
            ports,
            lease: SyncMutex::new(lease),
            process: Mutex::new(None),
            pid: SyncMutex::new(live_pid),
            started_at: SyncMutex::new(live_pid.and(record.started_at)),
            statuses: RwLock::new(BTreeMap::new()),
            server_info: RwLock::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn log_path(&self) -> PathBuf {
        self.instance_dir.join(LOG_FILE_NAME)
    }

    fn ensure_not_destroyed(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::InstanceDestroyed(self.endpoint()));
        }
        Ok(())
    }

    /// Whether the server process currently exists.
    pub async fn is_alive(&self) -> bool {
        {
            let mut process = self.process.lock().await;
            if let Some(child) = process.as_mut() {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        let pid = *self.pid.lock();
        pid.is_some_and(is_pid_alive)
    }

    /// Start the server and wait up to `timeout` for its endpoint to accept
    /// connections.
    ///
    /// Returns `Ok(false)` if the server did not become reachable in time; the
    /// process is left running unless it exited on its own. Starting a
    /// running instance only re-checks readiness.
    #[tracing::instrument(skip(self), fields(instance.kind = %self.kind, instance.port = self.port))]
    pub async fn start(&self, timeout: Duration) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(timeout).await
    }

    async fn start_locked(&self, timeout: Duration) -> Result<bool> {
        self.ensure_not_destroyed()?;

        if self.is_alive().await {
            debug!("{} already running, checking readiness", self.kind);
            return Ok(self.wait_ready(timeout).await);
        }
        self.clear_process().await;

        // Recreate anything removed behind our back since construction
        if let Some(dbpath) = self.params.get(DBPATH_PARAM) {
            std::fs::create_dir_all(dbpath)?;
        }
        write_config_file(&self.config_path, &self.params)?;

        let child = process::spawn(&self.binary, &self.config_path, &self.kind, &self.log_path())?;
        let pid = child.id();
        *self.pid.lock() = pid;
        *self.started_at.lock() = Some(Utc::now());
        *self.process.lock().await = Some(child);
        info!("Started {} (pid {:?}) for {}", self.kind, pid, self.endpoint());

        let ready = self.wait_ready(timeout).await;
        if ready {
            self.refresh_server_info().await;
        } else if !self.is_alive().await {
            let tail = process::read_log_tail(&self.log_path(), CRASH_LOG_LINES);
            warn!(
                "{} exited during startup on {}{}",
                self.kind,
                self.endpoint(),
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(":\n{}", tail.join("\n"))
                }
            );
            self.clear_process().await;
        } else {
            warn!(
                "{} did not accept connections on {} within {:?}",
                self.kind,
                self.endpoint(),
                timeout
            );
        }
        Ok(ready)
    }

    /// Stop the server, escalating from SIGTERM to SIGKILL after the grace
    /// period.
    ///
    /// Returns whether the endpoint stopped accepting connections. Stopping
    /// an instance that is not running succeeds.
    #[tracing::instrument(skip(self), fields(instance.kind = %self.kind, instance.port = self.port))]
    pub async fn stop(&self) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<bool> {
        let child = self.process.lock().await.take();
        let pid = self.pid.lock().take();
        let started_at = self.started_at.lock().take();

        match (child, pid) {
            (Some(mut child), _) => {
                process::terminate_child(&mut child, &self.kind, self.grace_period).await?;
            }
            (None, Some(pid)) => {
                process::terminate_detached(pid, &self.kind, self.grace_period, started_at).await?;
            }
            (None, None) => {
                debug!("{} is not running", self.kind);
                return Ok(true);
            }
        }

        self.statuses
            .write()
            .insert(STATUS_REACHABLE.to_string(), Value::Bool(false));

        let checker = TcpChecker::new(self.endpoint(), DEFAULT_CONNECT_TIMEOUT);
        let closed = wait_for_closed(&checker, self.grace_period, POLL_INTERVAL).await;
        if closed {
            info!("Stopped {} on {}", self.kind, self.endpoint());
        } else {
            warn!("{} still accepts connections after stop", self.endpoint());
        }
        Ok(closed)
    }

    /// Stop then start on the same port and configuration.
    #[tracing::instrument(skip(self), fields(instance.kind = %self.kind, instance.port = self.port))]
    pub async fn restart(&self, timeout: Duration) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_not_destroyed()?;
        self.stop_locked().await?;
        self.start_locked(timeout).await
    }

    /// Snapshot of the instance's current state.
    pub async fn info(&self) -> InstanceInfo {
        let alive = self.is_alive().await;
        InstanceInfo {
            id: None,
            uri: self.endpoint(),
            statuses: self.statuses.read().clone(),
            server_info: self.server_info.read().clone(),
            proc_info: ProcInfo {
                pid: self.pid(),
                alive,
                binary: self.binary.clone(),
                params: self.params.clone(),
                optfile: self.config_path.clone(),
            },
        }
    }

    /// Stop the server and remove everything it owns on disk, then release
    /// its port. Idempotent; later `start`/`restart` calls fail.
    #[tracing::instrument(skip(self), fields(instance.kind = %self.kind, instance.port = self.port))]
    pub async fn cleanup(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.stop_locked().await {
            warn!("Failed to stop {} during cleanup: {}", self.endpoint(), e);
        }
        self.remove_footprint();
        self.release_port();
        info!("Cleaned up {} on {}", self.kind, self.endpoint());
        Ok(())
    }

    /// Persistable form of this instance.
    pub fn to_record(&self, id: &str, created_at: DateTime<Utc>) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            kind: self.kind.clone(),
            params: self.params.clone(),
            host: self.host.clone(),
            port: self.port,
            config_path: self.config_path.clone(),
            pid: self.pid(),
            started_at: *self.started_at.lock(),
            created_at,
        }
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        let checker = StartupChecker {
            instance: self,
            tcp: TcpChecker::new(self.endpoint(), DEFAULT_CONNECT_TIMEOUT),
        };
        let ready = wait_for(&checker, timeout, POLL_INTERVAL).await;
        self.statuses
            .write()
            .insert(STATUS_REACHABLE.to_string(), Value::Bool(ready));
        ready
    }

    async fn refresh_server_info(&self) {
        if let Some(version) = VersionProbe::new(&self.binary, VERSION_PROBE_TIMEOUT).run().await {
            self.server_info
                .write()
                .insert(SERVER_INFO_VERSION.to_string(), Value::String(version));
        }
    }

    /// Reap an exited child and forget its pid.
    async fn clear_process(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.try_wait();
        }
        *self.pid.lock() = None;
        *self.started_at.lock() = None;
    }

    fn remove_footprint(&self) {
        remove_file_quiet(&self.config_path);
        remove_file_quiet(&self.log_path());
        if let Some(dbpath) = self.params.get(DBPATH_PARAM) {
            if let Err(e) = std::fs::remove_dir_all(dbpath) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove data directory {}: {}", dbpath, e);
                }
            }
        }
        if let Some(logpath) = self.params.get(LOGPATH_PARAM) {
            remove_file_quiet(Path::new(logpath));
        }
        // Only removed once empty; a restored record's directory may be shared
        let _ = std::fs::remove_dir(&self.instance_dir);
    }

    fn release_port(&self) {
        if let Some(lease) = self.lease.lock().take() {
            self.ports.release_lease(&lease);
        }
    }
}

impl Drop for Instance {
    /// A server still running keeps its port reserved for a later restore.
    fn drop(&mut self) {
        let running = self.pid.get_mut().is_some_and(is_pid_alive);
        match self.lease.get_mut().take() {
            Some(lease) if running => self.ports.detach_lease(&lease),
            Some(lease) => self.ports.release_lease(&lease),
            None => {}
        }
    }
}

/// Ready when the endpoint accepts connections; aborts once the process is
/// gone.
struct StartupChecker<'a> {
    instance: &'a Instance,
    tcp: TcpChecker,
}

#[async_trait]
impl<'a> HealthChecker for StartupChecker<'a> {
    async fn check(&self) -> Result<bool> {
        if !self.instance.is_alive().await {
            return Err(Error::ProcessExited(self.instance.kind.clone()));
        }
        self.tcp.check().await
    }

    fn timeout(&self) -> Duration {
        self.tcp.timeout()
    }
}

/// Create the instance directory and data directory, fill in defaults and
/// write the configuration file.
fn prepare_footprint(instance_dir: &Path, mut params: Params, host: &str) -> Result<(Params, PathBuf)> {
    std::fs::create_dir_all(instance_dir).map_err(|e| {
        Error::Filesystem(format!(
            "Failed to create instance directory '{}': {}",
            instance_dir.display(),
            e
        ))
    })?;

    let dbpath = params
        .entry(DBPATH_PARAM.to_string())
        .or_insert_with(|| instance_dir.join("db").to_string_lossy().into_owned())
        .clone();
    std::fs::create_dir_all(&dbpath).map_err(|e| {
        Error::Filesystem(format!("Failed to create data directory '{}': {}", dbpath, e))
    })?;

    params
        .entry(BIND_IP_PARAM.to_string())
        .or_insert_with(|| host.to_string());

    let config_path = instance_dir.join(CONFIG_FILE_NAME);
    write_config_file(&config_path, &params)?;
    Ok((params, config_path))
}

fn remove_file_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
