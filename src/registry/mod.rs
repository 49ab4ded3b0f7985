//! The identifier-keyed catalog of supervised instances.
//!
//! One [`Registry`] is built by the process entry point and shared (usually as
//! `Arc<Registry>`) with everything that needs it. It owns the
//! [`PortAllocator`] and the [`StateStore`]; every mutation is written through
//! to the store so a later process can restore the same view with
//! [`Registry::configure`].

mod command;

pub use command::Command;

use crate::config::{validate_releases, SupervisorConfig};
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceInfo, InstanceSettings, Params};
use crate::port::PortAllocator;
use crate::state::{SqliteStateStore, StateStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Entry {
    instance: Arc<Instance>,
    created_at: DateTime<Utc>,
}

struct Inner {
    store: Option<Box<dyn StateStore>>,
    settings: InstanceSettings,
    start_timeout: Duration,
    instances: HashMap<String, Entry>,
}

/// Process-wide authority over all known instances.
pub struct Registry {
    ports: Arc<PortAllocator>,
    inner: RwLock<Inner>,
    /// Ids claimed by in-flight `create` calls
    pending: SyncMutex<HashSet<String>>,
}

impl Registry {
    /// Build an unconfigured registry. Call [`Registry::configure`] before
    /// creating instances.
    pub fn new(config: &SupervisorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ports: Arc::new(PortAllocator::new(config.port_range)?),
            inner: RwLock::new(Inner {
                store: None,
                settings: InstanceSettings::from_config(config),
                start_timeout: config.get_start_timeout(),
                instances: HashMap::new(),
            }),
            pending: SyncMutex::new(HashSet::new()),
        })
    }

    /// Build a registry and open the store named by the config.
    pub async fn open(config: &SupervisorConfig) -> Result<Self> {
        let registry = Self::new(config)?;
        registry
            .configure(&config.get_persistence_path(), None)
            .await?;
        Ok(registry)
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Reset the port pool. Outstanding reservations are forgotten.
    pub fn set_port_range(&self, low: u16, high: u16) -> Result<()> {
        self.ports.set_range(low, high)
    }

    /// Replace the named releases used to pick binaries by the `version`
    /// parameter. Applies to instances created afterwards.
    pub async fn set_releases(
        &self,
        releases: BTreeMap<String, PathBuf>,
        default_release: Option<String>,
    ) -> Result<()> {
        validate_releases(&releases, default_release.as_deref())?;
        let mut inner = self.inner.write().await;
        debug!(
            "Releases: {:?} (default {:?})",
            releases.keys().collect::<Vec<_>>(),
            default_release
        );
        inner.settings.releases = releases;
        inner.settings.default_release = default_release;
        Ok(())
    }

    /// Point the registry at the store at `persistence_path`, creating it if
    /// needed, and restore every record it holds.
    ///
    /// `bin_dir`, when given, replaces the directory searched for server
    /// binaries. The previous store is closed first; handles to its instances
    /// are dropped without stopping their processes.
    pub async fn configure(&self, persistence_path: &Path, bin_dir: Option<&Path>) -> Result<()> {
        self.close_current().await;
        let store = SqliteStateStore::open(persistence_path).await?;
        self.install_store(Box::new(store), bin_dir).await
    }

    /// Like [`Registry::configure`] but with a caller-built store.
    pub async fn configure_with_store(
        &self,
        store: Box<dyn StateStore>,
        bin_dir: Option<&Path>,
    ) -> Result<()> {
        self.close_current().await;
        self.install_store(store, bin_dir).await
    }

    async fn close_current(&self) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.store.take() {
            if let Err(e) = old.close().await {
                warn!(
                    "Failed to close state store at {}: {}",
                    old.location().display(),
                    e
                );
            }
        }
        inner.instances.clear();
    }

    async fn install_store(&self, store: Box<dyn StateStore>, bin_dir: Option<&Path>) -> Result<()> {
        let records = match store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                let _ = store.close().await;
                return Err(e);
            }
        };

        let mut inner = self.inner.write().await;
        if let Some(dir) = bin_dir {
            inner.settings.bin_dir = Some(dir.to_path_buf());
        }
        for record in &records {
            let instance = Instance::restore(record, &inner.settings, Arc::clone(&self.ports));
            debug!("Restored '{}' at {}", record.id, instance.endpoint());
            inner.instances.insert(
                record.id.clone(),
                Entry {
                    instance: Arc::new(instance),
                    created_at: record.created_at,
                },
            );
        }
        info!(
            "Registry using {} ({} instance(s) restored)",
            store.location().display(),
            records.len()
        );
        inner.store = Some(store);
        Ok(())
    }

    /// Close the store and forget every handle. Running servers keep running
    /// and stay recorded for the next `configure`.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.instances.clear();
        if let Some(store) = inner.store.take() {
            store.close().await?;
            info!("Registry shut down ({})", store.location().display());
        }
        Ok(())
    }

    pub async fn persistence_location(&self) -> Option<PathBuf> {
        let inner = self.inner.read().await;
        inner.store.as_deref().map(|s| s.location().to_path_buf())
    }

    /// Create an instance under a fresh identifier. See [`Registry::create_with_id`].
    pub async fn create(&self, kind: &str, params: Params, autostart: bool) -> Result<String> {
        self.create_with_id(None, kind, params, autostart).await
    }

    /// Build (and with `autostart`, start) an instance of `kind`, record it
    /// and return its identifier.
    ///
    /// A missing binary fails with `Error::Launch`. A server that does not
    /// become reachable within the start timeout is still registered.
    #[tracing::instrument(skip(self, params))]
    pub async fn create_with_id(
        &self,
        id: Option<&str>,
        kind: &str,
        params: Params,
        autostart: bool,
    ) -> Result<String> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (settings, start_timeout) = self.reserve_id(&id).await?;

        let result = self
            .create_reserved(&id, kind, params, autostart, &settings, start_timeout)
            .await;
        self.pending.lock().remove(&id);
        result.map(|()| id)
    }

    async fn reserve_id(&self, id: &str) -> Result<(InstanceSettings, Duration)> {
        let inner = self.inner.read().await;
        if inner.store.is_none() {
            return Err(Error::NotConfigured);
        }
        if inner.instances.contains_key(id) || !self.pending.lock().insert(id.to_string()) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        Ok((inner.settings.clone(), inner.start_timeout))
    }

    async fn create_reserved(
        &self,
        id: &str,
        kind: &str,
        params: Params,
        autostart: bool,
        settings: &InstanceSettings,
        start_timeout: Duration,
    ) -> Result<()> {
        let instance = Arc::new(Instance::new(kind, params, settings, Arc::clone(&self.ports))?);

        if autostart {
            match instance.start(start_timeout).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "'{}' did not become ready within {:?}; registered anyway",
                    id, start_timeout
                ),
                Err(e) => {
                    if let Err(cleanup_err) = instance.cleanup().await {
                        warn!("Cleanup after failed start of '{}': {}", id, cleanup_err);
                    }
                    return Err(e);
                }
            }
        }

        let created_at = Utc::now();
        let mut inner = self.inner.write().await;
        let put = match inner.store.as_deref() {
            Some(store) => store.put(&instance.to_record(id, created_at)).await,
            None => Err(Error::NotConfigured),
        };
        if let Err(e) = put {
            drop(inner);
            if let Err(cleanup_err) = instance.cleanup().await {
                warn!("Cleanup after failed persist of '{}': {}", id, cleanup_err);
            }
            return Err(e);
        }

        info!("Created '{}' ({}) at {}", id, kind, instance.endpoint());
        inner.instances.insert(
            id.to_string(),
            Entry {
                instance,
                created_at,
            },
        );
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.instances.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.instances.is_empty()
    }

    /// All identifiers, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handle to the instance registered under `id`.
    pub async fn instance(&self, id: &str) -> Result<Arc<Instance>> {
        self.inner
            .read()
            .await
            .instances
            .get(id)
            .map(|entry| Arc::clone(&entry.instance))
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    /// `info()` of the instance registered under `id`, with `id` filled in.
    pub async fn get(&self, id: &str) -> Result<InstanceInfo> {
        let instance = self.instance(id).await?;
        let mut info = instance.info().await;
        info.id = Some(id.to_string());
        Ok(info)
    }

    /// Register an existing instance under `id`.
    ///
    /// A different instance previously stored under `id` is cleaned up. An
    /// instance already registered under another id is rejected with
    /// `Error::DuplicateId` naming that id.
    pub async fn set(&self, id: &str, instance: Arc<Instance>) -> Result<()> {
        if instance.is_destroyed() {
            return Err(Error::InstanceDestroyed(instance.endpoint()));
        }
        if self.pending.lock().contains(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let mut inner = self.inner.write().await;
        if let Some(other) = inner
            .instances
            .iter()
            .find(|(key, entry)| key.as_str() != id && Arc::ptr_eq(&entry.instance, &instance))
            .map(|(key, _)| key.clone())
        {
            return Err(Error::DuplicateId(other));
        }
        let created_at = inner
            .instances
            .get(id)
            .map_or_else(Utc::now, |entry| entry.created_at);
        match inner.store.as_deref() {
            Some(store) => store.put(&instance.to_record(id, created_at)).await?,
            None => return Err(Error::NotConfigured),
        }
        let previous = inner.instances.insert(
            id.to_string(),
            Entry {
                instance: Arc::clone(&instance),
                created_at,
            },
        );
        drop(inner);

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.instance, &instance) {
                debug!("Replacing '{}' ({})", id, previous.instance.endpoint());
                previous.instance.cleanup().await?;
            }
        }
        Ok(())
    }

    /// Unregister `id` and clean up its instance.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .instances
                .remove(id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            let removed = match inner.store.as_deref() {
                Some(store) => store.remove(id).await,
                None => Ok(()),
            };
            if let Err(e) = removed {
                inner.instances.insert(id.to_string(), entry);
                return Err(e);
            }
            entry
        };

        entry.instance.cleanup().await?;
        info!("Removed '{}'", id);
        Ok(())
    }

    /// Run `action` ("start", "stop" or "restart") on the instance under `id`.
    #[tracing::instrument(skip(self))]
    pub async fn command(&self, id: &str, action: &str) -> Result<bool> {
        let command: Command = action.parse()?;
        let instance = self.instance(id).await?;
        let timeout = self.inner.read().await.start_timeout;

        let outcome = match command {
            Command::Start => instance.start(timeout).await?,
            Command::Stop => instance.stop().await?,
            Command::Restart => instance.restart(timeout).await?,
        };
        debug!("'{}' {} -> {}", id, command, outcome);

        self.refresh_record(id, &instance).await?;
        Ok(outcome)
    }

    /// Rewrite the stored record so pid/started_at track the live process.
    async fn refresh_record(&self, id: &str, instance: &Arc<Instance>) -> Result<()> {
        let inner = self.inner.read().await;
        let Some(entry) = inner.instances.get(id) else {
            return Ok(());
        };
        if !Arc::ptr_eq(&entry.instance, instance) {
            return Ok(());
        }
        match inner.store.as_deref() {
            Some(store) => store.put(&instance.to_record(id, entry.created_at)).await,
            None => Ok(()),
        }
    }

    /// `host:port` of the instance under `id`.
    pub async fn hostname(&self, id: &str) -> Result<String> {
        Ok(self.instance(id).await?.endpoint())
    }

    /// Identifier of the instance listening on `endpoint`.
    pub async fn id_by_hostname(&self, endpoint: &str) -> Result<String> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&String> = inner
            .instances
            .iter()
            .filter(|(_, entry)| entry.instance.endpoint() == endpoint)
            .map(|(id, _)| id)
            .collect();
        matches.sort();
        matches
            .first()
            .map(|id| id.to_string())
            .ok_or_else(|| Error::EndpointNotFound(endpoint.to_string()))
    }

    /// Clean up every registered instance and empty the registry.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut tasks = JoinSet::new();
        for (id, entry) in inner.instances.drain() {
            tasks.spawn(async move {
                let result = entry.instance.cleanup().await;
                (id, result)
            });
        }

        let mut count = 0usize;
        while let Some(joined) = tasks.join_next().await {
            count += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!("Failed to clean up '{}': {}", id, e),
                Err(e) => warn!("Cleanup task failed: {}", e),
            }
        }

        if let Some(store) = inner.store.as_deref() {
            store.clear().await?;
        }
        info!("Registry cleaned up ({} instance(s))", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::instance::{CONFIG_FILE_NAME, DBPATH_PARAM};
    use tempfile::TempDir;

    /// Registry over a temp dir with an empty `fake-db` binary: enough to
    /// create unstarted instances.
    async fn registry(dir: &TempDir, low: u16) -> Registry {
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join("fake-db"), "").unwrap();
        let config = SupervisorConfig {
            work_dir: Some(dir.path().join("work")),
            port_range: PortRange::new(low, low + 20).unwrap(),
            ..Default::default()
        };
        let registry = Registry::new(&config).unwrap();
        registry
            .configure(&dir.path().join("registry.db"), Some(bin_dir.as_path()))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn create_without_autostart_has_no_pid() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43000).await;
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();

        assert!(registry.contains(&id).await);
        assert_eq!(registry.len().await, 1);
        let info = registry.get(&id).await.unwrap();
        assert_eq!(info.id.as_deref(), Some(id.as_str()));
        assert_eq!(info.proc_info.pid, None);
        assert!(info.proc_info.optfile.ends_with(CONFIG_FILE_NAME));
    }

    #[tokio::test]
    async fn unconfigured_registry_refuses_create() {
        let registry = Registry::new(&SupervisorConfig::default()).unwrap();
        assert!(matches!(
            registry.create("fake-db", Params::new(), false).await,
            Err(Error::NotConfigured)
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43030).await;
        registry
            .create_with_id(Some("db"), "fake-db", Params::new(), false)
            .await
            .unwrap();
        let err = registry
            .create_with_id(Some("db"), "fake-db", Params::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(ref id) if id == "db"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn missing_kind_is_launch_error_and_not_registered() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43060).await;
        let err = registry
            .create("fake_process_", Params::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
        assert!(registry.is_empty().await);
        assert!(registry.ports().reserved_ports().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_footprint_and_is_strict() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43090).await;
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();
        let info = registry.get(&id).await.unwrap();
        let dbpath = PathBuf::from(&info.proc_info.params[DBPATH_PARAM]);
        assert!(dbpath.exists());

        registry.remove(&id).await.unwrap();
        assert!(!registry.contains(&id).await);
        assert!(!dbpath.exists());
        assert!(!info.proc_info.optfile.exists());
        assert!(matches!(
            registry.remove(&id).await,
            Err(Error::InstanceNotFound(_))
        ));
        assert!(matches!(registry.get(&id).await, Err(Error::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn invalid_command_and_unknown_id() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43120).await;
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();
        assert!(matches!(
            registry.command(&id, "fake").await,
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            registry.command("nope", "stop").await,
            Err(Error::InstanceNotFound(_))
        ));
        assert!(registry.command(&id, "stop").await.unwrap());
    }

    #[tokio::test]
    async fn hostname_round_trip_with_several_instances() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43150).await;
        let a = registry.create("fake-db", Params::new(), false).await.unwrap();
        let b = registry.create("fake-db", Params::new(), false).await.unwrap();

        let host_a = registry.hostname(&a).await.unwrap();
        let host_b = registry.hostname(&b).await.unwrap();
        assert_ne!(host_a, host_b);
        assert_eq!(registry.id_by_hostname(&host_a).await.unwrap(), a);
        assert_eq!(registry.id_by_hostname(&host_b).await.unwrap(), b);
        assert!(matches!(
            registry.id_by_hostname("127.0.0.1:1").await,
            Err(Error::EndpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn records_are_restored_on_reconfigure() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43180).await;
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();
        let endpoint = registry.hostname(&id).await.unwrap();

        let other = dir.path().join("other.db");
        registry.configure(&other, None).await.unwrap();
        assert!(registry.is_empty().await);
        assert_eq!(registry.persistence_location().await, Some(other));

        registry
            .configure(&dir.path().join("registry.db"), None)
            .await
            .unwrap();
        assert_eq!(registry.ids().await, vec![id.clone()]);
        assert_eq!(registry.hostname(&id).await.unwrap(), endpoint);
    }

    #[tokio::test]
    async fn set_replaces_and_cleans_previous() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43210).await;
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();
        let old = registry.instance(&id).await.unwrap();

        let settings = InstanceSettings {
            host: "127.0.0.1".to_string(),
            bin_dir: Some(dir.path().join("bin")),
            work_dir: dir.path().join("work"),
            grace_period: Duration::from_millis(200),
            ..InstanceSettings::default()
        };
        let replacement = Arc::new(
            Instance::new("fake-db", Params::new(), &settings, Arc::clone(registry.ports())).unwrap(),
        );
        registry.set(&id, Arc::clone(&replacement)).await.unwrap();

        assert!(old.is_destroyed());
        assert_eq!(
            registry.hostname(&id).await.unwrap(),
            replacement.endpoint()
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn set_rejects_second_id_for_same_instance() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43360).await;
        let a = registry.create("fake-db", Params::new(), false).await.unwrap();
        let instance = registry.instance(&a).await.unwrap();

        let err = registry.set("alias", Arc::clone(&instance)).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(ref id) if id == &a));
        assert!(!registry.contains("alias").await);

        // Re-setting under its own id is allowed and keeps the instance alive
        registry.set(&a, Arc::clone(&instance)).await.unwrap();
        assert!(!instance.is_destroyed());

        registry.remove(&a).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn corrupt_record_fails_configure() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43390).await;
        registry
            .create_with_id(Some("good"), "fake-db", Params::new(), false)
            .await
            .unwrap();
        registry
            .create_with_id(Some("victim"), "fake-db", Params::new(), false)
            .await
            .unwrap();
        registry.shutdown().await.unwrap();

        let db_path = dir.path().join("registry.db");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute(
            "UPDATE instances SET params = 'not json' WHERE id = 'victim'",
            [],
        )
        .unwrap();
        drop(conn);

        let err = registry.configure(&db_path, None).await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { ref id, .. } if id == "victim"));
        assert!(registry.is_empty().await);
        assert_eq!(registry.persistence_location().await, None);
        assert!(matches!(
            registry.create("fake-db", Params::new(), false).await,
            Err(Error::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn version_param_picks_release() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43420).await;
        let release_dir = dir.path().join("release-4.0");
        std::fs::create_dir_all(&release_dir).unwrap();
        std::fs::write(release_dir.join("fake-db"), "").unwrap();

        assert!(matches!(
            registry
                .set_releases(BTreeMap::new(), Some("4.0".to_string()))
                .await,
            Err(Error::Config(_))
        ));
        let mut releases = BTreeMap::new();
        releases.insert("4.0".to_string(), release_dir.clone());
        registry.set_releases(releases, None).await.unwrap();

        let mut params = Params::new();
        params.insert("version".to_string(), "4.0".to_string());
        let id = registry.create("fake-db", params.clone(), false).await.unwrap();
        assert_eq!(
            registry.get(&id).await.unwrap().proc_info.binary,
            release_dir.join("fake-db")
        );

        params.insert("version".to_string(), "2.6".to_string());
        assert!(matches!(
            registry.create("fake-db", params, false).await,
            Err(Error::Launch { .. })
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn cleanup_empties_registry_and_store() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43240).await;
        for _ in 0..3 {
            registry.create("fake-db", Params::new(), false).await.unwrap();
        }
        registry.cleanup().await.unwrap();
        assert!(registry.is_empty().await);
        assert!(registry.ports().reserved_ports().is_empty());

        registry
            .configure(&dir.path().join("registry.db"), None)
            .await
            .unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ephemeral_store_and_port_range_reset() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43300).await;
        let store = SqliteStateStore::new_ephemeral().await.unwrap();
        registry
            .configure_with_store(Box::new(store), None)
            .await
            .unwrap();
        assert_eq!(
            registry.persistence_location().await,
            Some(PathBuf::from(":memory:"))
        );

        registry.set_port_range(43330, 43331).unwrap();
        let id = registry.create("fake-db", Params::new(), false).await.unwrap();
        let port = registry.instance(&id).await.unwrap().port();
        assert!((43330..=43331).contains(&port));
    }

    #[tokio::test]
    async fn shutdown_closes_store() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 43270).await;
        registry.shutdown().await.unwrap();
        assert_eq!(registry.persistence_location().await, None);
        assert!(matches!(
            registry.create("fake-db", Params::new(), false).await,
            Err(Error::NotConfigured)
        ));
    }
}
