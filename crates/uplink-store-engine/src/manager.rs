//! Storage engine manager.
//!
//! One manager owns one logical store instance. Configuration changes are
//! admitted by a dedicated single-worker task in strict submission order,
//! each completing before the next starts, and execute under the write side
//! of a fair read-write lock. Data operations run under the read side, so
//! any number of units of work proceed in parallel but none ever overlaps a
//! configuration change, credential rotation, pool resize, or
//! defragmentation cycle.
//!
//! A configuration change installs the new pool before releasing the write
//! lock, so every subsequent reader sees a single consistent epoch; no unit
//! of work can observe a connection from an already-disposed pool.

use crate::maintenance::{self, MaintenanceTasks};
use crate::pool::{self, EnginePool};
use crate::registry::OwnerId;
use crate::{EngineConfig, StoreError, StoreRegistry, StoreResult};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task;
use tracing::{error, info, warn};

/// Pending configuration changes admitted before submitters are backpressured.
const CONFIG_QUEUE_CAPACITY: usize = 16;

/// Manager for one pooled embedded store.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`. Call
/// [`StorageEngineManager::shutdown`] when done — dropping the manager stops
/// the background worker lazily but skips the final flush.
pub struct StorageEngineManager {
    shared: Arc<ManagerShared>,
    commands: mpsc::Sender<Command>,
}

pub(crate) struct ManagerShared {
    pub(crate) owner: OwnerId,
    pub(crate) registry: Arc<StoreRegistry>,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) maintenance: Mutex<Option<MaintenanceTasks>>,
    epoch: AtomicU64,
}

impl ManagerShared {
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub(crate) enum EngineState {
    /// No configuration has been applied yet.
    Unconfigured,
    /// A store is open and serving units of work.
    Ready(Arc<ActiveStore>),
    /// The last configuration apply failed; data calls fail fast.
    Failed(String),
    /// The manager was shut down.
    Shutdown,
}

pub(crate) struct ActiveStore {
    pub(crate) pool: EnginePool,
    pub(crate) config: EngineConfig,
    pub(crate) epoch: u64,
}

enum Command {
    Apply(EngineConfig, oneshot::Sender<StoreResult<()>>),
    Shutdown(oneshot::Sender<StoreResult<()>>),
}

impl StorageEngineManager {
    /// Create a manager registered against `registry`.
    ///
    /// Spawns the configuration worker, so this must run inside a Tokio
    /// runtime. The manager starts unconfigured; data calls fail fast until
    /// [`StorageEngineManager::apply_configuration`] succeeds.
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        let owner = registry.allocate_owner();
        let shared = Arc::new(ManagerShared {
            owner,
            registry,
            state: RwLock::new(EngineState::Unconfigured),
            maintenance: Mutex::new(None),
            epoch: AtomicU64::new(0),
        });

        let (commands, queue) = mpsc::channel(CONFIG_QUEUE_CAPACITY);
        task::spawn(configuration_worker(Arc::clone(&shared), queue));

        Self { shared, commands }
    }

    /// Apply a configuration.
    ///
    /// Changes are serialized in submission order; each apply fully commits
    /// or rolls back before the next one starts. Pure validation failures
    /// (bad grammar, remote target, ownership conflict) leave any open store
    /// untouched; a failure while switching stores leaves the manager not
    /// ready.
    pub async fn apply_configuration(&self, config: EngineConfig) -> StoreResult<()> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Apply(config, reply))
            .await
            .map_err(|_| {
                StoreError::NotReady("configuration worker is no longer running".to_string())
            })?;
        result
            .await
            .map_err(|_| StoreError::Interrupted("configuration apply was abandoned".to_string()))?
    }

    /// Run `unit_of_work` on a pooled connection.
    ///
    /// Waits for any in-flight configuration change to drain, then holds the
    /// read lock for the whole unit of work. On failure, any transaction the
    /// unit left open is rolled back; the connection always returns to the
    /// pool.
    pub async fn with_connection<T, F>(&self, unit_of_work: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.shared.state.read().await;
        let active = match &*state {
            EngineState::Ready(active) => Arc::clone(active),
            EngineState::Unconfigured => {
                return Err(StoreError::NotReady(
                    "no configuration has been applied".to_string(),
                ))
            }
            EngineState::Failed(reason) => {
                return Err(StoreError::NotReady(format!(
                    "last configuration apply failed: {reason}"
                )))
            }
            EngineState::Shutdown => {
                return Err(StoreError::NotReady(
                    "storage engine manager is shut down".to_string(),
                ))
            }
        };

        let outcome = task::spawn_blocking(move || {
            let mut conn = active
                .pool
                .get()
                .map_err(|e| StoreError::Connection(format!("connection checkout failed: {e}")))?;
            match unit_of_work(&mut conn) {
                Ok(value) => Ok(value),
                Err(failure) => {
                    if !conn.is_autocommit() {
                        if let Err(e) = conn.execute_batch("ROLLBACK") {
                            warn!(error = %e, "rollback after failed unit of work also failed");
                        }
                    }
                    Err(failure)
                }
            }
        })
        .await;
        drop(state);

        match outcome {
            Ok(result) => result,
            Err(e) => Err(StoreError::Interrupted(format!(
                "unit of work did not complete: {e}"
            ))),
        }
    }

    /// Stop maintenance, flush, and dispose the pool.
    ///
    /// Serialized on the same queue as configuration changes. Idempotent:
    /// shutting down an already shut down manager is a no-op.
    pub async fn shutdown(&self) -> StoreResult<()> {
        let (reply, result) = oneshot::channel();
        match self.commands.send(Command::Shutdown(reply)).await {
            Ok(()) => result
                .await
                .map_err(|_| StoreError::Interrupted("shutdown was abandoned".to_string()))?,
            // Worker already gone, nothing left to stop.
            Err(_) => Ok(()),
        }
    }

    /// True when a store is open and serving units of work.
    pub async fn is_ready(&self) -> bool {
        matches!(&*self.shared.state.read().await, EngineState::Ready(_))
    }

    /// Epoch of the currently installed pool, if any.
    pub async fn epoch(&self) -> Option<u64> {
        match &*self.shared.state.read().await {
            EngineState::Ready(active) => Some(active.epoch),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}

async fn configuration_worker(shared: Arc<ManagerShared>, mut queue: mpsc::Receiver<Command>) {
    while let Some(command) = queue.recv().await {
        match command {
            Command::Apply(config, reply) => {
                let result = apply_configuration(&shared, config).await;
                let _ = reply.send(result);
            }
            Command::Shutdown(reply) => {
                let result = shutdown_store(&shared).await;
                let _ = reply.send(result);
                break;
            }
        }
    }
}

async fn apply_configuration(shared: &Arc<ManagerShared>, config: EngineConfig) -> StoreResult<()> {
    // Pre-I/O validation; failures here leave any open store untouched.
    let config = config.validated()?;
    let identity = config.identity();

    let previous_identity = match &*shared.state.read().await {
        EngineState::Ready(active) => Some(active.config.identity()),
        EngineState::Shutdown => {
            return Err(StoreError::NotReady(
                "storage engine manager is shut down".to_string(),
            ))
        }
        _ => None,
    };

    let identity_changed = previous_identity.as_ref() != Some(&identity);
    if identity_changed {
        shared
            .registry
            .claim(&identity.canonical_location, shared.owner)?;
    }

    // The maintenance tasks take the engine locks themselves; joining them
    // while holding the write lock would deadlock against a defragmentation
    // cycle waiting for that same lock.
    maintenance::stop(shared).await;

    let mut state = shared.state.write().await;
    match switch_store(shared, &mut state, config, identity_changed).await {
        Ok(installed) => {
            drop(state);
            maintenance::start(shared, &installed).await;
            info!(store = %installed.location, "configuration applied");
            Ok(())
        }
        Err(e) => {
            *state = EngineState::Failed(e.to_string());
            shared
                .registry
                .release(&identity.canonical_location, shared.owner);
            error!(error = %e, "configuration apply failed, manager left not ready");
            Err(e)
        }
    }
}

/// Swap the active store under the write lock. Returns the installed
/// configuration on success.
async fn switch_store(
    shared: &Arc<ManagerShared>,
    state: &mut EngineState,
    config: EngineConfig,
    identity_changed: bool,
) -> StoreResult<EngineConfig> {
    let previous = match std::mem::replace(state, EngineState::Unconfigured) {
        EngineState::Ready(active) => Some(active),
        _ => None,
    };

    if identity_changed {
        // The previous store is fully shut down before the new one opens.
        if let Some(active) = previous {
            dispose_store(shared, active).await;
        }

        let open_config = config.clone();
        let pool = task::spawn_blocking(move || pool::open_store(&open_config))
            .await
            .map_err(|e| StoreError::Interrupted(e.to_string()))??;
        install(shared, state, pool, config.clone());
        return Ok(config);
    }

    let Some(active) = previous else {
        // Same identity but nothing is open (a previous apply failed).
        let open_config = config.clone();
        let pool = task::spawn_blocking(move || pool::open_store(&open_config))
            .await
            .map_err(|e| StoreError::Interrupted(e.to_string()))??;
        install(shared, state, pool, config.clone());
        return Ok(config);
    };

    let credential_changed = active.config.credential != config.credential;
    let pool_changed = credential_changed || active.config.max_connections != config.max_connections;

    if credential_changed {
        let rotate_pool = active.pool.clone();
        let credential = config.credential.clone();
        task::spawn_blocking(move || {
            let conn = rotate_pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            pool::rotate_credential(&conn, &credential)
        })
        .await
        .map_err(|e| StoreError::Interrupted(e.to_string()))??;
    }

    let pool = if pool_changed {
        // Dispose the old pool before reopening so new connections pick up
        // the new credential and size.
        drop(active);
        let open_config = config.clone();
        task::spawn_blocking(move || pool::open_pool(&open_config))
            .await
            .map_err(|e| StoreError::Interrupted(e.to_string()))??
    } else {
        let pool = active.pool.clone();
        drop(active);
        pool
    };

    install(shared, state, pool, config.clone());
    Ok(config)
}

fn install(shared: &Arc<ManagerShared>, state: &mut EngineState, pool: EnginePool, config: EngineConfig) {
    *state = EngineState::Ready(Arc::new(ActiveStore {
        pool,
        epoch: shared.next_epoch(),
        config,
    }));
}

/// Flush, dispose the pool, and release the registry claim of `active`.
async fn dispose_store(shared: &Arc<ManagerShared>, active: Arc<ActiveStore>) {
    let pool = active.pool.clone();
    let flush = task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pool::flush_for_shutdown(&conn)
    })
    .await;
    match flush {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "final flush of store failed"),
        Err(e) => warn!(error = %e, "final flush of store was interrupted"),
    }

    let canonical = active.config.location.canonical();
    drop(active);
    shared.registry.release(&canonical, shared.owner);
    info!(store = %canonical, "store shut down");
}

async fn shutdown_store(shared: &Arc<ManagerShared>) -> StoreResult<()> {
    maintenance::stop(shared).await;

    let mut state = shared.state.write().await;
    let previous = std::mem::replace(&mut *state, EngineState::Shutdown);
    if let EngineState::Ready(active) = previous {
        dispose_store(shared, active).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreLocation;
    use std::path::Path;

    fn file_config(path: &Path) -> EngineConfig {
        let location = StoreLocation::parse(&format!("uplink:file:{}", path.display())).unwrap();
        let mut config = EngineConfig::for_location(location);
        // Keep the schedulers quiet during tests.
        config.checkpoint_interval_seconds = 0;
        config.defrag_interval_minutes = 0;
        config
    }

    async fn manager_with_store(path: &Path) -> StorageEngineManager {
        let manager = StorageEngineManager::new(StoreRegistry::new());
        manager.apply_configuration(file_config(path)).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_with_connection_before_configuration_fails_fast() {
        let manager = StorageEngineManager::new(StoreRegistry::new());
        let err = manager
            .with_connection(|_conn| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_apply_and_run_unit_of_work() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(&dir.path().join("store.db")).await;
        assert!(manager.is_ready().await);

        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
                Ok(())
            })
            .await
            .unwrap();

        let x: i32 = manager
            .with_connection(|conn| {
                conn.query_row("SELECT x FROM t", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(x, 7);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_target_apply_leaves_open_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(&dir.path().join("store.db")).await;
        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();
        let epoch = manager.epoch().await;

        let remote = EngineConfig::for_location(
            StoreLocation::parse("uplink:tcp://db.internal/queue").unwrap(),
        );
        let err = manager.apply_configuration(remote).await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));

        // The previously open store is intact and on the same epoch.
        assert!(manager.is_ready().await);
        assert_eq!(manager.epoch().await, epoch);
        manager
            .with_connection(|conn| {
                conn.execute("INSERT INTO t VALUES (1)", [])?;
                Ok(())
            })
            .await
            .unwrap();

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_manager_for_same_store_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let registry = StoreRegistry::new();

        let first = StorageEngineManager::new(Arc::clone(&registry));
        first.apply_configuration(file_config(&path)).await.unwrap();

        let second = StorageEngineManager::new(Arc::clone(&registry));
        let err = second
            .apply_configuration(file_config(&path))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(!second.is_ready().await);

        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_change_releases_previous_claim() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();

        let first = StorageEngineManager::new(Arc::clone(&registry));
        first
            .apply_configuration(file_config(&dir.path().join("a.db")))
            .await
            .unwrap();
        first
            .apply_configuration(file_config(&dir.path().join("b.db")))
            .await
            .unwrap();

        // a.db is free again for another manager.
        let second = StorageEngineManager::new(Arc::clone(&registry));
        second
            .apply_configuration(file_config(&dir.path().join("a.db")))
            .await
            .unwrap();

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_units_of_work() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager_with_store(&dir.path().join("store.db")).await);

        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE counter (n INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .with_connection(move |conn| {
                        conn.execute("INSERT INTO counter VALUES (?1)", [i])?;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let count: i64 = manager
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM counter", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 8);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_resize_installs_new_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let manager = manager_with_store(&path).await;
        let before = manager.epoch().await.unwrap();

        let mut resized = file_config(&path);
        resized.max_connections = 3;
        manager.apply_configuration(resized).await.unwrap();

        assert!(manager.epoch().await.unwrap() > before);
        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_credential_rotation_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let manager = manager_with_store(&path).await;

        let mut rotated = file_config(&path);
        rotated.credential = "rotated".to_string();
        manager.apply_configuration(rotated).await.unwrap();

        assert!(manager.is_ready().await);
        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_manager_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("store.db");
        // A directory at the database path cannot be opened or deleted as a
        // database file, so the apply fails after the recreate attempt.
        let bad = dir.path().join("occupied.db");
        std::fs::create_dir(&bad).unwrap();

        let manager = manager_with_store(&good).await;
        let err = manager.apply_configuration(file_config(&bad)).await.unwrap_err();
        assert!(!matches!(err, StoreError::Validation(_)));

        let err = manager.with_connection(|_conn| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));

        // A clean apply recovers the manager.
        manager.apply_configuration(file_config(&good)).await.unwrap();
        assert!(manager.is_ready().await);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_of_work_failure_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(&dir.path().join("store.db")).await;

        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();

        let err = manager
            .with_connection(|conn| -> StoreResult<()> {
                conn.execute_batch("BEGIN; INSERT INTO t VALUES (1);")?;
                Err(StoreError::Validation("synthetic failure".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let count: i64 = manager
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(&dir.path().join("store.db")).await;

        manager.shutdown().await.unwrap();
        let err = manager.with_connection(|_conn| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_applies_are_serialized_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        let manager = Arc::new(StorageEngineManager::new(registry));

        let a = file_config(&dir.path().join("a.db"));
        let b = file_config(&dir.path().join("b.db"));

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.apply_configuration(a).await })
        };
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.apply_configuration(b).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(manager.is_ready().await);

        manager.shutdown().await.unwrap();
    }
}
