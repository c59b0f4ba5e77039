//! Connection pool construction and engine-level statements.
//!
//! Every pooled connection is initialized with the same batch: the key
//! pragma (when the store is keyed), WAL journal mode, and the pragmas the
//! engine needs to behave under concurrent readers. A file-backed store that
//! fails its first open is deleted and recreated exactly once.

use crate::{EngineConfig, StorageProtocol, StoreError, StoreResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a checkout waits for a free pooled connection before the wait is
/// reported as a connection error.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type EnginePool = Pool<SqliteConnectionManager>;

/// Open the pool for `config`, recreating a file-backed store once if the
/// first open fails.
pub(crate) fn open_store(config: &EngineConfig) -> StoreResult<EnginePool> {
    match open_pool(config) {
        Ok(pool) => Ok(pool),
        Err(first_failure) => {
            let Some(path) = config.location.database_path() else {
                return Err(first_failure);
            };
            warn!(
                store = %config.location,
                error = %first_failure,
                "store failed to open, deleting and recreating the database files"
            );
            delete_database_files(&path)?;
            open_pool(config)
        }
    }
}

/// Open the pool for `config` without any recovery.
pub(crate) fn open_pool(config: &EngineConfig) -> StoreResult<EnginePool> {
    if let Some(path) = config.location.database_path() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let manager = connection_manager(config);

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(1))
        .connection_timeout(CHECKOUT_TIMEOUT)
        .build(manager)
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    info!(
        store = %config.location,
        max_connections = config.max_connections,
        "store opened"
    );

    Ok(pool)
}

fn connection_manager(config: &EngineConfig) -> SqliteConnectionManager {
    let credential = config.credential.clone();
    let read_only = matches!(config.location.protocol(), StorageProtocol::Zip);

    let mut flags = OpenFlags::default();
    if read_only {
        flags.remove(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE);
        flags.insert(OpenFlags::SQLITE_OPEN_READ_ONLY);
    }

    SqliteConnectionManager::file(config.location.connection_uri())
        .with_flags(flags)
        .with_init(move |conn| {
            if !credential.is_empty() {
                conn.execute_batch(&key_statement(&credential))?;
            }
            if read_only {
                conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            } else {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA foreign_keys = ON;
                    PRAGMA busy_timeout = 5000;
                ",
                )?;
            }
            Ok(())
        })
}

/// Remove the database file and its WAL sidecars.
fn delete_database_files(path: &Path) -> StoreResult<()> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        targets.push(sidecar.into());
    }

    for target in targets {
        match std::fs::remove_file(&target) {
            Ok(()) => debug!(path = %target.display(), "deleted store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Force a durable flush of committed data.
pub(crate) fn checkpoint(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    Ok(())
}

/// Compact the on-disk representation ahead of a pool reopen.
pub(crate) fn compact(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("VACUUM;")?;
    checkpoint(conn)
}

/// Final flush issued as part of a store-level shutdown.
pub(crate) fn flush_for_shutdown(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); PRAGMA optimize;")?;
    Ok(())
}

/// Change the credential the store is keyed with.
///
/// The rekey is followed by a compaction pass so the whole file is rewritten
/// under the new credential.
pub(crate) fn rotate_credential(conn: &Connection, credential: &str) -> StoreResult<()> {
    conn.execute_batch(&rekey_statement(credential))?;
    compact(conn)?;
    info!("store credential rotated");
    Ok(())
}

fn key_statement(credential: &str) -> String {
    format!("PRAGMA key = {};", quote_literal(credential))
}

fn rekey_statement(credential: &str) -> String {
    format!("PRAGMA rekey = {};", quote_literal(credential))
}

/// Quote a string literal for inclusion in an engine statement. Embedded
/// quotes are doubled; the caller-controlled value can never terminate the
/// literal early.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreLocation;

    fn file_config(path: &Path) -> EngineConfig {
        let location =
            StoreLocation::parse(&format!("uplink:file:{}", path.display())).unwrap();
        EngineConfig::for_location(location)
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir.path().join("store.db"));

        let pool = open_store(&config).unwrap();
        let conn = pool.get().unwrap();
        let one: i32 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_corrupted_file_store_recreated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, b"this is not a database").unwrap();

        let config = file_config(&path);
        let pool = open_store(&config).unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
    }

    #[test]
    fn test_memory_store_shared_across_connections() {
        let location = StoreLocation::parse("uplink:mem:pool-test").unwrap();
        let mut config = EngineConfig::for_location(location);
        config.max_connections = 2;

        let pool = open_pool(&config).unwrap();
        let a = pool.get().unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
        drop(a);

        let b = pool.get().unwrap();
        let x: i32 = conn_count(&b);
        assert_eq!(x, 1);
    }

    fn conn_count(conn: &Connection) -> i32 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(rekey_statement("a'b"), "PRAGMA rekey = 'a''b';");
    }

    #[test]
    fn test_checkpoint_and_compact_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir.path().join("store.db"));
        let pool = open_store(&config).unwrap();
        let conn = pool.get().unwrap();

        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        checkpoint(&conn).unwrap();
        compact(&conn).unwrap();
        flush_for_shutdown(&conn).unwrap();
    }
}
