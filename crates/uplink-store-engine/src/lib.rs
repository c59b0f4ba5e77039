//! Storage engine layer for the uplink message store.
//!
//! This crate owns the lifecycle of one pooled embedded database per
//! [`StorageEngineManager`]: opening it from a validated configuration,
//! handing out pooled connections to units of work, rotating credentials and
//! resizing the pool on live reconfiguration, and running periodic
//! checkpoint and defragmentation maintenance.
//!
//! # Architecture
//!
//! ```text
//! apply_configuration ──▶ mpsc queue ──▶ single worker ──▶ write lock ─┐
//!                                                                      ▼
//!                                                            ┌──────────────┐
//! with_connection ──▶ read lock ──▶ pool checkout ──▶ unit   │  r2d2 pool   │
//!                                                            │  (SQLite)    │
//! checkpoint task ──▶ read lock ──▶ wal_checkpoint           └──────────────┘
//! defrag task ──────▶ write lock ──▶ VACUUM + pool reopen
//! ```
//!
//! Configuration changes are strictly serialized and exclude every data
//! operation; data operations run in parallel with each other. A change
//! installs the new pool before releasing the write lock, so a unit of work
//! never observes a connection from a disposed pool.
//!
//! # Example
//!
//! ```ignore
//! let registry = StoreRegistry::new();
//! let manager = StorageEngineManager::new(registry);
//!
//! let location = StoreLocation::parse("uplink:file:/var/lib/uplink/store.db")?;
//! manager.apply_configuration(EngineConfig::for_location(location)).await?;
//!
//! let count: i64 = manager
//!     .with_connection(|conn| {
//!         conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
//!             .map_err(Into::into)
//!     })
//!     .await?;
//! ```

mod config;
mod error;
mod location;
mod maintenance;
mod manager;
mod pool;
mod registry;

pub use config::{
    EngineConfig, DEFAULT_CHECKPOINT_INTERVAL_SECONDS, DEFAULT_DEFRAG_INTERVAL_MINUTES,
    DEFAULT_POOL_MAX_SIZE, MIN_CHECKPOINT_INTERVAL_SECONDS, PROP_CHECKPOINT_INTERVAL_SECONDS,
    PROP_CONNECTOR_URL, PROP_DEFRAG_INTERVAL_MINUTES, PROP_PASSWORD, PROP_POOL_MAX_SIZE, PROP_USER,
};
pub use error::{StoreError, StoreResult};
pub use location::{StorageProtocol, StoreLocation};
pub use manager::StorageEngineManager;
pub use registry::StoreRegistry;
