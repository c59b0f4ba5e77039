//! Engine configuration.
//!
//! Configuration arrives from an external collaborator as a validated
//! key/value map; this module turns it into an immutable [`EngineConfig`]
//! value, built once per update. The credential field is expected to be
//! already decrypted by the external crypto service.

use crate::{StoreError, StoreLocation, StoreResult};
use std::collections::HashMap;
use tracing::warn;

/// Property key for the store location string.
pub const PROP_CONNECTOR_URL: &str = "db.connector.url";
/// Property key for the principal the store is opened as.
pub const PROP_USER: &str = "db.user";
/// Property key for the (already decrypted) credential.
pub const PROP_PASSWORD: &str = "db.password";
/// Property key for the checkpoint cadence in seconds.
pub const PROP_CHECKPOINT_INTERVAL_SECONDS: &str = "db.checkpoint.interval.seconds";
/// Property key for the defragmentation cadence in minutes.
pub const PROP_DEFRAG_INTERVAL_MINUTES: &str = "db.defrag.interval.minutes";
/// Property key for the connection pool size.
pub const PROP_POOL_MAX_SIZE: &str = "db.connection.pool.max.size";

/// Default checkpoint cadence.
pub const DEFAULT_CHECKPOINT_INTERVAL_SECONDS: i64 = 900;
/// Shortest checkpoint cadence an apply will accept; lower positive values
/// are clamped up to this.
pub const MIN_CHECKPOINT_INTERVAL_SECONDS: i64 = 5;
/// Default defragmentation cadence.
pub const DEFAULT_DEFRAG_INTERVAL_MINUTES: i64 = 15;
/// Default connection pool size.
pub const DEFAULT_POOL_MAX_SIZE: u32 = 10;

/// Immutable engine configuration.
///
/// Values are validated and normalized by [`EngineConfig::validated`]; the
/// manager refuses to apply anything that has not gone through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Store location. Remote targets and anonymous in-memory targets are
    /// rejected at validation time.
    pub location: StoreLocation,
    /// Principal the store belongs to. Part of the store identity: changing
    /// it forces a full close/reopen of the store.
    pub principal: String,
    /// Decrypted credential. Empty means the store is not keyed.
    pub credential: String,
    /// Checkpoint cadence in seconds; zero or negative disables the task.
    pub checkpoint_interval_seconds: i64,
    /// Defragmentation cadence in minutes; zero or negative disables the task.
    pub defrag_interval_minutes: i64,
    /// Connection pool size; floored at 1.
    pub max_connections: u32,
}

/// Identity of a logical store: the part of the configuration that, when
/// changed, requires the previous store to be fully shut down first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoreIdentity {
    pub canonical_location: String,
    pub principal: String,
}

impl EngineConfig {
    /// A configuration for `location` with default cadences and pool size.
    pub fn for_location(location: StoreLocation) -> Self {
        Self {
            location,
            principal: String::new(),
            credential: String::new(),
            checkpoint_interval_seconds: DEFAULT_CHECKPOINT_INTERVAL_SECONDS,
            defrag_interval_minutes: DEFAULT_DEFRAG_INTERVAL_MINUTES,
            max_connections: DEFAULT_POOL_MAX_SIZE,
        }
    }

    /// Build a configuration from the externally supplied key/value map.
    pub fn from_properties(properties: &HashMap<String, String>) -> StoreResult<Self> {
        let raw_location = properties.get(PROP_CONNECTOR_URL).ok_or_else(|| {
            StoreError::Configuration(format!("missing required property '{PROP_CONNECTOR_URL}'"))
        })?;

        let mut config = Self::for_location(StoreLocation::parse(raw_location)?);

        if let Some(principal) = properties.get(PROP_USER) {
            config.principal = principal.clone();
        }
        if let Some(credential) = properties.get(PROP_PASSWORD) {
            config.credential = credential.clone();
        }
        if let Some(value) = properties.get(PROP_CHECKPOINT_INTERVAL_SECONDS) {
            config.checkpoint_interval_seconds =
                parse_property(PROP_CHECKPOINT_INTERVAL_SECONDS, value)?;
        }
        if let Some(value) = properties.get(PROP_DEFRAG_INTERVAL_MINUTES) {
            config.defrag_interval_minutes = parse_property(PROP_DEFRAG_INTERVAL_MINUTES, value)?;
        }
        if let Some(value) = properties.get(PROP_POOL_MAX_SIZE) {
            config.max_connections = parse_property(PROP_POOL_MAX_SIZE, value)?;
        }

        config.validated()
    }

    /// Validate target rules and normalize cadence floors.
    pub fn validated(mut self) -> StoreResult<Self> {
        self.location.validate_local_target()?;

        if self.checkpoint_interval_seconds > 0
            && self.checkpoint_interval_seconds < MIN_CHECKPOINT_INTERVAL_SECONDS
        {
            warn!(
                configured = self.checkpoint_interval_seconds,
                floor = MIN_CHECKPOINT_INTERVAL_SECONDS,
                "checkpoint interval below floor, clamping"
            );
            self.checkpoint_interval_seconds = MIN_CHECKPOINT_INTERVAL_SECONDS;
        }

        if self.max_connections < 1 {
            warn!("connection pool size below 1, clamping");
            self.max_connections = 1;
        }

        Ok(self)
    }

    pub(crate) fn identity(&self) -> StoreIdentity {
        StoreIdentity {
            canonical_location: self.location.canonical(),
            principal: self.principal.clone(),
        }
    }
}

fn parse_property<T: std::str::FromStr>(key: &str, value: &str) -> StoreResult<T> {
    value.trim().parse().map_err(|_| {
        StoreError::Configuration(format!("property '{key}' has invalid value '{value}'"))
    })
}
