//! Periodic store maintenance.
//!
//! Two schedules run per open store: a checkpoint task that forces a durable
//! flush, and a defragmentation task that compacts the store and reopens the
//! pool. Checkpointing runs under the read lock and is safe alongside other
//! readers; defragmentation takes the write lock because it replaces the
//! pool. Neither task ever escalates a failure: a checkpoint failure is
//! logged and the schedule continues, a defragmentation failure aborts only
//! the current cycle.

use crate::manager::{ActiveStore, EngineState, ManagerShared};
use crate::pool;
use crate::{EngineConfig, StoreError, StoreResult};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// Bound on waiting for a maintenance task to stop before it is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct MaintenanceTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Start the schedules configured by `config`. A cadence of zero or less
/// leaves that schedule disabled.
pub(crate) async fn start(shared: &Arc<ManagerShared>, config: &EngineConfig) {
    let (shutdown, signal) = watch::channel(false);
    let mut handles = Vec::new();

    if config.checkpoint_interval_seconds > 0 {
        let period = Duration::from_secs(config.checkpoint_interval_seconds as u64);
        handles.push(task::spawn(checkpoint_loop(
            Arc::downgrade(shared),
            period,
            signal.clone(),
        )));
        debug!(period_seconds = config.checkpoint_interval_seconds, "checkpoint task started");
    }

    if config.defrag_interval_minutes > 0 {
        let period = Duration::from_secs(config.defrag_interval_minutes as u64 * 60);
        handles.push(task::spawn(defrag_loop(
            Arc::downgrade(shared),
            period,
            signal.clone(),
        )));
        debug!(period_minutes = config.defrag_interval_minutes, "defragmentation task started");
    }

    *shared.maintenance.lock().await = Some(MaintenanceTasks { shutdown, handles });
}

/// Stop and join the running schedules, waiting at most [`STOP_TIMEOUT`]
/// per task before aborting it.
pub(crate) async fn stop(shared: &Arc<ManagerShared>) {
    let tasks = shared.maintenance.lock().await.take();
    let Some(tasks) = tasks else { return };

    let _ = tasks.shutdown.send(true);
    for mut handle in tasks.handles {
        match timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "maintenance task ended abnormally"),
            Err(_) => {
                warn!(
                    wait_seconds = STOP_TIMEOUT.as_secs(),
                    "maintenance task did not stop in time, aborting it"
                );
                handle.abort();
            }
        }
    }
}

async fn checkpoint_loop(
    shared: Weak<ManagerShared>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately; consume it so the
    // first checkpoint happens one full period after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(e) = run_checkpoint(&shared).await {
                    // Never stops the schedule.
                    warn!(error = %e, "periodic checkpoint failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn defrag_loop(
    shared: Weak<ManagerShared>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(e) = run_defrag(&shared).await {
                    // Aborts only this cycle.
                    warn!(error = %e, "defragmentation cycle failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Force a durable flush through a pooled connection.
pub(crate) async fn run_checkpoint(shared: &Arc<ManagerShared>) -> StoreResult<()> {
    let state = shared.state.read().await;
    let pool = match &*state {
        EngineState::Ready(active) => active.pool.clone(),
        _ => return Ok(()),
    };

    task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pool::checkpoint(&conn)
    })
    .await
    .map_err(|e| StoreError::Interrupted(e.to_string()))??;

    debug!("periodic checkpoint completed");
    Ok(())
}

/// Compact the store and reopen its pool with identical configuration.
///
/// Runs under the write lock: no unit of work overlaps the cycle, and the
/// new pool is installed before the lock is released.
pub(crate) async fn run_defrag(shared: &Arc<ManagerShared>) -> StoreResult<()> {
    let mut state = shared.state.write().await;
    let (pool, config) = match &*state {
        EngineState::Ready(active) => (active.pool.clone(), active.config.clone()),
        _ => return Ok(()),
    };

    task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pool::compact(&conn)
    })
    .await
    .map_err(|e| StoreError::Interrupted(e.to_string()))??;

    let open_config = config.clone();
    let pool = task::spawn_blocking(move || pool::open_pool(&open_config))
        .await
        .map_err(|e| StoreError::Interrupted(e.to_string()))??;

    *state = EngineState::Ready(Arc::new(ActiveStore {
        pool,
        epoch: shared.next_epoch(),
        config,
    }));

    debug!("defragmentation cycle completed");
    Ok(())
}
