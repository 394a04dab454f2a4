//! Dispatcher startup and shutdown.
//!
//! Startup builds every resource before any lane runs: buffer pool, lane spawner, shard queues,
//! adaptor, pool pre-warm and its reaper, and finally one lane per shard. Shutdown closes intake,
//! stops the lanes according to the configured [ShutdownPolicy], joins every lane thread, stops
//! the reaper, and closes the pool.

use super::{Dispatcher, Lifecycle, Running};
use crate::config::ShutdownPolicy;
use crate::lanes::{DispatchError, LaneSnapshot, LaneSpawner, Shard, SpawnError, StopTrigger};
use crate::memory::{BufferPool, PoolError, PoolStats, Reaper};

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

impl Dispatcher {
    /// Builds the pool, shards, and adaptor, then launches one lane per shard.
    ///
    /// Any failure aborts startup before a lane is launched, except a thread spawn failure, in
    /// which case the lanes already launched are stopped again. A dispatcher can be started once.
    pub fn start(&self) -> Result<(), StartError> {
        let mut state = self.lock_state();
        if *state != Lifecycle::Created {
            return Err(StartError::AlreadyStarted);
        }
        let config = &self.config;
        config
            .validate()
            .map_err(|e| StartError::InvalidConfig(e.to_string()))?;

        log::info!("Initializing buffer pool...");
        let pool = Arc::new(BufferPool::new(&config.buffer_pool));

        log::info!("Initializing {} lanes...", config.lanes.count);
        let spawner = LaneSpawner::new(config.lanes.name_prefix.clone())
            .set_cores(config.lanes.cores.clone())
            .set_failure_pause(Duration::from_millis(config.lanes.failure_pause_ms));
        let shards: Vec<Arc<Shard>> = (0..config.lanes.count)
            .map(|index| Arc::new(Shard::new(index)))
            .collect();

        log::info!("Initializing adaptor '{}'...", config.adaptor);
        let adaptor = match self.registry.build(&config.adaptor, config) {
            Some(Ok(adaptor)) => adaptor,
            Some(Err(e)) => {
                pool.close();
                return Err(StartError::Adaptor {
                    name: config.adaptor.clone(),
                    source: e.into(),
                });
            }
            None => {
                pool.close();
                return Err(StartError::UnknownAdaptor(config.adaptor.clone()));
            }
        };

        let warmed = pool.prewarm()?;
        log::info!(
            "Pre-warmed {} buffers of {} bytes.",
            warmed,
            config.buffer_pool.buffer_size
        );

        let mut reaper = match Reaper::spawn(&pool, "buffer-reaper".to_string()) {
            Ok(reaper) => reaper,
            Err(e) => {
                pool.close();
                return Err(StartError::Reaper(e));
            }
        };

        let stop = StopTrigger::new();
        let handles = match spawner.run(&shards, &pool, &adaptor, &stop) {
            Ok(handles) => handles,
            Err(e) => {
                for shard in &shards {
                    shard.close();
                }
                reaper.shutdown();
                pool.close();
                return Err(e.into());
            }
        };

        let running = Running {
            pool,
            shards,
            adaptor,
            stop,
            handles: Mutex::new(handles),
            reaper: Mutex::new(Some(reaper)),
        };
        if self.running.set(running).is_err() {
            return Err(StartError::AlreadyStarted);
        }
        *state = Lifecycle::Running;
        log::info!("Dispatcher ready.");
        Ok(())
    }

    /// Stops intake, stops every lane, and closes the buffer pool.
    ///
    /// Tasks already running always finish. With [ShutdownPolicy::Abandon] tasks still queued are
    /// dropped and counted in the report; with [ShutdownPolicy::Drain] they all run first. Every
    /// lane thread has exited when this returns. Submissions fail with [DispatchError::Closed]
    /// from the moment stop begins.
    pub fn stop(&self) -> Result<ShutdownReport, DispatchError> {
        let mut state = self.lock_state();
        match *state {
            Lifecycle::Created => return Err(DispatchError::NotStarted),
            Lifecycle::Stopped => return Err(DispatchError::Closed),
            Lifecycle::Running => {}
        }
        let running = self.running.get().ok_or(DispatchError::NotStarted)?;
        let policy = self.config.lanes.shutdown;
        log::info!("Stopping dispatcher ({:?})...", policy);

        for shard in &running.shards {
            shard.close();
        }
        if policy == ShutdownPolicy::Abandon {
            running.stop.halt();
        }

        let handles: Vec<_> = running
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (lane, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                log::error!("Lane {} terminated abnormally: {:?}", lane, e);
            }
        }
        // Drain mode leaves the wake channel connected until every lane has exited.
        running.stop.halt();

        let mut abandoned = 0;
        for shard in &running.shards {
            let dropped = shard.discard_queued();
            if dropped > 0 {
                log::warn!(
                    "Abandoned {} queued tasks on lane {}.",
                    dropped,
                    shard.index()
                );
            }
            abandoned += dropped;
        }

        if let Some(mut reaper) = running
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.shutdown();
        }
        running.pool.close();
        *state = Lifecycle::Stopped;

        let report = ShutdownReport {
            lanes: running
                .shards
                .iter()
                .map(|shard| shard.stats().snapshot())
                .collect(),
            abandoned,
            pool: running.pool.stats(),
        };
        log::info!(
            "Dispatcher stopped: {} processed, {} failed, {} abandoned.",
            report.processed(),
            report.failed(),
            report.abandoned
        );
        Ok(report)
    }
}

/// Final counters returned by [Dispatcher::stop].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Per-lane statistics, indexed by lane.
    pub lanes: Vec<LaneSnapshot>,
    /// Queued tasks dropped without running.
    pub abandoned: usize,
    pub pool: PoolStats,
}

impl ShutdownReport {
    pub fn processed(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.processed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.failed).sum()
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Dispatcher was already started")]
    AlreadyStarted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No adaptor registered as '{0}'")]
    UnknownAdaptor(String),

    #[error("Failed to construct adaptor '{name}'")]
    Adaptor {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to pre-warm buffer pool")]
    Pool(#[from] PoolError),

    #[error("Failed to spawn buffer reaper")]
    Reaper(#[source] io::Error),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}
