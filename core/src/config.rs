//! Configuration options.
//!
//! The dispatcher is configured from a TOML file that defines the channel adaptor to bind, the
//! buffer pool sizing, and the worker lane layout. The path to the configuration file itself will
//! typically be a command line argument passed to the application. See
//! [configs](../../configs) for examples.

use std::fs;
use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Loads and validates a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: RuntimeConfig = toml::from_str(&config_str)?;
    config.validate()?;
    log::debug!("Loaded configuration: {:#?}", config);
    Ok(config)
}

/// Loads a default configuration.
///
/// The default configuration binds the built-in `noop` adaptor and runs one lane per available
/// CPU:
/// ```toml
/// adaptor = "noop"
///
/// [buffer_pool]
///     core_size = 64
///     buffer_size = 8192
///     keep_alive_ms = 60_000
///
/// [lanes]
///     name_prefix = "channel-handler"
///     failure_pause_ms = 100
///     assignment = "channel_hash"
///     shutdown = "abandon"
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Identifier of the channel adaptor implementation, resolved through the
    /// [AdaptorRegistry](crate::adaptor::AdaptorRegistry) at startup. Defaults to `"noop"`.
    #[serde(default = "default_adaptor")]
    pub adaptor: String,

    /// Buffer pool settings.
    #[serde(default)]
    pub buffer_pool: BufferPoolConfig,

    /// Worker lane settings.
    #[serde(default)]
    pub lanes: LaneConfig,
}

impl RuntimeConfig {
    /// Checks the invariants the dispatcher relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adaptor.is_empty() {
            return Err(ConfigError::Invalid("adaptor identifier is empty".into()));
        }
        if self.lanes.count == 0 {
            return Err(ConfigError::Invalid("lanes.count must be at least 1".into()));
        }
        if self.buffer_pool.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_pool.buffer_size must be at least 1".into(),
            ));
        }
        if self.buffer_pool.max_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_pool.max_size must be at least 1".into(),
            ));
        }
        if self.buffer_pool.core_size > self.buffer_pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "buffer_pool.core_size ({}) exceeds buffer_pool.max_size ({})",
                self.buffer_pool.core_size, self.buffer_pool.max_size
            )));
        }
        if let Some(cores) = &self.lanes.cores {
            if cores.is_empty() {
                return Err(ConfigError::Invalid(
                    "lanes.cores must list at least one core when set".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_adaptor() -> String {
    "noop".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            adaptor: default_adaptor(),
            buffer_pool: BufferPoolConfig::default(),
            lanes: LaneConfig::default(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Buffer pool options.
///
/// I/O paths borrow fixed-size buffers from a shared pool instead of allocating per operation.
/// `core_size` buffers are created eagerly at startup and always kept; the pool may grow up to
/// `max_size`, and idle buffers beyond `core_size` are reclaimed once they have been idle for
/// `keep_alive_ms`.
///
/// ## Example
/// ```toml
/// [buffer_pool]
///     core_size = 256
///     buffer_size = 16_384
///     keep_alive_ms = 30_000
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of buffers kept warm. Defaults to `64`.
    #[serde(default = "default_core_size")]
    pub core_size: usize,

    /// Upper bound on buffers managed by the pool (idle plus lent). Defaults to `u32::MAX`, which
    /// is effectively unbounded but still enforced.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// How long a surplus idle buffer may sit in the pool before it is reclaimed (in
    /// milliseconds). Defaults to `60_000` (1 minute).
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Capacity of each buffer in bytes. Defaults to `8192`.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_core_size() -> usize {
    64
}

fn default_max_size() -> usize {
    u32::MAX as usize
}

fn default_keep_alive_ms() -> u64 {
    60_000
}

fn default_buffer_size() -> usize {
    8192
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            core_size: default_core_size(),
            max_size: default_max_size(),
            keep_alive_ms: default_keep_alive_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// How tasks without an explicit shard index are assigned to a lane.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    /// Hash of the channel session id modulo the lane count. All tasks of one channel run on
    /// the same lane, in submission order.
    ChannelHash,
    /// Uniform random lane per task. Successive tasks of one channel may run out of order on
    /// different lanes.
    Random,
}

/// What happens to tasks still queued when the dispatcher stops.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Lanes stop after their current task. Queued tasks are dropped and counted.
    Abandon,
    /// Intake closes, lanes run every queued task, then exit.
    Drain,
}

/// Worker lane options.
///
/// ## Example
/// ```toml
/// [lanes]
///     count = 8
///     name_prefix = "channel-handler"
///     failure_pause_ms = 100
///     assignment = "channel_hash"
///     shutdown = "drain"
///     cores = [2, 3, 4, 5, 6, 7, 8, 9]
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LaneConfig {
    /// Number of lanes, which is also the number of shards. Defaults to the available
    /// parallelism of the host.
    #[serde(default = "default_lane_count")]
    pub count: usize,

    /// Thread name prefix. Lane `i` is named `{name_prefix}-{i}`. Defaults to
    /// `"channel-handler"`.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Pause after a task failure before the lane takes its next task (in milliseconds).
    /// Defaults to `100`.
    #[serde(default = "default_failure_pause_ms")]
    pub failure_pause_ms: u64,

    /// Shard assignment for unassigned tasks. Defaults to `channel_hash`.
    #[serde(default = "default_assignment")]
    pub assignment: AssignmentPolicy,

    /// Treatment of queued tasks on stop. Defaults to `abandon`.
    #[serde(default = "default_shutdown")]
    pub shutdown: ShutdownPolicy,

    /// CPU cores to pin lanes to. Lane `i` is pinned to `cores[i % cores.len()]`. Defaults to
    /// `None` (no pinning).
    #[serde(default = "default_cores")]
    pub cores: Option<Vec<u32>>,
}

fn default_lane_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_name_prefix() -> String {
    "channel-handler".to_string()
}

fn default_failure_pause_ms() -> u64 {
    100
}

fn default_assignment() -> AssignmentPolicy {
    AssignmentPolicy::ChannelHash
}

fn default_shutdown() -> ShutdownPolicy {
    ShutdownPolicy::Abandon
}

fn default_cores() -> Option<Vec<u32>> {
    None
}

impl Default for LaneConfig {
    fn default() -> Self {
        LaneConfig {
            count: default_lane_count(),
            name_prefix: default_name_prefix(),
            failure_pause_ms: default_failure_pause_ms(),
            assignment: default_assignment(),
            shutdown: default_shutdown(),
            cores: default_cores(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
