use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `DRIPFLOW__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub abtest: AbTestConfig,
}

/// Worker pool tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pause between successive pulls, bounding pressure on the subscriber
    /// store and message transport.
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// How long terminal jobs stay queryable before the retention sweep
    /// drops them.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on graph hops advanced within one job dispatch; longer runs
    /// continue under a freshly enqueued job.
    #[serde(default = "default_max_steps_per_dispatch")]
    pub max_steps_per_dispatch: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbTestConfig {
    /// Interval of the periodic significance sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_concurrency() -> usize {
    8
}
fn default_delay_between_batches_ms() -> u64 {
    250
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_max_steps_per_dispatch() -> u32 {
    25
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            delay_between_batches_ms: default_delay_between_batches_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_dispatch: default_max_steps_per_dispatch(),
        }
    }
}

impl Default for AbTestConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            engine: EngineConfig::default(),
            abtest: AbTestConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DRIPFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
