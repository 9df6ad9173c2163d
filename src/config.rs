use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::data_model::{
    DEFAULT_INSERT_BUDGET, DEFAULT_STRING_TOP_CAPACITY, DEFAULT_STRING_TOP_COUNT_INSERT,
};

/// Top-level configuration for the tallyd agent and aggregator.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the host environment YAML file; empty disables it.
    #[serde(default)]
    pub env_file_path: String,

    /// Agent-side ingestion and bucketing configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Aggregator-side sampling and insertion configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// Agent-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Number of independently locked shards. Default: 4.
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// String-top entries collected per item before folding. Default: 100.
    #[serde(default = "default_string_top_capacity")]
    pub string_top_capacity: usize,

    /// Resolution applied to hardware host metrics. Default: 60.
    #[serde(default = "default_hardware_resolution")]
    pub hardware_metric_resolution: u32,

    /// Bucket payload codec: "zstd", "gzip" or "none". Default: "zstd".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Bounded outbound queue length in buckets. Default: 60.
    #[serde(default = "default_outbound_queue_len")]
    pub outbound_queue_len: usize,

    /// Grace period for draining the outbound queue on shutdown.
    /// Default: 5s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            num_shards: default_num_shards(),
            string_top_capacity: default_string_top_capacity(),
            hardware_metric_resolution: default_hardware_resolution(),
            compression: default_compression(),
            outbound_queue_len: default_outbound_queue_len(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Aggregator-side configuration. The sampling subset can be updated
/// remotely; readers always work from a cloned snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Insert budget in bytes per contributor per second. Default: 350.
    #[serde(default = "default_insert_budget")]
    pub insert_budget: i64,

    /// String-top entries surviving into the insert. Default: 20.
    #[serde(default = "default_string_top_count_insert")]
    pub string_top_count_insert: usize,

    /// Sampling weight per namespace id; absent means weight 1.
    #[serde(default)]
    pub sample_namespaces: HashMap<i32, f64>,

    /// Sampling weight per group id.
    #[serde(default)]
    pub sample_groups: HashMap<i32, f64>,

    /// Sampling weight per metric id.
    #[serde(default)]
    pub sample_keys: HashMap<i32, f64>,

    /// Column store HTTP address (host:port); empty means dry-run.
    #[serde(default)]
    pub insert_addr: String,

    /// Target table of the insert statement.
    #[serde(default = "default_insert_table")]
    pub insert_table: String,

    /// Timeout for one insert POST. Default: 15s.
    #[serde(default = "default_insert_timeout", with = "humantime_serde")]
    pub insert_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            insert_budget: default_insert_budget(),
            string_top_count_insert: default_string_top_count_insert(),
            sample_namespaces: HashMap::new(),
            sample_groups: HashMap::new(),
            sample_keys: HashMap::new(),
            insert_addr: String::new(),
            insert_table: default_insert_table(),
            insert_timeout: default_insert_timeout(),
        }
    }
}

impl Config {
    /// Loads and validates a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data).context("parsing config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.num_shards == 0 {
            bail!("agent.num_shards must be positive");
        }
        if self.agent.string_top_capacity == 0 {
            bail!("agent.string_top_capacity must be positive");
        }
        if !matches!(self.agent.compression.as_str(), "" | "none" | "zstd" | "gzip") {
            bail!(
                "agent.compression must be one of none/zstd/gzip, got {:?}",
                self.agent.compression
            );
        }
        if self.agent.outbound_queue_len == 0 {
            bail!("agent.outbound_queue_len must be positive");
        }
        if self.aggregator.insert_budget <= 0 {
            bail!("aggregator.insert_budget must be positive");
        }
        if self.aggregator.string_top_count_insert == 0 {
            bail!("aggregator.string_top_count_insert must be positive");
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_num_shards() -> usize {
    4
}

fn default_string_top_capacity() -> usize {
    DEFAULT_STRING_TOP_CAPACITY
}

fn default_hardware_resolution() -> u32 {
    60
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_outbound_queue_len() -> usize {
    60
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_insert_budget() -> i64 {
    DEFAULT_INSERT_BUDGET
}

fn default_string_top_count_insert() -> usize {
    DEFAULT_STRING_TOP_COUNT_INSERT
}

fn default_insert_table() -> String {
    "tallyd_value_incoming".to_string()
}

fn default_insert_timeout() -> Duration {
    Duration::from_secs(15)
}
