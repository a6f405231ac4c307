use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardqError};

pub const DEFAULT_NUM_PARTITIONS: u32 = 6;
pub const DEFAULT_RESOURCE_NAME: &str = "scheduler-resource";
pub const DEFAULT_CLAIM_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_CLAIM_BATCHES_PER_CYCLE: usize = 20;
pub const DEFAULT_OUTBOX_FETCH_SIZE: usize = 500;
pub const DEFAULT_MAX_PUBLISH_BATCHES_PER_CYCLE: usize = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 600; // 10 minutes
pub const DEFAULT_TOPIC: &str = "scheduler-events";
pub const MAX_TRACE_CHARS: usize = 4_000;

/// Top-level config (shardq.toml + SHARDQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardqConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Instance name reported in logs. A `worker-<uuid>` name is generated
    /// when empty.
    #[serde(default)]
    pub instance_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Coordinator resource whose partitions this node serves; partition
    /// names arrive as `<resource_name>_<n>`.
    #[serde(default = "default_resource_name")]
    pub resource_name: String,
    /// Number of hash partitions events are routed into.
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u32,
    /// Partition count the coordinator was provisioned with. When set it
    /// must equal `num_partitions`; startup fails otherwise.
    #[serde(default)]
    pub coordinator_partitions: Option<u32>,
    /// Partitions assigned by the static coordinator.
    #[serde(default)]
    pub owned_partitions: Vec<u32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            resource_name: default_resource_name(),
            num_partitions: DEFAULT_NUM_PARTITIONS,
            coordinator_partitions: None,
            owned_partitions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits for SQLite's write lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Claim/process pipeline tuning. Batch size and the per-cycle cap bound
/// how long one partition can delay the others; neither affects correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    #[serde(default = "default_max_claim_batches")]
    pub max_batches_per_cycle: usize,
    /// Worker pool size shared by every event execution on this node.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Per-event execution timeout; `None` waits indefinitely.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
    /// Overlapping cycles allowed before ticks are skipped.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_cycles: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            max_batches_per_cycle: DEFAULT_MAX_CLAIM_BATCHES_PER_CYCLE,
            max_concurrent_executions: default_max_concurrent_executions(),
            execution_timeout_ms: None,
            max_in_flight_cycles: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_outbox_fetch_size")]
    pub fetch_batch_size: usize,
    #[serde(default = "default_max_publish_batches")]
    pub max_batches_per_cycle: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_cycles: usize,
    /// Topic name sent along with every published message.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// When set, outbox records are POSTed here; otherwise they are logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fetch_batch_size: DEFAULT_OUTBOX_FETCH_SIZE,
            max_batches_per_cycle: DEFAULT_MAX_PUBLISH_BATCHES_PER_CYCLE,
            max_in_flight_cycles: default_max_in_flight(),
            topic: default_topic(),
            webhook_url: None,
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Claims older than this are considered abandoned. Must exceed the
    /// longest plausible batch processing time.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            stale_timeout_secs: DEFAULT_STALE_TIMEOUT_SECS,
        }
    }
}

fn default_resource_name() -> String {
    DEFAULT_RESOURCE_NAME.to_string()
}
fn default_num_partitions() -> u32 {
    DEFAULT_NUM_PARTITIONS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shardq/shardq.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_claim_batch_size() -> usize {
    DEFAULT_CLAIM_BATCH_SIZE
}
fn default_max_claim_batches() -> usize {
    DEFAULT_MAX_CLAIM_BATCHES_PER_CYCLE
}
fn default_max_concurrent_executions() -> usize {
    64
}
fn default_max_in_flight() -> usize {
    1
}
fn default_outbox_fetch_size() -> usize {
    DEFAULT_OUTBOX_FETCH_SIZE
}
fn default_max_publish_batches() -> usize {
    DEFAULT_MAX_PUBLISH_BATCHES_PER_CYCLE
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_publish_timeout_ms() -> u64 {
    10_000
}
fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}
fn default_stale_timeout_secs() -> u64 {
    DEFAULT_STALE_TIMEOUT_SECS
}

impl ShardqConfig {
    /// Load config from a TOML file with SHARDQ_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.shardq/shardq.toml
    ///
    /// A missing file is not an error; built-in defaults apply. Nested keys
    /// are separated by `__` in env vars, e.g. `SHARDQ_CLUSTER__NUM_PARTITIONS=12`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ShardqConfig = Figment::from(Serialized::defaults(ShardqConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SHARDQ_").split("__"))
            .extract()
            .map_err(|e| ShardqError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs the worker cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster;
        if cluster.num_partitions == 0 {
            return Err(ShardqError::Config("cluster.num_partitions must be > 0".into()));
        }
        if let Some(coordinator) = cluster.coordinator_partitions {
            if coordinator != cluster.num_partitions {
                return Err(ShardqError::PartitionCountMismatch {
                    configured: cluster.num_partitions,
                    coordinator,
                });
            }
        }
        if let Some(&partition) = cluster
            .owned_partitions
            .iter()
            .find(|&&p| p >= cluster.num_partitions)
        {
            return Err(ShardqError::PartitionOutOfRange {
                partition,
                num_partitions: cluster.num_partitions,
            });
        }

        let positive = [
            ("pipeline.claim_batch_size", self.pipeline.claim_batch_size),
            ("pipeline.max_batches_per_cycle", self.pipeline.max_batches_per_cycle),
            (
                "pipeline.max_concurrent_executions",
                self.pipeline.max_concurrent_executions,
            ),
            ("pipeline.max_in_flight_cycles", self.pipeline.max_in_flight_cycles),
            ("outbox.fetch_batch_size", self.outbox.fetch_batch_size),
            ("outbox.max_batches_per_cycle", self.outbox.max_batches_per_cycle),
            ("outbox.max_in_flight_cycles", self.outbox.max_in_flight_cycles),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ShardqError::Config(format!("{key} must be > 0")));
        }

        // Poller periods feed `tokio::time::interval`, which rejects zero.
        let periods = [
            ("pipeline.poll_interval_ms", self.pipeline.poll_interval_ms),
            ("outbox.poll_interval_ms", self.outbox.poll_interval_ms),
            ("reaper.interval_secs", self.reaper.interval_secs),
            ("reaper.stale_timeout_secs", self.reaper.stale_timeout_secs),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, v)| *v == 0) {
            return Err(ShardqError::Config(format!("{key} must be > 0")));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shardq/shardq.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ShardqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.num_partitions, 6);
        assert_eq!(config.pipeline.claim_batch_size, 50);
        assert_eq!(config.outbox.fetch_batch_size, 500);
        assert_eq!(config.reaper.stale_timeout_secs, 600);
    }

    #[test]
    fn coordinator_partition_mismatch_fails_fast() {
        let mut config = ShardqConfig::default();
        config.cluster.coordinator_partitions = Some(12);
        assert!(matches!(
            config.validate(),
            Err(ShardqError::PartitionCountMismatch {
                configured: 6,
                coordinator: 12
            })
        ));
    }

    #[test]
    fn owned_partition_out_of_range_is_rejected() {
        let mut config = ShardqConfig::default();
        config.cluster.owned_partitions = vec![0, 6];
        assert!(matches!(
            config.validate(),
            Err(ShardqError::PartitionOutOfRange { partition: 6, .. })
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = ShardqConfig::default();
        config.pipeline.claim_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_intervals_are_rejected() {
        let cases: [fn(&mut ShardqConfig); 3] = [
            |c| c.pipeline.poll_interval_ms = 0,
            |c| c.outbox.poll_interval_ms = 0,
            |c| c.reaper.interval_secs = 0,
        ];
        for zero_out in cases {
            let mut config = ShardqConfig::default();
            zero_out(&mut config);
            assert!(matches!(config.validate(), Err(ShardqError::Config(_))));
        }
    }

    #[test]
    fn load_merges_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[cluster]\nnum_partitions = 4\nowned_partitions = [1, 3]\n\n[reaper]\nstale_timeout_secs = 120"
        )
        .unwrap();

        let config = ShardqConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.cluster.num_partitions, 4);
        assert_eq!(config.cluster.owned_partitions, vec![1, 3]);
        assert_eq!(config.reaper.stale_timeout_secs, 120);
        assert_eq!(config.pipeline.claim_batch_size, DEFAULT_CLAIM_BATCH_SIZE);
    }
}
