use serde::{Deserialize, Serialize};

/// Main configuration structure for the orchestration engine.
///
/// Every option has a default; the figment loader merges YAML files
/// and `CONDUCTOR_*` environment variables over these values. The
/// config is threaded through construction — components never read
/// global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Task processor worker pool size (>= 1)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Provider invocation timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Dedup / result cache settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Quota ledger settings
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Provider health probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Load-balancing strategy applied after filters
    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,

    /// Workflow scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Event bus settings
    #[serde(default)]
    pub events: EventBusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

const fn default_worker_count() -> usize {
    4
}

const fn default_request_timeout_ms() -> u64 {
    120_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            dedup: DedupConfig::default(),
            quota: QuotaConfig::default(),
            health: HealthConfig::default(),
            load_balancing_strategy: LoadBalancingStrategy::default(),
            scheduler: SchedulerConfig::default(),
            events: EventBusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Retry and back-off policy for transient task failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum retries per task (attempts <= max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base back-off in milliseconds; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Back-off ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

const fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Dedup cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DedupConfig {
    /// TTL of completed cache entries in milliseconds
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,

    /// How long a follower waits for its producer before being
    /// re-queued, in milliseconds
    #[serde(default = "default_follower_timeout_ms")]
    pub follower_timeout_ms: u64,

    /// Number of cache shards (power of two recommended)
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
}

const fn default_dedup_ttl_ms() -> u64 {
    3_600_000
}

const fn default_follower_timeout_ms() -> u64 {
    300_000
}

const fn default_shard_count() -> usize {
    16
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_ms: default_dedup_ttl_ms(),
            follower_timeout_ms: default_follower_timeout_ms(),
            shard_count: default_shard_count(),
        }
    }
}

/// Quota ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QuotaConfig {
    /// Uncommitted reservations older than this are auto-refunded,
    /// in milliseconds
    #[serde(default = "default_reservation_ttl_ms")]
    pub reservation_ttl_ms: u64,
}

const fn default_reservation_ttl_ms() -> u64 {
    60_000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: default_reservation_ttl_ms(),
        }
    }
}

/// Provider health probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Probe cadence for unhealthy providers, in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

const fn default_probe_interval_ms() -> u64 {
    30_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

/// Strategy applied to providers that survive capability, health, and
/// quota filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    FastestResponse,
    PriorityBased,
    CapabilityBased,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::FastestResponse => "fastest_response",
            Self::PriorityBased => "priority_based",
            Self::CapabilityBased => "capability_based",
        }
    }
}

/// Workflow scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Tick interval of the fire-time evaluator, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Missed fires older than this are not caught up, in milliseconds
    #[serde(default = "default_catch_up_window_ms")]
    pub catch_up_window_ms: u64,
}

const fn default_tick_interval_ms() -> u64 {
    60_000
}

const fn default_catch_up_window_ms() -> u64 {
    3_600_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            catch_up_window_ms: default_catch_up_window_ms(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventBusConfig {
    /// Per-subscriber buffer; subscribers lagging beyond this are
    /// dropped and must resubscribe
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

const fn default_channel_capacity() -> usize {
    1_024
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
