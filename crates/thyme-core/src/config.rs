//! Scheduler configuration
//!
//! Defaults live in code; `from_env` overrides them from `THYME_`-prefixed
//! environment variables so the daemon can be tuned without rebuilds.

use anyhow::Result;
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Master switch; when false the scheduler never starts and due-task
    /// passes return empty
    pub enabled: bool,
    /// Start the polling ticker during initialization
    pub enable_auto_scheduling: bool,
    /// Tick period in milliseconds
    pub scheduling_interval_ms: u64,
    /// Hard cap on concurrently running handlers
    pub max_concurrent_tasks: usize,
    /// Priority assigned to tasks that do not specify one (0-10)
    pub default_priority: u8,
    /// Minimum priority for the priority-based strategy (0-10)
    pub priority_strategy_threshold: u8,
    /// How long `stop_scheduler` waits for in-flight handlers
    pub shutdown_grace_ms: u64,
    pub entity_cache_size: usize,
    pub entity_cache_ttl_ms: u64,
    pub query_cache_size: usize,
    pub query_cache_ttl_ms: u64,
    /// Timezone for day boundaries and cron evaluation
    pub timezone: Tz,
    /// Backing collection for the vector registry
    pub collection_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_auto_scheduling: false,
            scheduling_interval_ms: 5000,
            max_concurrent_tasks: 5,
            default_priority: 5,
            priority_strategy_threshold: 7,
            shutdown_grace_ms: 30_000,
            entity_cache_size: 500,
            entity_cache_ttl_ms: 60_000,
            query_cache_size: 50,
            query_cache_ttl_ms: 30_000,
            timezone: chrono_tz::UTC,
            collection_name: "thyme_tasks".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_bool("THYME_ENABLED", defaults.enabled),
            enable_auto_scheduling: env_bool(
                "THYME_AUTO_SCHEDULING",
                defaults.enable_auto_scheduling,
            ),
            scheduling_interval_ms: env_parse(
                "THYME_INTERVAL_MS",
                defaults.scheduling_interval_ms,
            ),
            max_concurrent_tasks: env_parse(
                "THYME_MAX_CONCURRENT",
                defaults.max_concurrent_tasks,
            ),
            default_priority: env_parse("THYME_DEFAULT_PRIORITY", defaults.default_priority)
                .min(10),
            priority_strategy_threshold: env_parse(
                "THYME_PRIORITY_THRESHOLD",
                defaults.priority_strategy_threshold,
            )
            .min(10),
            shutdown_grace_ms: env_parse("THYME_SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms),
            entity_cache_size: env_parse("THYME_ENTITY_CACHE_SIZE", defaults.entity_cache_size),
            entity_cache_ttl_ms: env_parse(
                "THYME_ENTITY_CACHE_TTL_MS",
                defaults.entity_cache_ttl_ms,
            ),
            query_cache_size: env_parse("THYME_QUERY_CACHE_SIZE", defaults.query_cache_size),
            query_cache_ttl_ms: env_parse(
                "THYME_QUERY_CACHE_TTL_MS",
                defaults.query_cache_ttl_ms,
            ),
            timezone: std::env::var("THYME_TIMEZONE")
                .ok()
                .and_then(|tz| tz.parse().ok())
                .unwrap_or(defaults.timezone),
            collection_name: std::env::var("THYME_COLLECTION")
                .unwrap_or(defaults.collection_name),
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
