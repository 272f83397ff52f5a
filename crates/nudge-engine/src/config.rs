//! Engine configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`NudgeConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `NUDGE_*` environment overrides (highest priority)
//! 4. Clamp sizes and intervals to their lower bounds

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Floor for timer periods; a zero period would panic the ticker.
const MIN_INTERVAL_MS: u64 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn validate(&mut self) {
        self.max_size = self.max_size.max(1);
        self.sweep_interval_ms = self.sweep_interval_ms.max(MIN_INTERVAL_MS);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Operations pulled per processing pass.
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    /// Queue length that triggers an immediate pass.
    pub max_queue_size: usize,
    /// Hard bound; beyond it the oldest lowest-priority operation is dropped.
    pub queue_capacity: usize,
    /// Priority at or above which an enqueue triggers an immediate pass.
    pub priority_threshold: u8,
    pub max_retries: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            flush_interval_ms: 5000,
            max_queue_size: 50,
            queue_capacity: 500,
            priority_threshold: 5,
            max_retries: 3,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn validate(&mut self) {
        self.max_batch_size = self.max_batch_size.max(1);
        self.max_queue_size = self.max_queue_size.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.flush_interval_ms = self.flush_interval_ms.max(MIN_INTERVAL_MS);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: usize,
    pub fallback_ttl_ms: u64,
    pub store_url: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 5,
            fallback_ttl_ms: 60 * 60 * 1000,
            store_url: "https://apps.apple.com/app/id0000000000?action=write-review".into(),
        }
    }
}

impl RecoveryConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_millis(self.fallback_ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub minimum_food_logs: u32,
    pub milestones: BTreeSet<String>,
    pub streak_milestones: BTreeSet<u32>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            minimum_food_logs: 10,
            milestones: ["first_week", "first_month", "weight_goal_reached", "hundred_logs"]
                .into_iter()
                .map(String::from)
                .collect(),
            streak_milestones: [7, 14, 30, 60, 100].into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Actions buffered while uninitialized; the oldest is dropped beyond this.
    pub pending_capacity: usize,
    /// Run the cache sweeper and batch worker as background tasks.
    pub background_tasks: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 100,
            background_tasks: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NudgeConfig {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub recovery: RecoveryConfig,
    pub trigger: TriggerConfig,
    pub manager: ManagerConfig,
}

impl NudgeConfig {
    pub fn validate(&mut self) {
        let before = self.clone();
        self.cache.validate();
        self.batch.validate();
        self.manager.pending_capacity = self.manager.pending_capacity.max(1);
        if *self != before {
            warn!("config values below their minimum were clamped");
        }
    }
}

/// Load configuration from `path` with environment overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<NudgeConfig, ConfigError> {
    let defaults = serde_json::to_value(NudgeConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: NudgeConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate();
    Ok(config)
}

/// Objects merge per key, arrays and primitives are replaced, nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(config: &mut NudgeConfig) {
    if let Some(v) = read_env_string("NUDGE_STORE_URL") {
        config.recovery.store_url = v;
    }
    if let Some(v) = read_env_u64("NUDGE_FLUSH_INTERVAL_MS", 10, 3_600_000) {
        config.batch.flush_interval_ms = v;
    }
    if let Some(v) = read_env_u64("NUDGE_CACHE_MAX_SIZE", 1, 1_000_000) {
        config.cache.max_size = v as usize;
    }
    if let Some(v) = read_env_u64("NUDGE_MAX_RETRIES", 0, 20) {
        config.recovery.max_retries = v as u32;
        config.batch.max_retries = v as u32;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}
