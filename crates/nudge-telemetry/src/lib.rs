mod metrics;

pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "nudge_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether the in-memory metrics recorder is created.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            metrics_enabled: true,
        }
    }
}

/// Handle returned by [`init_telemetry`]; keeps runtime log control alive.
pub struct TelemetryGuard {
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload_handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let filter_str = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };

        if let Some(handle) = &self.reload_handle {
            if let Err(e) = handle.reload(EnvFilter::new(&filter_str)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Access the metrics recorder.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call keeps the first subscriber; the returned guard then only
/// carries the metrics recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    if !installed {
        eprintln!("nudge-telemetry: a global subscriber is already installed");
    }

    let metrics_recorder = config
        .metrics_enabled
        .then(|| Arc::new(MetricsRecorder::new()));

    TelemetryGuard {
        metrics_recorder,
        base_level: config.log_level,
        level_filter,
        reload_handle: installed.then_some(reload_handle),
    }
}

fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}
