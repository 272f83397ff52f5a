pub mod collaborators;
pub mod errors;
pub mod ids;
pub mod metrics;
pub mod record;
pub mod settings;
pub mod trigger;

pub use collaborators::{
    AnalyticsSink, KeyValueStore, NoopAnalytics, PromptSurface, StoreRedirector,
    REVIEW_SETTINGS_KEY, USER_METRICS_KEY,
};
pub use errors::{ErrorContext, ErrorKind, RecordError, ReviewError, SurfaceError};
pub use ids::OperationId;
pub use metrics::{MetricsPatch, ReviewAction, UserAction, UserMetrics};
pub use settings::{ReviewSettings, SettingsPatch, TriggerKind};
pub use trigger::{AppState, TriggerContext, TriggerResult};
