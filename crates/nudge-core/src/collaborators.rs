//! Contracts for everything outside the decision core.

use async_trait::async_trait;

use crate::errors::{ReviewError, SurfaceError};

/// Persisted key for [`crate::UserMetrics`].
pub const USER_METRICS_KEY: &str = "user_metrics";
/// Persisted key for [`crate::ReviewSettings`].
pub const REVIEW_SETTINGS_KEY: &str = "review_settings";

/// Slow, fallible async key-value persistence. Failures are `Storage` errors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ReviewError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), ReviewError>;
    async fn remove(&self, key: &str) -> Result<(), ReviewError>;
}

/// The native, opaque "rate this app" prompt.
#[async_trait]
pub trait PromptSurface: Send + Sync {
    async fn is_available(&self) -> Result<bool, SurfaceError>;
    /// Returns whether the surface reports the review flow as completed.
    async fn request_review(&self) -> Result<bool, SurfaceError>;
}

/// Opens the store listing when the native prompt cannot be used.
#[async_trait]
pub trait StoreRedirector: Send + Sync {
    async fn open_external_url(&self, url: &str) -> Result<(), SurfaceError>;
}

/// Fire-and-forget analytics. Implementations must not block.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &str, payload: serde_json::Value);
}

/// Sink that drops every event.
pub struct NoopAnalytics;

impl AnalyticsSink for NoopAnalytics {
    fn record(&self, _event: &str, _payload: serde_json::Value) {}
}
