//! Fault classification, retry bookkeeping, and fallback strategies.
//!
//! `handle_review_error` runs the per-kind recovery strategy and reports what
//! it did. Retrying is the caller's job: either drive it through
//! [`ErrorHandler::decide`] or let [`ErrorHandler::run_with_retry`] own the loop.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nudge_core::{ErrorKind, ReviewAction, ReviewError, StoreRedirector};

use crate::config::RecoveryConfig;

/// Which recovery path was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    StoreRedirect,
    RetryWithBackoff,
    InMemoryFallback,
    RateLimitBackoff,
    Generic,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub resulting_action: Option<ReviewAction>,
    pub error_message: Option<String>,
    pub fallback_used: Option<FallbackStrategy>,
    /// Payload recovered from the in-memory fallback store.
    pub fallback_value: Option<serde_json::Value>,
}

impl RecoveryResult {
    fn recovered(strategy: FallbackStrategy, action: Option<ReviewAction>) -> Self {
        Self {
            success: true,
            resulting_action: action,
            error_message: None,
            fallback_used: Some(strategy),
            fallback_value: None,
        }
    }

    fn failed(strategy: FallbackStrategy, action: ReviewAction, message: impl Into<String>) -> Self {
        Self {
            success: false,
            resulting_action: Some(action),
            error_message: Some(message.into()),
            fallback_used: Some(strategy),
            fallback_value: None,
        }
    }
}

/// What the caller should do next with a failed operation.
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryDecision {
    RetryAfter(Duration),
    FallbackApplied(RecoveryResult),
    Fatal(RecoveryResult),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ErrorStats {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub recovered: u64,
    pub retries: u64,
    pub tracked_operations: usize,
}

pub struct ErrorHandler {
    config: RecoveryConfig,
    redirector: Arc<dyn StoreRedirector>,
    retry_attempts: DashMap<String, u32>,
    request_log: DashMap<String, VecDeque<Instant>>,
    fallbacks: DashMap<String, (serde_json::Value, Instant)>,
    error_counts: DashMap<ErrorKind, u64>,
    recovered: AtomicU64,
    retries: AtomicU64,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig, redirector: Arc<dyn StoreRedirector>) -> Self {
        Self {
            config,
            redirector,
            retry_attempts: DashMap::new(),
            request_log: DashMap::new(),
            fallbacks: DashMap::new(),
            error_counts: DashMap::new(),
            recovered: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run the recovery strategy for `error.kind`.
    pub async fn handle_review_error(&self, error: &ReviewError) -> RecoveryResult {
        *self.error_counts.entry(error.kind).or_insert(0) += 1;
        warn!(
            kind = %error.kind,
            message = %error.message,
            operation = error.context.as_ref().map(|c| c.operation.as_str()).unwrap_or(""),
            "review error"
        );

        let result = match error.kind {
            ErrorKind::NativeSurfaceUnavailable => self.redirect_to_store(FallbackStrategy::StoreRedirect).await,
            ErrorKind::Network => RecoveryResult::failed(
                FallbackStrategy::RetryWithBackoff,
                ReviewAction::Error,
                format!("network error, retry with backoff: {}", error.message),
            ),
            ErrorKind::Storage => self.recover_from_fallback(error),
            ErrorKind::RateLimit => {
                let op_id = error
                    .context
                    .as_ref()
                    .and_then(|c| c.operation_id.as_deref())
                    .unwrap_or_default();
                let wait = self.rate_limit_wait(op_id);
                RecoveryResult::failed(
                    FallbackStrategy::RateLimitBackoff,
                    ReviewAction::Error,
                    format!("rate limited, wait {}s before retrying", wait.as_secs().max(1)),
                )
            }
            ErrorKind::Unknown => self.redirect_to_store(FallbackStrategy::Generic).await,
        };

        if result.success {
            self.recovered.fetch_add(1, Ordering::Relaxed);
            info!(kind = %error.kind, strategy = ?result.fallback_used, "recovered from review error");
        }
        result
    }

    /// Decide between retrying and applying the fallback strategy.
    pub async fn decide(&self, error: &ReviewError, op_id: &str) -> RecoveryDecision {
        if self.should_retry(error, Some(op_id)) {
            let attempt = self.retry_attempts(op_id) + 1;
            return RecoveryDecision::RetryAfter(self.get_retry_delay(attempt));
        }
        let result = self.handle_review_error(error).await;
        if result.success {
            RecoveryDecision::FallbackApplied(result)
        } else {
            RecoveryDecision::Fatal(result)
        }
    }

    /// Run `f` until it succeeds, the error stops being retryable, or the
    /// attempt budget for `op_id` is spent. Attempts are cleared either way.
    pub async fn run_with_retry<T, F, Fut>(&self, op_id: &str, mut f: F) -> Result<T, ReviewError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReviewError>>,
    {
        loop {
            match f().await {
                Ok(value) => {
                    self.clear_retry_attempts(op_id);
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, Some(op_id)) => {
                    let attempt = self.record_retry_attempt(op_id);
                    let delay = self.get_retry_delay(attempt);
                    warn!(
                        op_id,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.clear_retry_attempts(op_id);
                    return Err(e);
                }
            }
        }
    }

    /// Retryable kind and the attempt count for `op_id` is still below the maximum.
    pub fn should_retry(&self, error: &ReviewError, op_id: Option<&str>) -> bool {
        if !error.is_retryable() {
            return false;
        }
        let attempts = op_id.map_or(0, |id| self.retry_attempts(id));
        attempts < self.config.max_retries
    }

    /// `base * multiplier^(attempt-1)`, capped. Attempt 0 is treated as 1.
    pub fn get_retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let ms = self.config.base_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let capped = ms.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn record_retry_attempt(&self, op_id: &str) -> u32 {
        self.retries.fetch_add(1, Ordering::Relaxed);
        let mut attempts = self.retry_attempts.entry(op_id.to_owned()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn retry_attempts(&self, op_id: &str) -> u32 {
        self.retry_attempts.get(op_id).map_or(0, |a| *a)
    }

    pub fn clear_retry_attempts(&self, op_id: &str) {
        self.retry_attempts.remove(op_id);
    }

    /// Whether `op_id` has used up its request budget in the sliding window.
    pub fn is_rate_limited(&self, op_id: &str) -> bool {
        let now = Instant::now();
        let window = self.config.rate_limit_window();
        match self.request_log.get_mut(op_id) {
            Some(mut log) => {
                prune(&mut log, now, window);
                log.len() >= self.config.rate_limit_max_requests
            }
            None => false,
        }
    }

    pub fn record_api_request(&self, op_id: &str) {
        let now = Instant::now();
        let window = self.config.rate_limit_window();
        let mut log = self.request_log.entry(op_id.to_owned()).or_default();
        prune(&mut log, now, window);
        log.push_back(now);
    }

    /// Time until the oldest request in the window ages out.
    fn rate_limit_wait(&self, op_id: &str) -> Duration {
        let window = self.config.rate_limit_window();
        self.request_log
            .get(op_id)
            .and_then(|log| log.front().copied())
            .map_or(window, |oldest| window.saturating_sub(oldest.elapsed()))
    }

    pub fn set_in_memory_fallback(&self, key: &str, value: serde_json::Value) {
        self.fallbacks.insert(key.to_owned(), (value, Instant::now()));
    }

    pub fn get_in_memory_fallback(&self, key: &str) -> Option<serde_json::Value> {
        let ttl = self.config.fallback_ttl();
        let expired = match self.fallbacks.get(key) {
            Some(entry) if entry.1.elapsed() <= ttl => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.fallbacks.remove(key);
        }
        None
    }

    pub fn stats(&self) -> ErrorStats {
        let by_kind: BTreeMap<String, u64> = self
            .error_counts
            .iter()
            .map(|e| (e.key().as_str().to_owned(), *e.value()))
            .collect();
        ErrorStats {
            total: by_kind.values().sum(),
            by_kind,
            recovered: self.recovered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            tracked_operations: self.retry_attempts.len(),
        }
    }

    /// Forget retry, rate-limit, and fallback state.
    pub fn reset(&self) {
        self.retry_attempts.clear();
        self.request_log.clear();
        self.fallbacks.clear();
    }

    async fn redirect_to_store(&self, strategy: FallbackStrategy) -> RecoveryResult {
        match self.redirector.open_external_url(&self.config.store_url).await {
            Ok(()) => {
                debug!(url = %self.config.store_url, "redirected to store page");
                RecoveryResult::recovered(strategy, Some(ReviewAction::Completed))
            }
            Err(e) => RecoveryResult::failed(
                strategy,
                ReviewAction::NotAvailable,
                format!("store redirect failed: {e}"),
            ),
        }
    }

    fn recover_from_fallback(&self, error: &ReviewError) -> RecoveryResult {
        let key = error.context.as_ref().and_then(|c| c.key.as_deref());
        match key.and_then(|k| self.get_in_memory_fallback(k)) {
            Some(value) => RecoveryResult {
                fallback_value: Some(value),
                ..RecoveryResult::recovered(FallbackStrategy::InMemoryFallback, None)
            },
            None => RecoveryResult::failed(
                FallbackStrategy::InMemoryFallback,
                ReviewAction::Error,
                format!("storage error with no fallback: {}", error.message),
            ),
        }
    }
}

fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while log
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        log.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRedirector;
    use nudge_core::ErrorContext;
    use std::sync::atomic::AtomicUsize;

    fn handler() -> (ErrorHandler, Arc<MockRedirector>) {
        let redirector = Arc::new(MockRedirector::new());
        (ErrorHandler::new(RecoveryConfig::default(), redirector.clone()), redirector)
    }

    #[test]
    fn retry_delay_is_exponential() {
        let (h, _) = handler();
        assert_eq!(h.get_retry_delay(1), Duration::from_millis(1000));
        assert_eq!(h.get_retry_delay(2), Duration::from_millis(2000));
        assert_eq!(h.get_retry_delay(3), Duration::from_millis(4000));
        assert_eq!(h.get_retry_delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn retry_delay_capped_at_max() {
        let (h, _) = handler();
        assert_eq!(h.get_retry_delay(10), Duration::from_millis(30_000));
        assert_eq!(h.get_retry_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn should_retry_until_budget_spent() {
        let (h, _) = handler();
        let err = ReviewError::network("connection reset");
        for _ in 0..3 {
            assert!(h.should_retry(&err, Some("load")));
            h.record_retry_attempt("load");
        }
        assert!(!h.should_retry(&err, Some("load")));
        assert!(h.should_retry(&err, Some("other")));

        h.clear_retry_attempts("load");
        assert!(h.should_retry(&err, Some("load")));
    }

    #[test]
    fn only_network_and_unknown_are_retried() {
        let (h, _) = handler();
        assert!(h.should_retry(&ReviewError::unknown("?"), None));
        assert!(!h.should_retry(&ReviewError::storage("disk"), None));
        assert!(!h.should_retry(&ReviewError::rate_limited("slow down"), None));
        assert!(!h.should_retry(&ReviewError::unavailable("no surface"), None));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_sliding_window() {
        let (h, _) = handler();
        for _ in 0..4 {
            h.record_api_request("request_review");
        }
        assert!(!h.is_rate_limited("request_review"));
        h.record_api_request("request_review");
        assert!(h.is_rate_limited("request_review"));
        assert!(!h.is_rate_limited("other"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!h.is_rate_limited("request_review"));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_expires_after_ttl() {
        let (h, _) = handler();
        h.set_in_memory_fallback("user_metrics", serde_json::json!({"appOpenCount": 4}));
        assert!(h.get_in_memory_fallback("user_metrics").is_some());

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(h.get_in_memory_fallback("user_metrics").is_none());
    }

    #[tokio::test]
    async fn unavailable_surface_redirects_to_store() {
        let (h, redirector) = handler();
        let result = h.handle_review_error(&ReviewError::unavailable("not available")).await;
        assert!(result.success);
        assert_eq!(result.fallback_used, Some(FallbackStrategy::StoreRedirect));
        assert_eq!(redirector.opened(), vec![RecoveryConfig::default().store_url]);
    }

    #[tokio::test]
    async fn failed_redirect_reports_not_available() {
        let redirector = Arc::new(MockRedirector::failing());
        let h = ErrorHandler::new(RecoveryConfig::default(), redirector);
        let result = h.handle_review_error(&ReviewError::unavailable("not available")).await;
        assert!(!result.success);
        assert_eq!(result.resulting_action, Some(ReviewAction::NotAvailable));
    }

    #[tokio::test]
    async fn network_strategy_is_advisory() {
        let (h, redirector) = handler();
        let result = h.handle_review_error(&ReviewError::network("offline")).await;
        assert!(!result.success);
        assert_eq!(result.fallback_used, Some(FallbackStrategy::RetryWithBackoff));
        assert!(redirector.opened().is_empty());
    }

    #[tokio::test]
    async fn storage_strategy_uses_fallback_by_key() {
        let (h, _) = handler();
        let err = ReviewError::storage("read failed")
            .with_context(ErrorContext::new("load_settings").with_key("review_settings"));

        assert!(!h.handle_review_error(&err).await.success);

        h.set_in_memory_fallback("review_settings", serde_json::json!({"cooldownDays": 7}));
        let result = h.handle_review_error(&err).await;
        assert!(result.success);
        assert_eq!(result.fallback_value, Some(serde_json::json!({"cooldownDays": 7})));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_message_states_wait() {
        let (h, _) = handler();
        h.record_api_request("request_review");
        tokio::time::advance(Duration::from_secs(20)).await;
        let err = ReviewError::rate_limited("too many")
            .with_context(ErrorContext::new("request_review").with_operation_id("request_review"));
        let result = h.handle_review_error(&err).await;
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("rate limited, wait 40s before retrying"));
    }

    #[tokio::test]
    async fn unknown_falls_back_to_redirect() {
        let (h, redirector) = handler();
        let result = h.handle_review_error(&ReviewError::unknown("boom")).await;
        assert!(result.success);
        assert_eq!(result.fallback_used, Some(FallbackStrategy::Generic));
        assert_eq!(redirector.opened().len(), 1);
    }

    #[tokio::test]
    async fn decide_retries_then_gives_up() {
        let redirector = Arc::new(MockRedirector::failing());
        let h = ErrorHandler::new(RecoveryConfig::default(), redirector);
        let err = ReviewError::network("timeout");

        assert_eq!(h.decide(&err, "op").await, RecoveryDecision::RetryAfter(Duration::from_millis(1000)));
        h.record_retry_attempt("op");
        assert_eq!(h.decide(&err, "op").await, RecoveryDecision::RetryAfter(Duration::from_millis(2000)));
        h.record_retry_attempt("op");
        h.record_retry_attempt("op");
        assert!(matches!(h.decide(&err, "op").await, RecoveryDecision::Fatal(_)));

        let storage = ReviewError::storage("x");
        assert!(matches!(h.decide(&storage, "op2").await, RecoveryDecision::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_with_retry_recovers() {
        let (h, _) = handler();
        let calls = AtomicUsize::new(0);
        let result = h
            .run_with_retry("load", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ReviewError::network("timeout"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(h.retry_attempts("load"), 0);
        assert_eq!(h.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_with_retry_gives_up_after_budget() {
        let (h, _) = handler();
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Result<(), _> = h
            .run_with_retry("load", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ReviewError::network("timeout")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(1000 + 2000 + 4000));
    }

    #[tokio::test]
    async fn run_with_retry_does_not_retry_storage() {
        let (h, _) = handler();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = h
            .run_with_retry("save", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ReviewError::storage("disk full")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Storage);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_count_by_kind() {
        let (h, _) = handler();
        h.handle_review_error(&ReviewError::network("a")).await;
        h.handle_review_error(&ReviewError::network("b")).await;
        h.handle_review_error(&ReviewError::unavailable("c")).await;

        let stats = h.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind.get("network"), Some(&2));
        assert_eq!(stats.recovered, 1);
    }
}
