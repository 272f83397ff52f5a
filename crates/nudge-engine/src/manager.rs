//! The single entry point the host application talks to.
//!
//! Owns every component as an explicit instance, serialises prompt attempts
//! with a fail-fast in-flight flag, and converts every fault into a default
//! value after routing it through the [`ErrorHandler`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nudge_core::{
    AnalyticsSink, ErrorContext, ErrorKind, KeyValueStore, MetricsPatch, OperationId,
    PromptSurface, ReviewAction, ReviewError, ReviewSettings, SettingsPatch, StoreRedirector,
    TriggerContext, TriggerResult, UserAction, UserMetrics,
};

use crate::batch::{BatchProcessor, BatchStats, QueueStatus, DEFAULT_PRIORITY, HIGH_PRIORITY};
use crate::cache::{spawn_sweeper, CacheManager, CacheStats};
use crate::config::NudgeConfig;
use crate::recovery::{ErrorHandler, ErrorStats, RecoveryResult};
use crate::repo::ReviewRepo;
use crate::trigger::TriggerEngine;

/// Rate-limit bucket for prompt surface invocations.
pub const REQUEST_REVIEW_OP: &str = "request_review";
const AVAILABILITY_OP: &str = "is_available";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
}

/// External collaborators supplied by the host.
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub surface: Arc<dyn PromptSurface>,
    pub redirector: Arc<dyn StoreRedirector>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ManagerStats {
    pub state: ManagerState,
    pub pending_actions: usize,
    pub dropped_actions: u64,
    pub prompt_in_flight: bool,
    pub cache: CacheStats,
    pub batch: BatchStats,
    pub queue: QueueStatus,
    pub errors: ErrorStats,
}

struct Lifecycle {
    state: ManagerState,
    pending: VecDeque<UserAction>,
    dropped: u64,
}

pub struct ReviewManager {
    config: NudgeConfig,
    repo: Arc<ReviewRepo>,
    cache: Arc<CacheManager>,
    errors: Arc<ErrorHandler>,
    batch: BatchProcessor,
    engine: TriggerEngine,
    surface: Arc<dyn PromptSurface>,
    analytics: Arc<dyn AnalyticsSink>,
    lifecycle: Mutex<Lifecycle>,
    init_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the in-flight flag however the prompt attempt ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReviewManager {
    pub fn new(config: NudgeConfig, collaborators: Collaborators) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let errors = Arc::new(ErrorHandler::new(
            config.recovery.clone(),
            collaborators.redirector,
        ));
        let repo = Arc::new(ReviewRepo::new(
            collaborators.store,
            cache.clone(),
            errors.clone(),
        ));
        let batch = BatchProcessor::new(repo.clone(), config.batch.clone());
        let engine = TriggerEngine::new(repo.clone(), config.trigger.clone());

        Self {
            config,
            repo,
            cache,
            errors,
            batch,
            engine,
            surface: collaborators.surface,
            analytics: collaborators.analytics,
            lifecycle: Mutex::new(Lifecycle {
                state: ManagerState::Uninitialized,
                pending: VecDeque::new(),
                dropped: 0,
            }),
            init_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle.lock().state
    }

    /// Warm the caches, start background work, and drain actions recorded
    /// before initialization in their original order. Drained actions are
    /// applied directly through the trigger engine, app opens included, so
    /// they are persisted before this returns. Idempotent.
    pub async fn initialize(&self) {
        let _init = self.init_lock.lock().await;
        {
            let mut lc = self.lifecycle.lock();
            if lc.state == ManagerState::Ready {
                return;
            }
            lc.state = ManagerState::Initializing;
        }

        if let Err(e) = self.repo.load_settings().await {
            self.report(e).await;
        }
        if let Err(e) = self.engine.user_metrics().await {
            self.report(e).await;
        }

        if self.config.manager.background_tasks {
            let mut tasks = self.tasks.lock();
            tasks.push(spawn_sweeper(self.cache.clone(), self.config.cache.sweep_interval()));
            tasks.push(self.batch.start());
        }

        let mut drained = 0usize;
        loop {
            // Ready is set under the same lock that finds the queue empty, so
            // an action recorded meanwhile is either drained here or processed
            // directly, never both.
            let next = {
                let mut lc = self.lifecycle.lock();
                let next = lc.pending.pop_front();
                if next.is_none() {
                    lc.state = ManagerState::Ready;
                }
                next
            };
            let Some(action) = next else { break };
            self.apply_action(&action).await;
            drained += 1;
        }
        info!(drained, "review manager ready");
    }

    /// Record an engagement event. Buffered until the manager is ready.
    pub async fn record_user_action(&self, action: UserAction) {
        {
            let mut lc = self.lifecycle.lock();
            if lc.state != ManagerState::Ready {
                if lc.pending.len() >= self.config.manager.pending_capacity.max(1) {
                    lc.pending.pop_front();
                    lc.dropped += 1;
                    warn!(capacity = self.config.manager.pending_capacity, "pending action queue full, dropped oldest");
                }
                lc.pending.push_back(action);
                return;
            }
        }
        self.process_action(action).await;
    }

    /// Evaluate `ctx` and, if warranted, show the prompt. Returns whether the
    /// surface reported success. A second call while a prompt is in flight
    /// returns `false` immediately.
    pub async fn check_and_trigger_review(&self, ctx: &TriggerContext) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(trigger = %ctx.trigger, "review prompt already in flight");
            return false;
        }
        let _flight = InFlightGuard(&self.in_flight);

        if self.state() != ManagerState::Ready {
            debug!(trigger = %ctx.trigger, "review manager not initialized");
            return false;
        }

        match self.try_review(ctx).await {
            Ok(completed) => completed,
            Err(err) => self.report(err).await.success,
        }
    }

    async fn try_review(&self, ctx: &TriggerContext) -> Result<bool, ReviewError> {
        let verdict = self.engine.evaluate_trigger(ctx).await;
        self.record_evaluation(ctx, &verdict);
        if !verdict.should_trigger {
            return Ok(false);
        }

        if self.errors.is_rate_limited(REQUEST_REVIEW_OP) {
            return Err(ReviewError::rate_limited("too many review requests").with_context(
                ErrorContext::new("check_and_trigger_review").with_operation_id(REQUEST_REVIEW_OP),
            ));
        }
        if !self.is_review_available().await {
            return Err(ReviewError::unavailable("review prompt not available")
                .with_context(ErrorContext::new("check_and_trigger_review")));
        }

        self.errors.record_api_request(REQUEST_REVIEW_OP);
        self.batch.batch_user_action(
            UserAction::ReviewPromptShown { at: Utc::now() },
            HIGH_PRIORITY,
        );
        self.analytics.record(
            "review_prompt_shown",
            json!({ "trigger": ctx.trigger.as_str(), "confidence": verdict.confidence }),
        );

        let outcome = self.surface.request_review().await;
        let (action, result) = match outcome {
            Ok(true) => (ReviewAction::Completed, Ok(true)),
            Ok(false) => (ReviewAction::Dismissed, Ok(false)),
            Err(e) => {
                let err = ReviewError::from_surface(&e)
                    .with_context(ErrorContext::new("request_review"));
                let action = if err.kind == ErrorKind::NativeSurfaceUnavailable {
                    ReviewAction::NotAvailable
                } else {
                    ReviewAction::Error
                };
                (action, Err(err))
            }
        };

        self.batch
            .batch_user_action(UserAction::ReviewAction { action }, HIGH_PRIORITY);
        self.batch.flush().await;
        self.analytics.record(
            "review_prompt_result",
            json!({ "trigger": ctx.trigger.as_str(), "action": action.as_str() }),
        );
        info!(trigger = %ctx.trigger, action = action.as_str(), "review prompt finished");
        result
    }

    /// Clear persisted records, caches, the metrics snapshot, and every queue.
    pub async fn reset_review_state(&self) {
        let discarded = self.batch.clear_queue();
        if let Err(e) = self.repo.clear().await {
            self.report(e).await;
        }
        self.cache.clear();
        self.engine.clear_snapshot();
        self.errors.reset();
        let pending = {
            let mut lc = self.lifecycle.lock();
            let n = lc.pending.len();
            lc.pending.clear();
            n
        };
        self.in_flight.store(false, Ordering::SeqCst);
        self.analytics.record(
            "review_state_reset",
            json!({ "discarded_operations": discarded, "discarded_pending": pending }),
        );
        info!(discarded, pending, "review state reset");
    }

    pub async fn get_user_metrics(&self) -> UserMetrics {
        match self.engine.user_metrics().await {
            Ok(m) => m,
            Err(e) => {
                self.report(e).await;
                self.engine
                    .snapshot()
                    .unwrap_or_else(|| UserMetrics::new(Utc::now()))
            }
        }
    }

    pub async fn get_review_settings(&self) -> ReviewSettings {
        match self.repo.load_settings().await {
            Ok(s) => s,
            Err(e) => {
                self.report(e).await;
                ReviewSettings::default()
            }
        }
    }

    /// Queue a settings change and flush it. Returns `false` if it could not
    /// be persisted.
    pub async fn update_review_settings(&self, patch: SettingsPatch) -> bool {
        let failed_before = self.batch.get_stats().failed;
        let id = self.batch.batch_update_review_settings(patch, HIGH_PRIORITY);
        self.batch.flush().await;
        let ok = self.batch.get_stats().failed == failed_before;
        if !ok {
            warn!(op_id = %id, "settings update was not persisted");
        }
        ok
    }

    /// Queue a partial metrics update for the next batch.
    pub fn track_metrics(&self, patch: MetricsPatch) -> OperationId {
        self.batch.batch_update_user_metrics(patch, DEFAULT_PRIORITY)
    }

    pub async fn get_next_eligible_time(&self) -> Option<DateTime<Utc>> {
        self.engine.next_eligible_time().await
    }

    /// Whether the native prompt can be shown. Cached; transient failures are
    /// retried with backoff, anything else reads as unavailable.
    pub async fn is_review_available(&self) -> bool {
        if let Some(available) = self.cache.get_availability() {
            return available;
        }
        let surface = &self.surface;
        let result = self
            .errors
            .run_with_retry(AVAILABILITY_OP, move || async move {
                surface
                    .is_available()
                    .await
                    .map_err(|e| ReviewError::from_surface(&e))
            })
            .await;
        match result {
            Ok(available) => {
                self.cache.set_availability(available);
                available
            }
            Err(e) => {
                warn!(error = %e, "review availability check failed");
                false
            }
        }
    }

    /// Persist everything queued in the batch processor.
    pub async fn flush(&self) -> usize {
        self.batch.flush().await
    }

    pub fn stats(&self) -> ManagerStats {
        let (state, pending_actions, dropped_actions) = {
            let lc = self.lifecycle.lock();
            (lc.state, lc.pending.len(), lc.dropped)
        };
        ManagerStats {
            state,
            pending_actions,
            dropped_actions,
            prompt_in_flight: self.in_flight.load(Ordering::SeqCst),
            cache: self.cache.stats(),
            batch: self.batch.get_stats(),
            queue: self.batch.get_queue_status(),
            errors: self.errors.stats(),
        }
    }

    /// Flush pending writes and stop background tasks.
    pub async fn shutdown(&self) {
        let written = self.batch.flush().await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!(written, stopped = tasks.len(), "review manager shut down");
    }

    async fn process_action(&self, action: UserAction) {
        if action.is_batchable() {
            self.batch.batch_user_action(action, DEFAULT_PRIORITY);
            return;
        }
        self.apply_action(&action).await;
    }

    async fn apply_action(&self, action: &UserAction) {
        if let Err(e) = self.engine.update_user_metrics(action).await {
            self.report(e).await;
        }
    }

    fn record_evaluation(&self, ctx: &TriggerContext, verdict: &TriggerResult) {
        self.analytics.record(
            "review_trigger_evaluated",
            json!({
                "trigger": ctx.trigger.as_str(),
                "should_trigger": verdict.should_trigger,
                "reason": verdict.reason,
                "confidence": verdict.confidence,
            }),
        );
    }

    async fn report(&self, err: ReviewError) -> RecoveryResult {
        self.analytics.record(
            "review_error",
            json!({ "kind": err.kind.as_str(), "message": err.message }),
        );
        self.errors.handle_review_error(&err).await
    }
}
