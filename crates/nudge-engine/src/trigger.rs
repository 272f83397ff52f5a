//! Confidence-scored trigger evaluation.
//!
//! [`evaluate`] is the pure decision: gates in a fixed order, then a
//! per-trigger condition with a base confidence, then engagement and timing
//! refinements. [`TriggerEngine`] wraps it with the verdict cache, the
//! persisted metrics/settings, and an in-memory snapshot used when the store
//! cannot be read.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use nudge_core::{
    ReviewAction, ReviewError, ReviewSettings, TriggerContext, TriggerKind, TriggerResult,
    UserAction, UserMetrics,
};

use crate::config::TriggerConfig;
use crate::repo::ReviewRepo;

pub const APP_OPEN_CONFIDENCE: f64 = 0.60;
pub const FOOD_LOG_CONFIDENCE: f64 = 0.80;
pub const MILESTONE_CONFIDENCE: f64 = 0.90;
pub const STREAK_CONFIDENCE: f64 = 0.95;
pub const GOAL_CONFIDENCE: f64 = 0.85;

const ENGAGEMENT_CAP: f64 = 0.30;
const TIMING_CAP: f64 = 0.20;
const DISMISSED_PENALTY: f64 = 0.7;

/// Evaluate `ctx` against `metrics` and `settings` at `now`.
///
/// Expected business outcomes (cooldown, thresholds, disabled triggers) are
/// negative results, never errors.
pub fn evaluate(
    ctx: &TriggerContext,
    metrics: &UserMetrics,
    settings: &ReviewSettings,
    config: &TriggerConfig,
    now: DateTime<Utc>,
) -> TriggerResult {
    if !settings.enabled_triggers.contains(&ctx.trigger) {
        return TriggerResult::reject(format!("trigger {} is disabled", ctx.trigger));
    }

    if let Some(last) = metrics.last_review_prompt {
        let eligible = cooldown_end(last, settings.cooldown_days);
        if eligible.map_or(true, |at| now < at) {
            let result = TriggerResult::reject(format!(
                "cooldown active for {} days",
                settings.cooldown_days
            ));
            return match eligible {
                Some(at) => result.with_next_eligible(at),
                None => result,
            };
        }
    }

    // Proxy for an exhausted prompt budget; prompts are not counted.
    if metrics.last_review_action == Some(ReviewAction::Dismissed)
        && metrics.last_review_prompt.is_some()
    {
        return TriggerResult::reject("previous prompt was dismissed");
    }

    let app = &ctx.app_state;
    if app.is_loading {
        return TriggerResult::reject("app is loading");
    }
    if app.has_errors {
        return TriggerResult::reject("app has errors");
    }
    if app.is_restricted_screen() {
        return TriggerResult::reject(format!("screen {} is restricted", app.current_screen));
    }

    let base = match base_confidence(ctx.trigger, metrics, settings, config) {
        Ok(base) => base,
        Err(reason) => return TriggerResult::reject(reason),
    };

    let mut confidence = base + engagement_bonus(metrics) + timing_bonus(metrics, now);
    if metrics.last_review_action == Some(ReviewAction::Dismissed) {
        confidence *= DISMISSED_PENALTY;
    }
    TriggerResult::accept(format!("{} conditions met", ctx.trigger), confidence)
}

/// End of a cooldown that started at `last`, or `None` when it falls past
/// the representable calendar and so never ends.
fn cooldown_end(last: DateTime<Utc>, cooldown_days: u32) -> Option<DateTime<Utc>> {
    last.checked_add_signed(ChronoDuration::days(i64::from(cooldown_days)))
}

fn base_confidence(
    trigger: TriggerKind,
    metrics: &UserMetrics,
    settings: &ReviewSettings,
    config: &TriggerConfig,
) -> Result<f64, String> {
    match trigger {
        TriggerKind::AppOpen => {
            if metrics.app_open_count >= settings.minimum_app_opens {
                Ok(APP_OPEN_CONFIDENCE)
            } else {
                Err(format!(
                    "app opens {} below minimum {}",
                    metrics.app_open_count, settings.minimum_app_opens
                ))
            }
        }
        TriggerKind::SuccessfulFoodLog => {
            if metrics.successful_food_logs >= config.minimum_food_logs {
                Ok(FOOD_LOG_CONFIDENCE)
            } else {
                Err(format!(
                    "food logs {} below minimum {}",
                    metrics.successful_food_logs, config.minimum_food_logs
                ))
            }
        }
        TriggerKind::MilestoneAchieved => {
            if metrics.milestones_achieved.is_disjoint(&config.milestones) {
                Err("no qualifying milestone achieved".to_owned())
            } else {
                Ok(MILESTONE_CONFIDENCE)
            }
        }
        TriggerKind::StreakMilestone => {
            if config.streak_milestones.contains(&metrics.streak_days) {
                Ok(STREAK_CONFIDENCE)
            } else {
                Err(format!("streak of {} days is not a milestone", metrics.streak_days))
            }
        }
        TriggerKind::GoalCompleted => Ok(GOAL_CONFIDENCE),
        TriggerKind::Unknown => Err("unknown trigger".to_owned()),
    }
}

fn engagement_bonus(m: &UserMetrics) -> f64 {
    let mut bonus = 0.0;
    if m.app_open_count > 20 {
        bonus += 0.10;
    }
    if m.successful_food_logs > 50 {
        bonus += 0.10;
    }
    if m.streak_days > 14 {
        bonus += 0.15;
    }
    if m.milestones_achieved.len() > 2 {
        bonus += 0.10;
    }
    f64::min(bonus, ENGAGEMENT_CAP)
}

fn timing_bonus(m: &UserMetrics, now: DateTime<Utc>) -> f64 {
    let mut bonus = match m.last_review_prompt {
        Some(last) if now - last > ChronoDuration::days(60) => 0.10,
        Some(_) => 0.0,
        None => 0.05,
    };
    if now - m.last_app_open < ChronoDuration::hours(24) {
        bonus += 0.05;
    }
    f64::min(bonus, TIMING_CAP)
}

pub struct TriggerEngine {
    repo: Arc<ReviewRepo>,
    config: TriggerConfig,
    snapshot: RwLock<Option<UserMetrics>>,
}

impl TriggerEngine {
    pub fn new(repo: Arc<ReviewRepo>, config: TriggerConfig) -> Self {
        Self {
            repo,
            config,
            snapshot: RwLock::new(None),
        }
    }

    /// Cached verdict if one is fresh, otherwise evaluate against the caller's
    /// user state or the persisted metrics. Never fails: unreadable metrics
    /// fall back to the last snapshot, unreadable settings to defaults.
    pub async fn evaluate_trigger(&self, ctx: &TriggerContext) -> TriggerResult {
        let cache = self.repo.cache();
        if let Some(hit) = cache.get_verdict(ctx) {
            debug!(trigger = %ctx.trigger, should_trigger = hit.should_trigger, "cached verdict");
            return hit;
        }

        let settings = match self.repo.load_settings().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "settings unavailable, using defaults");
                ReviewSettings::default()
            }
        };
        let metrics = match &ctx.user_state {
            Some(m) => m.clone(),
            None => self.metrics_or_snapshot().await,
        };

        let result = evaluate(ctx, &metrics, &settings, &self.config, Utc::now());
        if settings.debug_mode {
            info!(
                trigger = %ctx.trigger,
                should_trigger = result.should_trigger,
                confidence = result.confidence,
                reason = %result.reason,
                "trigger evaluated"
            );
        } else {
            debug!(
                trigger = %ctx.trigger,
                should_trigger = result.should_trigger,
                confidence = result.confidence,
                reason = %result.reason,
                "trigger evaluated"
            );
        }
        cache.set_verdict(ctx, result.clone());
        result
    }

    /// Apply one user action to the persisted metrics.
    pub async fn update_user_metrics(&self, action: &UserAction) -> Result<UserMetrics, ReviewError> {
        if matches!(action, UserAction::Unrecognized) {
            debug!("ignoring unrecognized action");
            return self.user_metrics().await;
        }
        let metrics = self.repo.update_metrics(|m| m.apply_action(action)).await?;
        *self.snapshot.write() = Some(metrics.clone());
        debug!(action = action.action_type(), "metrics updated");
        Ok(metrics)
    }

    /// Persisted metrics, refreshing the snapshot.
    pub async fn user_metrics(&self) -> Result<UserMetrics, ReviewError> {
        let metrics = self.repo.load_metrics().await?;
        *self.snapshot.write() = Some(metrics.clone());
        Ok(metrics)
    }

    /// When the cooldown ends, or `None` if a prompt may be shown now or the
    /// cooldown has no representable end.
    pub async fn next_eligible_time(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let cache = self.repo.cache();
        if let Some(cached) = cache.get_next_eligible() {
            return cached.filter(|at| *at > now);
        }

        let settings = self.repo.load_settings().await.unwrap_or_default();
        let metrics = self.metrics_or_snapshot().await;
        let at = metrics
            .last_review_prompt
            .and_then(|last| cooldown_end(last, settings.cooldown_days))
            .filter(|at| *at > now);
        cache.set_next_eligible(at);
        at
    }

    pub fn snapshot(&self) -> Option<UserMetrics> {
        self.snapshot.read().clone()
    }

    pub fn clear_snapshot(&self) {
        *self.snapshot.write() = None;
    }

    async fn metrics_or_snapshot(&self) -> UserMetrics {
        match self.user_metrics().await {
            Ok(m) => m,
            Err(e) => {
                let snapshot = self.snapshot();
                warn!(error = %e, has_snapshot = snapshot.is_some(), "metrics unavailable");
                snapshot.unwrap_or_else(|| UserMetrics::new(Utc::now()))
            }
        }
    }
}
