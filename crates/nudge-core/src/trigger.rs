use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::UserMetrics;
use crate::settings::TriggerKind;

/// Screens on which a prompt would interrupt a critical flow.
pub const RESTRICTED_SCREENS: [&str; 4] = ["onboarding", "login", "signup", "error"];

/// What the host UI is doing right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub is_loading: bool,
    pub has_errors: bool,
    pub current_screen: String,
    pub session_start: DateTime<Utc>,
}

impl AppState {
    pub fn idle(screen: impl Into<String>) -> Self {
        Self {
            is_loading: false,
            has_errors: false,
            current_screen: screen.into(),
            session_start: Utc::now(),
        }
    }

    pub fn is_restricted_screen(&self) -> bool {
        let screen = self.current_screen.to_lowercase();
        RESTRICTED_SCREENS.iter().any(|s| *s == screen)
    }
}

/// Caller-supplied, never persisted input to a trigger evaluation.
///
/// When `user_state` is present it is evaluated as-is; otherwise the
/// persisted metrics are loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub trigger: TriggerKind,
    pub user_state: Option<UserMetrics>,
    pub app_state: AppState,
}

impl TriggerContext {
    pub fn new(trigger: TriggerKind, app_state: AppState) -> Self {
        Self {
            trigger,
            user_state: None,
            app_state,
        }
    }

    pub fn with_user_state(mut self, metrics: UserMetrics) -> Self {
        self.user_state = Some(metrics);
        self
    }
}

/// Verdict of a trigger evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub should_trigger: bool,
    pub reason: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub next_eligible_time: Option<DateTime<Utc>>,
}

impl TriggerResult {
    pub fn accept(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            should_trigger: true,
            reason: reason.into(),
            confidence: clamp_unit(confidence),
            next_eligible_time: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_trigger: false,
            reason: reason.into(),
            confidence: 0.0,
            next_eligible_time: None,
        }
    }

    pub fn with_next_eligible(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_time = Some(at);
        self
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
