use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the user did with the last prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Completed,
    Dismissed,
    Error,
    NotAvailable,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
            Self::Error => "error",
            Self::NotAvailable => "not_available",
        }
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "dismissed" => Ok(Self::Dismissed),
            "error" => Ok(Self::Error),
            "not_available" => Ok(Self::NotAvailable),
            other => Err(format!("unknown review action: {other}")),
        }
    }
}

/// Engagement counters that drive trigger decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub app_open_count: u32,
    pub successful_food_logs: u32,
    pub streak_days: u32,
    pub milestones_achieved: BTreeSet<String>,
    pub first_app_open: DateTime<Utc>,
    pub last_app_open: DateTime<Utc>,
    /// Minutes.
    pub total_session_time: u64,
    pub last_review_prompt: Option<DateTime<Utc>>,
    pub last_review_action: Option<ReviewAction>,
}

impl UserMetrics {
    /// Fresh metrics for a user we have never seen.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            app_open_count: 0,
            successful_food_logs: 0,
            streak_days: 0,
            milestones_achieved: BTreeSet::new(),
            first_app_open: now,
            last_app_open: now,
            total_session_time: 0,
            last_review_prompt: None,
            last_review_action: None,
        }
    }

    /// Apply a single user action. Unrecognized actions are a no-op.
    pub fn apply_action(&mut self, action: &UserAction) {
        match action {
            UserAction::AppOpen { at } => {
                self.app_open_count = self.app_open_count.saturating_add(1);
                self.last_app_open = *at;
            }
            UserAction::SuccessfulFoodLog => {
                self.successful_food_logs = self.successful_food_logs.saturating_add(1);
            }
            UserAction::MilestoneAchieved { milestone } => {
                self.milestones_achieved.insert(milestone.clone());
            }
            UserAction::StreakUpdated { days } => self.streak_days = *days,
            UserAction::ReviewPromptShown { at } => self.last_review_prompt = Some(*at),
            UserAction::ReviewAction { action } => self.last_review_action = Some(*action),
            UserAction::SessionTime { minutes } => {
                self.total_session_time = self.total_session_time.saturating_add(*minutes);
            }
            UserAction::Unrecognized => {}
        }
    }

    /// Apply `count` coalesced app opens whose latest timestamp is `last`.
    pub fn apply_app_open_batch(&mut self, count: u32, last: DateTime<Utc>) {
        self.app_open_count = self.app_open_count.saturating_add(count);
        if last > self.last_app_open {
            self.last_app_open = last;
        }
    }

    /// Apply a merged partial update: counters add, everything else overwrites.
    pub fn apply_patch(&mut self, patch: &MetricsPatch) {
        if let Some(n) = patch.app_open_count {
            self.app_open_count = self.app_open_count.saturating_add(n);
        }
        if let Some(n) = patch.successful_food_logs {
            self.successful_food_logs = self.successful_food_logs.saturating_add(n);
        }
        if let Some(days) = patch.streak_days {
            self.streak_days = days;
        }
        if let Some(ref milestones) = patch.milestones_achieved {
            self.milestones_achieved.clone_from(milestones);
        }
        if let Some(ts) = patch.first_app_open {
            self.first_app_open = ts;
        }
        if let Some(ts) = patch.last_app_open {
            self.last_app_open = ts;
        }
        if let Some(minutes) = patch.total_session_time {
            self.total_session_time = minutes;
        }
        if let Some(ts) = patch.last_review_prompt {
            self.last_review_prompt = Some(ts);
        }
        if let Some(action) = patch.last_review_action {
            self.last_review_action = Some(action);
        }
    }

    /// Restore cross-field invariants after a mutation.
    pub fn validate(&mut self) {
        if self.last_app_open < self.first_app_open {
            self.first_app_open = self.last_app_open;
        }
    }
}

/// One engagement event reported by the host application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserAction {
    AppOpen { at: DateTime<Utc> },
    SuccessfulFoodLog,
    MilestoneAchieved { milestone: String },
    StreakUpdated { days: u32 },
    ReviewPromptShown { at: DateTime<Utc> },
    ReviewAction { action: ReviewAction },
    SessionTime { minutes: u64 },
    #[serde(other)]
    Unrecognized,
}

impl UserAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::AppOpen { .. } => "app_open",
            Self::SuccessfulFoodLog => "successful_food_log",
            Self::MilestoneAchieved { .. } => "milestone_achieved",
            Self::StreakUpdated { .. } => "streak_updated",
            Self::ReviewPromptShown { .. } => "review_prompt_shown",
            Self::ReviewAction { .. } => "review_action",
            Self::SessionTime { .. } => "session_time",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Actions that can be coalesced into a single aggregated update.
    pub fn is_batchable(&self) -> bool {
        matches!(self, Self::AppOpen { .. })
    }

    pub fn app_open_now() -> Self {
        Self::AppOpen { at: Utc::now() }
    }
}

/// Partial metrics update queued for batched persistence.
///
/// Counter fields are increments. Merging two patches sums counters, keeps
/// the latest timestamp, and lets the later patch win for everything else.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPatch {
    pub app_open_count: Option<u32>,
    pub successful_food_logs: Option<u32>,
    pub streak_days: Option<u32>,
    pub milestones_achieved: Option<BTreeSet<String>>,
    pub first_app_open: Option<DateTime<Utc>>,
    pub last_app_open: Option<DateTime<Utc>>,
    pub total_session_time: Option<u64>,
    pub last_review_prompt: Option<DateTime<Utc>>,
    pub last_review_action: Option<ReviewAction>,
}

impl MetricsPatch {
    pub fn merge(&mut self, later: &MetricsPatch) {
        self.app_open_count = sum(self.app_open_count, later.app_open_count);
        self.successful_food_logs = sum(self.successful_food_logs, later.successful_food_logs);
        self.first_app_open = latest(self.first_app_open, later.first_app_open);
        self.last_app_open = latest(self.last_app_open, later.last_app_open);
        self.last_review_prompt = latest(self.last_review_prompt, later.last_review_prompt);
        if later.streak_days.is_some() {
            self.streak_days = later.streak_days;
        }
        if later.milestones_achieved.is_some() {
            self.milestones_achieved.clone_from(&later.milestones_achieved);
        }
        if later.total_session_time.is_some() {
            self.total_session_time = later.total_session_time;
        }
        if later.last_review_action.is_some() {
            self.last_review_action = later.last_review_action;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn sum(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.saturating_add(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
