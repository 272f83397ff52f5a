use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Named classes of moments that may justify asking for a rating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    AppOpen,
    SuccessfulFoodLog,
    MilestoneAchieved,
    StreakMilestone,
    GoalCompleted,
    #[serde(other)]
    Unknown,
}

impl TriggerKind {
    pub const KNOWN: [TriggerKind; 5] = [
        Self::AppOpen,
        Self::SuccessfulFoodLog,
        Self::MilestoneAchieved,
        Self::StreakMilestone,
        Self::GoalCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppOpen => "APP_OPEN",
            Self::SuccessfulFoodLog => "SUCCESSFUL_FOOD_LOG",
            Self::MilestoneAchieved => "MILESTONE_ACHIEVED",
            Self::StreakMilestone => "STREAK_MILESTONE",
            Self::GoalCompleted => "GOAL_COMPLETED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Triggers tied to one-off achievements; their cached verdicts must stay fresh.
    pub fn is_achievement(&self) -> bool {
        matches!(self, Self::MilestoneAchieved | Self::GoalCompleted)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::KNOWN
            .iter()
            .find(|k| k.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown trigger: {s}"))
    }
}

/// Product-level knobs for prompting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSettings {
    pub minimum_app_opens: u32,
    pub cooldown_days: u32,
    pub enabled_triggers: BTreeSet<TriggerKind>,
    pub debug_mode: bool,
    pub max_prompts_per_user: u32,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            minimum_app_opens: 5,
            cooldown_days: 30,
            enabled_triggers: TriggerKind::KNOWN.into_iter().collect(),
            debug_mode: false,
            max_prompts_per_user: 3,
        }
    }
}

impl ReviewSettings {
    /// Clamp every lower-bounded field back into range.
    pub fn validate(&mut self) {
        self.minimum_app_opens = self.minimum_app_opens.max(1);
        self.cooldown_days = self.cooldown_days.max(1);
        self.max_prompts_per_user = self.max_prompts_per_user.max(1);
        self.enabled_triggers.remove(&TriggerKind::Unknown);
    }

    pub fn apply_patch(&mut self, patch: &SettingsPatch) {
        if let Some(n) = patch.minimum_app_opens {
            self.minimum_app_opens = n;
        }
        if let Some(n) = patch.cooldown_days {
            self.cooldown_days = n;
        }
        if let Some(ref triggers) = patch.enabled_triggers {
            self.enabled_triggers.clone_from(triggers);
        }
        if let Some(flag) = patch.debug_mode {
            self.debug_mode = flag;
        }
        if let Some(n) = patch.max_prompts_per_user {
            self.max_prompts_per_user = n;
        }
    }
}

/// Partial settings update. Later patches overwrite earlier ones per field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub minimum_app_opens: Option<u32>,
    pub cooldown_days: Option<u32>,
    pub enabled_triggers: Option<BTreeSet<TriggerKind>>,
    pub debug_mode: Option<bool>,
    pub max_prompts_per_user: Option<u32>,
}

impl SettingsPatch {
    pub fn merge(&mut self, later: &SettingsPatch) {
        if later.minimum_app_opens.is_some() {
            self.minimum_app_opens = later.minimum_app_opens;
        }
        if later.cooldown_days.is_some() {
            self.cooldown_days = later.cooldown_days;
        }
        if later.enabled_triggers.is_some() {
            self.enabled_triggers.clone_from(&later.enabled_triggers);
        }
        if later.debug_mode.is_some() {
            self.debug_mode = later.debug_mode;
        }
        if later.max_prompts_per_user.is_some() {
            self.max_prompts_per_user = later.max_prompts_per_user;
        }
    }
}
