//! Persisted record codec.
//!
//! Records are stored as camelCase JSON with ISO-8601 dates. Decoding is
//! lenient: whatever a previous app version (or a corrupted write) left on
//! disk is coerced into a valid in-memory value instead of failing.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::errors::RecordError;
use crate::metrics::{ReviewAction, UserMetrics};
use crate::settings::{ReviewSettings, TriggerKind};

pub fn encode_metrics(m: &UserMetrics) -> String {
    json!({
        "appOpenCount": m.app_open_count,
        "successfulFoodLogs": m.successful_food_logs,
        "lastReviewPrompt": m.last_review_prompt.map(iso),
        "lastReviewAction": m.last_review_action.map(|a| a.as_str()),
        "streakDays": m.streak_days,
        "milestonesAchieved": m.milestones_achieved,
        "firstAppOpen": iso(m.first_app_open),
        "totalSessionTime": m.total_session_time,
        "lastAppOpen": iso(m.last_app_open),
    })
    .to_string()
}

/// Decode a metrics record; `now` fills required dates that are missing or invalid.
pub fn decode_metrics(raw: &str, now: DateTime<Utc>) -> Result<UserMetrics, RecordError> {
    let obj = parse_object(raw)?;

    let mut metrics = UserMetrics {
        app_open_count: counter_u32(obj.get("appOpenCount")),
        successful_food_logs: counter_u32(obj.get("successfulFoodLogs")),
        streak_days: counter_u32(obj.get("streakDays")),
        milestones_achieved: string_list(obj.get("milestonesAchieved")),
        first_app_open: date(obj.get("firstAppOpen")).unwrap_or(now),
        last_app_open: date(obj.get("lastAppOpen")).unwrap_or(now),
        total_session_time: counter(obj.get("totalSessionTime")),
        last_review_prompt: date(obj.get("lastReviewPrompt")),
        last_review_action: obj
            .get("lastReviewAction")
            .and_then(Value::as_str)
            .and_then(|s| s.to_lowercase().parse::<ReviewAction>().ok()),
    };
    metrics.validate();
    Ok(metrics)
}

pub fn encode_settings(s: &ReviewSettings) -> String {
    json!({
        "minimumAppOpens": s.minimum_app_opens,
        "cooldownDays": s.cooldown_days,
        "enabledTriggers": s.enabled_triggers.iter().map(TriggerKind::as_str).collect::<Vec<_>>(),
        "debugMode": s.debug_mode,
        "maxPromptsPerUser": s.max_prompts_per_user,
    })
    .to_string()
}

pub fn decode_settings(raw: &str) -> Result<ReviewSettings, RecordError> {
    let obj = parse_object(raw)?;
    let defaults = ReviewSettings::default();

    let bounded = |key: &str, default: u32| match obj.get(key) {
        None | Some(Value::Null) => default,
        v => counter_u32(v),
    };

    let enabled_triggers = match obj.get("enabledTriggers") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| serde_json::from_value::<TriggerKind>(v.clone()).ok())
            .filter(|k| *k != TriggerKind::Unknown)
            .collect(),
        _ => defaults.enabled_triggers.clone(),
    };

    let mut settings = ReviewSettings {
        minimum_app_opens: bounded("minimumAppOpens", defaults.minimum_app_opens),
        cooldown_days: bounded("cooldownDays", defaults.cooldown_days),
        enabled_triggers,
        debug_mode: obj.get("debugMode").is_some_and(truthy),
        max_prompts_per_user: bounded("maxPromptsPerUser", defaults.max_prompts_per_user),
    };
    settings.validate();
    Ok(settings)
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, RecordError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(RecordError::NotAnObject),
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Non-numeric, negative, or non-finite values become 0.
fn counter(v: Option<&Value>) -> u64 {
    match v.and_then(Value::as_f64) {
        Some(n) if n.is_finite() && n > 0.0 => n.floor() as u64,
        _ => 0,
    }
}

fn counter_u32(v: Option<&Value>) -> u32 {
    u32::try_from(counter(v)).unwrap_or(u32::MAX)
}

fn date(v: Option<&Value>) -> Option<DateTime<Utc>> {
    v.and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn string_list(v: Option<&Value>) -> BTreeSet<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// JavaScript-style truthiness, for flags written by older clients.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
