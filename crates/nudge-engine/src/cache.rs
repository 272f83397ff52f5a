//! TTL + LRU cache for expensive reads.
//!
//! Expiry is lazy (checked on read) plus an optional periodic sweep.
//! Recency ties (two reads in the same instant) are broken by a monotonic
//! access sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, trace};

use nudge_core::{ReviewSettings, TriggerContext, TriggerResult, UserMetrics};

use crate::config::CacheConfig;

pub const METRICS_KEY: &str = "user_metrics";
pub const SETTINGS_KEY: &str = "review_settings";
pub const AVAILABILITY_KEY: &str = "review_available";
pub const NEXT_ELIGIBLE_KEY: &str = "next_eligible_time";
pub const VERDICT_PREFIX: &str = "trigger:";

pub const METRICS_TTL: Duration = Duration::from_secs(2 * 60);
pub const SETTINGS_TTL: Duration = Duration::from_secs(10 * 60);
pub const AVAILABILITY_TTL: Duration = Duration::from_secs(5 * 60);
pub const NEXT_ELIGIBLE_TTL: Duration = Duration::from_secs(15 * 60);

/// Fraction of entries kept by [`CacheManager::optimize`].
const OPTIMIZE_KEEP_RATIO: f64 = 0.8;

/// Everything the review pipeline caches.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Metrics(UserMetrics),
    Settings(ReviewSettings),
    Availability(bool),
    NextEligible(Option<DateTime<Utc>>),
    Verdict(TriggerResult),
    Json(serde_json::Value),
}

struct CacheEntry {
    value: CacheValue,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
    access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Keys of the `n` least-recently-accessed entries, skipping `keep`.
    fn lru_keys(&self, n: usize, keep: &[&str]) -> Vec<String> {
        let mut candidates: Vec<(&String, (Instant, u64))> = self
            .entries
            .iter()
            .filter(|(k, _)| !keep.contains(&k.as_str()))
            .map(|(k, e)| (k, (e.last_accessed, e.access_seq)))
            .collect();
        candidates.sort_by_key(|(_, recency)| *recency);
        candidates.into_iter().take(n).map(|(k, _)| k.clone()).collect()
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

/// Point-in-time cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    state: Mutex<CacheState>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn new(mut config: CacheConfig) -> Self {
        config.validate();
        Self {
            state: Mutex::new(CacheState::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let seq = state.next_seq();

        match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.access_count += 1;
                    entry.last_accessed = now;
                    entry.access_seq = seq;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
            Some(true) => {
                state.entries.remove(key);
                trace!(key, "cache entry expired");
            }
            None => {}
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace `key`. `None` uses the configured default TTL.
    pub fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let mut state = self.state.lock();

        if !state.entries.contains_key(key) && state.entries.len() >= self.config.max_size {
            let expired = state.remove_expired(now);
            if expired == 0 {
                let victims = state.lru_keys(1, &[]);
                self.evict(&mut state, victims);
            }
        }

        let seq = state.next_seq();
        state.entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                access_count: 0,
                last_accessed: now,
                access_seq: seq,
            },
        );
    }

    /// Insert many entries, evicting everything needed up front in one pass.
    pub fn set_batch(&self, items: Vec<(String, CacheValue, Option<Duration>)>) {
        let now = Instant::now();
        let max = self.config.max_size;
        let skip = items.len().saturating_sub(max);
        let items: Vec<_> = items.into_iter().skip(skip).collect();

        let mut state = self.state.lock();
        state.remove_expired(now);

        let batch_keys: Vec<&str> = items.iter().map(|(k, _, _)| k.as_str()).collect();
        let mut new_keys: Vec<&str> = batch_keys
            .iter()
            .copied()
            .filter(|k| !state.entries.contains_key(*k))
            .collect();
        new_keys.sort_unstable();
        new_keys.dedup();

        let needed = (state.entries.len() + new_keys.len()).saturating_sub(max);
        if needed > 0 {
            let victims = state.lru_keys(needed, &batch_keys);
            debug!(needed, "batch eviction");
            self.evict(&mut state, victims);
        }

        for (key, value, ttl) in items {
            let seq = state.next_seq();
            state.entries.insert(
                key,
                CacheEntry {
                    value,
                    inserted_at: now,
                    ttl: ttl.unwrap_or_else(|| self.config.default_ttl()),
                    access_count: 0,
                    last_accessed: now,
                    access_seq: seq,
                },
            );
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Presence check that honours expiry but does not touch recency or counters.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(true) => {
                state.entries.remove(key);
                false
            }
            Some(false) => true,
            None => false,
        }
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| !k.starts_with(prefix));
        before - state.entries.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.state.lock().remove_expired(Instant::now())
    }

    /// Keep the best-scoring entries by `access_count / age_minutes`, evicting the rest.
    pub fn optimize(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let len = state.entries.len();
        if len == 0 {
            return 0;
        }
        let keep = (len as f64 * OPTIMIZE_KEEP_RATIO).ceil() as usize;

        let mut scored: Vec<(String, f64)> = state
            .entries
            .iter()
            .map(|(k, e)| {
                let age_minutes =
                    (now.saturating_duration_since(e.inserted_at).as_secs_f64() / 60.0).max(1.0 / 60.0);
                (k.clone(), e.access_count as f64 / age_minutes)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let victims: Vec<String> = scored.into_iter().take(len - keep).map(|(k, _)| k).collect();
        let evicted = victims.len();
        self.evict(&mut state, victims);
        evicted
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    fn evict(&self, state: &mut CacheState, keys: Vec<String>) {
        for key in keys {
            if state.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "cache entry evicted");
            }
        }
    }

    // ── Typed helpers ───────────────────────────────────────────────────

    pub fn get_metrics(&self) -> Option<UserMetrics> {
        match self.get(METRICS_KEY)? {
            CacheValue::Metrics(m) => Some(m),
            _ => None,
        }
    }

    pub fn set_metrics(&self, metrics: UserMetrics) {
        self.set(METRICS_KEY, CacheValue::Metrics(metrics), Some(METRICS_TTL));
    }

    pub fn get_settings(&self) -> Option<ReviewSettings> {
        match self.get(SETTINGS_KEY)? {
            CacheValue::Settings(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_settings(&self, settings: ReviewSettings) {
        self.set(SETTINGS_KEY, CacheValue::Settings(settings), Some(SETTINGS_TTL));
    }

    pub fn get_availability(&self) -> Option<bool> {
        match self.get(AVAILABILITY_KEY)? {
            CacheValue::Availability(b) => Some(b),
            _ => None,
        }
    }

    pub fn set_availability(&self, available: bool) {
        self.set(AVAILABILITY_KEY, CacheValue::Availability(available), Some(AVAILABILITY_TTL));
    }

    /// `Some(None)` is a cached "no cooldown"; `None` is a miss.
    pub fn get_next_eligible(&self) -> Option<Option<DateTime<Utc>>> {
        match self.get(NEXT_ELIGIBLE_KEY)? {
            CacheValue::NextEligible(t) => Some(t),
            _ => None,
        }
    }

    pub fn set_next_eligible(&self, at: Option<DateTime<Utc>>) {
        self.set(NEXT_ELIGIBLE_KEY, CacheValue::NextEligible(at), Some(NEXT_ELIGIBLE_TTL));
    }

    pub fn get_verdict(&self, ctx: &TriggerContext) -> Option<TriggerResult> {
        match self.get(&verdict_key(ctx))? {
            CacheValue::Verdict(r) => Some(r),
            _ => None,
        }
    }

    pub fn set_verdict(&self, ctx: &TriggerContext, result: TriggerResult) {
        let ttl = verdict_ttl(ctx, &result);
        self.set(&verdict_key(ctx), CacheValue::Verdict(result), Some(ttl));
    }

    pub fn invalidate_verdicts(&self) -> usize {
        self.invalidate_prefix(VERDICT_PREFIX)
    }
}

/// `trigger:{KIND}:{sha256(context)}`.
///
/// The hash covers the whole context, including `session_start`, so distinct
/// sessions never share a verdict.
pub fn verdict_key(ctx: &TriggerContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(ctx).unwrap_or_default());
    format!("{VERDICT_PREFIX}{}:{:x}", ctx.trigger.as_str(), hasher.finalize())
}

pub fn verdict_ttl(ctx: &TriggerContext, result: &TriggerResult) -> Duration {
    let ttl = if result.confidence > 0.8 {
        Duration::from_secs(60)
    } else if result.confidence < 0.3 {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(30)
    };
    if ctx.trigger.is_achievement() {
        ttl.min(Duration::from_secs(15))
    } else {
        ttl
    }
}

/// Periodically drop expired entries.
pub fn spawn_sweeper(cache: Arc<CacheManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.cleanup_expired();
            if removed > 0 {
                debug!(removed, "cache sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::{AppState, TriggerKind};

    fn cache(max_size: usize) -> CacheManager {
        CacheManager::new(CacheConfig {
            max_size,
            ..Default::default()
        })
    }

    fn json(n: i64) -> CacheValue {
        CacheValue::Json(serde_json::json!(n))
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let c = cache(10);
        c.set("k", json(1), Some(Duration::from_millis(100)));
        assert_eq!(c.get("k"), Some(json(1)));

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(c.get("k"), None);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_alive_at_exact_ttl() {
        let c = cache(10);
        c.set("k", json(1), Some(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(c.has("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_least_recently_read() {
        let c = cache(2);
        c.set("k1", json(1), None);
        c.set("k2", json(2), None);
        assert!(c.get("k1").is_some());
        c.set("k3", json(3), None);

        assert!(c.get("k1").is_some());
        assert!(c.get("k3").is_some());
        assert!(c.get("k2").is_none());
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_does_not_evict() {
        let c = cache(2);
        c.set("k1", json(1), None);
        c.set("k2", json(2), None);
        c.set("k1", json(10), None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("k1"), Some(json(10)));
        assert_eq!(c.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_dropping_expired_entries() {
        let c = cache(2);
        c.set("short", json(1), Some(Duration::from_millis(10)));
        c.set("long", json(2), None);
        tokio::time::advance(Duration::from_millis(20)).await;
        c.set("new", json(3), None);
        assert!(c.has("long"));
        assert!(c.has("new"));
        assert_eq!(c.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_batch_evicts_in_one_pass() {
        let c = cache(3);
        c.set("a", json(1), None);
        c.set("b", json(2), None);
        c.set("c", json(3), None);
        c.get("a");

        c.set_batch(vec![
            ("d".into(), json(4), None),
            ("e".into(), json(5), None),
            ("a".into(), json(11), None),
        ]);

        assert_eq!(c.len(), 3);
        assert_eq!(c.stats().evictions, 2);
        assert_eq!(c.get("a"), Some(json(11)));
        assert!(c.has("d"));
        assert!(c.has("e"));
        assert!(!c.has("b"));
        assert!(!c.has("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn set_batch_larger_than_capacity_keeps_tail() {
        let c = cache(2);
        c.set_batch((0..5).map(|i| (format!("k{i}"), json(i), None)).collect());
        assert_eq!(c.len(), 2);
        assert!(c.has("k3"));
        assert!(c.has("k4"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_and_prefix_invalidation() {
        let c = cache(10);
        c.set("trigger:APP_OPEN:aa", json(1), Some(Duration::from_secs(1)));
        c.set("trigger:GOAL_COMPLETED:bb", json(2), None);
        c.set("user_metrics", json(3), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.cleanup_expired(), 1);
        assert_eq!(c.invalidate_prefix(VERDICT_PREFIX), 1);
        assert_eq!(c.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn optimize_keeps_most_used() {
        let c = cache(10);
        for i in 0..5 {
            c.set(&format!("k{i}"), json(i), None);
        }
        for _ in 0..3 {
            for i in 1..5 {
                c.get(&format!("k{i}"));
            }
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(c.optimize(), 1);
        assert!(!c.has("k0"));
        assert_eq!(c.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let c = Arc::new(cache(10));
        c.set("k", json(1), Some(Duration::from_millis(50)));
        let handle = spawn_sweeper(c.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(c.len(), 0);
        handle.abort();
    }

    #[test]
    fn verdict_ttl_by_confidence() {
        let ctx = TriggerContext::new(TriggerKind::AppOpen, AppState::idle("home"));
        assert_eq!(verdict_ttl(&ctx, &TriggerResult::accept("x", 0.9)), Duration::from_secs(60));
        assert_eq!(verdict_ttl(&ctx, &TriggerResult::accept("x", 0.5)), Duration::from_secs(30));
        assert_eq!(verdict_ttl(&ctx, &TriggerResult::reject("x")), Duration::from_secs(10));

        let goal = TriggerContext::new(TriggerKind::GoalCompleted, AppState::idle("home"));
        assert_eq!(verdict_ttl(&goal, &TriggerResult::accept("x", 0.95)), Duration::from_secs(15));
        assert_eq!(verdict_ttl(&goal, &TriggerResult::reject("x")), Duration::from_secs(10));
    }

    #[test]
    fn verdict_key_depends_on_whole_context() {
        let a = TriggerContext::new(TriggerKind::AppOpen, AppState::idle("home"));
        let mut b = a.clone();
        assert_eq!(verdict_key(&a), verdict_key(&b));
        assert!(verdict_key(&a).starts_with("trigger:APP_OPEN:"));

        b.app_state.session_start += chrono::Duration::seconds(1);
        assert_ne!(verdict_key(&a), verdict_key(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn typed_helpers_round_trip() {
        let c = cache(10);
        assert_eq!(c.get_next_eligible(), None);
        c.set_next_eligible(None);
        assert_eq!(c.get_next_eligible(), Some(None));

        c.set_availability(true);
        assert_eq!(c.get_availability(), Some(true));
        tokio::time::advance(AVAILABILITY_TTL + Duration::from_secs(1)).await;
        assert_eq!(c.get_availability(), None);

        let settings = ReviewSettings::default();
        c.set_settings(settings.clone());
        assert_eq!(c.get_settings(), Some(settings));
    }
}
