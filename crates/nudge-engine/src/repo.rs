use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use nudge_core::record::{decode_metrics, decode_settings, encode_metrics, encode_settings};
use nudge_core::{
    ErrorContext, KeyValueStore, ReviewError, ReviewSettings, UserMetrics, REVIEW_SETTINGS_KEY,
    USER_METRICS_KEY,
};

use crate::cache::{CacheManager, NEXT_ELIGIBLE_KEY};
use crate::recovery::ErrorHandler;

/// Single read-merge-validate-persist path for metrics and settings.
///
/// Writers are serialised so concurrent read-modify-write cycles from the
/// trigger engine and the batch processor cannot lose updates.
pub struct ReviewRepo {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<CacheManager>,
    errors: Arc<ErrorHandler>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ReviewRepo {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cache: Arc<CacheManager>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            store,
            cache,
            errors,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Cache, then store, then defaults. A storage fault falls back to the
    /// last value this process saw, if any.
    pub async fn load_metrics(&self) -> Result<UserMetrics, ReviewError> {
        if let Some(m) = self.cache.get_metrics() {
            return Ok(m);
        }
        match self.read(USER_METRICS_KEY, "load_metrics").await {
            Ok(raw) => {
                let metrics = raw
                    .and_then(|raw| match decode_metrics(&raw, Utc::now()) {
                        Ok(m) => Some(m),
                        Err(e) => {
                            warn!(error = %e, "discarding unreadable metrics record");
                            None
                        }
                    })
                    .unwrap_or_else(|| UserMetrics::new(Utc::now()));
                self.remember_metrics(&metrics);
                Ok(metrics)
            }
            Err(err) => {
                let value = self.recover(err).await?;
                Ok(decode_metrics(&value, Utc::now())?)
            }
        }
    }

    pub async fn load_settings(&self) -> Result<ReviewSettings, ReviewError> {
        if let Some(s) = self.cache.get_settings() {
            return Ok(s);
        }
        match self.read(REVIEW_SETTINGS_KEY, "load_settings").await {
            Ok(raw) => {
                let settings = raw
                    .and_then(|raw| match decode_settings(&raw) {
                        Ok(s) => Some(s),
                        Err(e) => {
                            warn!(error = %e, "discarding unreadable settings record");
                            None
                        }
                    })
                    .unwrap_or_default();
                self.remember_settings(&settings);
                Ok(settings)
            }
            Err(err) => {
                let value = self.recover(err).await?;
                Ok(decode_settings(&value)?)
            }
        }
    }

    /// Load, mutate, validate, persist. Returns the persisted value.
    pub async fn update_metrics<F>(&self, f: F) -> Result<UserMetrics, ReviewError>
    where
        F: FnOnce(&mut UserMetrics),
    {
        let _guard = self.write_lock.lock().await;
        let mut metrics = self.load_metrics().await?;
        f(&mut metrics);
        metrics.validate();

        self.write(USER_METRICS_KEY, "update_metrics", &encode_metrics(&metrics))
            .await?;
        self.remember_metrics(&metrics);
        self.invalidate_derived();
        debug!(app_opens = metrics.app_open_count, "metrics persisted");
        Ok(metrics)
    }

    pub async fn update_settings<F>(&self, f: F) -> Result<ReviewSettings, ReviewError>
    where
        F: FnOnce(&mut ReviewSettings),
    {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load_settings().await?;
        f(&mut settings);
        settings.validate();

        self.write(REVIEW_SETTINGS_KEY, "update_settings", &encode_settings(&settings))
            .await?;
        self.remember_settings(&settings);
        self.invalidate_derived();
        debug!(cooldown_days = settings.cooldown_days, "settings persisted");
        Ok(settings)
    }

    /// Remove both persisted records and everything cached from them.
    pub async fn clear(&self) -> Result<(), ReviewError> {
        let _guard = self.write_lock.lock().await;
        let metrics = self.remove(USER_METRICS_KEY).await;
        let settings = self.remove(REVIEW_SETTINGS_KEY).await;
        self.cache.clear();
        metrics.and(settings)
    }

    async fn read(&self, key: &str, op: &str) -> Result<Option<String>, ReviewError> {
        self.store
            .get(key)
            .await
            .map_err(|e| e.with_context(ErrorContext::new(op).with_key(key)))
    }

    async fn write(&self, key: &str, op: &str, value: &str) -> Result<(), ReviewError> {
        self.store
            .set(key, value)
            .await
            .map_err(|e| e.with_context(ErrorContext::new(op).with_key(key)))
    }

    async fn remove(&self, key: &str) -> Result<(), ReviewError> {
        self.store
            .remove(key)
            .await
            .map_err(|e| e.with_context(ErrorContext::new("clear").with_key(key)))
    }

    /// Route a read fault through the storage strategy; returns the fallback record.
    async fn recover(&self, err: ReviewError) -> Result<String, ReviewError> {
        let result = self.errors.handle_review_error(&err).await;
        match result.fallback_value {
            Some(value) if result.success => Ok(value.to_string()),
            _ => Err(err),
        }
    }

    fn remember_metrics(&self, metrics: &UserMetrics) {
        self.cache.set_metrics(metrics.clone());
        if let Ok(value) = serde_json::from_str(&encode_metrics(metrics)) {
            self.errors.set_in_memory_fallback(USER_METRICS_KEY, value);
        }
    }

    fn remember_settings(&self, settings: &ReviewSettings) {
        self.cache.set_settings(settings.clone());
        if let Ok(value) = serde_json::from_str(&encode_settings(settings)) {
            self.errors.set_in_memory_fallback(REVIEW_SETTINGS_KEY, value);
        }
    }

    fn invalidate_derived(&self) {
        self.cache.invalidate_verdicts();
        self.cache.delete(NEXT_ELIGIBLE_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheValue;
    use crate::config::{CacheConfig, RecoveryConfig};
    use crate::mock::MockRedirector;
    use nudge_core::{ErrorKind, TriggerKind};
    use nudge_store::MemoryStore;

    fn repo_with(store: Arc<MemoryStore>) -> ReviewRepo {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let errors = Arc::new(ErrorHandler::new(
            RecoveryConfig::default(),
            Arc::new(MockRedirector::new()),
        ));
        ReviewRepo::new(store, cache, errors)
    }

    #[tokio::test]
    async fn empty_store_yields_defaults_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store.clone());

        let m = repo.load_metrics().await.unwrap();
        assert_eq!(m.app_open_count, 0);
        assert_eq!(repo.load_settings().await.unwrap(), ReviewSettings::default());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn update_persists_and_refreshes_cache() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store.clone());

        repo.update_metrics(|m| m.app_open_count += 2).await.unwrap();
        let raw = store.peek(USER_METRICS_KEY).unwrap();
        assert!(raw.contains(r#""appOpenCount":2"#));

        let reads = store.read_count();
        assert_eq!(repo.load_metrics().await.unwrap().app_open_count, 2);
        assert_eq!(store.read_count(), reads);
    }

    #[tokio::test]
    async fn settings_update_is_validated() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store);
        let s = repo
            .update_settings(|s| {
                s.cooldown_days = 0;
                s.enabled_triggers.insert(TriggerKind::Unknown);
            })
            .await
            .unwrap();
        assert_eq!(s.cooldown_days, 1);
        assert!(!s.enabled_triggers.contains(&TriggerKind::Unknown));
    }

    #[tokio::test]
    async fn read_fault_uses_in_memory_fallback() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store.clone());
        repo.update_metrics(|m| m.streak_days = 9).await.unwrap();

        repo.cache().clear();
        store.set_fail_reads(true);
        assert_eq!(repo.load_metrics().await.unwrap().streak_days, 9);
    }

    #[tokio::test]
    async fn read_fault_without_fallback_is_storage_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let repo = repo_with(store);
        let err = repo.load_settings().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Storage);
        assert_eq!(err.context.unwrap().key.as_deref(), Some(REVIEW_SETTINGS_KEY));
    }

    #[tokio::test]
    async fn corrupted_record_is_replaced_by_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.insert(USER_METRICS_KEY, "[not, an, object]");
        let repo = repo_with(store);
        assert_eq!(repo.load_metrics().await.unwrap().app_open_count, 0);
    }

    #[tokio::test]
    async fn write_fault_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let repo = repo_with(store);
        let err = repo.update_metrics(|m| m.app_open_count += 1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Storage);
    }

    #[tokio::test]
    async fn updates_invalidate_verdicts_and_next_eligible() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store);
        repo.cache().set("trigger:APP_OPEN:abc", CacheValue::Json(serde_json::json!(1)), None);
        repo.cache().set_next_eligible(None);

        repo.update_settings(|s| s.cooldown_days = 7).await.unwrap();
        assert!(!repo.cache().has("trigger:APP_OPEN:abc"));
        assert!(repo.cache().get_next_eligible().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        store.set_delay(Some(std::time::Duration::from_millis(5)));
        let repo = Arc::new(repo_with(store));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.update_metrics(|m| m.app_open_count += 1).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(repo.load_metrics().await.unwrap().app_open_count, 10);
    }

    #[tokio::test]
    async fn clear_removes_records() {
        let store = Arc::new(MemoryStore::new());
        let repo = repo_with(store.clone());
        repo.update_metrics(|m| m.app_open_count = 3).await.unwrap();
        repo.update_settings(|s| s.debug_mode = true).await.unwrap();

        repo.clear().await.unwrap();
        assert!(store.peek(USER_METRICS_KEY).is_none());
        assert!(store.peek(REVIEW_SETTINGS_KEY).is_none());
        assert!(repo.cache().is_empty());
        assert_eq!(repo.load_metrics().await.unwrap().app_open_count, 0);
    }
}
