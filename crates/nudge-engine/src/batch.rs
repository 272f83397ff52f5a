//! Coalescing write queue in front of [`ReviewRepo`].
//!
//! Operations wait in a priority-ordered queue (FIFO within a priority) and
//! are flushed by a periodic worker, by an immediate pass when a
//! high-priority operation arrives or the queue fills, or by [`BatchProcessor::flush`].
//! Each pass turns every kind of queued operation into at most one
//! read-modify-write against the store. Priority decides which operations a
//! pass takes; within a pass they are merged in enqueue order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use nudge_core::{MetricsPatch, OperationId, ReviewError, SettingsPatch, UserAction};

use crate::config::BatchConfig;
use crate::repo::ReviewRepo;

pub const DEFAULT_PRIORITY: u8 = 1;
pub const HIGH_PRIORITY: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    UpdateMetrics,
    UpdateSettings,
    UserAction,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateMetrics => "update_metrics",
            Self::UpdateSettings => "update_settings",
            Self::UserAction => "user_action",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BatchPayload {
    Metrics(MetricsPatch),
    Settings(SettingsPatch),
    Action(UserAction),
}

impl BatchPayload {
    pub fn kind(&self) -> BatchKind {
        match self {
            Self::Metrics(_) => BatchKind::UpdateMetrics,
            Self::Settings(_) => BatchKind::UpdateSettings,
            Self::Action(_) => BatchKind::UserAction,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchOperation {
    pub id: OperationId,
    pub payload: BatchPayload,
    /// Monotonic enqueue position; survives requeues.
    pub seq: u64,
    pub enqueued_at: Instant,
    pub priority: u8,
    pub retry_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub enqueued: u64,
    pub processed: u64,
    pub batches: u64,
    /// Operations folded into another operation's write.
    pub merged_writes: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueStatus {
    pub len: usize,
    pub by_kind: BTreeMap<BatchKind, usize>,
    pub oldest_age_ms: Option<u64>,
    pub processing: bool,
}

struct Inner {
    repo: Arc<ReviewRepo>,
    config: BatchConfig,
    queue: Mutex<VecDeque<BatchOperation>>,
    stats: Mutex<BatchStats>,
    process_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    next_seq: AtomicU64,
    wake: Notify,
}

#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

impl BatchProcessor {
    pub fn new(repo: Arc<ReviewRepo>, mut config: BatchConfig) -> Self {
        config.validate();
        Self {
            inner: Arc::new(Inner {
                repo,
                config,
                queue: Mutex::new(VecDeque::new()),
                stats: Mutex::new(BatchStats::default()),
                process_lock: tokio::sync::Mutex::new(()),
                processing: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn batch_update_user_metrics(&self, patch: MetricsPatch, priority: u8) -> OperationId {
        self.enqueue(BatchPayload::Metrics(patch), priority)
    }

    pub fn batch_update_review_settings(&self, patch: SettingsPatch, priority: u8) -> OperationId {
        self.enqueue(BatchPayload::Settings(patch), priority)
    }

    pub fn batch_user_action(&self, action: UserAction, priority: u8) -> OperationId {
        self.enqueue(BatchPayload::Action(action), priority)
    }

    pub fn enqueue(&self, payload: BatchPayload, priority: u8) -> OperationId {
        let op = BatchOperation {
            id: OperationId::new(),
            payload,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
            priority,
            retry_count: 0,
        };
        let id = op.id.clone();
        let kind = op.payload.kind();

        let (len, dropped) = {
            let mut queue = self.inner.queue.lock();
            insert_by_priority(&mut queue, op);
            let dropped = (queue.len() > self.inner.config.queue_capacity)
                .then(|| drop_oldest_lowest(&mut queue))
                .flatten();
            (queue.len(), dropped)
        };

        {
            let mut stats = self.inner.stats.lock();
            stats.enqueued += 1;
            if dropped.is_some() {
                stats.dropped += 1;
            }
        }
        if let Some(victim) = dropped {
            warn!(
                op_id = %victim.id,
                kind = victim.payload.kind().as_str(),
                priority = victim.priority,
                "batch queue full, dropped operation"
            );
        }

        debug!(op_id = %id, kind = kind.as_str(), priority, len, "operation enqueued");
        if priority >= self.inner.config.priority_threshold || len >= self.inner.config.max_queue_size {
            self.inner.wake.notify_one();
        }
        id
    }

    /// Process queued operations until the queue is empty.
    pub async fn flush(&self) -> usize {
        let mut total = 0;
        while !self.inner.queue.lock().is_empty() {
            total += self.process_batch().await;
        }
        total
    }

    /// Take up to `max_batch_size` operations off the queue and persist them.
    /// Returns how many operations were written successfully.
    pub async fn process_batch(&self) -> usize {
        let _guard = self.inner.process_lock.lock().await;
        let mut ops: Vec<BatchOperation> = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len().min(self.inner.config.max_batch_size);
            queue.drain(..n).collect()
        };
        if ops.is_empty() {
            return 0;
        }
        ops.sort_by_key(|op| op.seq);

        self.inner.processing.store(true, Ordering::SeqCst);
        let mut metrics = Vec::new();
        let mut settings = Vec::new();
        let mut actions = Vec::new();
        for op in ops {
            match op.payload.kind() {
                BatchKind::UpdateMetrics => metrics.push(op),
                BatchKind::UpdateSettings => settings.push(op),
                BatchKind::UserAction => actions.push(op),
            }
        }

        let mut written = 0;
        for group in [metrics, settings, actions] {
            written += self.write_group(group).await;
        }

        self.inner.stats.lock().batches += 1;
        self.inner.processing.store(false, Ordering::SeqCst);
        written
    }

    async fn write_group(&self, ops: Vec<BatchOperation>) -> usize {
        let Some(kind) = ops.first().map(|op| op.payload.kind()) else {
            return 0;
        };
        let result = match kind {
            BatchKind::UpdateMetrics => self.write_metrics(&ops).await,
            BatchKind::UpdateSettings => self.write_settings(&ops).await,
            BatchKind::UserAction => self.write_actions(&ops).await,
        };

        let count = ops.len();
        match result {
            Ok(()) => {
                let mut stats = self.inner.stats.lock();
                stats.processed += count as u64;
                stats.merged_writes += count as u64 - 1;
                count
            }
            Err(e) => {
                warn!(error = %e, count, kind = kind.as_str(), "batch write failed");
                self.requeue(ops);
                0
            }
        }
    }

    async fn write_metrics(&self, ops: &[BatchOperation]) -> Result<(), ReviewError> {
        let mut merged = MetricsPatch::default();
        for op in ops {
            if let BatchPayload::Metrics(patch) = &op.payload {
                merged.merge(patch);
            }
        }
        if merged.is_empty() {
            return Ok(());
        }
        self.inner.repo.update_metrics(|m| m.apply_patch(&merged)).await?;
        Ok(())
    }

    async fn write_settings(&self, ops: &[BatchOperation]) -> Result<(), ReviewError> {
        let mut merged = SettingsPatch::default();
        for op in ops {
            if let BatchPayload::Settings(patch) = &op.payload {
                merged.merge(patch);
            }
        }
        self.inner.repo.update_settings(|s| s.apply_patch(&merged)).await?;
        Ok(())
    }

    async fn write_actions(&self, ops: &[BatchOperation]) -> Result<(), ReviewError> {
        let mut opens: Option<AppOpenRange> = None;
        let mut replay = Vec::new();
        for op in ops {
            let BatchPayload::Action(action) = &op.payload else {
                continue;
            };
            match action {
                UserAction::AppOpen { at } => match opens.as_mut() {
                    Some(range) => range.push(*at),
                    None => opens = Some(AppOpenRange::new(*at)),
                },
                other => replay.push(other.clone()),
            }
        }

        if let Some(range) = &opens {
            debug!(
                batch_count = range.count,
                first = %range.first,
                last = %range.last,
                "aggregated app opens"
            );
        }
        self.inner
            .repo
            .update_metrics(|m| {
                for action in &replay {
                    m.apply_action(action);
                }
                if let Some(range) = &opens {
                    m.apply_app_open_batch(range.count, range.last);
                }
            })
            .await?;
        Ok(())
    }

    fn requeue(&self, ops: Vec<BatchOperation>) {
        let max_retries = self.inner.config.max_retries;
        let mut queue = self.inner.queue.lock();
        let mut stats = self.inner.stats.lock();
        for mut op in ops {
            op.retry_count += 1;
            if op.retry_count > max_retries {
                stats.failed += 1;
                error!(
                    op_id = %op.id,
                    kind = op.payload.kind().as_str(),
                    retries = max_retries,
                    "batch operation failed permanently"
                );
            } else {
                stats.retried += 1;
                insert_by_priority(&mut queue, op);
            }
        }
    }

    /// Spawn the background worker: periodic flush plus immediate passes.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.config.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.process_batch().await;
                    }
                    _ = this.inner.wake.notified() => {
                        this.process_batch().await;
                        while this.needs_immediate() {
                            this.process_batch().await;
                        }
                    }
                }
            }
        })
    }

    fn needs_immediate(&self) -> bool {
        let queue = self.inner.queue.lock();
        queue.len() >= self.inner.config.max_queue_size
            || queue
                .front()
                .is_some_and(|op| op.priority >= self.inner.config.priority_threshold)
    }

    pub fn clear_queue(&self) -> usize {
        let mut queue = self.inner.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let now = Instant::now();
        let queue = self.inner.queue.lock();
        let mut by_kind = BTreeMap::new();
        for op in queue.iter() {
            *by_kind.entry(op.payload.kind()).or_insert(0) += 1;
        }
        QueueStatus {
            len: queue.len(),
            by_kind,
            oldest_age_ms: queue
                .iter()
                .map(|op| op.enqueued_at)
                .min()
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            processing: self.inner.processing.load(Ordering::SeqCst),
        }
    }

    pub fn get_stats(&self) -> BatchStats {
        self.inner.stats.lock().clone()
    }

    /// Ids of queued operations in processing order.
    pub fn queued_ids(&self) -> Vec<OperationId> {
        self.inner.queue.lock().iter().map(|op| op.id.clone()).collect()
    }

    pub fn flush_interval(&self) -> Duration {
        self.inner.config.flush_interval()
    }
}

struct AppOpenRange {
    count: u32,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

impl AppOpenRange {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            first: at,
            last: at,
        }
    }

    fn push(&mut self, at: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.first = self.first.min(at);
        self.last = self.last.max(at);
    }
}

/// Insert after every operation of equal or higher priority.
fn insert_by_priority(queue: &mut VecDeque<BatchOperation>, op: BatchOperation) {
    let pos = queue
        .iter()
        .position(|existing| existing.priority < op.priority)
        .unwrap_or(queue.len());
    queue.insert(pos, op);
}

/// Remove the oldest operation among those with the lowest priority.
fn drop_oldest_lowest(queue: &mut VecDeque<BatchOperation>) -> Option<BatchOperation> {
    let lowest = queue.iter().map(|op| op.priority).min()?;
    let idx = queue
        .iter()
        .enumerate()
        .filter(|(_, op)| op.priority == lowest)
        .min_by_key(|(_, op)| op.seq)
        .map(|(i, _)| i)?;
    queue.remove(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::config::{CacheConfig, RecoveryConfig};
    use crate::mock::MockRedirector;
    use crate::recovery::ErrorHandler;
    use chrono::Duration as ChronoDuration;
    use nudge_core::record::{decode_metrics, decode_settings};
    use nudge_core::{REVIEW_SETTINGS_KEY, USER_METRICS_KEY};
    use nudge_store::MemoryStore;

    fn processor(store: Arc<MemoryStore>, config: BatchConfig) -> BatchProcessor {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let errors = Arc::new(ErrorHandler::new(
            RecoveryConfig::default(),
            Arc::new(MockRedirector::new()),
        ));
        let repo = Arc::new(ReviewRepo::new(store, cache, errors));
        BatchProcessor::new(repo, config)
    }

    fn persisted_metrics(store: &MemoryStore) -> nudge_core::UserMetrics {
        decode_metrics(&store.peek(USER_METRICS_KEY).unwrap(), Utc::now()).unwrap()
    }

    fn opens(n: u32) -> MetricsPatch {
        MetricsPatch {
            app_open_count: Some(n),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn metric_counters_are_summed_into_one_write() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());

        batch.batch_update_user_metrics(opens(1), DEFAULT_PRIORITY);
        batch.batch_update_user_metrics(opens(2), DEFAULT_PRIORITY);
        assert_eq!(batch.flush().await, 2);

        assert_eq!(store.write_count(), 1);
        assert_eq!(persisted_metrics(&store).app_open_count, 3);
        let stats = batch.get_stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.merged_writes, 1);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test]
    async fn settings_last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());

        for n in [5, 10] {
            batch.batch_update_review_settings(
                SettingsPatch {
                    minimum_app_opens: Some(n),
                    ..Default::default()
                },
                DEFAULT_PRIORITY,
            );
        }
        batch.flush().await;

        let settings = decode_settings(&store.peek(REVIEW_SETTINGS_KEY).unwrap()).unwrap();
        assert_eq!(settings.minimum_app_opens, 10);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn settings_merge_in_enqueue_order_across_priorities() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());

        batch.batch_update_review_settings(
            SettingsPatch {
                minimum_app_opens: Some(5),
                ..Default::default()
            },
            DEFAULT_PRIORITY,
        );
        batch.batch_update_review_settings(
            SettingsPatch {
                minimum_app_opens: Some(10),
                ..Default::default()
            },
            3,
        );
        batch.flush().await;

        let settings = decode_settings(&store.peek(REVIEW_SETTINGS_KEY).unwrap()).unwrap();
        assert_eq!(settings.minimum_app_opens, 10);
    }

    #[tokio::test]
    async fn actions_replay_in_enqueue_order_across_priorities() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());

        batch.batch_user_action(UserAction::StreakUpdated { days: 3 }, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::StreakUpdated { days: 4 }, 3);
        batch.batch_user_action(UserAction::StreakUpdated { days: 2 }, DEFAULT_PRIORITY);
        assert_eq!(batch.flush().await, 3);

        assert_eq!(store.write_count(), 1);
        assert_eq!(persisted_metrics(&store).streak_days, 2);
    }

    #[tokio::test]
    async fn app_opens_are_aggregated_and_others_replayed() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());
        let now = Utc::now();
        let latest = now + ChronoDuration::minutes(5);

        batch.batch_user_action(UserAction::AppOpen { at: now }, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::AppOpen { at: latest }, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::StreakUpdated { days: 3 }, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::StreakUpdated { days: 4 }, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::AppOpen { at: now }, DEFAULT_PRIORITY);
        batch.flush().await;

        assert_eq!(store.write_count(), 1);
        let m = persisted_metrics(&store);
        assert_eq!(m.app_open_count, 3);
        assert_eq!(m.last_app_open, latest);
        assert_eq!(m.successful_food_logs, 1);
        assert_eq!(m.streak_days, 4);
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let batch = processor(Arc::new(MemoryStore::new()), BatchConfig::default());
        let a = batch.batch_user_action(UserAction::SuccessfulFoodLog, 1);
        let b = batch.batch_user_action(UserAction::SuccessfulFoodLog, 3);
        let c = batch.batch_user_action(UserAction::SuccessfulFoodLog, 1);
        let d = batch.batch_user_action(UserAction::SuccessfulFoodLog, 3);
        assert_eq!(batch.queued_ids(), vec![b, d, a, c]);
    }

    #[tokio::test]
    async fn max_batch_size_limits_one_pass() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(
            store.clone(),
            BatchConfig {
                max_batch_size: 2,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            batch.batch_update_user_metrics(opens(1), DEFAULT_PRIORITY);
        }
        assert_eq!(batch.process_batch().await, 2);
        assert_eq!(batch.get_queue_status().len, 3);

        batch.flush().await;
        assert_eq!(persisted_metrics(&store).app_open_count, 5);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn failed_writes_retry_then_fail_permanently() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let batch = processor(store.clone(), BatchConfig::default());

        batch.batch_update_user_metrics(opens(1), DEFAULT_PRIORITY);
        assert_eq!(batch.flush().await, 0);

        let stats = batch.get_stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.batches, 4);
        assert_eq!(batch.get_queue_status().len, 0);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_next_pass() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let batch = processor(store.clone(), BatchConfig::default());

        batch.batch_update_user_metrics(opens(2), DEFAULT_PRIORITY);
        assert_eq!(batch.process_batch().await, 0);
        assert_eq!(batch.get_queue_status().len, 1);

        store.set_fail_writes(false);
        assert_eq!(batch.flush().await, 1);
        assert_eq!(persisted_metrics(&store).app_open_count, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_lowest_priority() {
        let batch = processor(
            Arc::new(MemoryStore::new()),
            BatchConfig {
                queue_capacity: 3,
                ..Default::default()
            },
        );
        let first = batch.batch_user_action(UserAction::SuccessfulFoodLog, 1);
        let high = batch.batch_user_action(UserAction::SuccessfulFoodLog, 3);
        let second = batch.batch_user_action(UserAction::SuccessfulFoodLog, 1);
        let third = batch.batch_user_action(UserAction::SuccessfulFoodLog, 1);

        assert_eq!(batch.queued_ids(), vec![high, second, third]);
        assert!(!batch.queued_ids().contains(&first));
        assert_eq!(batch.get_stats().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_status_reports_kinds_and_age() {
        let batch = processor(Arc::new(MemoryStore::new()), BatchConfig::default());
        batch.batch_update_user_metrics(opens(1), DEFAULT_PRIORITY);
        tokio::time::advance(Duration::from_millis(300)).await;
        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);

        let status = batch.get_queue_status();
        assert_eq!(status.len, 3);
        assert_eq!(status.by_kind.get(&BatchKind::UserAction), Some(&2));
        assert_eq!(status.oldest_age_ms, Some(300));
        assert!(!status.processing);

        assert_eq!(batch.clear_queue(), 3);
        assert_eq!(batch.get_queue_status().oldest_age_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_processes_high_priority_immediately() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());
        let worker = batch.start();

        batch.batch_user_action(UserAction::SuccessfulFoodLog, HIGH_PRIORITY);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.write_count(), 1);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_config_keeps_worker_alive() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(
            store.clone(),
            BatchConfig {
                flush_interval_ms: 0,
                max_batch_size: 0,
                ..Default::default()
            },
        );
        let worker = batch.start();

        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);
        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!worker.is_finished());
        assert_eq!(persisted_metrics(&store).successful_food_logs, 2);
        assert_eq!(batch.get_queue_status().len, 0);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_flushes_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let batch = processor(store.clone(), BatchConfig::default());
        let worker = batch.start();

        batch.batch_user_action(UserAction::SuccessfulFoodLog, DEFAULT_PRIORITY);
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(store.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.write_count(), 1);
        worker.abort();
    }
}
