use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nudge_core::{KeyValueStore, ReviewError};

use crate::error::StoreError;

/// In-process key-value store with failure injection, for tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get` fail with a storage error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `set`/`remove` fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Suspend each call for `delay` before touching the map.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Current raw value, bypassing counters and failure injection.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Seed a raw value, bypassing counters and failure injection.
    pub fn insert(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn check(flag: &AtomicBool, op: &str, key: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Injected(format!("{op} {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ReviewError> {
        self.pause().await;
        Self::check(&self.fail_reads, "get", key)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ReviewError> {
        self.pause().await;
        Self::check(&self.fail_writes, "set", key)?;
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ReviewError> {
        self.pause().await;
        Self::check(&self.fail_writes, "remove", key)?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::ErrorKind;

    #[tokio::test]
    async fn counts_reads_and_writes() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.set("a", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_storage_errors() {
        let store = MemoryStore::new();
        store.insert("a", "1");
        store.set_fail_reads(true);
        store.set_fail_writes(true);

        assert_eq!(store.get("a").await.unwrap_err().kind, ErrorKind::Storage);
        assert_eq!(store.set("a", "2").await.unwrap_err().kind, ErrorKind::Storage);
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.peek("a").as_deref(), Some("1"));

        store.set_fail_reads(false);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_suspends_calls() {
        let store = MemoryStore::new();
        store.set_delay(Some(Duration::from_millis(250)));
        let start = tokio::time::Instant::now();
        store.set("a", "1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
