//! Scripted collaborators for deterministic tests without a device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nudge_core::{AnalyticsSink, PromptSurface, StoreRedirector, SurfaceError};

/// Pre-programmed outcome of one `request_review` call.
#[derive(Clone, Debug)]
pub enum MockReview {
    Completed,
    Dismissed,
    Error(String),
    /// Wait a duration, then produce the inner outcome.
    Delay(Duration, Box<MockReview>),
}

impl MockReview {
    pub fn delayed(delay: Duration, inner: MockReview) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Prompt surface that replays scripted outcomes in order.
/// Once the script is exhausted every call reports a dismissal.
pub struct MockPromptSurface {
    script: Mutex<VecDeque<MockReview>>,
    available: AtomicBool,
    availability_error: Mutex<Option<String>>,
    call_count: AtomicUsize,
    availability_calls: AtomicUsize,
}

impl MockPromptSurface {
    pub fn new(script: Vec<MockReview>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            available: AtomicBool::new(true),
            availability_error: Mutex::new(None),
            call_count: AtomicUsize::new(0),
            availability_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `is_available` fail with `message` (or succeed again with `None`).
    pub fn set_availability_error(&self, message: Option<&str>) {
        *self.availability_error.lock() = message.map(str::to_owned);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn availability_calls(&self) -> usize {
        self.availability_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PromptSurface for MockPromptSurface {
    async fn is_available(&self) -> Result<bool, SurfaceError> {
        self.availability_calls.fetch_add(1, Ordering::SeqCst);
        let error = self.availability_error.lock().clone();
        match error {
            Some(message) => Err(SurfaceError::new(message)),
            None => Ok(self.available.load(Ordering::SeqCst)),
        }
    }

    async fn request_review(&self) -> Result<bool, SurfaceError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut next = self.script.lock().pop_front().unwrap_or(MockReview::Dismissed);
        loop {
            match next {
                MockReview::Completed => return Ok(true),
                MockReview::Dismissed => return Ok(false),
                MockReview::Error(message) => return Err(SurfaceError::new(message)),
                MockReview::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    next = *inner;
                }
            }
        }
    }
}

/// Redirector that records every URL it was asked to open.
#[derive(Default)]
pub struct MockRedirector {
    fail: AtomicBool,
    opened: Mutex<Vec<String>>,
}

impl MockRedirector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl StoreRedirector for MockRedirector {
    async fn open_external_url(&self, url: &str) -> Result<(), SurfaceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SurfaceError::new("cannot open url"));
        }
        self.opened.lock().push(url.to_owned());
        Ok(())
    }
}

/// Analytics sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|(n, _)| n == event).count()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn record(&self, event: &str, payload: serde_json::Value) {
        self.events.lock().push((event.to_owned(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn surface_replays_script_then_dismisses() {
        let surface = MockPromptSurface::new(vec![
            MockReview::Completed,
            MockReview::Error("network down".into()),
        ]);
        assert_eq!(surface.request_review().await, Ok(true));
        assert_eq!(
            surface.request_review().await,
            Err(SurfaceError::new("network down"))
        );
        assert_eq!(surface.request_review().await, Ok(false));
        assert_eq!(surface.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_review_waits() {
        let surface = MockPromptSurface::new(vec![MockReview::delayed(
            Duration::from_secs(2),
            MockReview::Completed,
        )]);
        let start = tokio::time::Instant::now();
        assert_eq!(surface.request_review().await, Ok(true));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn availability_can_fail() {
        let surface = MockPromptSurface::new(vec![]);
        assert_eq!(surface.is_available().await, Ok(true));
        surface.set_availability_error(Some("timeout"));
        assert!(surface.is_available().await.is_err());
        assert_eq!(surface.availability_calls(), 2);
    }

    #[test]
    fn analytics_counts_events() {
        let sink = RecordingAnalytics::new();
        sink.record("review_prompt_shown", serde_json::json!({}));
        sink.record("review_prompt_result", serde_json::json!({"action": "completed"}));
        sink.record("review_prompt_shown", serde_json::json!({}));
        assert_eq!(sink.count("review_prompt_shown"), 2);
        assert_eq!(sink.names()[1], "review_prompt_result");
    }
}
