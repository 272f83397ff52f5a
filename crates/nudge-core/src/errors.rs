use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure classes for everything that can go wrong around a review prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NativeSurfaceUnavailable,
    Network,
    Storage,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        Self::NativeSurfaceUnavailable,
        Self::Network,
        Self::Storage,
        Self::RateLimit,
        Self::Unknown,
    ];

    /// Only transient transport faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Unknown)
    }

    /// Short classification string for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeSurfaceUnavailable => "native_surface_unavailable",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::RateLimit => "rate_limit",
            Self::Unknown => "unknown",
        }
    }

    /// Classify a free-form failure message from the native prompt surface.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["not available", "unavailable", "not supported", "not implemented"]) {
            Self::NativeSurfaceUnavailable
        } else if has(&["network", "timeout", "timed out", "connection", "offline"]) {
            Self::Network
        } else if has(&["rate limit", "rate-limit", "ratelimit", "quota", "too many", "throttl"]) {
            Self::RateLimit
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a fault happened. Used by recovery strategies to pick fallbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub key: Option<String>,
    pub operation_id: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }
}

/// A genuine fault in the review pipeline. Business rejections (cooldown,
/// thresholds, disabled triggers) are never represented as a `ReviewError`.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ReviewError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<String>,
    pub context: Option<ErrorContext>,
    pub timestamp: DateTime<Utc>,
}

impl ReviewError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NativeSurfaceUnavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Wrap a native surface failure, classifying it by message content.
    pub fn from_surface(err: &SurfaceError) -> Self {
        Self::new(ErrorKind::classify_message(&err.message), err.message.clone())
            .with_cause(err)
    }
}

/// Opaque failure raised by the native prompt surface or store redirector.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("surface error: {message}")]
pub struct SurfaceError {
    pub message: String,
}

impl SurfaceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure decoding a persisted record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,
}

impl From<RecordError> for ReviewError {
    fn from(e: RecordError) -> Self {
        ReviewError::storage("failed to decode persisted record").with_cause(e)
    }
}
