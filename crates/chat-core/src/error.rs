use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Invalid input or unsupported request.
    Config,
    /// Missing or rejected credentials.
    Auth,
    /// Transient network or server failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Transport framing or handshake violation.
    Protocol,
    /// Serialization/deserialization failure.
    Serialization,
    /// Invariant break inside the client.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message, surfaced verbatim in notices.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Standard error for commands that need a signed-in identity.
    pub fn not_signed_in(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Auth,
            "not_signed_in",
            format!("cannot run '{action}' without a signed-in identity"),
        )
    }

    /// Whether the failure may clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Network | ChatErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 | 429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Network,
        _ => ChatErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ChatErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ChatErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ChatErrorCategory::Config);
        assert_eq!(classify_http_status(502), ChatErrorCategory::Network);
        assert_eq!(classify_http_status(302), ChatErrorCategory::Internal);
    }

    #[test]
    fn not_signed_in_code_is_stable() {
        let err = ChatError::not_signed_in("select_conversation");
        assert_eq!(err.code, "not_signed_in");
        assert_eq!(err.category, ChatErrorCategory::Auth);
        assert!(err.message.contains("select_conversation"));
    }

    #[test]
    fn only_network_and_rate_limits_are_transient() {
        assert!(ChatError::new(ChatErrorCategory::Network, "n", "n").is_transient());
        assert!(ChatError::new(ChatErrorCategory::RateLimited, "r", "r").is_transient());
        assert!(!ChatError::new(ChatErrorCategory::Protocol, "p", "p").is_transient());
    }

    #[test]
    fn stores_retry_after_in_millis() {
        let err = ChatError::new(ChatErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_millis(1_500));
        assert_eq!(err.retry_after_ms, Some(1_500));
    }
}
