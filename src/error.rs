//! Provider error taxonomy.
//!
//! Every failure coming out of a search tier, a generation candidate or a
//! probed collaborator is mapped into [`ProviderError`]. The variant decides
//! what the surrounding chain does next:
//!
//! | Variant | Chain behaviour |
//! |---------|-----------------|
//! | `Unavailable` | provider never attempted |
//! | `NotFound` / `Unsupported` | advance to the next candidate |
//! | `RateLimited` | one fixed backoff, then advance |
//! | `Transient` / `Unknown` | advance immediately |
//! | `MalformedResponse` | zero contribution, advance |
//! | `Exhausted` | surfaced to the orchestrator |

use crate::models::FailureRecord;
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Flat classification stored in [`FailureRecord`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    NotFound,
    Unsupported,
    RateLimited,
    Transient,
    MalformedResponse,
    Unknown,
    Exhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::NotFound => "not_found",
            Self::Unsupported => "unsupported",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::MalformedResponse => "malformed_response",
            Self::Unknown => "unknown",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a single provider call or by an exhausted chain.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unknown failure: {0}")]
    Unknown(String),
    #[error("all {} candidates failed; last error: {}", .failures.len(), .last)]
    Exhausted {
        /// Display form of the last underlying error.
        last: String,
        /// Every failure recorded on the way.
        failures: Vec<FailureRecord>,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Transient(_) => ErrorKind::Transient,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::Unknown(_) => ErrorKind::Unknown,
            Self::Exhausted { .. } => ErrorKind::Exhausted,
        }
    }

    /// Map a non-success HTTP status to the taxonomy.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let msg = format!("status {}: {}", status, crate::utils::truncate_for_log(body, 200));
        match status.as_u16() {
            404 => Self::NotFound(msg),
            400 | 405 | 422 | 501 => Self::Unsupported(msg),
            429 => Self::RateLimited(msg),
            401 | 403 => Self::Unavailable(msg),
            408 => Self::Transient(msg),
            s if (500..600).contains(&s) => Self::Transient(msg),
            _ => Self::Unknown(msg),
        }
    }

    /// Map a transport-level reqwest error.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status, "")
        } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            Self::Transient(e.to_string())
        } else {
            Self::Unknown(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ProviderError::from_status(StatusCode::NOT_FOUND, "").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, "").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::REQUEST_TIMEOUT, "").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "").kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, "").kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::IM_A_TEAPOT, "").kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_exhausted_message_counts_failures() {
        let err = ProviderError::Exhausted {
            last: "boom".to_string(),
            failures: vec![],
        };
        assert_eq!(err.to_string(), "all 0 candidates failed; last error: boom");
        assert_eq!(err.kind(), ErrorKind::Exhausted);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
    }
}
