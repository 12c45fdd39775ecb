//! Error taxonomy for the client core.
//!
//! Every fallible operation in this crate returns [`Error`], a flat
//! `thiserror` enum rather than a class hierarchy, per the "tagged variants"
//! guidance this crate follows throughout (auth strategies, SSE events, and
//! errors are all modeled as sum types).

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error as ThisError;

/// Whether an error is safe to retry automatically.
///
/// Implemented directly on [`Error`] rather than folded into the enum match
/// arms at every call site, so retry policies (Streaming Engine, JWT
/// exchanger) share one source of truth.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Structured context attached to an error: URL, HTTP status, auth strategy,
/// or any other detail worth surfacing to a caller building diagnostics.
pub type ErrorContext = BTreeMap<String, Value>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Missing or invalid configuration. Never retryable.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        context: ErrorContext,
    },

    /// Credential exchange failed, or a 401 survived one refresh-and-retry.
    #[error("authentication error: {message}")]
    Auth {
        message: String,
        #[source]
        cause: Option<Box<Error>>,
        context: ErrorContext,
    },

    /// Transport-level failure (DNS, connect, reset, timeout at the socket level).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A caller- or policy-derived deadline expired.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP 429. `retry_after` carries the parsed `Retry-After` header, if present.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimit {
        retry_after: Option<Duration>,
        context: ErrorContext,
    },

    /// HTTP 5xx.
    #[error("upstream server error: status={status}")]
    Server { status: u16, context: ErrorContext },

    /// HTTP 4xx other than 401/429.
    #[error("upstream client error: status={status}")]
    Client { status: u16, context: ErrorContext },

    /// Malformed JSON in a response body or SSE event payload.
    #[error("parse error: {message}")]
    Parse {
        message: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// A resource limit was hit: session table full, subscriber mailbox overflow.
    #[error("resource error: {message}")]
    Resource { message: String },

    /// Caller-initiated stop/cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
            cause: None,
            context: ErrorContext::new(),
        }
    }

    pub fn auth_with_cause(message: impl Into<String>, cause: Error) -> Self {
        Error::Auth {
            message: message.into(),
            cause: Some(Box::new(cause)),
            context: ErrorContext::new(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
            cause: None,
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Error::Resource {
            message: message.into(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let ctx = match &mut self {
            Error::Config { context, .. }
            | Error::Auth { context, .. }
            | Error::RateLimit { context, .. }
            | Error::Server { context, .. }
            | Error::Client { context, .. } => Some(context),
            _ => None,
        };
        if let Some(ctx) = ctx {
            ctx.insert(key.into(), value.into());
        }
        self
    }

    /// Classify an upstream HTTP status code into the taxonomy of §7.
    ///
    /// `retry_after` is only consulted for 429.
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> Self {
        let code = status.as_u16();
        match code {
            401 => Error::auth("unauthenticated"),
            429 => Error::RateLimit {
                retry_after,
                context: ErrorContext::new(),
            },
            500..=599 => Error::Server {
                status: code,
                context: ErrorContext::new(),
            },
            400..=499 => Error::Client {
                status: code,
                context: ErrorContext::new(),
            },
            _ => Error::Server {
                status: code,
                context: ErrorContext::new(),
            },
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Timeout(_) => true,
            Error::RateLimit { .. } => true,
            Error::Server { .. } => true,
            Error::Config { .. }
            | Error::Auth { .. }
            | Error::Client { .. }
            | Error::Parse { .. }
            | Error::Resource { .. }
            | Error::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            Error::from_status(reqwest::StatusCode::UNAUTHORIZED, None),
            Error::Auth { .. }
        ));
        assert!(matches!(
            Error::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2))),
            Error::RateLimit { retry_after: Some(_), .. }
        ));
        assert!(matches!(
            Error::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, None),
            Error::Server { status: 500, .. }
        ));
        assert!(matches!(
            Error::from_status(reqwest::StatusCode::NOT_FOUND, None),
            Error::Client { status: 404, .. }
        ));
    }

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(Error::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, None).is_retryable());
        assert!(Error::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, None).is_retryable());
        assert!(!Error::from_status(reqwest::StatusCode::NOT_FOUND, None).is_retryable());
        assert!(!Error::from_status(reqwest::StatusCode::UNAUTHORIZED, None).is_retryable());
        assert!(!Error::config("missing project_id").is_retryable());
    }
}
