//! Error taxonomy for GraphQL operations.
//!
//! Every failure the engine reports is an [`ApiError`]. Callers usually see it
//! wrapped in an `anyhow::Error` with extra context; [`ApiError::find`] and the
//! helpers below recover the original kind without string parsing.

use std::fmt;
use std::time::Duration;

/// Guidance appended to authentication failures.
pub const REAUTH_HINT: &str =
    "Set LINEAR_API_KEY or re-authenticate to renew the stored OAuth credentials.";

/// Errors produced while executing a GraphQL operation.
#[derive(Debug)]
pub enum ApiError {
    /// Transport-level failure (connection, timeout, reset).
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    /// Non-success HTTP status with the raw response body.
    Http { status: u16, body: String },
    /// HTTP 429, with the server's wait hint when one was given.
    RateLimited { retry_after: Option<Duration> },
    /// Credential rejected or unrecoverable.
    Authentication { message: String, code: String },
    /// Application-level error reported in the response envelope.
    GraphQL {
        message: String,
        query_excerpt: String,
    },
    /// Input or payload failed validation.
    Validation(String),
    /// The requested entity does not exist.
    NotFound(String),
}

/// Fieldless mirror of [`ApiError`] for branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Http,
    RateLimited,
    Authentication,
    GraphQL,
    Validation,
    NotFound,
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        ApiError::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ApiError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn authentication(message: impl Into<String>, code: impl Into<String>) -> Self {
        ApiError::Authentication {
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Network { .. } => ErrorKind::Network,
            ApiError::Http { .. } => ErrorKind::Http,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Authentication { .. } => ErrorKind::Authentication,
            ApiError::GraphQL { .. } => ErrorKind::GraphQL,
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Finds the first `ApiError` anywhere in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&ApiError> {
        err.chain().find_map(|e| e.downcast_ref::<ApiError>())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Network { message, .. } => write!(f, "Network error: {}", message),
            ApiError::Http { status, body } => {
                if body.is_empty() {
                    write!(f, "HTTP {} error", status)
                } else {
                    write!(f, "HTTP {} error: {}", status, body)
                }
            }
            ApiError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(
                    f,
                    "Rate limit exceeded. Retry after {} seconds.",
                    d.as_secs()
                ),
                None => write!(f, "Rate limit exceeded. Try again later."),
            },
            ApiError::Authentication { message, .. } => {
                write!(f, "Authentication failed: {}. {}", message, REAUTH_HINT)
            }
            ApiError::GraphQL {
                message,
                query_excerpt,
            } => write!(f, "GraphQL error: {} (query: {})", message, query_excerpt),
            ApiError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Network {
                source: Some(source),
                ..
            } => Some(source.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

/// Errors a [`crate::auth::TokenProvider`] reports when no usable credential exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The refresh grant was rejected; the user must log in again.
    SessionExpired,
    /// The credential cannot be refreshed (e.g. a personal API key).
    NoRefreshCapability,
    /// No credential is configured at all.
    NotAuthenticated,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::SessionExpired => write!(f, "Session expired. {}", REAUTH_HINT),
            AuthError::NoRefreshCapability => {
                write!(f, "Credential cannot be refreshed")
            }
            AuthError::NotAuthenticated => write!(f, "Not authenticated. {}", REAUTH_HINT),
        }
    }
}

impl std::error::Error for AuthError {}

/// Returns the kind of the first `ApiError` in the chain, if any.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    ApiError::find(err).map(ApiError::kind)
}

pub fn is_authentication_error(err: &anyhow::Error) -> bool {
    error_kind(err) == Some(ErrorKind::Authentication)
        || err.chain().any(|e| e.downcast_ref::<AuthError>().is_some())
}

pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    error_kind(err) == Some(ErrorKind::RateLimited)
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    error_kind(err) == Some(ErrorKind::NotFound)
}

/// The server-supplied wait hint carried by a rate-limit error.
pub fn retry_after(err: &anyhow::Error) -> Option<Duration> {
    match ApiError::find(err)? {
        ApiError::RateLimited { retry_after } => *retry_after,
        _ => None,
    }
}
