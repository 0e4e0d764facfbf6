//! Retry policy and outcome classification for GraphQL requests.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::io;
use std::time::Duration;

/// Maximum number of physical attempts per operation.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
pub const BASE_DELAY_MS: u64 = 1000;

/// Multiplier applied to backoff when a 429 carries no Retry-After.
pub const RATE_LIMIT_MULTIPLIER: u32 = 10;

/// Immutable retry configuration shared by all operations of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            rate_limit_multiplier: RATE_LIMIT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// `base × 2^attempt`, where `attempt` is the 0-based sequence number of the
    /// attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Backoff for a 429 without a server hint.
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        self.backoff(attempt)
            .saturating_mul(self.rate_limit_multiplier)
    }
}

/// Coarse classification of an HTTP status for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Unauthorized,
    RateLimited,
    ServerError,
    ClientError,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        s if s.is_success() => StatusClass::Success,
        StatusCode::UNAUTHORIZED => StatusClass::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => StatusClass::RateLimited,
        s if s.is_server_error() => StatusClass::ServerError,
        // 1xx/3xx never reach here in practice; treat them like 4xx.
        _ => StatusClass::ClientError,
    }
}

/// Reads an integer-seconds `Retry-After` header. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Whether a transport error is worth retrying: timeouts, resets, broken pipes
/// and premature EOF. Connection refused and DNS failures are not.
pub fn is_temporary(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);

    while let Some(err) = current {
        if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() {
                return true;
            }
        }

        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }

        if message_looks_temporary(&err.to_string()) {
            return true;
        }

        current = err.source();
    }

    false
}

fn message_looks_temporary(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("timed out")
        || message.contains("timeout")
        || message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("unexpected eof")
        || message.contains("connection closed before message completed")
}
