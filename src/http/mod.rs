//! GraphQL-over-HTTP execution engine.
//!
//! - `transport` - shared connection pool and per-phase timeouts
//! - `retry` - retry policy and outcome classification
//! - `envelope` - request body and response envelope decoding
//! - `client` - the retrying executor callers use
//! - `sleep` - backoff waits

mod client;
mod envelope;
mod retry;
mod sleep;
#[cfg(test)]
mod test_server;
mod transport;

pub use client::{DEFAULT_ENDPOINT, GraphqlClient};
pub use envelope::{Operation, QUERY_EXCERPT_CHARS, decode_response, query_excerpt};
pub use retry::{
    BASE_DELAY_MS, MAX_ATTEMPTS, RATE_LIMIT_MULTIPLIER, RetryPolicy, StatusClass,
    classify_status, is_temporary, parse_retry_after,
};
pub use sleep::{Sleeper, TokioSleeper};
pub use transport::{Exchange, Transport, TransportSettings};
