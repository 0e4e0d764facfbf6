//! Shared, connection-pooling HTTP transport.

use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::ApiError;

/// Static connection settings. Every per-phase timeout is shorter than
/// `request_timeout`, which bounds a single physical attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub max_idle_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub response_header_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            max_conns_per_host: 20,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            user_agent: "linctl".to_string(),
        }
    }
}

/// A fully-read HTTP exchange.
#[derive(Debug)]
pub struct Exchange {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Long-lived client plus a bound on concurrent exchanges. Clones share the
/// connection pool and the permit count.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    permits: Arc<Semaphore>,
    response_header_timeout: Duration,
}

impl Transport {
    pub fn new(settings: &TransportSettings) -> Self {
        // reqwest's connect timeout covers both the TCP dial and the TLS
        // handshake, so the two budgets are added together.
        let connect_timeout = settings.dial_timeout + settings.tls_handshake_timeout;

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_timeout)
            .tcp_keepalive(settings.tcp_keepalive)
            .connect_timeout(connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build configured HTTP client ({}), using defaults", e);
                Client::new()
            });

        Self::from_client(client, settings)
    }

    /// Wraps an existing client, e.g. one pointed at a test server.
    pub fn from_client(client: Client, settings: &TransportSettings) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(settings.max_conns_per_host.max(1))),
            response_header_timeout: settings.response_header_timeout,
        }
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Sends one request and reads the whole reply. The connection permit is
    /// held until the body has been read, so no more than
    /// `max_conns_per_host` exchanges are ever in flight.
    pub async fn exchange(&self, request: Request) -> Result<Exchange, ApiError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ApiError::network_with_source("connection pool closed", e))?;

        debug!("{} {}", request.method(), request.url());

        // Only the wait for headers is bounded here; the body read is governed
        // by the client's overall request timeout.
        let response =
            match tokio::time::timeout(self.response_header_timeout, self.client.execute(request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(ApiError::network_with_source("request failed", e)),
                Err(elapsed) => {
                    return Err(ApiError::network_with_source(
                        format!(
                            "timed out waiting for response headers after {:?}",
                            self.response_header_timeout
                        ),
                        elapsed,
                    ));
                }
            };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::network_with_source("failed to read response body", e))?;

        Ok(Exchange {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
