//! GraphQL client with retry, backoff, rate-limit handling and token refresh.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::envelope::{Operation, decode_response};
use super::retry::{
    RetryPolicy, StatusClass, classify_status, is_temporary, parse_retry_after,
};
use super::sleep::{Sleeper, TokioSleeper};
use super::transport::{Exchange, Transport};
use crate::auth::TokenProvider;
use crate::error::{ApiError, AuthError};

/// Linear's public GraphQL endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.linear.app/graphql";

/// Executes GraphQL operations against one endpoint.
///
/// Cheap to clone; clones share the connection pool, token provider and
/// retry policy.
#[derive(Clone)]
pub struct GraphqlClient {
    transport: Transport,
    endpoint: String,
    policy: RetryPolicy,
    tokens: Arc<dyn TokenProvider>,
    sleeper: Arc<dyn Sleeper>,
}

impl GraphqlClient {
    pub fn new(
        transport: Transport,
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            policy: RetryPolicy::default(),
            tokens,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Builds an operation from raw parts and executes it.
    pub async fn query<D: DeserializeOwned>(
        &self,
        query: &str,
        variables: Option<Map<String, Value>>,
    ) -> Result<Option<D>> {
        let mut operation = Operation::new(query)?;
        if let Some(variables) = variables {
            operation = operation.with_variables(variables);
        }
        self.execute(&operation).await
    }

    /// Executes and returns the raw `data` payload (`null` when absent).
    pub async fn execute_raw(&self, operation: &Operation) -> Result<Value> {
        Ok(self.execute::<Value>(operation).await?.unwrap_or(Value::Null))
    }

    /// Executes `operation`, decoding `data` into `D`.
    ///
    /// Returns `Ok(None)` when the response carries no data and no errors.
    #[tracing::instrument(skip(self, operation))]
    pub async fn execute<D: DeserializeOwned>(&self, operation: &Operation) -> Result<Option<D>> {
        let body = operation.to_body()?;

        let mut budget = self.policy.max_attempts.max(1);
        let mut refreshed = false;
        let mut attempt: u32 = 0;
        let mut last_error: Option<ApiError> = None;
        let mut refreshed_token: Option<String> = None;

        while attempt < budget {
            let token = match refreshed_token.take() {
                Some(token) => token,
                None => self
                    .tokens
                    .get_token()
                    .await
                    .context("Failed to obtain API credential")?,
            };

            debug!("Attempt {}/{} to {}", attempt + 1, budget, self.endpoint);

            let delay = match self.send_once(&token, &body).await {
                Err(err) if is_temporary(&err) => {
                    let delay = self.policy.backoff(attempt);
                    last_error = Some(err);
                    delay
                }
                Err(err) => return Err(err.into()),
                Ok(exchange) => match classify_status(exchange.status) {
                    StatusClass::Success => {
                        return decode_response(exchange.status, &exchange.body, operation.query())
                            .map_err(Into::into);
                    }
                    StatusClass::Unauthorized => {
                        if refreshed {
                            return Err(unauthorized_error(&exchange.body).into());
                        }
                        refreshed = true;

                        info!("Credential rejected, attempting refresh");
                        let fresh = self
                            .tokens
                            .refresh_if_needed(&token)
                            .await
                            .map_err(refresh_failure)?;
                        refreshed_token = Some(fresh);

                        // The retry with the new credential doesn't use up the budget.
                        budget += 1;
                        attempt += 1;
                        continue;
                    }
                    StatusClass::RateLimited => {
                        let hint = parse_retry_after(&exchange.headers);
                        last_error = Some(ApiError::RateLimited { retry_after: hint });
                        hint.unwrap_or_else(|| self.policy.rate_limit_backoff(attempt))
                    }
                    StatusClass::ServerError => {
                        let delay = self.policy.backoff(attempt);
                        last_error = Some(http_error(&exchange));
                        delay
                    }
                    StatusClass::ClientError => return Err(http_error(&exchange).into()),
                },
            };

            attempt += 1;
            if attempt >= budget {
                break;
            }

            if let Some(err) = &last_error {
                warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}...",
                    attempt, budget, err, delay
                );
            }
            self.sleeper.sleep(delay).await;
        }

        let err = last_error.unwrap_or_else(|| ApiError::network("no attempt was made"));
        Err(anyhow::Error::from(err).context(format!("Request failed after {} attempts", attempt)))
    }

    /// One physical attempt: send a fresh copy of `body` and read the reply.
    async fn send_once(&self, token: &str, body: &[u8]) -> Result<Exchange, ApiError> {
        let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::Validation("credential contains invalid characters".into()))?;
        auth_value.set_sensitive(true);

        let request = self
            .transport
            .inner()
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, auth_value)
            .body(body.to_vec())
            .build()
            .map_err(|e| ApiError::Validation(format!("failed to build request: {}", e)))?;

        self.transport.exchange(request).await
    }
}

fn http_error(exchange: &Exchange) -> ApiError {
    ApiError::Http {
        status: exchange.status.as_u16(),
        body: String::from_utf8_lossy(&exchange.body).into_owned(),
    }
}

/// A 401 that survived a refresh. Uses the server's first error message
/// when the body is a GraphQL envelope.
fn unauthorized_error(body: &[u8]) -> ApiError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("errors")?
                .get(0)?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| "credential rejected (HTTP 401)".to_string());
    ApiError::authentication(message, "unauthorized")
}

fn refresh_failure(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<AuthError>() {
        Some(AuthError::SessionExpired) => {
            ApiError::authentication("session expired", "session_expired").into()
        }
        Some(AuthError::NoRefreshCapability) => {
            ApiError::authentication("API key was rejected", "no_refresh_capability").into()
        }
        _ => err.context("Failed to refresh API credential"),
    }
}
