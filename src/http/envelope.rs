//! GraphQL request/response envelopes.

use log::debug;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Characters of query text kept in GraphQL error excerpts.
pub const QUERY_EXCERPT_CHARS: usize = 100;

/// One logical request: query text plus named variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<Map<String, Value>>,
}

impl Operation {
    pub fn new(query: impl Into<String>) -> Result<Self, ApiError> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(ApiError::Validation("query must not be empty".to_string()));
        }
        Ok(Self {
            query,
            variables: None,
        })
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn variables(&self) -> Option<&Map<String, Value>> {
        self.variables.as_ref()
    }

    /// Serializes the request body. Done once per operation; each attempt sends
    /// a copy of these bytes.
    pub fn to_body(&self) -> Result<Vec<u8>, ApiError> {
        serde_json::to_vec(self)
            .map_err(|e| ApiError::Validation(format!("failed to encode variables: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    data: Option<Value>,
    // Some servers send `"errors": null` on success.
    #[serde(default)]
    errors: Option<Vec<EnvelopeError>>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    message: String,
}

/// Decodes a fully-read response body.
///
/// Returns `Ok(None)` when the envelope has no `data` (or `null`) and no
/// errors. Only the first entry of a non-empty `errors` list is reported.
pub fn decode_response<D: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
    query: &str,
) -> Result<Option<D>, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Http {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }

    let envelope: ResponseEnvelope = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed response envelope: {}", e)))?;
    let errors = envelope.errors.unwrap_or_default();

    if let Some(first) = errors.first() {
        if errors.len() > 1 {
            debug!(
                "Response carried {} GraphQL errors, reporting the first",
                errors.len()
            );
        }
        return Err(ApiError::GraphQL {
            message: first.message.clone(),
            query_excerpt: query_excerpt(query),
        });
    }

    match envelope.data {
        None | Some(Value::Null) => Ok(None),
        Some(data) => serde_json::from_value(data)
            .map(Some)
            .map_err(|e| ApiError::Validation(format!("unexpected response data: {}", e))),
    }
}

/// First [`QUERY_EXCERPT_CHARS`] characters of `query`, with `...` appended
/// when truncated.
pub fn query_excerpt(query: &str) -> String {
    match query.char_indices().nth(QUERY_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &query[..idx]),
        None => query.to_string(),
    }
}
