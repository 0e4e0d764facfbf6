//! Credential providers for the GraphQL client.
//!
//! The client only ever asks a [`TokenProvider`] for the current token and,
//! after a 401, for a replacement of the token that was rejected.

mod oauth;
mod store;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::error::AuthError;

pub use oauth::{DEFAULT_TOKEN_URL, EXPIRY_SKEW_SECS, OAuthTokenProvider, TokenSet};
pub use store::{FileTokenStore, TokenStore};

#[cfg(test)]
pub use store::MockTokenStore;

/// Supplies bearer tokens and refreshes them on demand.
///
/// Implementations are shared by concurrent operations. Concurrent calls to
/// `refresh_if_needed` with the same stale token must result in a single
/// underlying refresh, and every caller must observe the same new token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the token to use for the next request.
    async fn get_token(&self) -> Result<String>;

    /// Returns a token newer than `stale_token`, refreshing if nobody else has.
    ///
    /// Fails with [`AuthError::SessionExpired`] when the session cannot be
    /// recovered and [`AuthError::NoRefreshCapability`] when refresh is not
    /// supported by this credential.
    async fn refresh_if_needed(&self, stale_token: &str) -> Result<String>;
}

/// A fixed personal API key.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &mask_token(&self.token))
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh_if_needed(&self, _stale_token: &str) -> Result<String> {
        debug!("API key credentials cannot be refreshed");
        Err(AuthError::NoRefreshCapability.into())
    }
}

/// Masks all but the edges of a token for logging.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}
