//! OAuth access tokens with coalesced refresh.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::{TokenProvider, TokenStore, mask_token};
use crate::error::AuthError;

/// Linear's OAuth token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://api.linear.app/oauth/token";

/// Tokens expiring within this many seconds are refreshed before use.
pub const EXPIRY_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) after which the access token is invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl TokenSet {
    pub fn expires_within(&self, now: u64, window: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(window),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: String,
}

/// Token provider backed by an OAuth refresh grant.
///
/// The current token set lives behind an async mutex that is held across the
/// refresh request, so racing refreshes for the same stale token collapse into
/// one network call and all callers observe the same new token.
pub struct OAuthTokenProvider<S: TokenStore> {
    http: Client,
    token_url: String,
    client_id: String,
    store: S,
    current: Mutex<TokenSet>,
}

impl<S: TokenStore> OAuthTokenProvider<S> {
    pub fn new(http: Client, client_id: impl Into<String>, store: S, tokens: TokenSet) -> Self {
        Self {
            http,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: client_id.into(),
            store,
            current: Mutex::new(tokens),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Refreshes `current` in place. Caller holds the lock.
    async fn refresh_locked(&self, current: &mut TokenSet) -> Result<()> {
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(AuthError::SessionExpired)?;

        info!(
            "Refreshing access token {}",
            mask_token(&current.access_token)
        );
        let mut fresh = self.request_refresh(&refresh_token).await?;

        // Some servers rotate refresh tokens, some don't.
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }

        if let Err(e) = self.store.save(&fresh) {
            warn!("Failed to persist refreshed credentials: {:#}", e);
        }

        *current = fresh;
        Ok(())
    }

    #[tracing::instrument(skip(self, refresh_token))]
    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .context("Failed to send token refresh request")?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<OAuthErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_default();
            debug!("Token endpoint rejected refresh ({}): {}", status, error);

            // Anything other than a dead grant (e.g. invalid_client) is a
            // configuration fault that logging in again won't fix.
            if status == StatusCode::UNAUTHORIZED || error == "invalid_grant" {
                return Err(AuthError::SessionExpired.into());
            }
            let detail = if error.is_empty() { body } else { error };
            return Err(anyhow::anyhow!("{}", detail)
                .context(format!("Token endpoint rejected refresh ({})", status)));
        }

        let response = response
            .error_for_status()
            .context("Token endpoint returned an error")?;
        let parsed: RefreshResponse = response
            .json()
            .await
            .context("Failed to parse token refresh response")?;

        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_in.map(|secs| unix_now().saturating_add(secs)),
        })
    }
}

#[async_trait]
impl<S: TokenStore> TokenProvider for OAuthTokenProvider<S> {
    async fn get_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if current.expires_within(unix_now(), EXPIRY_SKEW_SECS) && current.refresh_token.is_some()
        {
            debug!("Access token is about to expire, refreshing proactively");
            self.refresh_locked(&mut current).await?;
        }
        Ok(current.access_token.clone())
    }

    async fn refresh_if_needed(&self, stale_token: &str) -> Result<String> {
        let mut current = self.current.lock().await;
        if current.access_token != stale_token {
            debug!("Token already refreshed by another operation");
            return Ok(current.access_token.clone());
        }
        self.refresh_locked(&mut current).await?;
        Ok(current.access_token.clone())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockTokenStore;
    use mockito::Matcher;
    use std::sync::Arc;

    fn tokens(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
            expires_at: None,
        }
    }

    fn accepting_store() -> MockTokenStore {
        let mut store = MockTokenStore::new();
        store.expect_save().returning(|_| Ok(()));
        store
    }

    #[test]
    fn test_expires_within() {
        let mut t = tokens("a", None);
        assert!(!t.expires_within(1000, 60));

        t.expires_at = Some(1050);
        assert!(t.expires_within(1000, 60));
        assert!(!t.expires_within(900, 60));
    }

    #[tokio::test]
    async fn test_refresh_replaces_token_and_persists() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a2","refresh_token":"r2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut store = MockTokenStore::new();
        store
            .expect_save()
            .withf(|t: &TokenSet| t.access_token == "a2" && t.refresh_token.as_deref() == Some("r2"))
            .times(1)
            .returning(|_| Ok(()));

        let provider = OAuthTokenProvider::new(Client::new(), "cid", store, tokens("a1", Some("r1")))
            .with_token_url(format!("{}/oauth/token", server.url()));

        assert_eq!(provider.refresh_if_needed("a1").await.unwrap(), "a2");
        assert_eq!(provider.get_token().await.unwrap(), "a2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a2"}"#)
            .create_async()
            .await;

        let mut store = MockTokenStore::new();
        store
            .expect_save()
            .withf(|t: &TokenSet| t.refresh_token.as_deref() == Some("r1"))
            .returning(|_| Ok(()));

        let provider = OAuthTokenProvider::new(Client::new(), "cid", store, tokens("a1", Some("r1")))
            .with_token_url(format!("{}/oauth/token", server.url()));

        assert_eq!(provider.refresh_if_needed("a1").await.unwrap(), "a2");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a2","refresh_token":"r2"}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = Arc::new(
            OAuthTokenProvider::new(
                Client::new(),
                "cid",
                accepting_store(),
                tokens("a1", Some("r1")),
            )
            .with_token_url(format!("{}/oauth/token", server.url())),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider.refresh_if_needed("a1").await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "a2");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_grant_is_session_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let provider = OAuthTokenProvider::new(
            Client::new(),
            "cid",
            MockTokenStore::new(),
            tokens("a1", Some("r1")),
        )
        .with_token_url(format!("{}/oauth/token", server.url()));

        let err = provider.refresh_if_needed("a1").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AuthError>(),
            Some(&AuthError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_unauthorized_refresh_is_session_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;

        let provider = OAuthTokenProvider::new(
            Client::new(),
            "cid",
            MockTokenStore::new(),
            tokens("a1", Some("r1")),
        )
        .with_token_url(format!("{}/oauth/token", server.url()));

        let err = provider.refresh_if_needed("a1").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AuthError>(),
            Some(&AuthError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_client_misconfiguration_is_not_session_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let provider = OAuthTokenProvider::new(
            Client::new(),
            "cid",
            MockTokenStore::new(),
            tokens("a1", Some("r1")),
        )
        .with_token_url(format!("{}/oauth/token", server.url()));

        let err = provider.refresh_if_needed("a1").await.unwrap_err();
        assert!(err.downcast_ref::<AuthError>().is_none());
        assert!(err.to_string().contains("Token endpoint rejected refresh (400"));
        assert!(format!("{:#}", err).contains("invalid_client"));
        // Current token is untouched.
        assert_eq!(provider.get_token().await.unwrap(), "a1");
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_session_expired() {
        let provider = OAuthTokenProvider::new(
            Client::new(),
            "cid",
            MockTokenStore::new(),
            tokens("a1", None),
        );

        let err = provider.refresh_if_needed("a1").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AuthError>(),
            Some(&AuthError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_server_error_is_not_session_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(503)
            .create_async()
            .await;

        let provider = OAuthTokenProvider::new(
            Client::new(),
            "cid",
            MockTokenStore::new(),
            tokens("a1", Some("r1")),
        )
        .with_token_url(format!("{}/oauth/token", server.url()));

        let err = provider.refresh_if_needed("a1").await.unwrap_err();
        assert!(err.downcast_ref::<AuthError>().is_none());
    }

    #[tokio::test]
    async fn test_get_token_refreshes_expiring_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let expiring = TokenSet {
            access_token: "a1".into(),
            refresh_token: Some("r1".into()),
            expires_at: Some(unix_now() + 5),
        };
        let provider = OAuthTokenProvider::new(Client::new(), "cid", accepting_store(), expiring)
            .with_token_url(format!("{}/oauth/token", server.url()));

        assert_eq!(provider.get_token().await.unwrap(), "a2");
        // Fresh token is good for an hour; no second refresh.
        assert_eq!(provider.get_token().await.unwrap(), "a2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_failure_does_not_fail_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a2"}"#)
            .create_async()
            .await;

        let mut store = MockTokenStore::new();
        store
            .expect_save()
            .returning(|_| Err(anyhow::anyhow!("disk full")));

        let provider = OAuthTokenProvider::new(Client::new(), "cid", store, tokens("a1", Some("r1")))
            .with_token_url(format!("{}/oauth/token", server.url()));

        assert_eq!(provider.refresh_if_needed("a1").await.unwrap(), "a2");
    }
}
