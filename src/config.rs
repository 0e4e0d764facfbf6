use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    auth::{
        DEFAULT_TOKEN_URL, FileTokenStore, OAuthTokenProvider, StaticTokenProvider, TokenProvider,
        TokenStore, mask_token,
    },
    error::AuthError,
    http::{DEFAULT_ENDPOINT, GraphqlClient, RetryPolicy, Transport, TransportSettings},
    runtime::Runtime,
};

pub const API_KEY_ENV: &str = "LINEAR_API_KEY";
pub const API_URL_ENV: &str = "LINEAR_API_URL";
pub const CLIENT_ID_ENV: &str = "LINEAR_CLIENT_ID";
pub const TOKEN_URL_ENV: &str = "LINEAR_TOKEN_URL";
pub const MAX_ATTEMPTS_ENV: &str = "LINCTL_MAX_ATTEMPTS";

/// OAuth client id used when `LINEAR_CLIENT_ID` is unset.
pub const DEFAULT_CLIENT_ID: &str = "linctl";

/// Where the active credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    ApiKey,
    OAuth(PathBuf),
}

pub struct Config {
    pub client: GraphqlClient,
    pub auth: AuthSource,
}

impl Config {
    pub fn new<R: Runtime + 'static>(runtime: R, api_url: Option<String>) -> Result<Self> {
        let endpoint = api_url
            .or_else(|| runtime.env_var(API_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let mut policy = RetryPolicy::default();
        if let Ok(raw) = runtime.env_var(MAX_ATTEMPTS_ENV) {
            let max_attempts: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {:?}", MAX_ATTEMPTS_ENV, raw))?;
            policy = policy.with_max_attempts(max_attempts);
        }

        let transport = Transport::new(&TransportSettings::default());

        let (tokens, auth): (Arc<dyn TokenProvider>, AuthSource) =
            if let Ok(key) = runtime.env_var(API_KEY_ENV) {
                debug!("Using {} for authentication: {}", API_KEY_ENV, mask_token(&key));
                (Arc::new(StaticTokenProvider::new(key)), AuthSource::ApiKey)
            } else {
                let client_id = runtime
                    .env_var(CLIENT_ID_ENV)
                    .unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string());
                let token_url = runtime
                    .env_var(TOKEN_URL_ENV)
                    .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string());
                let path = FileTokenStore::default_path(&runtime).ok_or(AuthError::NotAuthenticated)?;

                let store = FileTokenStore::new(runtime, path.clone());
                let tokens = store.load()?.ok_or(AuthError::NotAuthenticated)?;
                debug!("Using OAuth credentials from {:?}", path);

                let provider =
                    OAuthTokenProvider::new(transport.inner().clone(), client_id, store, tokens)
                        .with_token_url(token_url);
                (Arc::new(provider), AuthSource::OAuth(path))
            };

        let client = GraphqlClient::new(transport, endpoint, tokens).with_retry_policy(policy);

        Ok(Self { client, auth })
    }
}
