//! Persistence for OAuth token sets.

use anyhow::{Context, Result};
use log::debug;
use std::path::{Path, PathBuf};

use super::TokenSet;
use crate::runtime::Runtime;

/// Where refreshed credentials are kept between runs.
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<TokenSet>>;
    fn save(&self, tokens: &TokenSet) -> Result<()>;
}

/// JSON credential file, by default `<config_dir>/linctl/credentials.json`.
pub struct FileTokenStore<R: Runtime> {
    runtime: R,
    path: PathBuf,
}

impl<R: Runtime> FileTokenStore<R> {
    pub fn new(runtime: R, path: PathBuf) -> Self {
        Self { runtime, path }
    }

    pub fn default_path(runtime: &R) -> Option<PathBuf> {
        runtime
            .config_dir()
            .map(|dir| dir.join("linctl").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R: Runtime> TokenStore for FileTokenStore<R> {
    #[tracing::instrument(skip(self))]
    fn load(&self) -> Result<Option<TokenSet>> {
        if !self.runtime.exists(&self.path) {
            debug!("No credential file at {:?}", self.path);
            return Ok(None);
        }

        let contents = self
            .runtime
            .read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials from {:?}", self.path))?;
        let tokens = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials in {:?}", self.path))?;
        Ok(Some(tokens))
    }

    #[tracing::instrument(skip(self, tokens))]
    fn save(&self, tokens: &TokenSet) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(tokens).context("Failed to encode credentials")?;
        self.runtime
            .write(&self.path, &json)
            .with_context(|| format!("Failed to write credentials to {:?}", self.path))?;
        self.runtime.set_permissions(&self.path, 0o600)?;

        debug!("Saved credentials to {:?}", self.path);
        Ok(())
    }
}
