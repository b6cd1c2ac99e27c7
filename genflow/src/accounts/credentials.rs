//! Credential provider seam.
//!
//! The provider is the only component that talks to a platform's login flow.
//! The account pool calls it for interactive logins and cookie refreshes and
//! treats every failure as an external error.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::domain::Platform;
use crate::executor::command::run_json_command;

/// Errors reported by a credential provider.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No credential provider configured for {0}")]
    NotConfigured(Platform),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Login required: {0}")]
    LoginRequired(String),

    #[error("Refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Rate limited - try again later")]
    RateLimited,

    #[error("Provider process failed: {0}")]
    Process(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CredentialError {
    /// Check if this error requires manual re-login.
    pub fn requires_relogin(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_) | Self::LoginRequired(_))
    }

    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Process(_))
    }
}

impl From<CredentialError> for crate::Error {
    fn from(err: CredentialError) -> Self {
        crate::Error::External(err.to_string())
    }
}

/// Account identity returned by an interactive login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub identifier: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub cookie: String,
}

/// The identity a provider needs to obtain a cookie.
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    pub account_id: String,
    pub platform: Platform,
    pub identifier: String,
    pub secret: Option<String>,
    pub cookie: Option<String>,
}

/// Platform login and cookie acquisition.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Run an interactive login for `platform`.
    async fn login(&self, platform: Platform) -> Result<LoginCredentials, CredentialError>;

    /// Obtain a fresh cookie for one account.
    async fn get_cookie(&self, request: &CredentialRequest) -> Result<String, CredentialError>;

    /// Obtain fresh cookies for several accounts, one outcome per request.
    async fn batch_get_cookie(
        &self,
        requests: &[CredentialRequest],
    ) -> Vec<(String, Result<String, CredentialError>)> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = self.get_cookie(request).await;
            outcomes.push((request.account_id.clone(), outcome));
        }
        outcomes
    }
}

/// Provider used when no login backend is configured.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredCredentialProvider;

#[async_trait]
impl CredentialProvider for UnconfiguredCredentialProvider {
    async fn login(&self, platform: Platform) -> Result<LoginCredentials, CredentialError> {
        Err(CredentialError::NotConfigured(platform))
    }

    async fn get_cookie(&self, request: &CredentialRequest) -> Result<String, CredentialError> {
        Err(CredentialError::NotConfigured(request.platform))
    }
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    cookie: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    relogin: bool,
}

const MAX_CONCURRENT_REFRESHES: usize = 4;

/// Provider backed by an external command per platform.
///
/// The request is written to stdin as JSON (`action`, `platform`, identity
/// fields) and the last stdout line is parsed as
/// `{"identifier", "secret", "cookie", "error", "relogin"}`.
#[derive(Debug, Clone, Default)]
pub struct CommandCredentialProvider {
    commands: HashMap<Platform, String>,
    timeout_secs: u64,
}

impl CommandCredentialProvider {
    pub fn new(commands: HashMap<Platform, String>) -> Self {
        Self {
            commands,
            timeout_secs: 600,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    async fn call(
        &self,
        platform: Platform,
        input: serde_json::Value,
    ) -> Result<CommandReply, CredentialError> {
        let command = self
            .commands
            .get(&platform)
            .ok_or(CredentialError::NotConfigured(platform))?;
        debug!(platform = %platform, "Invoking credential command");

        let line = run_json_command(command, &[], &input, self.timeout_secs)
            .await
            .map_err(|e| CredentialError::Process(e.to_string()))?;
        let reply: CommandReply = serde_json::from_str(&line)?;

        if let Some(error) = reply.error.clone() {
            return Err(if reply.relogin {
                CredentialError::LoginRequired(error)
            } else {
                CredentialError::RefreshFailed(error)
            });
        }
        Ok(reply)
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn login(&self, platform: Platform) -> Result<LoginCredentials, CredentialError> {
        let reply = self
            .call(platform, json!({ "action": "login", "platform": platform }))
            .await?;
        let identifier = reply
            .identifier
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CredentialError::InvalidCredentials("login returned no identifier".into()))?;
        let cookie = reply
            .cookie
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CredentialError::InvalidCredentials("login returned no cookie".into()))?;
        Ok(LoginCredentials {
            identifier,
            secret: reply.secret,
            cookie,
        })
    }

    async fn get_cookie(&self, request: &CredentialRequest) -> Result<String, CredentialError> {
        let reply = self
            .call(
                request.platform,
                json!({
                    "action": "get_cookie",
                    "platform": request.platform,
                    "identifier": request.identifier,
                    "secret": request.secret,
                }),
            )
            .await?;
        reply
            .cookie
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CredentialError::RefreshFailed("no cookie returned".into()))
    }

    /// Runs up to [`MAX_CONCURRENT_REFRESHES`] commands at once, keeping request order.
    async fn batch_get_cookie(
        &self,
        requests: &[CredentialRequest],
    ) -> Vec<(String, Result<String, CredentialError>)> {
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(MAX_CONCURRENT_REFRESHES) {
            let cookies = join_all(chunk.iter().map(|request| self.get_cookie(request))).await;
            results.extend(
                chunk
                    .iter()
                    .map(|request| request.account_id.clone())
                    .zip(cookies),
            );
        }
        results
    }
}
