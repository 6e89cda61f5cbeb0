// ABOUTME: Token credential abstraction and the default Azure credential chain
// ABOUTME: Tries environment, workload identity, managed identity and Azure CLI in order

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use super::azure_cli::AzureCliCredential;
use super::environment::{EnvironmentCredential, WorkloadIdentityCredential};
use super::managed_identity::ManagedIdentityCredential;
use super::token::TokenError;
use crate::config::{EnvSource, ProcessEnv};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("{credential} unavailable: {message}")]
    Unavailable {
        credential: &'static str,
        message: String,
    },
    #[error("{credential} authentication failed: {message}")]
    Authentication {
        credential: &'static str,
        message: String,
    },
    #[error("No credential in the chain could provide a token:\n{}", .0.join("\n"))]
    ChainExhausted(Vec<String>),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
    #[error("Access token error: {0}")]
    Token(#[from] TokenError),
}

impl CredentialError {
    pub fn unavailable(credential: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            credential,
            message: message.into(),
        }
    }

    pub fn authentication(credential: &'static str, message: impl Into<String>) -> Self {
        Self::Authentication {
            credential,
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// A bearer token and its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    /// Whether the token expires within `skew` from now
    pub fn is_expired(&self, skew: Duration) -> bool {
        self.expires_on - skew <= Utc::now()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Anything that can produce a bearer token for a scope
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Short name used in logs and chain errors
    fn name(&self) -> &'static str;

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Resource form of a scope, as managed identity and the CLI expect it
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

/// OAuth2 v2 form of a scope
pub fn resource_to_scope(resource: &str) -> String {
    if resource.ends_with("/.default") {
        resource.to_string()
    } else if resource.ends_with('/') {
        format!("{}.default", resource)
    } else {
        format!("{}/.default", resource)
    }
}

/// Parse an `expires_on` field given either as epoch seconds or a numeric string
pub(crate) fn parse_epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(seconds, 0).single()
}

/// Parse an `expires_in` field given in seconds from now
pub(crate) fn parse_expires_in(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(Utc::now() + Duration::seconds(seconds))
}

/// Credential chain used when no explicit credential is configured
pub struct DefaultAzureCredential {
    sources: Vec<Box<dyn TokenCredential>>,
}

impl DefaultAzureCredential {
    /// Build the chain from the process environment
    pub fn new() -> Result<Self, CredentialError> {
        Self::from_env(&ProcessEnv)
    }

    /// Build the chain from `env`; fails only if an HTTP client cannot be built
    pub fn from_env(env: &impl EnvSource) -> Result<Self, CredentialError> {
        let mut sources: Vec<Box<dyn TokenCredential>> = Vec::new();

        if let Some(credential) = EnvironmentCredential::from_env(env)? {
            sources.push(Box::new(credential));
        }
        if let Some(credential) = WorkloadIdentityCredential::from_env(env)? {
            sources.push(Box::new(credential));
        }
        sources.push(Box::new(ManagedIdentityCredential::from_env(env)?));
        sources.push(Box::new(AzureCliCredential::new()));

        Ok(Self { sources })
    }

    /// Chain over an explicit list of sources, tried in order
    pub fn with_sources(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenCredential for DefaultAzureCredential {
    fn name(&self) -> &'static str {
        "DefaultAzureCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut reasons = Vec::new();

        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    log::debug!("Acquired token for {} from {}", scope, source.name());
                    return Ok(token);
                }
                Err(e) if e.is_unavailable() => {
                    log::debug!("{}", e);
                    reasons.push(e.to_string());
                }
                Err(e) => {
                    log::warn!("{} failed: {}", source.name(), e);
                    return Err(e);
                }
            }
        }

        Err(CredentialError::ChainExhausted(reasons))
    }
}

/// A credential that always returns the same token
///
/// Useful when a token was obtained out of band, and in tests.
pub struct StaticTokenCredential {
    token: AccessToken,
    expected_scope: Option<String>,
}

impl StaticTokenCredential {
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            expected_scope: None,
        }
    }

    /// Refuse scopes other than `scope`
    pub fn with_expected_scope(mut self, scope: impl Into<String>) -> Self {
        self.expected_scope = Some(scope.into());
        self
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    fn name(&self) -> &'static str {
        "StaticTokenCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        match &self.expected_scope {
            Some(expected) if expected != scope => Err(CredentialError::authentication(
                self.name(),
                format!("unexpected scope {}", scope),
            )),
            _ => Ok(self.token.clone()),
        }
    }
}
