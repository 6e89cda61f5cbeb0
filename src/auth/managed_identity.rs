// ABOUTME: Managed identity credential for Azure-hosted processes
// ABOUTME: Uses the App Service identity endpoint when present, otherwise IMDS

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::credential::{
    parse_epoch_seconds, scope_to_resource, AccessToken, CredentialError, TokenCredential,
};
use super::environment::AZURE_CLIENT_ID;
use crate::config::EnvSource;

pub const IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
pub const IDENTITY_HEADER: &str = "IDENTITY_HEADER";

pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: Value,
}

/// Where the identity token comes from
#[derive(Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// App Service / Functions local identity endpoint and its secret header
    AppService { endpoint: String, secret: String },
    /// Azure Instance Metadata Service on VMs, AKS and Container Apps
    Imds { endpoint: String },
}

impl IdentitySource {
    /// App Service when both `IDENTITY_ENDPOINT` and `IDENTITY_HEADER` are set, IMDS otherwise
    pub fn from_env(env: &impl EnvSource) -> Self {
        match (env.var(IDENTITY_ENDPOINT), env.var(IDENTITY_HEADER)) {
            (Some(endpoint), Some(secret)) => IdentitySource::AppService { endpoint, secret },
            _ => IdentitySource::default(),
        }
    }
}

impl Default for IdentitySource {
    fn default() -> Self {
        IdentitySource::Imds {
            endpoint: IMDS_ENDPOINT.to_string(),
        }
    }
}

impl std::fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentitySource::AppService { endpoint, .. } => f
                .debug_struct("AppService")
                .field("endpoint", endpoint)
                .field("secret", &"<redacted>")
                .finish(),
            IdentitySource::Imds { endpoint } => {
                f.debug_struct("Imds").field("endpoint", endpoint).finish()
            }
        }
    }
}

pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: IdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Pick the identity source from the environment; a user-assigned identity
    /// is selected with `AZURE_CLIENT_ID`
    pub fn from_env(env: &impl EnvSource) -> Result<Self, CredentialError> {
        Self::new(IdentitySource::from_env(env), env.var(AZURE_CLIENT_ID))
    }

    pub fn new(source: IdentitySource, client_id: Option<String>) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;

        Ok(Self {
            http,
            source,
            client_id,
        })
    }

    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    fn request(&self, resource: &str) -> reqwest::RequestBuilder {
        let mut query = vec![("resource", resource.to_string())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }

        match &self.source {
            IdentitySource::AppService { endpoint, secret } => {
                query.push(("api-version", APP_SERVICE_API_VERSION.to_string()));
                self.http
                    .get(endpoint)
                    .query(&query)
                    .header("X-IDENTITY-HEADER", secret)
            }
            IdentitySource::Imds { endpoint } => {
                query.push(("api-version", IMDS_API_VERSION.to_string()));
                self.http
                    .get(endpoint)
                    .query(&query)
                    .header("Metadata", "true")
            }
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "ManagedIdentityCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope_to_resource(scope);

        let response = match self.request(resource).send().await {
            Ok(response) => response,
            // No endpoint listening means we are not on an Azure host
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(CredentialError::unavailable(
                    self.name(),
                    format!("identity endpoint unreachable: {}", e),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // IMDS answers 400 when no identity is assigned to the host
            return Err(if status.as_u16() == 400 {
                CredentialError::unavailable(self.name(), format!("no identity assigned: {}", body))
            } else {
                CredentialError::authentication(self.name(), format!("HTTP {}: {}", status, body))
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let expires_on = parse_epoch_seconds(&parsed.expires_on).ok_or_else(|| {
            CredentialError::InvalidResponse(format!("bad expires_on: {}", parsed.expires_on))
        })?;

        Ok(AccessToken::new(parsed.access_token, expires_on))
    }
}
