// ABOUTME: Service principal credentials configured through AZURE_* environment variables
// ABOUTME: Client secret and federated (workload identity) assertions via the OAuth2 v2 endpoint

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use super::credential::{
    parse_expires_in, resource_to_scope, AccessToken, CredentialError, TokenCredential,
};
use crate::config::EnvSource;

pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Value,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum ClientProof {
    Secret(String),
    AssertionFile(PathBuf),
}

/// OAuth2 client-credentials grant against a Microsoft identity authority
struct ClientCredentialFlow {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    proof: ClientProof,
}

impl ClientCredentialFlow {
    fn new(
        env: &impl EnvSource,
        tenant_id: String,
        client_id: String,
        proof: ClientProof,
    ) -> Result<Self, CredentialError> {
        let authority_host = env
            .var(AZURE_AUTHORITY_HOST)
            .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string());

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            authority_host,
            tenant_id,
            client_id,
            proof,
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    async fn request(
        &self,
        credential: &'static str,
        scope: &str,
    ) -> Result<AccessToken, CredentialError> {
        let scope = resource_to_scope(scope);
        let mut form = vec![
            ("client_id", self.client_id.clone()),
            ("scope", scope),
            ("grant_type", "client_credentials".to_string()),
        ];

        match &self.proof {
            ClientProof::Secret(secret) => form.push(("client_secret", secret.clone())),
            ClientProof::AssertionFile(path) => {
                // Federated tokens are rotated on disk, so re-read on every request
                let assertion = tokio::fs::read_to_string(path).await.map_err(|e| {
                    CredentialError::unavailable(
                        credential,
                        format!("cannot read {}: {}", path.display(), e),
                    )
                })?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                form.push(("client_assertion", assertion.trim().to_string()));
            }
        }

        let response = self.http.post(self.token_url()).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}", status),
            };
            return Err(CredentialError::authentication(credential, message));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let expires_on = parse_expires_in(&parsed.expires_in).ok_or_else(|| {
            CredentialError::InvalidResponse(format!("bad expires_in: {}", parsed.expires_in))
        })?;

        Ok(AccessToken::new(parsed.access_token, expires_on))
    }
}

/// Service principal with a client secret from `AZURE_TENANT_ID`,
/// `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`
pub struct EnvironmentCredential {
    flow: ClientCredentialFlow,
}

impl EnvironmentCredential {
    /// Returns `Ok(None)` unless all three variables are set
    pub fn from_env(env: &impl EnvSource) -> Result<Option<Self>, CredentialError> {
        let (Some(tenant_id), Some(client_id), Some(secret)) = (
            env.var(AZURE_TENANT_ID),
            env.var(AZURE_CLIENT_ID),
            env.var(AZURE_CLIENT_SECRET),
        ) else {
            return Ok(None);
        };

        let flow = ClientCredentialFlow::new(env, tenant_id, client_id, ClientProof::Secret(secret))?;
        Ok(Some(Self { flow }))
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &'static str {
        "EnvironmentCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        self.flow.request(self.name(), scope).await
    }
}

/// Kubernetes workload identity: a federated token file exchanged for an AAD token
pub struct WorkloadIdentityCredential {
    flow: ClientCredentialFlow,
}

impl WorkloadIdentityCredential {
    /// Returns `Ok(None)` unless the token file, tenant and client id are all set
    pub fn from_env(env: &impl EnvSource) -> Result<Option<Self>, CredentialError> {
        let (Some(token_file), Some(tenant_id), Some(client_id)) = (
            env.var(AZURE_FEDERATED_TOKEN_FILE),
            env.var(AZURE_TENANT_ID),
            env.var(AZURE_CLIENT_ID),
        ) else {
            return Ok(None);
        };

        let flow = ClientCredentialFlow::new(
            env,
            tenant_id,
            client_id,
            ClientProof::AssertionFile(PathBuf::from(token_file)),
        )?;
        Ok(Some(Self { flow }))
    }
}

#[async_trait]
impl TokenCredential for WorkloadIdentityCredential {
    fn name(&self) -> &'static str {
        "WorkloadIdentityCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        self.flow.request(self.name(), scope).await
    }
}
