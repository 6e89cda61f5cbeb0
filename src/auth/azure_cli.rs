// ABOUTME: Azure CLI credential for developer machines
// ABOUTME: Shells out to `az account get-access-token` and parses its JSON output

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::process::Output;
use tokio::process::Command;

use super::credential::{
    parse_epoch_seconds, scope_to_resource, AccessToken, CredentialError, TokenCredential,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    // Newer CLI versions also emit epoch seconds under a snake_case key
    #[serde(rename = "expires_on", default)]
    expires_on_epoch: Option<Value>,
}

pub struct AzureCliCredential {
    tenant_id: Option<String>,
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self { tenant_id: None }
    }

    pub fn with_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
        }
    }

    fn command(&self, resource: &str) -> Command {
        let mut args = vec![
            "account",
            "get-access-token",
            "--output",
            "json",
            "--resource",
            resource,
        ];
        if let Some(tenant) = &self.tenant_id {
            args.push("--tenant");
            args.push(tenant);
        }

        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg("az");
            c
        } else {
            Command::new("az")
        };
        command.args(args);
        command
    }

    fn interpret(&self, output: Output) -> Result<AccessToken, CredentialError> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim().to_string();
            return Err(if is_not_logged_in(&message) || is_not_installed(&message) {
                CredentialError::unavailable(self.name(), message)
            } else {
                CredentialError::authentication(self.name(), message)
            });
        }

        parse_cli_token(&output.stdout)
    }
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

fn is_not_logged_in(stderr: &str) -> bool {
    stderr.contains("az login") || stderr.contains("az account set")
}

fn is_not_installed(stderr: &str) -> bool {
    // `cmd /C az` on Windows, `sh` style messages elsewhere
    stderr.contains("is not recognized as an internal or external command")
        || stderr.contains("command not found")
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, CredentialError> {
    let token: CliToken = serde_json::from_slice(stdout)?;

    let expires_on = token
        .expires_on_epoch
        .as_ref()
        .and_then(parse_epoch_seconds)
        .or_else(|| token.expires_on.as_deref().and_then(parse_local_datetime))
        .ok_or_else(|| CredentialError::InvalidResponse("missing token expiry".to_string()))?;

    Ok(AccessToken::new(token.access_token, expires_on))
}

/// `expiresOn` is printed in the machine's local time zone
fn parse_local_datetime(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "AzureCliCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope_to_resource(scope);

        let output = match self.command(resource).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::unavailable(
                    self.name(),
                    "Azure CLI not found on path",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        self.interpret(output)
    }
}
