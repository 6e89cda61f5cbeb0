// ABOUTME: Environment-driven configuration for the feature store and state store
// ABOUTME: Handles environment detection, required variable lookup and .env loading

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::auth::IdentitySource;

/// Deployment environment name; unset means a developer machine
pub const ENVIRONMENT: &str = "ENVIRONMENT";
/// ODBC connection string for the MSSQL feature store
pub const FEATURE_STORE_CONNECTION_STRING: &str = "FEATURE_STORE_CONNECTION_STRING";
/// Cosmos DB account endpoint, e.g. https://account.documents.azure.com:443/
pub const COSMOSDB_ENDPOINT: &str = "COSMOSDB_ENDPOINT";
/// Cosmos DB primary key, only read in the `local` environment
pub const COSMOSDB_KEY: &str = "COSMOSDB_KEY";

/// Environment name assumed when `ENVIRONMENT` is not set
pub const DEFAULT_ENVIRONMENT: &str = "dev";
/// Environment name that switches the Cosmos client to shared key auth
pub const LOCAL_ENVIRONMENT: &str = "local";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable not set: {0}")]
    MissingVar(String),
    #[error("Failed to load environment file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// Source of environment variables
///
/// The process environment in production, a plain map in tests.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;

    /// Look up a variable that must be present
    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.var(key)
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    }
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<T: EnvSource + ?Sized> EnvSource for &T {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// The environment this process runs in, read once from `ENVIRONMENT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    name: Option<String>,
}

impl RuntimeEnvironment {
    pub fn detect(env: &impl EnvSource) -> Self {
        Self {
            name: env.var(ENVIRONMENT),
        }
    }

    /// True when `ENVIRONMENT` is unset
    pub fn is_local(&self) -> bool {
        self.name.is_none()
    }

    /// Environment name, falling back to `dev`
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    /// True only when `ENVIRONMENT=local`, where the Cosmos emulator or a
    /// shared key is used instead of an Azure identity
    pub fn uses_shared_key(&self) -> bool {
        self.name() == LOCAL_ENVIRONMENT
    }
}

/// Whether the current process is running on a developer machine
pub fn is_local() -> bool {
    RuntimeEnvironment::detect(&ProcessEnv).is_local()
}

/// Settings for the MSSQL feature store
#[derive(Clone)]
pub struct FeatureStoreSettings {
    pub connection_string: String,
    /// Token endpoint for `Authentication=ActiveDirectoryMsi`
    pub identity: IdentitySource,
}

impl FeatureStoreSettings {
    /// Settings for `connection_string`, with the IMDS identity endpoint
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            identity: IdentitySource::default(),
        }
    }

    pub fn from_env(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            connection_string: env.require(FEATURE_STORE_CONNECTION_STRING)?,
            identity: IdentitySource::from_env(env),
        })
    }

    /// Whether the connection string names its own authentication mode.
    ///
    /// When it does not, an AAD access token is supplied before connecting.
    pub fn specifies_authentication(&self) -> bool {
        self.connection_string
            .to_lowercase()
            .contains("authentication")
    }
}

impl std::fmt::Debug for FeatureStoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStoreSettings")
            .field("connection_string", &"<redacted>")
            .field("identity", &self.identity)
            .finish()
    }
}

/// How the Cosmos client authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum CosmosAuth {
    /// Account key, used against the emulator or in local development
    SharedKey(String),
    /// Azure identity resolved through the default credential chain
    Identity,
}

impl std::fmt::Debug for CosmosAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CosmosAuth::SharedKey(_) => f.write_str("SharedKey(<redacted>)"),
            CosmosAuth::Identity => f.write_str("Identity"),
        }
    }
}

/// Settings for the Cosmos DB state store
#[derive(Debug, Clone)]
pub struct CosmosSettings {
    pub endpoint: String,
    pub environment: RuntimeEnvironment,
    pub auth: CosmosAuth,
    pub verify_tls: bool,
}

impl CosmosSettings {
    pub fn from_env(env: &impl EnvSource) -> Result<Self, ConfigError> {
        let environment = RuntimeEnvironment::detect(env);
        let endpoint = env.require(COSMOSDB_ENDPOINT)?;

        let auth = if environment.uses_shared_key() {
            CosmosAuth::SharedKey(env.require(COSMOSDB_KEY)?)
        } else {
            CosmosAuth::Identity
        };

        Ok(Self {
            endpoint,
            verify_tls: !environment.uses_shared_key(),
            environment,
            auth,
        })
    }
}

/// Load a dotenv file into the process environment.
///
/// Returns `Ok(false)` when the file does not exist. Variables already set in
/// the process take precedence over the file.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<bool, ConfigError> {
    let path = path.as_ref();
    match dotenvy::from_path(path) {
        Ok(()) => {
            log::info!("Loaded environment from {}", path.display());
            Ok(true)
        }
        Err(e) if e.not_found() => {
            log::debug!("No environment file at {}", path.display());
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
