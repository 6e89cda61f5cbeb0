// ABOUTME: Connection helpers for the MSSQL feature store and the Cosmos DB state store
// ABOUTME: Contains module declarations and the environment-driven entry points

use std::sync::Arc;

// Module declarations
pub mod auth;
pub mod config;
pub mod db;
pub mod models;

pub use auth::{AccessToken, CredentialError, DefaultAzureCredential, TokenCredential};
pub use config::{is_local, ConfigError, EnvSource, ProcessEnv};
pub use db::{
    CosmosClient, CosmosError, Cursor, FeatureStoreConnection, FeatureStoreEngine, SqlServerError,
};
pub use models::{Cell, Table};

use config::{CosmosSettings, FeatureStoreSettings};

/// Packed AAD token for the database scope, from the default credential chain
pub async fn db_token_struct() -> Result<Vec<u8>, CredentialError> {
    auth::db_aad_token_struct(&DefaultAzureCredential::new()?).await
}

/// Connection to the feature store, configured from the environment
pub async fn feature_store_connection() -> Result<FeatureStoreConnection, SqlServerError> {
    let credential = DefaultAzureCredential::new()?;
    feature_store_connection_with(&ProcessEnv, &credential).await
}

pub async fn feature_store_connection_with(
    env: &impl EnvSource,
    credential: &dyn TokenCredential,
) -> Result<FeatureStoreConnection, SqlServerError> {
    let settings = FeatureStoreSettings::from_env(env)?;
    let connection = FeatureStoreConnection::open(&settings, credential).await?;
    log::info!("Feature store connection created and returned");
    Ok(connection)
}

/// Cursor for running queries against the feature store
pub async fn feature_store_cursor() -> Result<Cursor, SqlServerError> {
    let credential = DefaultAzureCredential::new()?;
    feature_store_cursor_with(&ProcessEnv, &credential).await
}

pub async fn feature_store_cursor_with(
    env: &impl EnvSource,
    credential: &dyn TokenCredential,
) -> Result<Cursor, SqlServerError> {
    let settings = FeatureStoreSettings::from_env(env)?;
    let cursor = FeatureStoreConnection::open(&settings, credential)
        .await?
        .cursor();
    log::info!("Feature store cursor created and returned");
    Ok(cursor)
}

/// Engine that opens feature store connections on demand
pub fn feature_store_engine() -> Result<FeatureStoreEngine, SqlServerError> {
    feature_store_engine_with(&ProcessEnv, Arc::new(DefaultAzureCredential::new()?))
}

pub fn feature_store_engine_with(
    env: &impl EnvSource,
    credential: Arc<dyn TokenCredential>,
) -> Result<FeatureStoreEngine, SqlServerError> {
    let settings = FeatureStoreSettings::from_env(env)?;
    FeatureStoreEngine::new(settings, credential)
}

/// Cosmos DB client for the state store
pub fn cosmos_client() -> Result<CosmosClient, CosmosError> {
    cosmos_client_with(&ProcessEnv, Arc::new(DefaultAzureCredential::new()?))
}

pub fn cosmos_client_with(
    env: &impl EnvSource,
    identity: Arc<dyn TokenCredential>,
) -> Result<CosmosClient, CosmosError> {
    let settings = CosmosSettings::from_env(env)?;
    let client = CosmosClient::from_settings(&settings, identity)?;
    log::info!("Cosmos client created.");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::managed_identity::{IDENTITY_ENDPOINT, IDENTITY_HEADER};
    use crate::auth::StaticTokenCredential;
    use crate::config::{
        COSMOSDB_ENDPOINT, COSMOSDB_KEY, ENVIRONMENT, FEATURE_STORE_CONNECTION_STRING,
    };
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn credential() -> StaticTokenCredential {
        StaticTokenCredential::new(AccessToken::new(
            "token",
            chrono::Utc::now() + chrono::Duration::hours(1),
        ))
    }

    fn is_missing(err: &ConfigError, name: &str) -> bool {
        matches!(err, ConfigError::MissingVar(var) if var == name)
    }

    #[tokio::test]
    async fn test_connection_requires_connection_string() {
        let err = feature_store_connection_with(&env(&[]), &credential())
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, SqlServerError::Config(ref e) if is_missing(e, FEATURE_STORE_CONNECTION_STRING))
        );
    }

    #[tokio::test]
    async fn test_cursor_requires_connection_string() {
        let err = feature_store_cursor_with(&env(&[(ENVIRONMENT, "prod")]), &credential())
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, SqlServerError::Config(ref e) if is_missing(e, FEATURE_STORE_CONNECTION_STRING))
        );
    }

    #[tokio::test]
    async fn test_connection_msi_uses_identity_endpoint_from_env() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/msi/token", server.server_addr().to_ip().unwrap());
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            let url = request.url().to_string();
            let secret = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("X-IDENTITY-HEADER"))
                .map(|h| h.value.as_str().to_string());
            let body = r#"{"access_token":"msi-token","expires_on":1900000000}"#;
            request
                .respond(tiny_http::Response::from_string(body))
                .unwrap();
            (url, secret)
        });

        // Token is fetched before the TCP connect, which then fails
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let cs = format!(
            "Server=tcp:127.0.0.1,{};Uid=app-client;Authentication=ActiveDirectoryMsi",
            port
        );
        let env = env(&[
            (FEATURE_STORE_CONNECTION_STRING, cs.as_str()),
            (IDENTITY_ENDPOINT, endpoint.as_str()),
            (IDENTITY_HEADER, "from-env-secret"),
        ]);

        let err = feature_store_connection_with(&env, &credential())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SqlServerError::Io(_)));

        let (url, secret) = handle.join().unwrap();
        assert!(url.starts_with("/msi/token?"));
        assert!(url.contains("client_id=app-client"));
        assert_eq!(secret.as_deref(), Some("from-env-secret"));
    }

    #[test]
    fn test_engine_requires_connection_string() {
        let err = feature_store_engine_with(&env(&[]), Arc::new(credential()))
            .err()
            .unwrap();
        assert!(
            matches!(err, SqlServerError::Config(ref e) if is_missing(e, FEATURE_STORE_CONNECTION_STRING))
        );
    }

    #[test]
    fn test_engine_from_env() {
        let engine = feature_store_engine_with(
            &env(&[(
                FEATURE_STORE_CONNECTION_STRING,
                "Driver={ODBC Driver 18 for SQL Server};Server=tcp:fs.database.windows.net,1433;Database=fs",
            )]),
            Arc::new(credential()),
        )
        .unwrap();
        assert_eq!(engine.options().host, "fs.database.windows.net");
    }

    #[test]
    fn test_cosmos_requires_endpoint() {
        let err = cosmos_client_with(&env(&[]), Arc::new(credential()))
            .err()
            .unwrap();
        assert!(matches!(err, CosmosError::Config(ref e) if is_missing(e, COSMOSDB_ENDPOINT)));
    }

    #[test]
    fn test_cosmos_local_requires_key() {
        let err = cosmos_client_with(
            &env(&[
                (ENVIRONMENT, "local"),
                (COSMOSDB_ENDPOINT, "https://localhost:8081/"),
            ]),
            Arc::new(credential()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CosmosError::Config(ref e) if is_missing(e, COSMOSDB_KEY)));
    }

    #[test]
    fn test_cosmos_deployed_uses_identity() {
        let client = cosmos_client_with(
            &env(&[
                (ENVIRONMENT, "prod"),
                (COSMOSDB_ENDPOINT, "https://acct.documents.azure.com:443/"),
            ]),
            Arc::new(credential()),
        )
        .unwrap();
        assert_eq!(client.scope(), "https://acct.documents.azure.com/.default");
    }
}
