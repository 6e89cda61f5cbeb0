// ABOUTME: Cosmos DB (SQL API) client for the application state store
// ABOUTME: Signs REST requests with the account key or an AAD token and maps documents via serde

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::auth::{CredentialError, TokenCredential};
use crate::config::{ConfigError, CosmosAuth, CosmosSettings};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2018-12-31";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum CosmosError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("Account key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("Account key cannot be used for signing: {0}")]
    KeyLength(#[from] hmac::digest::InvalidLength),
    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("Cosmos DB returned {status}: {message}")]
    Status { status: StatusCode, message: String },
}

/// How requests are authorised
#[derive(Clone)]
pub enum CosmosCredential {
    /// Account master key (base64), signed per request with HMAC-SHA256
    MasterKey(String),
    /// Azure identity, sent as an AAD bearer token
    Token(Arc<dyn TokenCredential>),
}

/// Split a resource path into (resource type, resource link) as the
/// signature expects. `dbs/a/colls/b/docs` → (`docs`, `dbs/a/colls/b`),
/// `dbs/a/colls/b` → (`colls`, `dbs/a/colls/b`).
fn resource_parts(path: &str) -> (String, String) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return (String::new(), String::new());
    }
    if segments.len() % 2 == 1 {
        let link = segments[..segments.len() - 1].join("/");
        (segments[segments.len() - 1].to_string(), link)
    } else {
        (segments[segments.len() - 2].to_string(), segments.join("/"))
    }
}

/// Base64 HMAC-SHA256 signature over the canonical request string
fn master_key_signature(
    key: &[u8],
    verb: &Method,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String, CosmosError> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.as_str().to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn encode_authorization(kind: &str, sig: &str) -> String {
    let raw = format!("type={}&ver=1.0&sig={}", kind, sig);
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct DatabaseList {
    #[serde(rename = "Databases")]
    databases: Vec<Value>,
}

#[derive(Deserialize)]
struct ContainerList {
    #[serde(rename = "DocumentCollections")]
    collections: Vec<Value>,
}

#[derive(Deserialize)]
struct DocumentPage<T> {
    #[serde(rename = "Documents")]
    documents: Vec<T>,
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    parameters: Vec<QueryParameter<'a>>,
}

#[derive(Serialize)]
struct QueryParameter<'a> {
    name: &'a str,
    value: &'a Value,
}

/// Request signer with the account key already decoded
enum Signer {
    MasterKey(Vec<u8>),
    Token(Arc<dyn TokenCredential>),
}

/// Client for one Cosmos DB account
pub struct CosmosClient {
    http: reqwest::Client,
    endpoint: Url,
    signer: Signer,
}

impl CosmosClient {
    /// Build a client; `verify_tls` is turned off only for the local emulator
    pub fn new(
        endpoint: &str,
        credential: CosmosCredential,
        verify_tls: bool,
    ) -> Result<Self, CosmosError> {
        let endpoint = Url::parse(endpoint)?;
        let signer = match credential {
            CosmosCredential::MasterKey(key) => Signer::MasterKey(STANDARD.decode(key.trim())?),
            CosmosCredential::Token(credential) => Signer::Token(credential),
        };

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            signer,
        })
    }

    /// Build a client from state store settings
    pub fn from_settings(
        settings: &CosmosSettings,
        identity: Arc<dyn TokenCredential>,
    ) -> Result<Self, CosmosError> {
        let credential = match &settings.auth {
            CosmosAuth::SharedKey(key) => CosmosCredential::MasterKey(key.clone()),
            CosmosAuth::Identity => CosmosCredential::Token(identity),
        };
        Self::new(&settings.endpoint, credential, settings.verify_tls)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// AAD scope for this account, e.g. `https://acct.documents.azure.com/.default`
    pub fn scope(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        format!("{}://{}/.default", self.endpoint.scheme(), host)
    }

    async fn authorization(
        &self,
        verb: &Method,
        path: &str,
        date: &str,
    ) -> Result<String, CosmosError> {
        match &self.signer {
            Signer::MasterKey(key) => {
                let (resource_type, resource_link) = resource_parts(path);
                let sig = master_key_signature(key, verb, &resource_type, &resource_link, date)?;
                Ok(encode_authorization("master", &sig))
            }
            Signer::Token(credential) => {
                let token = credential.get_token(&self.scope()).await?;
                Ok(encode_authorization("aad", token.secret()))
            }
        }
    }

    /// Resolve a resource path against the endpoint, percent-encoding each id
    fn url(&self, path: &str) -> Result<Url, CosmosError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    async fn send(
        &self,
        verb: Method,
        path: &str,
        extra: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, CosmosError> {
        let date = rfc1123_now();
        let authorization = self.authorization(&verb, path, &date).await?;
        let url = self.url(path)?;

        let mut request = self
            .http
            .request(verb, url)
            .header("authorization", HeaderValue::from_str(&authorization)?)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .headers(extra);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await?;
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody {
                code: Some(code),
                message: Some(message),
            }) => format!("{}: {}", code, message),
            Ok(ErrorBody {
                message: Some(message),
                ..
            }) => message,
            _ => text,
        };
        Err(CosmosError::Status { status, message })
    }

    /// Account properties; a cheap way to verify connectivity and auth
    pub async fn account(&self) -> Result<Value, CosmosError> {
        let response = self.send(Method::GET, "", HeaderMap::new(), None).await?;
        Ok(response.json().await?)
    }

    pub async fn list_databases(&self) -> Result<Vec<Value>, CosmosError> {
        let response = self.send(Method::GET, "dbs", HeaderMap::new(), None).await?;
        let list: DatabaseList = response.json().await?;
        Ok(list.databases)
    }

    pub fn database(&self, id: impl Into<String>) -> DatabaseClient<'_> {
        DatabaseClient {
            client: self,
            id: id.into(),
        }
    }
}

/// A database within the account
pub struct DatabaseClient<'a> {
    client: &'a CosmosClient,
    id: String,
}

impl<'a> DatabaseClient<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> String {
        format!("dbs/{}", self.id)
    }

    pub async fn read(&self) -> Result<Value, CosmosError> {
        let response = self
            .client
            .send(Method::GET, &self.path(), HeaderMap::new(), None)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn list_containers(&self) -> Result<Vec<Value>, CosmosError> {
        let path = format!("{}/colls", self.path());
        let response = self
            .client
            .send(Method::GET, &path, HeaderMap::new(), None)
            .await?;
        let list: ContainerList = response.json().await?;
        Ok(list.collections)
    }

    pub fn container(&self, id: impl Into<String>) -> ContainerClient<'a> {
        ContainerClient {
            client: self.client,
            database: self.id.clone(),
            id: id.into(),
        }
    }
}

/// A container and the documents in it
pub struct ContainerClient<'a> {
    client: &'a CosmosClient,
    database: String,
    id: String,
}

impl<'a> ContainerClient<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.id)
    }

    fn partition_headers(partition_key: &Value) -> Result<HeaderMap, CosmosError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ms-documentdb-partitionkey",
            HeaderValue::from_str(&json!([partition_key]).to_string())?,
        );
        Ok(headers)
    }

    /// Read a document by id; a missing document is `None`
    pub async fn read_item<T: DeserializeOwned>(
        &self,
        id: &str,
        partition_key: &Value,
    ) -> Result<Option<T>, CosmosError> {
        let path = format!("{}/docs/{}", self.path(), id);
        let headers = Self::partition_headers(partition_key)?;

        match self.client.send(Method::GET, &path, headers, None).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(CosmosError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create or replace a document, returning the stored version
    pub async fn upsert_item<T: Serialize, R: DeserializeOwned>(
        &self,
        item: &T,
        partition_key: &Value,
    ) -> Result<R, CosmosError> {
        let path = format!("{}/docs", self.path());
        let mut headers = Self::partition_headers(partition_key)?;
        headers.insert("x-ms-documentdb-is-upsert", HeaderValue::from_static("True"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = serde_json::to_vec(item)?;
        let response = self
            .client
            .send(Method::POST, &path, headers, Some(body))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn delete_item(&self, id: &str, partition_key: &Value) -> Result<(), CosmosError> {
        let path = format!("{}/docs/{}", self.path(), id);
        let headers = Self::partition_headers(partition_key)?;
        self.client
            .send(Method::DELETE, &path, headers, None)
            .await?;
        Ok(())
    }

    /// Run a SQL query across partitions, following continuation tokens
    pub async fn query_items<T: DeserializeOwned>(
        &self,
        query: &str,
        parameters: &[(&str, Value)],
    ) -> Result<Vec<T>, CosmosError> {
        let path = format!("{}/docs", self.path());
        let body = serde_json::to_vec(&QueryBody {
            query,
            parameters: parameters
                .iter()
                .map(|(name, value)| QueryParameter { name, value })
                .collect(),
        })?;

        let mut items = Vec::new();
        let mut continuation: Option<HeaderValue> = None;

        loop {
            let mut headers = HeaderMap::new();
            headers.insert("x-ms-documentdb-isquery", HeaderValue::from_static("True"));
            headers.insert(
                "x-ms-documentdb-query-enablecrosspartition",
                HeaderValue::from_static("True"),
            );
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/query+json"),
            );
            if let Some(token) = continuation.take() {
                headers.insert("x-ms-continuation", token);
            }

            let response = self
                .client
                .send(Method::POST, &path, headers, Some(body.clone()))
                .await?;
            continuation = response
                .headers()
                .get("x-ms-continuation")
                .filter(|v| !v.is_empty())
                .cloned();

            let page: DocumentPage<T> = response.json().await?;
            items.extend(page.documents);

            if continuation.is_none() {
                break;
            }
        }

        Ok(items)
    }
}
