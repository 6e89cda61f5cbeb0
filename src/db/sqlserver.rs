// ABOUTME: Feature store (Azure SQL / MSSQL) connections using tiberius
// ABOUTME: Handles token or password login, cursors, and an engine that opens connections on demand

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, QueryStream, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::connection_string::{AuthenticationMode, ConnectionStringError, SqlConnectOptions};
use crate::auth::{
    db_aad_token_struct, ConnectAttrs, CredentialError, IdentitySource, ManagedIdentityCredential,
    TokenCredential, TokenError, DATABASE_SCOPE,
};
use crate::config::{ConfigError, FeatureStoreSettings};
use crate::models::{Cell, Table};

#[derive(Error, Debug)]
pub enum SqlServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection string error: {0}")]
    ConnectionString(#[from] ConnectionStringError),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Access token error: {0}")]
    Token(#[from] TokenError),
    #[error("Tiberius error: {0}")]
    Tiberius(#[from] tiberius::error::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported authentication mode: {0}")]
    UnsupportedAuthentication(String),
    #[error("SQL authentication requires a user name")]
    MissingUser,
    #[error("Login did not complete within {0:?}")]
    LoginTimeout(Duration),
}

type TdsClient = Client<Compat<TcpStream>>;

/// Pre-connect attributes for the feature store.
///
/// A connection string that names no authentication mode gets a packed AAD
/// token for the database scope; otherwise no attributes are set.
pub async fn connect_attrs(
    settings: &FeatureStoreSettings,
    credential: &dyn TokenCredential,
) -> Result<ConnectAttrs, CredentialError> {
    if settings.specifies_authentication() {
        return Ok(ConnectAttrs::new());
    }
    Ok(ConnectAttrs::with_access_token(
        db_aad_token_struct(credential).await?,
    ))
}

/// Decide how to log in
async fn auth_method(
    options: &SqlConnectOptions,
    attrs: &ConnectAttrs,
    credential: &dyn TokenCredential,
    identity: &IdentitySource,
) -> Result<AuthMethod, SqlServerError> {
    if let Some(token) = attrs.access_token()? {
        return Ok(AuthMethod::aad_token(token));
    }

    match &options.authentication {
        None | Some(AuthenticationMode::SqlPassword) => {
            let user = options.user.as_deref().ok_or(SqlServerError::MissingUser)?;
            Ok(AuthMethod::sql_server(
                user,
                options.password.as_deref().unwrap_or_default(),
            ))
        }
        Some(AuthenticationMode::ActiveDirectoryMsi) => {
            // Uid names a user-assigned identity, as with the ODBC driver
            let managed = ManagedIdentityCredential::new(identity.clone(), options.user.clone())?;
            let token = managed.get_token(DATABASE_SCOPE).await?;
            Ok(AuthMethod::aad_token(token.secret()))
        }
        Some(AuthenticationMode::ActiveDirectoryDefault) => {
            let token = credential.get_token(DATABASE_SCOPE).await?;
            Ok(AuthMethod::aad_token(token.secret()))
        }
        Some(AuthenticationMode::Other(mode)) => {
            Err(SqlServerError::UnsupportedAuthentication(mode.clone()))
        }
    }
}

fn tiberius_config(options: &SqlConnectOptions, auth: AuthMethod) -> Config {
    let mut config = Config::new();
    config.host(&options.host);
    config.port(options.port);
    config.encryption(options.encryption);
    config.authentication(auth);

    if let Some(database) = &options.database {
        config.database(database);
    }
    if let Some(name) = &options.application_name {
        config.application_name(name);
    }
    if options.trust_server_certificate {
        config.trust_cert();
    }

    config
}

async fn open_stream(config: &Config) -> Result<TcpStream, SqlServerError> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

async fn login(mut config: Config) -> Result<TdsClient, SqlServerError> {
    let tcp = open_stream(&config).await?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // The Azure SQL gateway may redirect to the node hosting the database
        Err(tiberius::error::Error::Routing { host, port }) => {
            log::debug!("Login redirected to {}:{}", host, port);
            config.host(&host);
            config.port(port);
            let tcp = open_stream(&config).await?;
            Ok(Client::connect(config, tcp.compat_write()).await?)
        }
        Err(e) => Err(e.into()),
    }
}

fn numeric_to_f64(value: i128, scale: u8) -> f64 {
    value as f64 / 10f64.powi(i32::from(scale))
}

fn cell_from_column(data: ColumnData<'static>) -> Result<Cell, SqlServerError> {
    // Temporal types go through tiberius' chrono conversions
    let temporal = match &data {
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            Some(NaiveDateTime::from_sql(&data)?.map(Cell::DateTime))
        }
        ColumnData::Date(_) => Some(NaiveDate::from_sql(&data)?.map(Cell::Date)),
        ColumnData::Time(_) => Some(NaiveTime::from_sql(&data)?.map(Cell::Time)),
        ColumnData::DateTimeOffset(_) => {
            Some(DateTime::<FixedOffset>::from_sql(&data)?.map(Cell::DateTimeOffset))
        }
        _ => None,
    };
    if let Some(cell) = temporal {
        return Ok(cell.unwrap_or(Cell::Null));
    }

    let cell = match data {
        ColumnData::U8(v) => v.map(|v| Cell::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| Cell::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| Cell::Int(v.into())),
        ColumnData::I64(v) => v.map(Cell::Int),
        ColumnData::F32(v) => v.map(|v| Cell::Float(v.into())),
        ColumnData::F64(v) => v.map(Cell::Float),
        ColumnData::Bit(v) => v.map(Cell::Bool),
        ColumnData::String(v) => v.map(|s| Cell::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(Cell::Guid),
        ColumnData::Binary(v) => v.map(|b| Cell::Bytes(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| Cell::Float(numeric_to_f64(n.value(), n.scale()))),
        ColumnData::Xml(v) => v.map(|x| Cell::Text(x.into_owned().into_string())),
        _ => None,
    };
    Ok(cell.unwrap_or(Cell::Null))
}

fn row_cells(row: Row) -> Result<Vec<Cell>, SqlServerError> {
    row.into_iter().map(cell_from_column).collect()
}

async fn collect_table(mut stream: QueryStream<'_>) -> Result<Table, SqlServerError> {
    let columns: Vec<String> = stream
        .columns()
        .await?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = stream
        .into_first_result()
        .await?
        .into_iter()
        .map(row_cells)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Table::new(columns, rows))
}

/// A live connection to the feature store
pub struct FeatureStoreConnection {
    client: TdsClient,
}

impl FeatureStoreConnection {
    /// Connect with explicit options and pre-connect attributes.
    ///
    /// `identity` is only used for `Authentication=ActiveDirectoryMsi`.
    pub async fn connect(
        options: &SqlConnectOptions,
        attrs: &ConnectAttrs,
        credential: &dyn TokenCredential,
        identity: &IdentitySource,
    ) -> Result<Self, SqlServerError> {
        let auth = auth_method(options, attrs, credential, identity).await?;
        let config = tiberius_config(options, auth);

        let client = match options.login_timeout {
            Some(limit) => tokio::time::timeout(limit, login(config))
                .await
                .map_err(|_| SqlServerError::LoginTimeout(limit))??,
            None => login(config).await?,
        };

        log::debug!(
            "Connected to {}:{} ({})",
            options.host,
            options.port,
            options.database.as_deref().unwrap_or("default database")
        );
        Ok(Self { client })
    }

    /// Connect from feature store settings, fetching a token when the
    /// connection string does not name an authentication mode
    pub async fn open(
        settings: &FeatureStoreSettings,
        credential: &dyn TokenCredential,
    ) -> Result<Self, SqlServerError> {
        let options = SqlConnectOptions::parse(&settings.connection_string)?;
        let attrs = connect_attrs(settings, credential).await?;
        Self::connect(&options, &attrs, credential, &settings.identity).await
    }

    /// Query the server version string
    pub async fn server_version(&mut self) -> Result<String, SqlServerError> {
        let table = self.read_table("SELECT @@VERSION").await?;
        Ok(table
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Cell::as_str)
            .unwrap_or("Unknown")
            .to_string())
    }

    /// Run a query and load its first result set
    pub async fn read_table(&mut self, sql: &str) -> Result<Table, SqlServerError> {
        let stream = self.client.simple_query(sql).await?;
        collect_table(stream).await
    }

    /// Run a parameterised query (`@P1`, `@P2`, ...) and load its first result set
    pub async fn query_table(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Table, SqlServerError> {
        let stream = self.client.query(sql, params).await?;
        collect_table(stream).await
    }

    /// Run a statement, returning the number of affected rows
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<u64, SqlServerError> {
        let result = self.client.execute(sql, params).await?;
        Ok(result.total())
    }

    /// A cursor that owns this connection
    pub fn cursor(self) -> Cursor {
        Cursor::new(self)
    }

    /// Close the connection gracefully
    pub async fn close(self) -> Result<(), SqlServerError> {
        self.client.close().await?;
        Ok(())
    }
}

/// Row-at-a-time access to query results over an owned connection
pub struct Cursor {
    connection: FeatureStoreConnection,
    description: Vec<String>,
    pending: VecDeque<Vec<Cell>>,
}

impl Cursor {
    fn new(connection: FeatureStoreConnection) -> Self {
        Self {
            connection,
            description: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Run a query, replacing any unread rows from the previous one
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<&mut Self, SqlServerError> {
        let table = if params.is_empty() {
            self.connection.read_table(sql).await?
        } else {
            self.connection.query_table(sql, params).await?
        };
        self.load(table);
        Ok(self)
    }

    fn load(&mut self, table: Table) {
        self.description = table.columns;
        self.pending = table.rows.into();
    }

    /// Column names of the last result set
    pub fn description(&self) -> &[String] {
        &self.description
    }

    pub fn fetch_one(&mut self) -> Option<Vec<Cell>> {
        self.pending.pop_front()
    }

    pub fn fetch_many(&mut self, n: usize) -> Vec<Vec<Cell>> {
        let n = n.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    pub fn fetch_all(&mut self) -> Vec<Vec<Cell>> {
        self.pending.drain(..).collect()
    }

    pub fn into_connection(self) -> FeatureStoreConnection {
        self.connection
    }
}

/// Opens feature store connections on demand
///
/// Each `connect` is a separate login, with a freshly acquired token when
/// token authentication applies.
pub struct FeatureStoreEngine {
    settings: FeatureStoreSettings,
    options: SqlConnectOptions,
    credential: Arc<dyn TokenCredential>,
}

impl FeatureStoreEngine {
    pub fn new(
        settings: FeatureStoreSettings,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, SqlServerError> {
        let options = SqlConnectOptions::parse(&settings.connection_string)?;
        Ok(Self {
            settings,
            options,
            credential,
        })
    }

    pub fn options(&self) -> &SqlConnectOptions {
        &self.options
    }

    pub async fn connect(&self) -> Result<FeatureStoreConnection, SqlServerError> {
        let attrs = connect_attrs(&self.settings, self.credential.as_ref()).await?;
        FeatureStoreConnection::connect(
            &self.options,
            &attrs,
            self.credential.as_ref(),
            &self.settings.identity,
        )
        .await
    }

    /// Connect, read one result set, and close
    pub async fn read_table(&self, sql: &str) -> Result<Table, SqlServerError> {
        let mut connection = self.connect().await?;
        let table = connection.read_table(sql).await?;
        connection.close().await?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, StaticTokenCredential};
    use async_trait::async_trait;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCredential {
        calls: AtomicUsize,
    }

    impl CountingCredential {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenCredential for CountingCredential {
        fn name(&self) -> &'static str {
            "CountingCredential"
        }

        async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
            assert_eq!(scope, DATABASE_SCOPE);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new(
                "counted-token",
                chrono::Utc::now() + chrono::Duration::hours(1),
            ))
        }
    }

    fn settings(connection_string: &str) -> FeatureStoreSettings {
        FeatureStoreSettings::new(connection_string)
    }

    fn imds() -> IdentitySource {
        IdentitySource::default()
    }

    /// A port with nothing listening on it
    fn closed_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_connect_attrs_pack_token_without_authentication_keyword() {
        let credential = CountingCredential::new();
        let attrs = connect_attrs(&settings("Server=x;Database=fs"), &credential)
            .await
            .unwrap();
        assert_eq!(attrs.access_token().unwrap().as_deref(), Some("counted-token"));
        assert_eq!(credential.calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_attrs_empty_when_authentication_named() {
        let credential = CountingCredential::new();
        let attrs = connect_attrs(
            &settings("Server=x;Authentication=ActiveDirectoryMsi"),
            &credential,
        )
        .await
        .unwrap();
        assert!(attrs.is_empty());
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_method_prefers_token_attribute() {
        let options = SqlConnectOptions::parse("Server=x;Uid=sa;Pwd=pw").unwrap();
        let packed = crate::auth::pack_access_token("tok").unwrap();
        let attrs = ConnectAttrs::with_access_token(packed);
        let credential = CountingCredential::new();

        let auth = auth_method(&options, &attrs, &credential, &imds()).await.unwrap();
        assert!(matches!(auth, AuthMethod::AADToken(ref t) if t == "tok"));
    }

    #[tokio::test]
    async fn test_auth_method_sql_password() {
        let credential = CountingCredential::new();
        let options =
            SqlConnectOptions::parse("Server=x;Uid=sa;Pwd=pw;Authentication=SqlPassword").unwrap();
        let auth = auth_method(&options, &ConnectAttrs::new(), &credential, &imds())
            .await
            .unwrap();
        assert!(matches!(auth, AuthMethod::SqlServer(_)));

        let options = SqlConnectOptions::parse("Server=x;Authentication=SqlPassword").unwrap();
        let err = auth_method(&options, &ConnectAttrs::new(), &credential, &imds())
            .await
            .unwrap_err();
        assert!(matches!(err, SqlServerError::MissingUser));
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_method_default_uses_credential() {
        let credential = CountingCredential::new();
        let options =
            SqlConnectOptions::parse("Server=x;Authentication=ActiveDirectoryDefault").unwrap();
        let auth = auth_method(&options, &ConnectAttrs::new(), &credential, &imds())
            .await
            .unwrap();
        assert!(matches!(auth, AuthMethod::AADToken(ref t) if t == "counted-token"));
        assert_eq!(credential.calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_method_msi_sends_uid_as_client_id() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/msi/token", server.server_addr().to_ip().unwrap());
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            let url = request.url().to_string();
            let body = r#"{"access_token":"msi-token","expires_on":1900000000}"#;
            request
                .respond(tiny_http::Response::from_string(body))
                .unwrap();
            url
        });

        let credential = CountingCredential::new();
        let options =
            SqlConnectOptions::parse("Server=x;Uid=8f3c-client;Authentication=ActiveDirectoryMsi")
                .unwrap();
        let identity = IdentitySource::Imds { endpoint };
        let auth = auth_method(&options, &ConnectAttrs::new(), &credential, &identity)
            .await
            .unwrap();
        assert!(matches!(auth, AuthMethod::AADToken(ref t) if t == "msi-token"));
        assert_eq!(credential.calls(), 0);

        let url = handle.join().unwrap();
        assert!(url.contains("client_id=8f3c-client"));
        assert!(url.contains("resource=https%3A%2F%2Fdatabase.windows.net%2F"));
    }

    #[tokio::test]
    async fn test_auth_method_rejects_unsupported_mode() {
        let credential = CountingCredential::new();
        let options =
            SqlConnectOptions::parse("Server=x;Authentication=ActiveDirectoryInteractive").unwrap();
        let err = auth_method(&options, &ConnectAttrs::new(), &credential, &imds())
            .await
            .unwrap_err();
        assert!(
            matches!(err, SqlServerError::UnsupportedAuthentication(ref m) if m == "ActiveDirectoryInteractive")
        );
    }

    #[test]
    fn test_tiberius_config_address() {
        let options = SqlConnectOptions::parse("Server=tcp:fs.database.windows.net,1433").unwrap();
        let config = tiberius_config(&options, AuthMethod::aad_token("t"));
        assert_eq!(config.get_addr(), "fs.database.windows.net:1433");
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(cell_from_column(ColumnData::I32(Some(7))).unwrap(), Cell::Int(7));
        assert_eq!(cell_from_column(ColumnData::I64(None)).unwrap(), Cell::Null);
        assert_eq!(
            cell_from_column(ColumnData::Bit(Some(true))).unwrap(),
            Cell::Bool(true)
        );
        assert_eq!(
            cell_from_column(ColumnData::String(Some(Cow::Borrowed("T03")))).unwrap(),
            Cell::Text("T03".to_string())
        );
        assert_eq!(
            cell_from_column(ColumnData::Binary(Some(Cow::Owned(vec![1, 2])))).unwrap(),
            Cell::Bytes(vec![1, 2])
        );
        assert_eq!(cell_from_column(ColumnData::DateTime2(None)).unwrap(), Cell::Null);
    }

    #[test]
    fn test_numeric_scaling() {
        assert_eq!(numeric_to_f64(12345, 2), 123.45);
        assert_eq!(numeric_to_f64(-5, 0), -5.0);
    }

    #[tokio::test]
    async fn test_open_fails_fast_on_bad_connection_string() {
        let credential = CountingCredential::new();
        let err = FeatureStoreConnection::open(&settings("Database=fs"), &credential)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SqlServerError::ConnectionString(ConnectionStringError::MissingKey("Server"))
        ));
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_fetches_token_before_connecting() {
        let credential = CountingCredential::new();
        let cs = format!("Server=tcp:127.0.0.1,{};Database=fs", closed_port());

        let err = FeatureStoreConnection::open(&settings(&cs), &credential)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SqlServerError::Io(_)));
        assert_eq!(credential.calls(), 1);
    }

    #[tokio::test]
    async fn test_login_timeout() {
        // Accepts the TCP handshake through the backlog but never answers prelogin
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let cs = format!(
            "Server=127.0.0.1,{};Uid=sa;Pwd=pw;Authentication=SqlPassword;Connection Timeout=1",
            port
        );
        let credential = StaticTokenCredential::new(AccessToken::new(
            "unused",
            chrono::Utc::now() + chrono::Duration::hours(1),
        ));

        let err = FeatureStoreConnection::open(&settings(&cs), &credential)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SqlServerError::LoginTimeout(d) if d == Duration::from_secs(1)));
        drop(listener);
    }

    #[tokio::test]
    async fn test_engine_acquires_token_per_connect() {
        let credential = Arc::new(CountingCredential::new());
        let cs = format!("Server=127.0.0.1,{}", closed_port());
        let engine = FeatureStoreEngine::new(settings(&cs), credential.clone()).unwrap();
        assert_eq!(engine.options().host, "127.0.0.1");

        assert!(engine.connect().await.is_err());
        assert!(engine.connect().await.is_err());
        assert_eq!(credential.calls(), 2);
    }
}
