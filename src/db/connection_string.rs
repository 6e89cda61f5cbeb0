// ABOUTME: ODBC-style connection string parsing for the feature store
// ABOUTME: Turns `Key=Value;` pairs into typed connect options for tiberius

use std::time::Duration;
use thiserror::Error;
use tiberius::EncryptionLevel;

pub const DEFAULT_PORT: u16 = 1433;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("Malformed connection string: {0}")]
    Malformed(String),
    #[error("Connection string is missing {0}")]
    MissingKey(&'static str),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Raw `key=value` pairs with keys lower-cased
#[derive(Clone, Default)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let mut pairs = Vec::new();
        let mut chars = input.chars().peekable();

        loop {
            // Key runs up to '='
            let mut key = String::new();
            let mut has_value = false;
            for c in chars.by_ref() {
                if c == '=' {
                    has_value = true;
                    break;
                }
                if c == ';' && key.trim().is_empty() {
                    key.clear();
                    continue;
                }
                if c == ';' {
                    return Err(ConnectionStringError::Malformed(format!(
                        "key without value: {}",
                        key.trim()
                    )));
                }
                key.push(c);
            }

            let key = key.trim().to_lowercase();
            if key.is_empty() {
                if chars.peek().is_none() {
                    break;
                }
                return Err(ConnectionStringError::Malformed("empty key".to_string()));
            }
            if !has_value {
                return Err(ConnectionStringError::Malformed(format!(
                    "key without value: {}",
                    key
                )));
            }

            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.peek() == Some(&'{') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '}' {
                        // `}}` inside braces is an escaped brace
                        if chars.peek() == Some(&'}') {
                            chars.next();
                            value.push('}');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(ConnectionStringError::Malformed(format!(
                        "unterminated brace in value for {}",
                        key
                    )));
                }
                // Only whitespace may sit between the closing brace and ';'
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        return Err(ConnectionStringError::Malformed(format!(
                            "unexpected text after braced value for {}",
                            key
                        )));
                    }
                }
            } else {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }

            pairs.push((key, value));

            if chars.peek().is_none() {
                break;
            }
        }

        Ok(Self { pairs })
    }

    /// Last value set under any of `keys`
    pub fn get(&self, keys: &[&str]) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| keys.iter().any(|key| k.eq_ignore_ascii_case(key)))
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// The `Authentication=` keyword
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMode {
    SqlPassword,
    ActiveDirectoryMsi,
    ActiveDirectoryDefault,
    Other(String),
}

impl AuthenticationMode {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "sqlpassword" => Self::SqlPassword,
            "activedirectorymsi" | "activedirectorymanagedidentity" => Self::ActiveDirectoryMsi,
            "activedirectorydefault" => Self::ActiveDirectoryDefault,
            _ => Self::Other(value.to_string()),
        }
    }
}

/// Typed connect options for the feature store
#[derive(Clone)]
pub struct SqlConnectOptions {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub encryption: EncryptionLevel,
    pub trust_server_certificate: bool,
    pub authentication: Option<AuthenticationMode>,
    pub application_name: Option<String>,
    pub login_timeout: Option<Duration>,
}

impl SqlConnectOptions {
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        Self::from_connection_string(&ConnectionString::parse(input)?)
    }

    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConnectionStringError> {
        let server = cs
            .get(&["server", "address", "addr", "data source"])
            .filter(|s| !s.is_empty())
            .ok_or(ConnectionStringError::MissingKey("Server"))?;
        let (host, port) = parse_server(server)?;

        let encryption = match cs.get(&["encrypt"]) {
            None => EncryptionLevel::Required,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "yes" | "true" | "mandatory" | "strict" => EncryptionLevel::Required,
                "no" | "false" | "optional" => EncryptionLevel::Off,
                _ => return Err(invalid("Encrypt", v)),
            },
        };

        let trust_server_certificate = match cs.get(&["trustservercertificate"]) {
            None => false,
            Some(v) => parse_bool("TrustServerCertificate", v)?,
        };

        let login_timeout = match cs.get(&["connection timeout", "login timeout", "timeout"]) {
            None => None,
            Some(v) => {
                let seconds: u64 = v.parse().map_err(|_| invalid("Connection Timeout", v))?;
                // 0 means wait indefinitely
                (seconds > 0).then(|| Duration::from_secs(seconds))
            }
        };

        Ok(Self {
            host,
            port,
            database: owned(cs.get(&["database", "initial catalog"])),
            user: owned(cs.get(&["uid", "user id", "user"])),
            password: owned(cs.get(&["pwd", "password"])),
            encryption,
            trust_server_certificate,
            authentication: cs
                .get(&["authentication"])
                .filter(|v| !v.is_empty())
                .map(AuthenticationMode::parse),
            application_name: owned(cs.get(&["app", "application name"])),
            login_timeout,
        })
    }
}

impl std::fmt::Debug for SqlConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("encryption", &self.encryption)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("authentication", &self.authentication)
            .field("application_name", &self.application_name)
            .field("login_timeout", &self.login_timeout)
            .finish()
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn invalid(key: &str, value: &str) -> ConnectionStringError {
    ConnectionStringError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConnectionStringError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// `tcp:host,port` / `host,port` / `host`
fn parse_server(server: &str) -> Result<(String, u16), ConnectionStringError> {
    let server = server.trim();
    let server = match server.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("tcp:") => &server[4..],
        _ => server,
    };

    match server.split_once(',') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConnectionStringError::InvalidPort(port.trim().to_string()))?;
            Ok((host.trim().to_string(), port))
        }
        None => Ok((server.to_string(), DEFAULT_PORT)),
    }
}
