pub mod sqlserver;

use crate::security::redact_value;
use crate::security::validation::{self, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SQLSERVER_PORT: u16 = 1433;

/// Connection parameters for one SQL Server target.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlServerConfig {
    pub driver: String,
    pub server: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub database: String,
    /// Free-form driver options such as `encrypt` or `TrustServerCertificate`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for SqlServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlServerConfig")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact_value(&self.password))
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

impl Default for SqlServerConfig {
    fn default() -> Self {
        Self {
            driver: "mssql".to_string(),
            server: "localhost".to_string(),
            port: DEFAULT_SQLSERVER_PORT,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            options: BTreeMap::new(),
        }
    }
}

impl SqlServerConfig {
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Option value after `yes`/`no` normalization, looked up case-insensitively.
    pub fn option(&self, key: &str) -> Option<String> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| normalize_option_value(v))
    }

    /// Canonical `sqlserver://` URL identifying this target. Two configs map to
    /// the same physical pool exactly when their connection strings are equal.
    pub fn connection_string(&self) -> String {
        let mut out = String::from("sqlserver://");
        if !self.user.is_empty() {
            out.push_str(&percent_encode(&self.user));
            out.push(':');
            out.push_str(&percent_encode(&self.password));
            out.push('@');
        }
        out.push_str(&self.server);
        out.push(':');
        out.push_str(&self.port.to_string());

        let mut query: BTreeMap<String, String> = BTreeMap::new();
        if !self.database.is_empty() {
            query.insert("database".to_string(), self.database.clone());
        }
        for (k, v) in &self.options {
            query.insert(k.clone(), normalize_option_value(v));
        }
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
                .collect();
            out.push('?');
            out.push_str(&encoded.join("&"));
        }
        out
    }
}

fn normalize_option_value(value: &str) -> String {
    if value.eq_ignore_ascii_case("yes") {
        "true".to_string()
    } else if value.eq_ignore_ascii_case("no") {
        "false".to_string()
    } else {
        value.to_string()
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to open or validate a physical connection pool.
#[derive(Debug)]
pub struct ConnectionError {
    pub message: String,
    pub cause: Option<BoxError>,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Failure of a single probe query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query execution failed: {0}")]
    Execution(String),

    #[error("query returned no rows")]
    NoRows,

    #[error("query must return exactly one column, got {0}")]
    ColumnCount(usize),

    #[error("{0}")]
    Coercion(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Pooled access to SQL Server targets.
///
/// `Handle` identifies one physical pool. Handles are cheap to clone and stay
/// valid until the pool is closed or replaced after a failed liveness check.
#[async_trait]
pub trait SqlServerService: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    /// Return a validated handle for the target, reusing a live pool when one exists.
    async fn connect(&self, config: &SqlServerConfig) -> Result<Self::Handle, ConnectionError>;

    /// Run a single-row, single-column probe and coerce the value to a boolean.
    async fn execute_query(&self, handle: &Self::Handle, sql: &str) -> Result<bool, QueryError>;

    /// Bounded-timeout liveness check.
    async fn validate_connection(&self, handle: &Self::Handle) -> Result<(), ConnectionError>;

    /// Remove the handle from the pool table and close it.
    async fn close(&self, handle: &Self::Handle) -> Result<(), ConnectionError>;

    /// Reject administrative statements before they reach the server.
    fn validate_query(&self, sql: &str) -> Result<(), ValidationError> {
        validation::validate_query(sql)
    }
}
