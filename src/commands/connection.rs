use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::db::connectors::{
    ConnectionError, SqlServerConfig, SqlServerService, DEFAULT_SQLSERVER_PORT,
};
use crate::models::{ActiveConnection, ConnectionEvent, ConnectionLog};
use crate::repository::ConnectionRepository;
use crate::security::{redact_connection_string, redact_value, CipherError, EncryptionService};

/// Database every new session is opened against.
const LOGIN_DATABASE: &str = "master";

/// Credentials the caller submits to open a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub db_user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("db_user", &self.db_user)
            .field("password", &redact_value(&self.password))
            .finish()
    }
}

fn default_driver() -> String {
    "mssql".to_string()
}

/// One page of connection history plus the total row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHistory {
    pub logs: Vec<ConnectionLog>,
    pub total: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("user already has an active connection for '{0}'")]
    AlreadyConnected(String),
    #[error("no active connection found for '{0}'")]
    NotConnected(String),
    #[error("failed to encrypt password: {0}")]
    Encrypt(#[from] CipherError),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

/// Session lifecycle for the external servers a user audits.
pub struct ConnectionService<S: SqlServerService> {
    connections: Arc<dyn ConnectionRepository>,
    sql: Arc<S>,
    cipher: Arc<dyn EncryptionService>,
    default_port: u16,
}

impl<S: SqlServerService> ConnectionService<S> {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        sql: Arc<S>,
        cipher: Arc<dyn EncryptionService>,
    ) -> Self {
        Self {
            connections,
            sql,
            cipher,
            default_port: DEFAULT_SQLSERVER_PORT,
        }
    }

    /// Port used when a request does not name one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Open and ping a server without recording a session.
    pub async fn test_connection(&self, config: &SqlServerConfig) -> Result<(), ConnectionError> {
        let handle = self.sql.connect(config).await?;
        let outcome = self.sql.validate_connection(&handle).await;
        self.sql.close(&handle).await?;
        outcome
    }

    /// Log in to a server and remember the session for `(user_id, manager)`.
    pub async fn connect_to_server(
        &self,
        user_id: i64,
        manager: &str,
        request: &ConnectRequest,
    ) -> Result<ActiveConnection, CommandError> {
        if self
            .connections
            .get_active_by_user_id_and_manager(user_id, manager)
            .await?
            .is_some()
        {
            return Err(CommandError::AlreadyConnected(manager.to_string()));
        }

        let encrypted = self.cipher.encrypt(&request.password)?;
        let port = request.port.unwrap_or(self.default_port);
        let config = SqlServerConfig {
            driver: request.driver.clone(),
            server: request.server.clone(),
            port,
            user: request.db_user.clone(),
            password: request.password.clone(),
            database: LOGIN_DATABASE.to_string(),
            ..SqlServerConfig::default()
        }
        .with_option("encrypt", "true")
        .with_option("TrustServerCertificate", "true");

        let handle = self.sql.connect(&config).await?;

        let mut conn = ActiveConnection {
            id: 0,
            user_id,
            manager: manager.to_string(),
            driver: request.driver.clone(),
            server: request.server.clone(),
            port,
            db_user: request.db_user.clone(),
            password: encrypted,
            is_connected: true,
            last_connected: Some(Utc::now()),
            last_disconnected: None,
        };
        conn.id = match self.connections.create_active(&conn).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(close_err) = self.sql.close(&handle).await {
                    log::warn!("Failed to close pool after save error: {}", close_err);
                }
                return Err(e.context("failed to save connection").into());
            }
        };

        log::info!(
            "User {} connected to {} as '{}'",
            user_id,
            redact_connection_string(&config.connection_string()),
            manager
        );
        self.record(&conn, ConnectionEvent::Connected).await;
        Ok(conn)
    }

    /// Mark the session disconnected. Pooled connections stay open for reuse.
    pub async fn disconnect_from_server(
        &self,
        user_id: i64,
        manager: &str,
    ) -> Result<(), CommandError> {
        let mut conn = self
            .connections
            .get_active_by_user_id_and_manager(user_id, manager)
            .await?
            .ok_or_else(|| CommandError::NotConnected(manager.to_string()))?;

        conn.is_connected = false;
        conn.last_disconnected = Some(Utc::now());
        self.connections
            .update_active(&conn)
            .await
            .map_err(|e| e.context("failed to update connection status"))?;

        log::info!("User {} disconnected from '{}'", user_id, manager);
        self.record(&conn, ConnectionEvent::Disconnected).await;
        Ok(())
    }

    pub async fn get_active_connection(
        &self,
        user_id: i64,
        manager: &str,
    ) -> Result<Option<ActiveConnection>, CommandError> {
        Ok(self
            .connections
            .get_active_by_user_id_and_manager(user_id, manager)
            .await?)
    }

    /// Newest first. A `limit` of zero returns everything after `offset`.
    pub async fn list_connection_history(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<ConnectionHistory, CommandError> {
        let logs = self
            .connections
            .list_logs_by_user(user_id, limit, offset)
            .await?;
        let total = self.connections.count_logs_by_user(user_id).await?;
        Ok(ConnectionHistory { logs, total })
    }

    /// History is best-effort; a failed append never fails the caller.
    async fn record(&self, conn: &ActiveConnection, status: ConnectionEvent) {
        let entry = ConnectionLog {
            id: 0,
            user_id: conn.user_id,
            manager: conn.manager.clone(),
            driver: conn.driver.clone(),
            server: conn.server.clone(),
            db_user: conn.db_user.clone(),
            status,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.connections.log_connection(&entry).await {
            log::warn!("Failed to log {} event: {:#}", status.as_str(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appdb::AppDatabase;
    use crate::db::connectors::QueryError;
    use crate::security::AesGcmEncryptionService;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSqlServer {
        refuse: bool,
        connects: Mutex<Vec<SqlServerConfig>>,
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl SqlServerService for FakeSqlServer {
        type Handle = u32;

        async fn connect(&self, config: &SqlServerConfig) -> Result<u32, ConnectionError> {
            self.connects.lock().unwrap().push(config.clone());
            if self.refuse {
                return Err(ConnectionError::new("failed to ping server"));
            }
            Ok(1)
        }

        async fn execute_query(&self, _handle: &u32, _sql: &str) -> Result<bool, QueryError> {
            Ok(true)
        }

        async fn validate_connection(&self, _handle: &u32) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&self, _handle: &u32) -> Result<(), ConnectionError> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Fixture {
        db: Arc<AppDatabase>,
        sql: Arc<FakeSqlServer>,
        cipher: Arc<AesGcmEncryptionService>,
        service: ConnectionService<FakeSqlServer>,
    }

    fn fixture(sql: FakeSqlServer) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(AppDatabase::init(dir.keep()).unwrap());
        let sql = Arc::new(sql);
        let cipher = Arc::new(AesGcmEncryptionService::new("test passphrase").unwrap());
        let service = ConnectionService::new(db.clone(), sql.clone(), cipher.clone())
            .with_default_port(14330);
        Fixture {
            db,
            sql,
            cipher,
            service,
        }
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            driver: "mssql".into(),
            server: "sql01.corp".into(),
            port: None,
            db_user: "auditor".into(),
            password: "S3cr@t!".into(),
        }
    }

    #[tokio::test]
    async fn test_connect_stores_encrypted_password() {
        let f = fixture(FakeSqlServer::default());
        let conn = f.service.connect_to_server(3, "mssql", &request()).await.unwrap();

        assert!(conn.id > 0);
        assert!(conn.is_connected);
        assert_eq!(conn.port, 14330);
        assert_ne!(conn.password, "S3cr@t!");
        assert_eq!(f.cipher.decrypt(&conn.password).unwrap(), "S3cr@t!");

        let connects = f.sql.connects.lock().unwrap();
        assert_eq!(connects[0].database, "master");
        assert_eq!(connects[0].option("encrypt").as_deref(), Some("true"));
        assert_eq!(
            connects[0].option("TrustServerCertificate").as_deref(),
            Some("true")
        );
        drop(connects);

        let history = f.service.list_connection_history(3, 0, 0).await.unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.logs[0].status, ConnectionEvent::Connected);
    }

    #[tokio::test]
    async fn test_second_connect_for_same_manager_is_refused() {
        let f = fixture(FakeSqlServer::default());
        f.service.connect_to_server(3, "mssql", &request()).await.unwrap();

        let err = f
            .service
            .connect_to_server(3, "mssql", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::AlreadyConnected(_)));

        // A different manager is a separate session.
        f.service.connect_to_server(3, "reporting", &request()).await.unwrap();
        assert_eq!(f.db.list_active_by_user(3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_records_nothing() {
        let f = fixture(FakeSqlServer {
            refuse: true,
            ..FakeSqlServer::default()
        });
        let err = f
            .service
            .connect_to_server(3, "mssql", &request())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connection failed: failed to ping server");
        assert!(f.service.get_active_connection(3, "mssql").await.unwrap().is_none());
        assert_eq!(f.db.count_logs_by_user(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let f = fixture(FakeSqlServer::default());
        f.service.connect_to_server(3, "mssql", &request()).await.unwrap();
        f.service.disconnect_from_server(3, "mssql").await.unwrap();

        assert!(f.service.get_active_connection(3, "mssql").await.unwrap().is_none());
        assert_eq!(*f.sql.closed.lock().unwrap(), 0);

        let err = f
            .service
            .disconnect_from_server(3, "mssql")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected(_)));

        f.service.connect_to_server(3, "mssql", &request()).await.unwrap();
        let history = f.service.list_connection_history(3, 2, 0).await.unwrap();
        assert_eq!(history.total, 3);
        assert_eq!(history.logs.len(), 2);
    }

    #[tokio::test]
    async fn test_connection_check_closes_pool() {
        let f = fixture(FakeSqlServer::default());
        let config = SqlServerConfig {
            server: "sql01.corp".into(),
            user: "sa".into(),
            ..SqlServerConfig::default()
        };
        f.service.test_connection(&config).await.unwrap();
        assert_eq!(*f.sql.closed.lock().unwrap(), 1);
    }

    #[test]
    fn test_request_defaults_driver() {
        let req: ConnectRequest = serde_json::from_str(
            r#"{"server":"db","db_user":"sa","password":"x"}"#,
        )
        .unwrap();
        assert_eq!(req.driver, "mssql");
        assert!(req.port.is_none());
        assert_eq!(req.password, "x");
    }

    #[test]
    fn test_request_debug_masks_password() {
        let text = format!("{:?}", request());
        assert!(text.contains("db_user"));
        assert!(text.contains("<redacted>"));
        assert!(!text.contains("S3cr@t!"));
    }
}
