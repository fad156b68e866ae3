//! End-to-end audit flow over the embedded SQLite store.
//!
//! The SQL Server side is replaced by a scripted executor so the flow runs
//! without a live server; storage, encryption and orchestration are real.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlaudit_lib::appdb::AppDatabase;
use sqlaudit_lib::audit::{AuditError, AuditRequest, AuditService};
use sqlaudit_lib::commands::{ConnectRequest, ConnectionService};
use sqlaudit_lib::db::connectors::{ConnectionError, QueryError, SqlServerConfig, SqlServerService};
use sqlaudit_lib::models::{Control, ControlsScript, RunMode, RunStatus};
use sqlaudit_lib::repository::AuditRepository;
use sqlaudit_lib::security::AesGcmEncryptionService;

// ─── helpers ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedServer {
    answers: HashMap<String, bool>,
    seen_passwords: Mutex<Vec<String>>,
}

#[async_trait]
impl SqlServerService for ScriptedServer {
    type Handle = ();

    async fn connect(&self, config: &SqlServerConfig) -> Result<(), ConnectionError> {
        self.seen_passwords.lock().unwrap().push(config.password.clone());
        Ok(())
    }

    async fn execute_query(&self, _handle: &(), sql: &str) -> Result<bool, QueryError> {
        self.answers
            .get(sql)
            .copied()
            .ok_or_else(|| QueryError::Execution(format!("Invalid object name in '{}'", sql)))
    }

    async fn validate_connection(&self, _handle: &()) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&self, _handle: &()) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct Engine {
    store: Arc<AppDatabase>,
    server: Arc<ScriptedServer>,
    audits: AuditService<ScriptedServer>,
    connections: ConnectionService<ScriptedServer>,
}

async fn engine() -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AppDatabase::init(dir.keep()).unwrap());
    let server = Arc::new(ScriptedServer {
        answers: HashMap::from([
            ("SELECT CAST(1 AS bit)".to_string(), true),
            ("SELECT CAST(0 AS bit)".to_string(), false),
        ]),
        ..ScriptedServer::default()
    });
    let cipher = Arc::new(AesGcmEncryptionService::new("integration passphrase").unwrap());

    seed_catalog(&store).await;

    let audits = AuditService::new(
        store.clone(),
        server.clone(),
        store.clone(),
        store.clone(),
        cipher.clone(),
    );
    let connections = ConnectionService::new(store.clone(), server.clone(), cipher);
    Engine {
        store,
        server,
        audits,
        connections,
    }
}

async fn seed_catalog(store: &AppDatabase) {
    for (id, name) in [(1, "Surface area"), (2, "Authentication")] {
        store
            .save_control(Control {
                id,
                idx: id,
                chapter: format!("2.{}", id),
                name: name.to_string(),
                description: String::new(),
            })
            .await
            .unwrap();
    }
    let scripts = [
        (10, 1, "automatic", "SELECT CAST(1 AS bit)"),
        (11, 1, "automatic", "SELECT CAST(0 AS bit)"),
        (12, 1, "manual", "-- review firewall rules"),
        (20, 2, "automatic", "EXEC sp_configure 'remote access'"),
        (21, 2, "automatic", "SELECT * FROM missing_table"),
    ];
    for (id, control_id, control_type, sql) in scripts {
        store
            .save_script(ControlsScript {
                id,
                control_type: control_type.to_string(),
                query_sql: sql.to_string(),
                control_id,
            })
            .await
            .unwrap();
    }
}

fn login() -> ConnectRequest {
    ConnectRequest {
        driver: "mssql".to_string(),
        server: "sql01.corp".to_string(),
        port: Some(1433),
        db_user: "auditor".to_string(),
        password: "Pa55w0rd!".to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  AUDIT FLOW
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn partial_audit_round_trip() {
    let e = engine().await;
    e.connections.connect_to_server(5, "mssql", &login()).await.unwrap();

    let request = AuditRequest {
        control_ids: vec![1],
        script_ids: vec![],
        database: "master".to_string(),
        full_audit: false,
    };
    let result = e.audits.execute(5, "mssql", &request, None).await.unwrap();

    assert_eq!(result.total, 3);
    assert_eq!(result.passed, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.manual_count, 1);
    let run_id = result.audit_run_id.expect("run id");

    // The stored password was decrypted before reaching the server.
    let seen = e.server.seen_passwords.lock().unwrap().clone();
    assert_eq!(seen.last().map(String::as_str), Some("Pa55w0rd!"));

    let run = e.store.get_audit_run_by_id(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.mode, RunMode::Partial);
    assert_eq!(run.controls, "1");
    assert_eq!((run.total, run.passed, run.failed), (3, 2, 1));

    let rows = e.store.list_script_results_by_audit_run(run_id).await.unwrap();
    assert_eq!(rows.len() as i64, run.total);
    assert_eq!(rows.iter().filter(|r| r.passed).count() as i64, run.passed);
}

#[tokio::test]
async fn full_audit_records_script_failures() {
    let e = engine().await;
    e.connections.connect_to_server(5, "mssql", &login()).await.unwrap();

    let request = AuditRequest {
        control_ids: vec![2],
        database: "master".to_string(),
        full_audit: true,
        ..AuditRequest::default()
    };
    let result = e.audits.execute(5, "mssql", &request, None).await.unwrap();
    assert_eq!(result.total, 5);
    assert_eq!(result.passed + result.failed, result.total);

    let rejected = result.scripts.iter().find(|s| s.script_id == 20).unwrap();
    assert!(!rejected.passed);
    assert_eq!(rejected.error, "query contains forbidden keyword: sp_configure");

    let broken = result.scripts.iter().find(|s| s.script_id == 21).unwrap();
    assert!(broken.error.contains("Invalid object name"));

    let (loaded, run) = e
        .audits
        .get_audit_run(5, result.audit_run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(run.controls, "ALL");
    assert_eq!(run.mode, RunMode::Full);
    assert_eq!(loaded.total, 5);
    assert_eq!(loaded.manual_count, 1);
    assert_eq!(loaded.scripts.len(), 5);

    let json = serde_json::to_value(&loaded).unwrap();
    assert_eq!(json["audit_run_id"], run.id);
    assert_eq!(json["manual_count"], 1);
}

#[tokio::test]
async fn audit_without_session_fails_and_is_closed_out() {
    let e = engine().await;
    let request = AuditRequest {
        script_ids: vec![10],
        database: "master".to_string(),
        ..AuditRequest::default()
    };

    let err = e.audits.execute(5, "mssql", &request, None).await.unwrap_err();
    assert!(matches!(err, AuditError::NoActiveConnection));

    let run = e.store.get_audit_run_by_id(1).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
    assert!(e.store.list_script_results_by_audit_run(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn disconnected_session_is_not_used() {
    let e = engine().await;
    e.connections.connect_to_server(5, "mssql", &login()).await.unwrap();
    e.connections.disconnect_from_server(5, "mssql").await.unwrap();

    let request = AuditRequest {
        script_ids: vec![10],
        database: "master".to_string(),
        ..AuditRequest::default()
    };
    let err = e.audits.execute(5, "mssql", &request, None).await.unwrap_err();
    assert!(matches!(err, AuditError::NoActiveConnection));

    let history = e.connections.list_connection_history(5, 0, 0).await.unwrap();
    assert_eq!(history.total, 2);
}

#[tokio::test]
async fn other_users_cannot_read_a_run() {
    let e = engine().await;
    e.connections.connect_to_server(5, "mssql", &login()).await.unwrap();
    let request = AuditRequest {
        script_ids: vec![10, 12],
        database: "master".to_string(),
        ..AuditRequest::default()
    };
    let result = e.audits.execute(5, "mssql", &request, None).await.unwrap();

    let err = e
        .audits
        .get_audit_run(6, result.audit_run_id.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Forbidden));
}
