use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::models::{
    ActiveConnection, AuditRun, AuditScriptResult, ConnectionLog, Control, ControlsScript,
    UnknownVariant,
};
use crate::repository::{AuditRepository, ConnectionRepository, ControlRepository};

const SCHEMA_SQL: &str = include_str!("../appdb/schema.sql");

const ACTIVE_COLUMNS: &str = "id, user_id, manager, driver, server, port, db_user, password, \
     is_connected, last_connected, last_disconnected";

const LOG_COLUMNS: &str = "id, user_id, manager, driver, server, db_user, status, timestamp";

const SCRIPT_COLUMNS: &str = "id, control_type, query_sql, control_id";

const RUN_COLUMNS: &str = "id, user_id, mode, database, total, passed, failed, status, \
     controls, started_at, finished_at";

const RESULT_COLUMNS: &str = "id, audit_run_id, script_id, control_id, query_sql, passed, \
     error, duration_ms, rows, created_at";

/// Embedded app database holding audit runs, the connection directory and
/// the script catalog.
pub struct AppDatabase {
    conn: Arc<Mutex<Connection>>,
}

// ── Column codecs ───────────────────────────────────────────────────────

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_from_sql(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| ts_from_sql(idx, v)).transpose()
}

fn enum_from_sql<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn active_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActiveConnection> {
    let port: i64 = row.get(5)?;
    let connected: i32 = row.get(8)?;
    Ok(ActiveConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        manager: row.get(2)?,
        driver: row.get(3)?,
        server: row.get(4)?,
        port: u16::try_from(port).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Integer, Box::new(e))
        })?,
        db_user: row.get(6)?,
        password: row.get(7)?,
        is_connected: connected != 0,
        last_connected: opt_ts_from_sql(9, row.get(9)?)?,
        last_disconnected: opt_ts_from_sql(10, row.get(10)?)?,
    })
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionLog> {
    Ok(ConnectionLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        manager: row.get(2)?,
        driver: row.get(3)?,
        server: row.get(4)?,
        db_user: row.get(5)?,
        status: enum_from_sql(6, row.get(6)?)?,
        timestamp: ts_from_sql(7, row.get(7)?)?,
    })
}

fn script_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ControlsScript> {
    Ok(ControlsScript {
        id: row.get(0)?,
        control_type: row.get(1)?,
        query_sql: row.get(2)?,
        control_id: row.get(3)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRun> {
    Ok(AuditRun {
        id: row.get(0)?,
        user_id: row.get(1)?,
        mode: enum_from_sql(2, row.get(2)?)?,
        database: row.get(3)?,
        total: row.get(4)?,
        passed: row.get(5)?,
        failed: row.get(6)?,
        status: enum_from_sql(7, row.get(7)?)?,
        controls: row.get(8)?,
        started_at: ts_from_sql(9, row.get(9)?)?,
        finished_at: opt_ts_from_sql(10, row.get(10)?)?,
    })
}

fn result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditScriptResult> {
    let passed: i32 = row.get(5)?;
    Ok(AuditScriptResult {
        id: row.get(0)?,
        audit_run_id: row.get(1)?,
        script_id: row.get(2)?,
        control_id: row.get(3)?,
        query_sql: row.get(4)?,
        passed: passed != 0,
        error: row.get(6)?,
        duration_ms: row.get(7)?,
        rows: row.get(8)?,
        created_at: ts_from_sql(9, row.get(9)?)?,
    })
}

// ── Implementation ──────────────────────────────────────────────────────

impl AppDatabase {
    /// Initialize the app database at the given data directory.
    /// Creates the DB file if it doesn't exist, then runs schema DDL.
    pub fn init(app_data_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&app_data_dir).context("Failed to create app data directory")?;

        let db_path = app_data_dir.join("sqlaudit.db");

        let conn = Connection::open(&db_path).context("Failed to open app database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to set WAL mode")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;

        log::info!("App database initialized at {:?}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let c = conn.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            f(&*c)
        })
        .await
        .context("spawn_blocking join error")?
    }

    // ── Catalog seeding ─────────────────────────────────────────────────

    pub async fn save_control(&self, control: Control) -> anyhow::Result<()> {
        self.with_conn(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO controls (id, idx, chapter, name, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    control.id,
                    control.idx,
                    control.chapter,
                    control.name,
                    control.description,
                ],
            )
            .context("Failed to save control")?;
            Ok(())
        })
        .await
    }

    pub async fn save_script(&self, script: ControlsScript) -> anyhow::Result<()> {
        self.with_conn(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO controls_scripts (id, control_type, query_sql, control_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    script.id,
                    script.control_type,
                    script.query_sql,
                    script.control_id,
                ],
            )
            .context("Failed to save script")?;
            Ok(())
        })
        .await
    }
}

// ── Audit runs ──────────────────────────────────────────────────────────

#[async_trait]
impl AuditRepository for AppDatabase {
    async fn create_audit_run(&self, run: &AuditRun) -> anyhow::Result<i64> {
        let run = run.clone();
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO audit_runs \
                 (user_id, mode, database, total, passed, failed, status, controls, started_at, finished_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    run.user_id,
                    run.mode.as_str(),
                    run.database,
                    run.total,
                    run.passed,
                    run.failed,
                    run.status.as_str(),
                    run.controls,
                    ts_to_sql(&run.started_at),
                    run.finished_at.as_ref().map(ts_to_sql),
                ],
            )
            .context("Failed to create audit run")?;
            Ok(c.last_insert_rowid())
        })
        .await
    }

    async fn update_audit_run(&self, run: &AuditRun) -> anyhow::Result<()> {
        let run = run.clone();
        self.with_conn(move |c| {
            let changed = c
                .execute(
                    "UPDATE audit_runs SET mode = ?2, database = ?3, total = ?4, passed = ?5, \
                     failed = ?6, status = ?7, controls = ?8, finished_at = ?9 WHERE id = ?1",
                    rusqlite::params![
                        run.id,
                        run.mode.as_str(),
                        run.database,
                        run.total,
                        run.passed,
                        run.failed,
                        run.status.as_str(),
                        run.controls,
                        run.finished_at.as_ref().map(ts_to_sql),
                    ],
                )
                .context("Failed to update audit run")?;
            if changed == 0 {
                return Err(anyhow!("audit run {} does not exist", run.id));
            }
            Ok(())
        })
        .await
    }

    async fn get_audit_run_by_id(&self, id: i64) -> anyhow::Result<Option<AuditRun>> {
        self.with_conn(move |c| {
            c.query_row(
                &format!("SELECT {} FROM audit_runs WHERE id = ?1", RUN_COLUMNS),
                rusqlite::params![id],
                run_from_row,
            )
            .optional()
            .context("Failed to load audit run")
        })
        .await
    }

    async fn create_script_result(&self, result: &AuditScriptResult) -> anyhow::Result<i64> {
        let result = result.clone();
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO audit_script_results \
                 (audit_run_id, script_id, control_id, query_sql, passed, error, duration_ms, rows, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    result.audit_run_id,
                    result.script_id,
                    result.control_id,
                    result.query_sql,
                    result.passed as i32,
                    result.error,
                    result.duration_ms,
                    result.rows,
                    ts_to_sql(&result.created_at),
                ],
            )
            .context("Failed to save script result")?;
            Ok(c.last_insert_rowid())
        })
        .await
    }

    async fn list_script_results_by_audit_run(
        &self,
        audit_run_id: i64,
    ) -> anyhow::Result<Vec<AuditScriptResult>> {
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM audit_script_results WHERE audit_run_id = ?1 ORDER BY id",
                    RESULT_COLUMNS
                ))
                .context("Failed to prepare script results query")?;
            let rows = stmt
                .query_map(rusqlite::params![audit_run_id], result_from_row)
                .context("Failed to query script results")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read script results")?;
            Ok(rows)
        })
        .await
    }
}

// ── Connection directory ────────────────────────────────────────────────

#[async_trait]
impl ConnectionRepository for AppDatabase {
    async fn create_active(&self, conn: &ActiveConnection) -> anyhow::Result<i64> {
        let conn = conn.clone();
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO active_connections \
                 (user_id, manager, driver, server, port, db_user, password, is_connected, \
                  last_connected, last_disconnected) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT (user_id, manager) DO UPDATE SET \
                   driver = excluded.driver, server = excluded.server, port = excluded.port, \
                   db_user = excluded.db_user, password = excluded.password, \
                   is_connected = excluded.is_connected, last_connected = excluded.last_connected, \
                   last_disconnected = excluded.last_disconnected",
                rusqlite::params![
                    conn.user_id,
                    conn.manager,
                    conn.driver,
                    conn.server,
                    conn.port as i64,
                    conn.db_user,
                    conn.password,
                    conn.is_connected as i32,
                    conn.last_connected.as_ref().map(ts_to_sql),
                    conn.last_disconnected.as_ref().map(ts_to_sql),
                ],
            )
            .context("Failed to save active connection")?;
            let id = c
                .query_row(
                    "SELECT id FROM active_connections WHERE user_id = ?1 AND manager = ?2",
                    rusqlite::params![conn.user_id, conn.manager],
                    |row| row.get(0),
                )
                .context("Failed to read active connection id")?;
            Ok(id)
        })
        .await
    }

    async fn get_active_by_user_id_and_manager(
        &self,
        user_id: i64,
        manager: &str,
    ) -> anyhow::Result<Option<ActiveConnection>> {
        let manager = manager.to_string();
        self.with_conn(move |c| {
            c.query_row(
                &format!(
                    "SELECT {} FROM active_connections \
                     WHERE user_id = ?1 AND manager = ?2 AND is_connected = 1",
                    ACTIVE_COLUMNS
                ),
                rusqlite::params![user_id, manager],
                active_from_row,
            )
            .optional()
            .context("Failed to load active connection")
        })
        .await
    }

    async fn list_active_by_user(&self, user_id: i64) -> anyhow::Result<Vec<ActiveConnection>> {
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM active_connections \
                     WHERE user_id = ?1 AND is_connected = 1 ORDER BY id",
                    ACTIVE_COLUMNS
                ))
                .context("Failed to prepare active connections query")?;
            let rows = stmt
                .query_map(rusqlite::params![user_id], active_from_row)
                .context("Failed to query active connections")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read active connections")?;
            Ok(rows)
        })
        .await
    }

    async fn update_active(&self, conn: &ActiveConnection) -> anyhow::Result<()> {
        let conn = conn.clone();
        self.with_conn(move |c| {
            c.execute(
                "UPDATE active_connections SET driver = ?2, server = ?3, port = ?4, db_user = ?5, \
                 password = ?6, is_connected = ?7, last_connected = ?8, last_disconnected = ?9 \
                 WHERE id = ?1",
                rusqlite::params![
                    conn.id,
                    conn.driver,
                    conn.server,
                    conn.port as i64,
                    conn.db_user,
                    conn.password,
                    conn.is_connected as i32,
                    conn.last_connected.as_ref().map(ts_to_sql),
                    conn.last_disconnected.as_ref().map(ts_to_sql),
                ],
            )
            .context("Failed to update active connection")?;
            Ok(())
        })
        .await
    }

    async fn delete_active(&self, user_id: i64, manager: &str) -> anyhow::Result<()> {
        let manager = manager.to_string();
        self.with_conn(move |c| {
            c.execute(
                "DELETE FROM active_connections WHERE user_id = ?1 AND manager = ?2",
                rusqlite::params![user_id, manager],
            )
            .context("Failed to delete active connection")?;
            Ok(())
        })
        .await
    }

    async fn log_connection(&self, log: &ConnectionLog) -> anyhow::Result<i64> {
        let log = log.clone();
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO connection_logs \
                 (user_id, manager, driver, server, db_user, status, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    log.user_id,
                    log.manager,
                    log.driver,
                    log.server,
                    log.db_user,
                    log.status.as_str(),
                    ts_to_sql(&log.timestamp),
                ],
            )
            .context("Failed to log connection")?;
            Ok(c.last_insert_rowid())
        })
        .await
    }

    async fn list_logs_by_user(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<ConnectionLog>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit: i64 = if limit == 0 { -1 } else { limit as i64 };
        let offset = offset as i64;
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM connection_logs WHERE user_id = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
                    LOG_COLUMNS
                ))
                .context("Failed to prepare connection log query")?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], log_from_row)
                .context("Failed to query connection logs")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read connection logs")?;
            Ok(rows)
        })
        .await
    }

    async fn count_logs_by_user(&self, user_id: i64) -> anyhow::Result<i64> {
        self.with_conn(move |c| {
            c.query_row(
                "SELECT COUNT(*) FROM connection_logs WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count connection logs")
        })
        .await
    }
}

// ── Script catalog ──────────────────────────────────────────────────────

#[async_trait]
impl ControlRepository for AppDatabase {
    async fn list_controls(&self) -> anyhow::Result<Vec<Control>> {
        self.with_conn(|c| {
            let mut stmt = c
                .prepare("SELECT id, idx, chapter, name, description FROM controls ORDER BY idx, id")
                .context("Failed to prepare controls query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Control {
                        id: row.get(0)?,
                        idx: row.get(1)?,
                        chapter: row.get(2)?,
                        name: row.get(3)?,
                        description: row.get(4)?,
                    })
                })
                .context("Failed to query controls")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read controls")?;
            Ok(rows)
        })
        .await
    }

    async fn get_control_scripts(&self, control_id: i64) -> anyhow::Result<Vec<ControlsScript>> {
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM controls_scripts WHERE control_id = ?1 ORDER BY id",
                    SCRIPT_COLUMNS
                ))
                .context("Failed to prepare control scripts query")?;
            let rows = stmt
                .query_map(rusqlite::params![control_id], script_from_row)
                .context("Failed to query control scripts")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read control scripts")?;
            Ok(rows)
        })
        .await
    }

    async fn get_scripts_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<ControlsScript>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |c| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM controls_scripts WHERE id IN ({}) ORDER BY id",
                    SCRIPT_COLUMNS, placeholders
                ))
                .context("Failed to prepare scripts query")?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), script_from_row)
                .context("Failed to query scripts")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read scripts")?;
            Ok(rows)
        })
        .await
    }

    async fn get_all_scripts(&self) -> anyhow::Result<Vec<ControlsScript>> {
        self.with_conn(|c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {} FROM controls_scripts ORDER BY id",
                    SCRIPT_COLUMNS
                ))
                .context("Failed to prepare scripts query")?;
            let rows = stmt
                .query_map([], script_from_row)
                .context("Failed to query scripts")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read scripts")?;
            Ok(rows)
        })
        .await
    }
}
