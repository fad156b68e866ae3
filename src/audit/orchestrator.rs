use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::selection::{select_connection, SQLSERVER_DRIVER_MARKER};
use super::{AuditError, AuditRequest, AuditResult, CancellationToken, ScriptResult};
use crate::db::connectors::{SqlServerConfig, SqlServerService};
use crate::models::{
    ActiveConnection, AuditRun, AuditScriptResult, ControlsScript, RunMode, RunStatus,
    ALL_CONTROLS,
};
use crate::repository::{AuditRepository, ConnectionRepository, ControlRepository};
use crate::security::{sanitize_for_display, EncryptionService};

/// Runs batches of diagnostic scripts against a user's SQL Server session
/// and records every outcome as an audit run.
pub struct AuditService<S: SqlServerService> {
    controls: Arc<dyn ControlRepository>,
    sql: Arc<S>,
    connections: Arc<dyn ConnectionRepository>,
    audits: Arc<dyn AuditRepository>,
    cipher: Arc<dyn EncryptionService>,
}

impl<S: SqlServerService> AuditService<S> {
    pub fn new(
        controls: Arc<dyn ControlRepository>,
        sql: Arc<S>,
        connections: Arc<dyn ConnectionRepository>,
        audits: Arc<dyn AuditRepository>,
        cipher: Arc<dyn EncryptionService>,
    ) -> Self {
        Self {
            controls,
            sql,
            connections,
            audits,
            cipher,
        }
    }

    /// Execute one audit end to end.
    ///
    /// Any error after the run row exists marks that run `failed` before it
    /// is returned. Per-script validation and execution errors are recorded
    /// on the script and never abort the run.
    pub async fn execute(
        &self,
        user_id: i64,
        manager: &str,
        request: &AuditRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AuditResult, AuditError> {
        let mut run = new_run(user_id, request);
        run.id = self.audits.create_audit_run(&run).await?;
        log::info!(
            "Audit run {} started for user {} (mode={}, controls={})",
            run.id,
            user_id,
            run.mode.as_str(),
            run.controls
        );

        match self.run(&mut run, manager, request, cancel).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.abandon(&mut run, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        run: &mut AuditRun,
        manager: &str,
        request: &AuditRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AuditResult, AuditError> {
        let conn = self.resolve_connection(run.user_id, manager).await?;
        let scripts = self.resolve_scripts(request).await?;

        let config = SqlServerConfig {
            driver: conn.driver.clone(),
            server: conn.server.clone(),
            port: conn.port,
            user: conn.db_user.clone(),
            password: self.recover_password(&conn.password),
            database: request.database.clone(),
            ..SqlServerConfig::default()
        }
        .with_option("TrustServerCertificate", "true");
        let handle = self.sql.connect(&config).await?;

        let mut result = AuditResult::default();
        for script in scripts.into_values() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(AuditError::Cancelled);
            }

            let manual = script.is_manual();
            let outcome = self.run_script(&handle, &script).await;
            self.persist(run.id, &outcome).await?;

            run.total += 1;
            if outcome.passed {
                run.passed += 1;
            } else {
                run.failed += 1;
            }
            result.push(outcome, manual);
        }

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        self.audits.update_audit_run(run).await?;
        log::info!(
            "Audit run {} completed: total={} passed={} failed={} manual={}",
            run.id,
            result.total,
            result.passed,
            result.failed,
            result.manual_count
        );

        result.audit_run_id = Some(run.id);
        Ok(result)
    }

    /// Load a finished (or abandoned) run. Only its owner may read it.
    pub async fn get_audit_run(
        &self,
        user_id: i64,
        audit_id: i64,
    ) -> Result<(AuditResult, AuditRun), AuditError> {
        let run = self
            .audits
            .get_audit_run_by_id(audit_id)
            .await?
            .ok_or(AuditError::NotFound(audit_id))?;
        if run.user_id != user_id {
            log::warn!("User {} denied access to audit run {}", user_id, audit_id);
            return Err(AuditError::Forbidden);
        }

        let rows = self.audits.list_script_results_by_audit_run(run.id).await?;
        let mut result = AuditResult {
            total: run.total,
            passed: run.passed,
            failed: run.failed,
            scripts: Vec::with_capacity(rows.len()),
            audit_run_id: Some(run.id),
            ..AuditResult::default()
        };
        for row in &rows {
            let script = ScriptResult::from_persisted(row);
            if script.looks_manual() {
                result.manual_count += 1;
            }
            result.scripts.push(script);
        }
        Ok((result, run))
    }

    async fn resolve_connection(
        &self,
        user_id: i64,
        manager: &str,
    ) -> Result<ActiveConnection, AuditError> {
        if let Some(conn) = self
            .connections
            .get_active_by_user_id_and_manager(user_id, manager)
            .await?
        {
            return Ok(conn);
        }

        let sessions = self.connections.list_active_by_user(user_id).await?;
        let picked = select_connection(&sessions, SQLSERVER_DRIVER_MARKER)
            .cloned()
            .ok_or(AuditError::NoActiveConnection)?;
        log::info!(
            "No '{}' session for user {}, using '{}' on {}",
            manager,
            user_id,
            picked.manager,
            picked.server
        );
        Ok(picked)
    }

    async fn resolve_scripts(
        &self,
        request: &AuditRequest,
    ) -> Result<HashMap<i64, ControlsScript>, AuditError> {
        let mut scripts = HashMap::new();

        if request.full_audit {
            for script in self.controls.get_all_scripts().await? {
                scripts.insert(script.id, script);
            }
        } else {
            for control_id in &request.control_ids {
                for script in self.controls.get_control_scripts(*control_id).await? {
                    scripts.insert(script.id, script);
                }
            }
            if !request.script_ids.is_empty() {
                for script in self.controls.get_scripts_by_ids(&request.script_ids).await? {
                    scripts.insert(script.id, script);
                }
            }
        }

        if scripts.is_empty() {
            return Err(AuditError::NoScripts);
        }
        Ok(scripts)
    }

    /// Stored passwords may predate encryption; use them verbatim then.
    fn recover_password(&self, stored: &str) -> String {
        match self.cipher.decrypt(stored) {
            Ok(plain) if !plain.is_empty() => plain,
            Ok(_) => stored.to_string(),
            Err(e) => {
                log::debug!("Stored password not decryptable ({}), using it as-is", e);
                stored.to_string()
            }
        }
    }

    /// Evaluate one script. Manual scripts are not executed and pass.
    ///
    /// A manual result is recorded with an empty `query_sql`, which is how
    /// `get_audit_run` tells it apart from an executed script later on. The
    /// SQL text of manual scripts is therefore absent from the stored audit
    /// trail; it remains available from the control catalog.
    async fn run_script(&self, handle: &S::Handle, script: &ControlsScript) -> ScriptResult {
        let mut outcome = ScriptResult::for_script(script);

        if script.is_manual() {
            outcome.query_sql.clear();
            outcome.passed = true;
            return outcome;
        }

        if let Err(e) = self.sql.validate_query(&script.query_sql) {
            log::warn!("Script {} rejected: {}", script.id, e);
            outcome.error = e.to_string();
            return outcome;
        }

        let started = Instant::now();
        let executed = self.sql.execute_query(handle, &script.query_sql).await;
        outcome.duration_ms = started.elapsed().as_millis() as i64;
        match executed {
            Ok(passed) => {
                outcome.passed = passed;
                outcome.rows = 1;
            }
            Err(e) => {
                log::warn!(
                    "Script {} failed after {}ms: {}",
                    script.id,
                    outcome.duration_ms,
                    sanitize_for_display(&e.to_string())
                );
                outcome.error = e.to_string();
            }
        }
        outcome
    }

    async fn persist(&self, audit_run_id: i64, outcome: &ScriptResult) -> Result<(), AuditError> {
        let row = AuditScriptResult {
            id: 0,
            audit_run_id,
            script_id: outcome.script_id,
            control_id: outcome.control_id,
            query_sql: outcome.query_sql.clone(),
            passed: outcome.passed,
            error: outcome.error.clone(),
            duration_ms: outcome.duration_ms,
            rows: outcome.rows,
            created_at: Utc::now(),
        };
        self.audits.create_script_result(&row).await?;
        Ok(())
    }

    /// Close out a run that could not finish. Counters keep whatever was
    /// recorded before the abort.
    async fn abandon(&self, run: &mut AuditRun, cause: &AuditError) {
        log::warn!("Audit run {} aborted: {}", run.id, cause);
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        if let Err(e) = self.audits.update_audit_run(run).await {
            log::error!("Failed to mark audit run {} as failed: {:#}", run.id, e);
        }
    }
}

fn new_run(user_id: i64, request: &AuditRequest) -> AuditRun {
    let (mode, controls) = if request.full_audit {
        (RunMode::Full, ALL_CONTROLS.to_string())
    } else {
        let ids: Vec<String> = request.control_ids.iter().map(|id| id.to_string()).collect();
        (RunMode::Partial, ids.join(","))
    };
    AuditRun {
        id: 0,
        user_id,
        mode,
        database: request.database.clone(),
        total: 0,
        passed: 0,
        failed: 0,
        status: RunStatus::Running,
        controls,
        started_at: Utc::now(),
        finished_at: None,
    }
}
