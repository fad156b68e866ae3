use async_trait::async_trait;

use crate::models::{
    ActiveConnection, AuditRun, AuditScriptResult, ConnectionLog, Control, ControlsScript,
};

/// Persistence for audit runs and their per-script results.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Insert a new run and return its assigned id.
    async fn create_audit_run(&self, run: &AuditRun) -> anyhow::Result<i64>;

    async fn update_audit_run(&self, run: &AuditRun) -> anyhow::Result<()>;

    async fn get_audit_run_by_id(&self, id: i64) -> anyhow::Result<Option<AuditRun>>;

    /// Insert one script result and return its assigned id.
    async fn create_script_result(&self, result: &AuditScriptResult) -> anyhow::Result<i64>;

    async fn list_script_results_by_audit_run(
        &self,
        audit_run_id: i64,
    ) -> anyhow::Result<Vec<AuditScriptResult>>;
}

/// Directory of the external databases each user is logged into.
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Insert or replace the record for `(user_id, manager)`. Returns its id.
    async fn create_active(&self, conn: &ActiveConnection) -> anyhow::Result<i64>;

    /// The connected record for `(user_id, manager)`, if any.
    async fn get_active_by_user_id_and_manager(
        &self,
        user_id: i64,
        manager: &str,
    ) -> anyhow::Result<Option<ActiveConnection>>;

    /// Every connected record of the user, across managers.
    async fn list_active_by_user(&self, user_id: i64) -> anyhow::Result<Vec<ActiveConnection>>;

    async fn update_active(&self, conn: &ActiveConnection) -> anyhow::Result<()>;

    async fn delete_active(&self, user_id: i64, manager: &str) -> anyhow::Result<()>;

    /// Append a history row. History is never updated or deleted.
    async fn log_connection(&self, log: &ConnectionLog) -> anyhow::Result<i64>;

    /// History for a user, newest first. A `limit` of zero means no limit.
    async fn list_logs_by_user(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<ConnectionLog>>;

    async fn count_logs_by_user(&self, user_id: i64) -> anyhow::Result<i64>;
}

/// Read access to the control/script catalog.
#[async_trait]
pub trait ControlRepository: Send + Sync {
    async fn list_controls(&self) -> anyhow::Result<Vec<Control>>;

    async fn get_control_scripts(&self, control_id: i64) -> anyhow::Result<Vec<ControlsScript>>;

    async fn get_scripts_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<ControlsScript>>;

    async fn get_all_scripts(&self) -> anyhow::Result<Vec<ControlsScript>>;
}
