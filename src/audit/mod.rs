pub mod orchestrator;
pub mod selection;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::db::connectors::ConnectionError;
use crate::models::{AuditScriptResult, ControlsScript};

pub use orchestrator::AuditService;
pub use selection::select_connection;

/// Body of an audit request. A full audit ignores the id lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    #[serde(default)]
    pub control_ids: Vec<i64>,
    #[serde(default)]
    pub script_ids: Vec<i64>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub full_audit: bool,
}

/// Outcome of one script as reported to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub script_id: i64,
    pub control_id: i64,
    pub control_type: String,
    pub query_sql: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub duration_ms: i64,
    pub rows: i64,
}

impl ScriptResult {
    pub(crate) fn for_script(script: &ControlsScript) -> Self {
        Self {
            script_id: script.id,
            control_id: script.control_id,
            control_type: script.control_type.clone(),
            query_sql: script.query_sql.clone(),
            ..Self::default()
        }
    }

    /// Rebuild from a persisted row. The control type is not stored.
    pub(crate) fn from_persisted(row: &AuditScriptResult) -> Self {
        Self {
            script_id: row.script_id,
            control_id: row.control_id,
            control_type: String::new(),
            query_sql: row.query_sql.clone(),
            passed: row.passed,
            error: row.error.clone(),
            duration_ms: row.duration_ms,
            rows: row.rows,
        }
    }

    /// Persisted manual results carry no SQL and no error.
    pub(crate) fn looks_manual(&self) -> bool {
        self.query_sql.is_empty() && self.error.is_empty()
    }
}

/// Aggregated audit summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub manual_count: i64,
    pub scripts: Vec<ScriptResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_run_id: Option<i64>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl AuditResult {
    pub(crate) fn push(&mut self, script: ScriptResult, manual: bool) {
        self.total += 1;
        if script.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        if manual {
            self.manual_count += 1;
        }
        self.scripts.push(script);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("no active connection")]
    NoActiveConnection,
    #[error("no scripts found for given control_ids or script_ids")]
    NoScripts,
    #[error("forbidden")]
    Forbidden,
    #[error("audit run {0} not found")]
    NotFound(i64),
    #[error("audit cancelled")]
    Cancelled,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

/// A simple cancellation token backed by an `AtomicBool`.
/// Clone it to share between the caller and the running audit.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
