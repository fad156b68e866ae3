use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user's live session against one manager, as last persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub id: i64,
    pub user_id: i64,
    pub manager: String,
    pub driver: String,
    pub server: String,
    pub port: u16,
    pub db_user: String,
    /// Ciphertext produced by the secret codec. Legacy rows may hold plaintext.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub is_connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected => "disconnected",
        }
    }
}

impl FromStr for ConnectionEvent {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConnectionEvent::Connected),
            "disconnected" => Ok(ConnectionEvent::Disconnected),
            other => Err(UnknownVariant::new("connection event", other)),
        }
    }
}

/// One row of the append-only connect/disconnect history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub id: i64,
    pub user_id: i64,
    pub manager: String,
    pub driver: String,
    pub server: String,
    pub db_user: String,
    pub status: ConnectionEvent,
    pub timestamp: DateTime<Utc>,
}

/// A named compliance check owning one or more scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub id: i64,
    pub idx: i64,
    pub chapter: String,
    pub name: String,
    pub description: String,
}

/// A diagnostic probe. Any control type other than `manual` is executed
/// and must yield a single boolean-like scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlsScript {
    pub id: i64,
    pub control_type: String,
    pub query_sql: String,
    pub control_id: i64,
}

impl ControlsScript {
    pub fn is_manual(&self) -> bool {
        self.control_type.trim().eq_ignore_ascii_case("manual")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Partial,
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Partial => "partial",
            RunMode::Full => "full",
        }
    }
}

impl FromStr for RunMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(RunMode::Partial),
            "full" => Ok(RunMode::Full),
            other => Err(UnknownVariant::new("run mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(UnknownVariant::new("run status", other)),
        }
    }
}

/// Literal stored in `AuditRun::controls` for a full audit.
pub const ALL_CONTROLS: &str = "ALL";

/// One audit invocation and its aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRun {
    pub id: i64,
    pub user_id: i64,
    pub mode: RunMode,
    pub database: String,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub status: RunStatus,
    /// Comma-separated control ids, or `ALL` for a full audit.
    pub controls: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of one script inside an audit run. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditScriptResult {
    pub id: i64,
    pub audit_run_id: i64,
    pub script_id: i64,
    pub control_id: i64,
    pub query_sql: String,
    pub passed: bool,
    pub error: String,
    pub duration_ms: i64,
    pub rows: i64,
    pub created_at: DateTime<Utc>,
}

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}
