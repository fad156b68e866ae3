use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Errors that can occur during script validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyQuery,
    ForbiddenKeyword(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyQuery => write!(f, "empty query"),
            ValidationError::ForbiddenKeyword(keyword) => {
                write!(f, "query contains forbidden keyword: {}", keyword)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Administrative statements that diagnostic scripts must never issue.
/// Matched case-insensitively on word boundaries so `backupset` is allowed.
const FORBIDDEN_KEYWORDS: &[(&str, &str)] = &[
    ("SHUTDOWN", r"(?i)\bSHUTDOWN\b"),
    ("BACKUP", r"(?i)\bBACKUP\b"),
    ("RESTORE", r"(?i)\bRESTORE\b"),
    ("KILL", r"(?i)\bKILL\b"),
    ("DROP DATABASE", r"(?i)\bDROP\s+DATABASE\b"),
    ("ALTER DATABASE", r"(?i)\bALTER\s+DATABASE\b"),
    ("CREATE DATABASE", r"(?i)\bCREATE\s+DATABASE\b"),
    ("xp_cmdshell", r"(?i)\bxp_cmdshell\b"),
    ("sp_configure", r"(?i)\bsp_configure\b"),
];

fn forbidden_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FORBIDDEN_KEYWORDS
            .iter()
            .map(|(label, pattern)| {
                (
                    *label,
                    Regex::new(pattern).expect("forbidden keyword pattern is valid"),
                )
            })
            .collect()
    })
}

/// Best-effort denylist check for a diagnostic script. Not a parser and not
/// a security boundary.
pub fn validate_query(sql: &str) -> Result<(), ValidationError> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(ValidationError::EmptyQuery);
    }

    for (label, pattern) in forbidden_patterns() {
        if pattern.is_match(sql) {
            return Err(ValidationError::ForbiddenKeyword(label.to_string()));
        }
    }

    Ok(())
}

/// Strip control characters (except common whitespace) from a string for safe display.
pub fn sanitize_for_display(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .collect()
}
