use crate::models::ActiveConnection;

/// Driver substring identifying SQL Server sessions.
pub const SQLSERVER_DRIVER_MARKER: &str = "mssql";

/// Pick a fallback session when the user has no connection for the
/// requested manager.
///
/// Only connected sessions are eligible. Sessions whose driver contains
/// `driver_marker` (case-insensitive) are preferred; when none do, every
/// connected session competes. The most recent `last_connected` wins, ties
/// keep the earlier candidate, and sessions that never connected are
/// never chosen.
pub fn select_connection<'a>(
    candidates: &'a [ActiveConnection],
    driver_marker: &str,
) -> Option<&'a ActiveConnection> {
    let marker = driver_marker.to_lowercase();
    let connected: Vec<&ActiveConnection> = candidates.iter().filter(|c| c.is_connected).collect();

    let preferred: Vec<&ActiveConnection> = connected
        .iter()
        .copied()
        .filter(|c| c.driver.to_lowercase().contains(&marker))
        .collect();
    let pool = if preferred.is_empty() {
        connected
    } else {
        preferred
    };

    let mut latest: Option<&ActiveConnection> = None;
    for candidate in pool {
        let Some(at) = candidate.last_connected else {
            continue;
        };
        let newer = match latest.and_then(|l| l.last_connected) {
            Some(best) => at > best,
            None => true,
        };
        if newer {
            latest = Some(candidate);
        }
    }
    latest
}
