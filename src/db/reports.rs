use crate::useragent::UNKNOWN_OS;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusShare {
    pub status_code: u16,
    pub count: i64,
    /// Share of all entries, rounded to two decimals.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogRow {
    pub ip_address: String,
    pub timestamp: String,
    pub path: String,
    pub status_code: u16,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseStats {
    pub total_log_entries: i64,
    pub total_user_agents: i64,
    pub unique_ips: i64,
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

/// `(ip_address, request_count)`, busiest first.
pub fn top_ips(con: &Connection, n: u32) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT ip_address, COUNT(*) AS request_count
        FROM log_entries
        GROUP BY ip_address
        ORDER BY request_count DESC, ip_address ASC
        LIMIT ?
        ",
    )?;
    let rows = stmt
        .query(params![n])?
        .mapped(|row| Ok((row.get(0)?, row.get(1)?)))
        .collect();
    rows
}

pub fn status_code_distribution(con: &Connection) -> rusqlite::Result<Vec<StatusShare>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT
            status_code,
            COUNT(*) AS count,
            ROUND(COUNT(*) * 100.0 / (SELECT COUNT(*) FROM log_entries), 2) AS percentage
        FROM log_entries
        GROUP BY status_code
        ORDER BY count DESC, status_code ASC
        ",
    )?;
    let rows = stmt
        .query([])?
        .mapped(|row| {
            Ok(StatusShare {
                status_code: row.get(0)?,
                count: row.get(1)?,
                percentage: row.get(2)?,
            })
        })
        .collect();
    rows
}

/// `("13:00", request_count)` per hour of the logged wall clock, hours
/// without traffic are left out.
pub fn hourly_traffic(con: &Connection) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT strftime('%H:00', timestamp) AS hour_of_day, COUNT(*) AS request_count
        FROM log_entries
        GROUP BY hour_of_day
        ORDER BY hour_of_day ASC
        ",
    )?;
    let rows = stmt
        .query([])?
        .mapped(|row| Ok((row.get(0)?, row.get(1)?)))
        .collect();
    rows
}

pub fn top_pages(con: &Connection, n: u32) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT path, COUNT(*) AS request_count
        FROM log_entries
        GROUP BY path
        ORDER BY request_count DESC, path ASC
        LIMIT ?
        ",
    )?;
    let rows = stmt
        .query(params![n])?
        .mapped(|row| Ok((row.get(0)?, row.get(1)?)))
        .collect();
    rows
}

/// Entries without a user agent count as unknown OS.
pub fn traffic_by_os(con: &Connection) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT COALESCE(ua.os, ?) AS os_name, COUNT(le.id) AS request_count
        FROM log_entries le
        LEFT JOIN user_agents ua ON le.user_agent_id = ua.id
        GROUP BY os_name
        ORDER BY request_count DESC, os_name ASC
        ",
    )?;
    let rows = stmt
        .query(params![UNKNOWN_OS])?
        .mapped(|row| Ok((row.get(0)?, row.get(1)?)))
        .collect();
    rows
}

/// 4xx and 5xx entries logged on `date` (`YYYY-MM-DD`, wall clock), oldest
/// first.
pub fn error_logs_by_date(con: &Connection, date: &str) -> rusqlite::Result<Vec<ErrorLogRow>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT
            le.ip_address,
            le.timestamp,
            le.path,
            le.status_code,
            COALESCE(ua.user_agent_string, 'Unknown') AS user_agent_string
        FROM log_entries le
        LEFT JOIN user_agents ua ON le.user_agent_id = ua.id
        WHERE date(le.timestamp) = ? AND le.status_code >= 400
        ORDER BY le.timestamp ASC, le.id ASC
        ",
    )?;
    let rows = stmt
        .query(params![date])?
        .mapped(|row| {
            Ok(ErrorLogRow {
                ip_address: row.get(0)?,
                timestamp: row.get(1)?,
                path: row.get(2)?,
                status_code: row.get(3)?,
                user_agent: row.get(4)?,
            })
        })
        .collect();
    rows
}

pub fn database_stats(con: &Connection) -> rusqlite::Result<DatabaseStats> {
    con.query_row(
        "
        SELECT
            (SELECT COUNT(*) FROM log_entries),
            (SELECT COUNT(*) FROM user_agents),
            (SELECT COUNT(DISTINCT ip_address) FROM log_entries),
            (SELECT MIN(timestamp) FROM log_entries),
            (SELECT MAX(timestamp) FROM log_entries)
        ",
        [],
        |row| {
            Ok(DatabaseStats {
                total_log_entries: row.get(0)?,
                total_user_agents: row.get(1)?,
                unique_ips: row.get(2)?,
                earliest: row.get(3)?,
                latest: row.get(4)?,
            })
        },
    )
}
