use crate::error::Result;
use crate::models::{LogRecord, UserAgentInfo, WALL_CLOCK_FORMAT};
use chrono::{Duration, NaiveDateTime};
use itertools::Itertools;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use tracing::info;

// Stays well below SQLITE_MAX_VARIABLE_NUMBER on every SQLite build
const HASH_LOOKUP_CHUNK: usize = 500;

/// A log entry staged for insertion, with its identity hash and resolved
/// user agent already attached.
#[derive(Debug, Clone)]
pub struct NewLogEntry<'r> {
    pub record: &'r LogRecord,
    pub log_hash: String,
    pub user_agent_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupSummary {
    pub deleted_entries: usize,
    pub deleted_user_agents: usize,
}

pub fn find_user_agent_id(con: &Connection, raw: &str) -> rusqlite::Result<Option<i64>> {
    let mut stmt = con.prepare_cached(
        "
        SELECT id FROM user_agents WHERE user_agent_string = ?
        ",
    )?;
    stmt.query_row(params![raw], |row| row.get(0)).optional()
}

pub fn insert_user_agent(
    con: &Connection,
    raw: &str,
    info: &UserAgentInfo,
) -> rusqlite::Result<i64> {
    let mut stmt = con.prepare_cached(
        "
            INSERT INTO
            user_agents(user_agent_string, os, browser, device_type)
            VALUES(?, ?, ?, ?)
            RETURNING id
        ",
    )?;
    stmt.query_row(
        params![raw, info.os, info.browser, info.device_type],
        // Get the ID
        |row| row.get(0),
    )
}

/// Returns the subset of `hashes` that is already stored.
pub fn existing_hashes<'h, I>(con: &Connection, hashes: I) -> rusqlite::Result<HashSet<String>>
where
    I: IntoIterator<Item = &'h str>,
{
    let mut found = HashSet::new();
    for chunk in &hashes.into_iter().chunks(HASH_LOOKUP_CHUNK) {
        let chunk = chunk.collect::<Vec<_>>();
        let sql = format!(
            "SELECT log_hash FROM log_entries WHERE log_hash IN ({})",
            std::iter::repeat("?").take(chunk.len()).join(", ")
        );
        let mut stmt = con.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
        for hash in rows {
            found.insert(hash?);
        }
    }
    Ok(found)
}

/// Inserts all rows and returns how many the store reports as inserted.
pub fn bulk_insert(con: &Connection, rows: &[NewLogEntry]) -> rusqlite::Result<usize> {
    let mut stmt = con.prepare_cached(
        "
            INSERT INTO
            log_entries(ip_address, timestamp, utc_offset, method, path, status_code,
                        bytes_sent, referrer, user_agent_id, log_hash)
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )?;
    let mut inserted = 0;
    for row in rows {
        let r = row.record;
        inserted += stmt.execute(params![
            r.client_address,
            r.timestamp.wall_clock(),
            r.timestamp.offset_seconds(),
            r.method,
            r.path,
            r.status_code,
            i64::try_from(r.bytes_sent)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            r.referrer,
            row.user_agent_id,
            row.log_hash,
        ])?;
    }
    Ok(inserted)
}

/// Deletes entries logged before `cutoff` (wall clock) and then every user
/// agent no longer referenced by an entry, in one transaction.
pub fn cleanup_before(con: &mut Connection, cutoff: NaiveDateTime) -> Result<CleanupSummary> {
    let tx = con.transaction()?;
    let deleted_entries = tx.execute(
        "DELETE FROM log_entries WHERE timestamp < ?",
        params![cutoff.format(WALL_CLOCK_FORMAT).to_string()],
    )?;
    let deleted_user_agents = tx.execute(
        "
        DELETE FROM user_agents
        WHERE id NOT IN (
            SELECT DISTINCT user_agent_id FROM log_entries WHERE user_agent_id IS NOT NULL
        )
        ",
        [],
    )?;
    tx.commit()?;

    info!(
        deleted_entries,
        deleted_user_agents,
        cutoff = %cutoff,
        "cleaned up old log entries"
    );
    Ok(CleanupSummary {
        deleted_entries,
        deleted_user_agents,
    })
}

pub fn cleanup_old_entries(con: &mut Connection, days: u32) -> Result<CleanupSummary> {
    let cutoff = chrono::Local::now().naive_local() - Duration::days(i64::from(days));
    cleanup_before(con, cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::models::tests::record;
    use crate::useragent::classify;

    fn stage(record: &LogRecord) -> NewLogEntry {
        NewLogEntry {
            record,
            log_hash: record.identity_hash(),
            user_agent_id: None,
        }
    }

    #[test]
    fn user_agent_lookup_and_insert() {
        let con = memory_db();
        let raw = "Mozilla/5.0 (Windows NT 10.0)";
        assert_eq!(find_user_agent_id(&con, raw).unwrap(), None);

        let id = insert_user_agent(&con, raw, &classify(Some(raw))).unwrap();
        assert_eq!(find_user_agent_id(&con, raw).unwrap(), Some(id));

        let (os, browser, device): (String, String, String) = con
            .query_row(
                "SELECT os, browser, device_type FROM user_agents WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(
            (os.as_str(), browser.as_str(), device.as_str()),
            ("Windows", "Unknown Browser", "Desktop")
        );
    }

    #[test]
    fn existing_hashes_returns_only_stored() {
        let con = memory_db();
        let a = record("10.0.0.1", "/a");
        let b = record("10.0.0.2", "/b");
        assert_eq!(bulk_insert(&con, &[stage(&a)]).unwrap(), 1);

        let hashes = [a.identity_hash(), b.identity_hash()];
        let found = existing_hashes(&con, hashes.iter().map(String::as_str)).unwrap();
        assert_eq!(found, [a.identity_hash()].into_iter().collect());
    }

    #[test]
    fn existing_hashes_spans_chunks() {
        let con = memory_db();
        let records = (0..HASH_LOOKUP_CHUNK + 25)
            .map(|i| record("10.0.0.1", &format!("/page/{}", i)))
            .collect::<Vec<_>>();
        let staged = records.iter().map(stage).collect::<Vec<_>>();
        assert_eq!(bulk_insert(&con, &staged).unwrap(), records.len());

        let hashes = staged.iter().map(|s| s.log_hash.clone()).collect::<Vec<_>>();
        let found = existing_hashes(&con, hashes.iter().map(String::as_str)).unwrap();
        assert_eq!(found.len(), records.len());
    }

    #[test]
    fn bulk_insert_stores_all_fields() {
        let con = memory_db();
        let mut r = record("127.0.0.1", "/a.gif");
        r.referrer = None;
        bulk_insert(&con, &[stage(&r)]).unwrap();

        let row: (String, String, Option<i32>, String, String, i64, i64, Option<String>) = con
            .query_row(
                "SELECT ip_address, timestamp, utc_offset, method, path, status_code, bytes_sent, referrer FROM log_entries",
                [],
                |f| {
                    Ok((
                        f.get(0)?,
                        f.get(1)?,
                        f.get(2)?,
                        f.get(3)?,
                        f.get(4)?,
                        f.get(5)?,
                        f.get(6)?,
                        f.get(7)?,
                    ))
                },
            )
            .unwrap();
        assert_eq!(
            row,
            (
                "127.0.0.1".to_owned(),
                "2000-10-10 13:55:36".to_owned(),
                Some(-25200),
                "GET".to_owned(),
                "/a.gif".to_owned(),
                200,
                2326,
                None
            )
        );
    }

    #[test]
    fn bulk_insert_refuses_unstorable_byte_counts() {
        let con = memory_db();
        let mut r = record("10.0.0.1", "/huge");
        r.bytes_sent = u64::MAX;
        assert!(matches!(
            bulk_insert(&con, &[stage(&r)]),
            Err(rusqlite::Error::ToSqlConversionFailure(_))
        ));

        r.bytes_sent = i64::MAX as u64;
        assert_eq!(bulk_insert(&con, &[stage(&r)]).unwrap(), 1);
        let stored: i64 = con
            .query_row("SELECT bytes_sent FROM log_entries", [], |f| f.get(0))
            .unwrap();
        assert_eq!(stored, i64::MAX);
    }

    #[test]
    fn cleanup_removes_old_entries_and_orphans() {
        let mut con = memory_db();
        let old = record("10.0.0.1", "/old");
        let mut recent = record("10.0.0.2", "/recent");
        recent.timestamp.local += Duration::days(365 * 20);

        let old_agent = insert_user_agent(&con, "old-agent", &classify(Some("old-agent"))).unwrap();
        let kept_agent = insert_user_agent(&con, "kept-agent", &classify(Some("kept-agent"))).unwrap();
        bulk_insert(
            &con,
            &[
                NewLogEntry {
                    user_agent_id: Some(old_agent),
                    ..stage(&old)
                },
                NewLogEntry {
                    user_agent_id: Some(kept_agent),
                    ..stage(&recent)
                },
            ],
        )
        .unwrap();

        let cutoff = old.timestamp.local + Duration::days(1);
        let summary = cleanup_before(&mut con, cutoff).unwrap();
        assert_eq!(
            summary,
            CleanupSummary {
                deleted_entries: 1,
                deleted_user_agents: 1
            }
        );
        assert_eq!(find_user_agent_id(&con, "old-agent").unwrap(), None);
        assert_eq!(find_user_agent_id(&con, "kept-agent").unwrap(), Some(kept_agent));
    }
}
