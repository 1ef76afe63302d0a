use super::cache::UserAgentCache;
use super::repositories::{bulk_insert, existing_hashes, NewLogEntry};
use crate::error::Result;
use crate::models::{InsertOutcome, LogRecord};
use itertools::Itertools;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::HashSet;
use tracing::{debug, info};

/// Writes parsed records to the store, one transaction per batch.
///
/// Owns the transaction boundary: a batch is either fully visible after
/// [`BatchLoader::load`] returns `Ok`, or not at all.
pub struct BatchLoader<'conn> {
    conn: &'conn mut Connection,
}

impl<'conn> BatchLoader<'conn> {
    pub fn new(conn: &'conn mut Connection) -> Self {
        BatchLoader { conn }
    }

    // Take the write lock up front: a deferred transaction that reads first
    // gets SQLITE_BUSY without waiting when another file's loader is writing
    fn begin(&mut self) -> rusqlite::Result<Transaction> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
    }

    /// Loads a batch and returns the number of newly inserted entries.
    /// Records whose identity hash is already stored are skipped silently.
    ///
    /// On error nothing of the batch is kept and the error is returned
    /// as is, retrying is up to the caller.
    pub fn load(&mut self, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.begin()?;
        let inserted = load_batch(&tx, records, UserAgentCache::new())?;
        tx.commit()?;

        info!(
            batch_len = records.len(),
            inserted,
            skipped = records.len() - inserted,
            "batch committed"
        );
        Ok(inserted)
    }

    /// Single record variant of [`BatchLoader::load`], committed on its own.
    pub fn insert_one(&mut self, record: &LogRecord) -> Result<InsertOutcome> {
        let tx = self.begin()?;
        let log_hash = record.identity_hash();
        if !existing_hashes(&tx, [log_hash.as_str()])?.is_empty() {
            debug!(%log_hash, "entry already stored");
            return Ok(InsertOutcome::Duplicate);
        }

        let mut cache = UserAgentCache::new();
        let user_agent_id = record
            .user_agent
            .as_deref()
            .map(|ua| cache.resolve(&tx, ua))
            .transpose()?;
        bulk_insert(
            &tx,
            &[NewLogEntry {
                record,
                log_hash,
                user_agent_id,
            }],
        )?;
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }
}

/// The body of one batch, run inside the caller's transaction.
///
/// The cache is taken by value so it cannot leak into the next batch.
pub fn load_batch(
    con: &Connection,
    records: &[LogRecord],
    mut cache: UserAgentCache,
) -> rusqlite::Result<usize> {
    for user_agent in records
        .iter()
        .filter_map(|r| r.user_agent.as_deref())
        .unique()
    {
        cache.resolve(con, user_agent)?;
    }

    let hashes = records.iter().map(LogRecord::identity_hash).collect::<Vec<_>>();
    let existing = existing_hashes(con, hashes.iter().map(String::as_str))?;

    // A hash repeated inside the batch would trip the unique constraint and
    // throw away the whole batch, keep the first occurrence only
    let mut staged_hashes = HashSet::new();
    let rows = records
        .iter()
        .zip(hashes)
        .filter(|(_, hash)| !existing.contains(hash) && staged_hashes.insert(hash.clone()))
        .map(|(record, log_hash)| NewLogEntry {
            record,
            log_hash,
            user_agent_id: record.user_agent.as_deref().and_then(|ua| cache.get(ua)),
        })
        .collect::<Vec<_>>();

    debug!(
        batch_len = records.len(),
        already_stored = existing.len(),
        staged = rows.len(),
        user_agents = cache.len(),
        "staged batch"
    );
    bulk_insert(con, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::models::tests::record;
    use assert_matches::assert_matches;

    fn count(con: &Connection, table: &str) -> i64 {
        con.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn empty_batch_does_not_touch_the_store() {
        // No schema: any query would fail
        let mut con = Connection::open_in_memory().unwrap();
        assert_eq!(BatchLoader::new(&mut con).load(&[]).unwrap(), 0);
    }

    #[test]
    fn loading_twice_inserts_once() {
        let mut con = memory_db();
        let batch = vec![record("10.0.0.1", "/a"), record("10.0.0.2", "/b")];

        let mut loader = BatchLoader::new(&mut con);
        assert_eq!(loader.load(&batch).unwrap(), 2);
        assert_eq!(loader.load(&batch).unwrap(), 0);
        assert_eq!(count(&con, "log_entries"), 2);
    }

    #[test]
    fn partially_known_batch_inserts_the_rest() {
        let mut con = memory_db();
        let mut loader = BatchLoader::new(&mut con);
        loader.load(&[record("10.0.0.1", "/a")]).unwrap();
        let inserted = loader
            .load(&[record("10.0.0.1", "/a"), record("10.0.0.1", "/new")])
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn repeated_hash_inside_batch_is_kept_once() {
        let mut con = memory_db();
        let mut second = record("10.0.0.1", "/a");
        second.bytes_sent = 1;
        let inserted = BatchLoader::new(&mut con)
            .load(&[record("10.0.0.1", "/a"), second])
            .unwrap();
        assert_eq!(inserted, 1);
        let bytes: i64 = con
            .query_row("SELECT bytes_sent FROM log_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bytes, 2326);
    }

    #[test]
    fn user_agents_are_created_once_and_linked() {
        let mut con = memory_db();
        let mut anonymous = record("10.0.0.3", "/c");
        anonymous.user_agent = None;
        let batch = vec![record("10.0.0.1", "/a"), record("10.0.0.2", "/b"), anonymous];

        assert_eq!(BatchLoader::new(&mut con).load(&batch).unwrap(), 3);
        assert_eq!(count(&con, "user_agents"), 1);

        let linked: i64 = con
            .query_row(
                "SELECT COUNT(*) FROM log_entries e JOIN user_agents ua ON e.user_agent_id = ua.id WHERE ua.os = 'Windows'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, 2);
        let unlinked: i64 = con
            .query_row(
                "SELECT COUNT(*) FROM log_entries WHERE user_agent_id IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(unlinked, 1);
    }

    #[test]
    fn rejected_row_rolls_back_whole_batch() {
        let mut con = memory_db();
        con.execute_batch(
            "
            CREATE TRIGGER reject_boom BEFORE INSERT ON log_entries
            WHEN NEW.path = '/boom'
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END;
            ",
        )
        .unwrap();

        let mut bad = record("10.0.0.9", "/boom");
        bad.user_agent = Some("only-in-this-batch".to_owned());
        let batch = vec![record("10.0.0.1", "/a"), bad, record("10.0.0.2", "/b")];

        let result = BatchLoader::new(&mut con).load(&batch);
        assert_matches!(result, Err(ref e) if e.is_store_failure());
        assert_eq!(count(&con, "log_entries"), 0);
        assert_eq!(count(&con, "user_agents"), 0);

        // The connection is usable again for the next batch
        let inserted = BatchLoader::new(&mut con)
            .load(&[record("10.0.0.1", "/a")])
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn insert_one_skips_duplicates() {
        let mut con = memory_db();
        let mut loader = BatchLoader::new(&mut con);
        let r = record("10.0.0.1", "/a");
        assert_eq!(loader.insert_one(&r).unwrap(), InsertOutcome::Inserted);
        assert_eq!(loader.insert_one(&r).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(loader.load(&[r]).unwrap(), 0);
        assert_eq!(count(&con, "log_entries"), 1);
        assert_eq!(count(&con, "user_agents"), 1);
    }
}
