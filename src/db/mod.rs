use crate::config::DatabaseConfig;
use crate::error::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::time::Duration;
use tracing::info;

pub mod cache;
pub mod loader;
pub mod reports;
pub mod repositories;

pub use cache::UserAgentCache;
pub use loader::BatchLoader;

const SCHEMA: &str = include_str!("schema.sql");

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn init(config: &DatabaseConfig) -> Result<DbPool> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let in_memory = config.path == ":memory:";

    // Every in-memory connection is its own database, so share a single one
    let (manager, max_size) = if in_memory {
        (SqliteConnectionManager::memory(), 1)
    } else {
        (SqliteConnectionManager::file(&config.path), config.pool_size)
    };
    let manager = manager.with_init(move |c| {
        c.busy_timeout(busy_timeout)?;
        c.execute_batch("PRAGMA foreign_keys = ON;")
    });

    let pool = r2d2::Pool::builder().max_size(max_size).build(manager)?;
    let conn = pool.get()?;
    create_schema(&conn)?;
    info!(path = %config.path, pool_size = max_size, "database ready");
    Ok(pool)
}
