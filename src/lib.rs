pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod tail;
pub mod useragent;

pub use config::Config;
pub use db::{BatchLoader, DbPool, UserAgentCache};
pub use error::{Error, Result};
pub use models::{InsertOutcome, LogRecord, Timestamp, UserAgentInfo};
pub use parser::{LineParser, ParseFailure, ParseStats};
pub use tail::{FollowEvent, TailCursor, TailState};
pub use useragent::classify;
