use chrono::{DateTime, FixedOffset, NaiveDateTime};
use sha2::{Digest, Sha256};

pub const WALL_CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Point in time as written in the log. The offset is missing when the log
/// line carried none (or an unparseable one).
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
pub struct Timestamp {
    pub local: NaiveDateTime,
    pub offset: Option<FixedOffset>,
}

impl Timestamp {
    pub fn naive(local: NaiveDateTime) -> Self {
        Timestamp {
            local,
            offset: None,
        }
    }

    /// Wall clock part only, this is what the `timestamp` column stores.
    pub fn wall_clock(&self) -> String {
        self.local.format(WALL_CLOCK_FORMAT).to_string()
    }

    pub fn offset_seconds(&self) -> Option<i32> {
        self.offset.map(|o| o.local_minus_utc())
    }

    /// `2000-10-10 13:55:36-07:00`, or without the offset suffix when there
    /// is none. Feeds the identity hash, so the layout must not change.
    pub fn canonical(&self) -> String {
        match self.offset {
            Some(offset) => format!("{}{}", self.wall_clock(), offset),
            None => self.wall_clock(),
        }
    }
}

impl From<DateTime<FixedOffset>> for Timestamp {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Timestamp {
            local: dt.naive_local(),
            offset: Some(*dt.offset()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct LogRecord {
    pub client_address: String,
    pub timestamp: Timestamp,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl LogRecord {
    /// SHA-256 over the identity fields, as 64 lowercase hex characters.
    ///
    /// Bytes sent, referrer and user agent are not part of the key: two
    /// requests that differ only in those are the same entry.
    pub fn identity_hash(&self) -> String {
        let key = format!(
            "{}_{}_{}_{}_{}",
            self.client_address,
            self.timestamp.canonical(),
            self.method,
            self.path,
            self.status_code
        );
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }
}

#[derive(PartialEq, Eq, Clone, Hash, Debug)]
pub struct UserAgentInfo {
    pub os: &'static str,
    pub browser: &'static str,
    pub device_type: &'static str,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}
