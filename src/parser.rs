use crate::error::{Error, Result};
use crate::models::{LogRecord, Timestamp};
use chrono::{DateTime, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

// https://httpd.apache.org/docs/2.4/logs.html
// (Looks like double quoted values need not escaping support?)
pub const COMBINED_LOG_PATTERN: &str = r#"^(?P<ip>[^ ]+) - - \[(?P<timestamp>[^\]]*)\] "(?P<request>.*?)" (?P<status>\d{3}) (?P<bytes>\d+|-) "(?P<referrer>.*?)" "(?P<user_agent>.*?)""#;
pub const COMMON_LOG_PATTERN: &str = r#"^(?P<ip>[^ ]+) - - \[(?P<timestamp>[^\]]*)\] "(?P<request>.*?)" (?P<status>\d{3}) (?P<bytes>\d+|-)$"#;

const MAX_BYTES_SENT: u64 = i64::MAX as u64;

const REQUIRED_GROUPS: [&str; 5] = ["ip", "timestamp", "request", "status", "bytes"];

const TIMESTAMP_WITH_OFFSET: &str = "%d/%b/%Y:%H:%M:%S %z";
const TIMESTAMP_WITHOUT_OFFSET: &str = "%d/%b/%Y:%H:%M:%S";

static DEFAULT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(COMBINED_LOG_PATTERN).unwrap(),
        Regex::new(COMMON_LOG_PATTERN).unwrap(),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("empty line")]
    Empty,
    #[error("line does not match any log format")]
    Malformed,
    #[error("unparseable timestamp")]
    BadTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseStats {
    pub parsed: u64,
    pub errors: u64,
    pub total: u64,
}

/// Turns raw access log lines into [`LogRecord`]s.
///
/// Grammars are tried in order and the first one that matches is used.
/// Counters belong to the instance; run one parser per pipeline.
#[derive(Debug, Clone)]
pub struct LineParser {
    patterns: Vec<Regex>,
    parsed_count: u64,
    error_count: u64,
}

impl Default for LineParser {
    fn default() -> Self {
        LineParser {
            patterns: DEFAULT_PATTERNS.clone(),
            parsed_count: 0,
            error_count: 0,
        }
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given grammars instead of the Apache combined/common pair.
    /// Every grammar needs the `ip`, `timestamp`, `request`, `status` and
    /// `bytes` groups, `referrer` and `user_agent` are optional.
    pub fn with_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let patterns = patterns
            .iter()
            .map(|p| -> Result<Regex> {
                let regex = Regex::new(p.as_ref())?;
                let names = regex.capture_names().flatten().collect::<Vec<_>>();
                if let Some(missing) = REQUIRED_GROUPS.iter().find(|g| !names.contains(g)) {
                    return Err(Error::Config(format!(
                        "log pattern '{}' has no '{}' group",
                        p.as_ref(),
                        missing
                    )));
                }
                Ok(regex)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LineParser {
            patterns,
            parsed_count: 0,
            error_count: 0,
        })
    }

    pub fn parse(&mut self, line: &str) -> Result<LogRecord, ParseFailure> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseFailure::Empty);
        }

        match self.parse_trimmed(line) {
            Ok(record) => {
                self.parsed_count += 1;
                Ok(record)
            }
            Err(failure) => {
                self.error_count += 1;
                match failure {
                    ParseFailure::BadTimestamp => warn!(line, "invalid timestamp in log line"),
                    _ => warn!(line, "malformed log line"),
                }
                Err(failure)
            }
        }
    }

    fn parse_trimmed(&self, line: &str) -> Result<LogRecord, ParseFailure> {
        let captures = self
            .patterns
            .iter()
            .find_map(|re| re.captures(line))
            .ok_or(ParseFailure::Malformed)?;

        let group = |name: &str| captures.name(name).map(|m| m.as_str());

        if let (Some(ip), Some(timestamp), Some(request), Some(status), Some(bytes)) = (
            group("ip"),
            group("timestamp"),
            group("request"),
            group("status"),
            group("bytes"),
        ) {
            let status_code = status
                .parse::<u16>()
                .map_err(|_| ParseFailure::Malformed)?;
            // The store keeps a signed 64-bit integer
            let bytes_sent = match bytes {
                "-" => 0,
                b => b
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n <= MAX_BYTES_SENT)
                    .ok_or(ParseFailure::Malformed)?,
            };
            let timestamp = parse_timestamp(timestamp).ok_or(ParseFailure::BadTimestamp)?;
            let (method, path) = split_request(request);

            Ok(LogRecord {
                client_address: ip.to_owned(),
                timestamp,
                method,
                path,
                status_code,
                bytes_sent,
                referrer: optional_field(&captures, "referrer"),
                user_agent: optional_field(&captures, "user_agent"),
            })
        } else {
            Err(ParseFailure::Malformed)
        }
    }

    pub fn parsed_count(&self) -> u64 {
        self.parsed_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn stats(&self) -> ParseStats {
        ParseStats {
            parsed: self.parsed_count,
            errors: self.error_count,
            total: self.parsed_count + self.error_count,
        }
    }

    pub fn reset(&mut self) {
        self.parsed_count = 0;
        self.error_count = 0;
    }
}

/// `-` (and an empty value) is the log's placeholder for "not present".
fn optional_field(captures: &Captures, name: &str) -> Option<String> {
    captures
        .name(name)
        .map(|m| m.as_str())
        .filter(|v| !v.is_empty() && *v != "-")
        .map(str::to_owned)
}

fn split_request(request: &str) -> (String, String) {
    let mut tokens = request.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(method), Some(path)) => (method.to_owned(), path.to_owned()),
        (Some(method), None) => (method.to_owned(), "/".to_owned()),
        _ => ("UNKNOWN".to_owned(), "/".to_owned()),
    }
}

pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_str(raw, TIMESTAMP_WITH_OFFSET) {
        return Some(dt.into());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_WITHOUT_OFFSET) {
        return Some(Timestamp::naive(naive));
    }
    // Unknown zone suffix, keep the wall clock and drop the zone
    let (date_part, _zone) = raw.rsplit_once(' ')?;
    NaiveDateTime::parse_from_str(date_part, TIMESTAMP_WITHOUT_OFFSET)
        .ok()
        .map(Timestamp::naive)
}
