use crate::db::BatchLoader;
use crate::error::{Error, Result};
use crate::parser::LineParser;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// Caught up with the end of the file (a partial last line may be pending).
    Idle,
    /// The last poll returned new lines.
    Draining,
}

/// Byte offset into a growing file. Each [`TailCursor::poll`] returns the
/// complete lines appended since the previous one.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    state: TailState,
}

impl TailCursor {
    /// Starts at the current end of the file, existing content is never
    /// returned.
    pub fn at_end(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let offset = fs::metadata(&path).map_err(|e| Error::io(&path, e))?.len();
        Ok(Self::at_offset(path, offset))
    }

    pub fn at_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        TailCursor {
            path: path.into(),
            offset,
            state: TailState::Idle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Reads what was appended since the last poll. The offset only moves past
    /// complete lines, a line without its terminator is read again next time.
    pub fn poll(&mut self) -> Result<Vec<String>> {
        let mut file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let len = file.metadata().map_err(|e| Error::io(&self.path, e))?.len();

        if len < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = len,
                "file truncated or rotated; reading from the start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            self.state = TailState::Idle;
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| Error::io(&self.path, e))?;
        let mut buffer = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buffer)
            .map_err(|e| Error::io(&self.path, e))?;

        let complete = match buffer.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => {
                debug!(
                    path = %self.path.display(),
                    pending_bytes = buffer.len(),
                    "waiting for the rest of a partial line"
                );
                self.state = TailState::Idle;
                return Ok(Vec::new());
            }
        };

        let lines = buffer[..complete]
            .split_inclusive(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\n").unwrap_or(line);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect::<Vec<_>>();

        debug!(
            path = %self.path.display(),
            from = self.offset,
            to = self.offset + complete as u64,
            lines = lines.len(),
            "cursor advanced"
        );
        self.offset += complete as u64;
        self.state = TailState::Draining;
        Ok(lines)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub lines: usize,
    pub parsed: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEvent {
    Processed(TickReport),
    Failed(String),
}

/// One poll of the cursor pushed through the parser and loader as a single
/// micro-batch. Returns `None` when nothing new was appended.
///
/// The cursor has already moved when the load fails, so the lines of a failed
/// batch are not retried.
pub fn tick(
    cursor: &mut TailCursor,
    parser: &mut LineParser,
    loader: &mut BatchLoader,
) -> Result<Option<TickReport>> {
    let lines = cursor.poll()?;
    if lines.is_empty() {
        return Ok(None);
    }

    let records = lines
        .iter()
        .filter_map(|line| parser.parse(line).ok())
        .collect::<Vec<_>>();
    let inserted = loader.load(&records)?;

    Ok(Some(TickReport {
        lines: lines.len(),
        parsed: records.len(),
        inserted,
    }))
}

/// Follows the file until `cancel` yields a message or its sender is dropped.
///
/// The signal is only observed between ticks: a commit in progress always
/// finishes, a wait between polls ends at once. Failed ticks are logged and
/// reported on `events`, they never stop the loop.
pub fn follow(
    cursor: &mut TailCursor,
    parser: &mut LineParser,
    loader: &mut BatchLoader,
    interval: Duration,
    cancel: &Receiver<()>,
    events: &Sender<FollowEvent>,
) {
    info!(
        path = %cursor.path().display(),
        offset = cursor.offset(),
        interval_ms = interval.as_millis() as u64,
        "following log file"
    );

    loop {
        match tick(cursor, parser, loader) {
            Ok(Some(report)) => {
                info!(
                    path = %cursor.path().display(),
                    lines = report.lines,
                    parsed = report.parsed,
                    inserted = report.inserted,
                    "processed new log lines"
                );
                let _ = events.send(FollowEvent::Processed(report));
            }
            Ok(None) => {}
            Err(err) => {
                error!(
                    error = %err,
                    path = %cursor.path().display(),
                    offset = cursor.offset(),
                    "tick failed; continuing"
                );
                let _ = events.send(FollowEvent::Failed(err.to_string()));
            }
        }

        match cancel.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(
        path = %cursor.path().display(),
        offset = cursor.offset(),
        "stopped following log file"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::time::Instant;

    fn line(n: usize) -> String {
        format!(
            r#"10.0.0.{} - - [10/Oct/2000:13:55:36 -0700] "GET /page/{} HTTP/1.1" 200 100 "-" "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0""#,
            n % 250,
            n
        )
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn file_with(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn existing_content_is_not_replayed() {
        let file = file_with(&format!("{}\n{}\n{}\n", line(1), line(2), line(3)));
        let mut cursor = TailCursor::at_end(file.path()).unwrap();
        assert_eq!(cursor.state(), TailState::Idle);
        assert!(cursor.poll().unwrap().is_empty());

        append(file.path(), &format!("{}\n{}\n", line(4), line(5)));
        let lines = cursor.poll().unwrap();
        assert_eq!(lines, vec![line(4), line(5)]);
        assert_eq!(cursor.state(), TailState::Draining);

        assert!(cursor.poll().unwrap().is_empty());
        assert_eq!(cursor.state(), TailState::Idle);
    }

    #[test]
    fn partial_line_is_held_back() {
        let file = file_with("");
        let mut cursor = TailCursor::at_end(file.path()).unwrap();

        append(file.path(), "first\nsec");
        assert_eq!(cursor.poll().unwrap(), vec!["first".to_owned()]);
        assert_eq!(cursor.offset(), 6);

        assert!(cursor.poll().unwrap().is_empty());
        assert_eq!(cursor.offset(), 6);

        append(file.path(), "ond\r\n");
        assert_eq!(cursor.poll().unwrap(), vec!["second".to_owned()]);
        assert_eq!(cursor.offset(), 6 + 8);
    }

    #[test]
    fn truncated_file_is_read_from_start() {
        let file = file_with("old line one\nold line two\n");
        let mut cursor = TailCursor::at_end(file.path()).unwrap();

        fs::write(file.path(), "new\n").unwrap();
        assert_eq!(cursor.poll().unwrap(), vec!["new".to_owned()]);
        assert_eq!(cursor.offset(), 4);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TailCursor::at_end(dir.path().join("nope.log")).is_err());

        let mut cursor = TailCursor::at_offset(dir.path().join("nope.log"), 0);
        assert!(matches!(cursor.poll(), Err(Error::Io { .. })));
    }

    #[test]
    fn tick_loads_only_new_lines() {
        let file = file_with(&format!("{}\n", line(1)));
        let mut con = memory_db();
        let mut cursor = TailCursor::at_end(file.path()).unwrap();
        let mut parser = LineParser::new();
        let mut loader = BatchLoader::new(&mut con);

        assert_eq!(tick(&mut cursor, &mut parser, &mut loader).unwrap(), None);

        append(
            file.path(),
            &format!("{}\nnot a log line\n{}\n", line(2), line(3)),
        );
        let report = tick(&mut cursor, &mut parser, &mut loader).unwrap();
        assert_eq!(
            report,
            Some(TickReport {
                lines: 3,
                parsed: 2,
                inserted: 2
            })
        );
        assert_eq!(parser.error_count(), 1);
    }

    #[test]
    fn follow_processes_appends_until_cancelled() {
        let file = file_with(&format!("{}\n{}\n", line(1), line(2)));
        let mut cursor = TailCursor::at_end(file.path()).unwrap();
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let follower = std::thread::spawn(move || {
            let mut con = memory_db();
            let mut parser = LineParser::new();
            {
                let mut loader = BatchLoader::new(&mut con);
                follow(
                    &mut cursor,
                    &mut parser,
                    &mut loader,
                    Duration::from_millis(10),
                    &cancel_rx,
                    &events_tx,
                );
            }
            con.query_row("SELECT COUNT(*) FROM log_entries", [], |r| r.get::<_, i64>(0))
                .unwrap()
        });

        append(file.path(), &(3..6).map(|n| line(n) + "\n").collect::<String>());

        let mut inserted = 0;
        while inserted < 3 {
            match events_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                FollowEvent::Processed(report) => inserted += report.inserted,
                FollowEvent::Failed(err) => panic!("tick failed: {}", err),
            }
        }

        cancel_tx.send(()).unwrap();
        assert_eq!(follower.join().unwrap(), 3);
    }

    #[test]
    fn cancellation_interrupts_the_wait() {
        let file = file_with("");
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let (events_tx, _events_rx) = crossbeam_channel::unbounded();
        let mut cursor = TailCursor::at_end(file.path()).unwrap();

        let started = Instant::now();
        let follower = std::thread::spawn(move || {
            let mut con = memory_db();
            let mut loader = BatchLoader::new(&mut con);
            follow(
                &mut cursor,
                &mut LineParser::new(),
                &mut loader,
                Duration::from_secs(60),
                &cancel_rx,
                &events_tx,
            );
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(cancel_tx);
        follower.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
