use crate::db::{BatchLoader, DbPool};
use crate::error::{Error, Result};
use crate::models::LogRecord;
use crate::parser::LineParser;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub lines: u64,
    pub parsed: u64,
    pub errors: u64,
    pub inserted: usize,
    pub failed_batches: usize,
}

struct BatchWriter<'l, 'conn> {
    loader: &'l mut BatchLoader<'conn>,
    batch: Vec<LogRecord>,
    batch_size: usize,
    inserted: usize,
    failed_batches: usize,
}

impl<'l, 'conn> BatchWriter<'l, 'conn> {
    fn push(&mut self, record: LogRecord) {
        self.batch.push(record);
        if self.batch.len() >= self.batch_size {
            self.flush();
        }
    }

    // A failed batch is logged and dropped, the run goes on with the next one
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        match self.loader.load(&self.batch) {
            Ok(inserted) => self.inserted += inserted,
            Err(err) => {
                error!(error = %err, batch_len = self.batch.len(), "batch failed; skipping");
                self.failed_batches += 1;
            }
        }
        self.batch.clear();
    }
}

/// Parses every line of `reader` and loads the records in batches of
/// `batch_size`. Invalid UTF-8 is replaced rather than rejected.
pub fn ingest_reader<R: BufRead>(
    mut reader: R,
    parser: &mut LineParser,
    loader: &mut BatchLoader,
    batch_size: usize,
) -> std::io::Result<IngestSummary> {
    let batch_size = batch_size.max(1);
    let mut writer = BatchWriter {
        loader,
        batch: Vec::with_capacity(batch_size),
        batch_size,
        inserted: 0,
        failed_batches: 0,
    };
    let start = parser.stats();
    let mut lines = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lines += 1;
        if let Ok(record) = parser.parse(&String::from_utf8_lossy(&buf)) {
            writer.push(record);
        }
    }
    writer.flush();

    let end = parser.stats();
    Ok(IngestSummary {
        lines,
        parsed: end.parsed - start.parsed,
        errors: end.errors - start.errors,
        inserted: writer.inserted,
        failed_batches: writer.failed_batches,
    })
}

pub fn ingest_file(
    path: &Path,
    parser: &mut LineParser,
    loader: &mut BatchLoader,
    batch_size: usize,
) -> Result<IngestSummary> {
    info!(path = %path.display(), batch_size, "processing log file");
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let summary = ingest_reader(BufReader::new(file), parser, loader, batch_size)
        .map_err(|e| Error::io(path, e))?;
    info!(
        path = %path.display(),
        lines = summary.lines,
        parsed = summary.parsed,
        errors = summary.errors,
        inserted = summary.inserted,
        failed_batches = summary.failed_batches,
        "finished processing log file"
    );
    Ok(summary)
}

/// Runs one pipeline per file in parallel, each with its own pooled
/// connection and its own copy of `parser`. Results keep the order of `paths`.
pub fn ingest_files(
    pool: &DbPool,
    paths: &[PathBuf],
    parser: &LineParser,
    batch_size: usize,
) -> Vec<(PathBuf, Result<IngestSummary>)> {
    paths
        .par_iter()
        .map(|path| {
            let result = pool.get().map_err(Error::from).and_then(|mut conn| {
                let mut parser = parser.clone();
                parser.reset();
                let mut loader = BatchLoader::new(&mut conn);
                ingest_file(path, &mut parser, &mut loader, batch_size)
            });
            (path.clone(), result)
        })
        .collect()
}
