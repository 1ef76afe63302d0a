use std::path::PathBuf;

/// Crate-wide error. `Sqlite` and `Pool` are store failures: the batch that
/// hit them has been rolled back and the caller decides whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures raised by the store rather than by the input.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Sqlite(_) | Error::Pool(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
