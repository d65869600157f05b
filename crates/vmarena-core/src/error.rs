use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("failed to reserve {size} bytes of address space: {source}")]
    ReservationFailed {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to commit {size} bytes at offset {offset}: {source}")]
    CommitFailed {
        offset: usize,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("arena exhausted: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory { requested: usize, remaining: usize },

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("arena has been destroyed")]
    Destroyed,

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("file is empty: {0}")]
    EmptyFile(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("short read on {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("short write on {path}: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ArenaError {
    /// Map an open/stat failure, keeping `NotFound` distinct from other IO errors.
    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::FileNotFound(path)
        } else {
            Self::Io { path, source }
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<config::ConfigError> for ArenaError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArenaError>;
