use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by indexing, planning, and patch execution.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A strong checksum has no bound node, or an expected path is missing.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A path is not the kind (file vs directory) the caller expected.
    #[error("{}: expected a {expected}", path.display())]
    KindMismatch {
        path: PathBuf,
        expected: &'static str,
    },

    /// An underlying OS error, wrapped with the operation and path.
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The command sequence violates the staging discipline.
    #[error("malformed plan: {0}")]
    PlanMalformed(String),

    /// The index root itself could not be read.
    #[error("cannot index {}: {source}", path.display())]
    IndexUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Relative paths in the index must be valid UTF-8.
    #[error("non-UTF-8 path: {}", path.display())]
    NonUtf8Path { path: PathBuf },

    /// A patch command failed; the plan is aborted at this command.
    #[error("command `{cmd}` failed: {source}")]
    CommandFailed {
        cmd: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
