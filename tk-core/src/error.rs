// tk-core/src/error.rs
// Crate-wide error type and Result alias

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::oracle::OracleError;

pub type Result<T> = std::result::Result<T, TkError>;

/// A single file the reindex scan could not turn into a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIssue {
    /// Path relative to the store root
    pub path: PathBuf,
    /// Ticket id, when the frontmatter got far enough to yield one
    pub id: Option<String>,
    /// What went wrong with this file
    pub error: String,
}

impl std::fmt::Display for FileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} ({}): {}", self.path.display(), id, self.error),
            None => write!(f, "{}: {}", self.path.display(), self.error),
        }
    }
}

/// Errors surfaced by the ticket store
#[derive(Debug, Error)]
pub enum TkError {
    /// Caller supplied a value outside the accepted domain
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// Ticket (or referenced ticket) does not exist
    #[error("ticket not found: {0}")]
    NotFound(String),

    /// A transition the semantics oracle disallows
    #[error(transparent)]
    Semantic(#[from] OracleError),

    /// Frontmatter region of a ticket file could not be parsed
    #[error("frontmatter parse error at line {line}: {reason}")]
    Frontmatter { line: usize, reason: String },

    /// WAL footer is self-consistent but the body checksum does not match.
    /// The WAL file is left on disk for inspection.
    #[error("wal corrupt: {0}")]
    WalCorrupt(String),

    /// A committed WAL carries an operation that fails validation
    #[error("wal replay failed: {0}")]
    WalReplay(String),

    /// The SQL transaction applying index changes failed
    #[error("index update failed: {0}")]
    IndexUpdate(String),

    /// The reindex scan collected per-file issues; the index was not touched
    #[error("index scan found {total} unreadable ticket file(s)")]
    IndexScan { total: usize, issues: Vec<FileIssue> },

    /// A lock or blocking operation ran past its deadline
    #[error("deadline exceeded after {waited:?}")]
    DeadlineExceeded { waited: Duration },

    /// The caller's cancel token fired between operations
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl TkError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        TkError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// True for errors that mean "retry after the next recovery", i.e. the
    /// WAL reached its commit point but apply did not finish.
    pub fn is_recoverable_commit_failure(&self) -> bool {
        matches!(
            self,
            TkError::Io(_) | TkError::Sql(_) | TkError::IndexUpdate(_) | TkError::Cancelled
        )
    }
}
