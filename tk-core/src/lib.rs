// tk-core/src/lib.rs
// Embedded ticket store: Markdown files + WAL + derived SQLite index

pub mod cancel;
pub mod error;
pub mod frontmatter;
pub mod fsio;
pub mod id;
pub mod index;
pub mod lock;
pub mod logging;
pub mod oracle;
pub mod recovery;
pub mod reindex;
pub mod store;
pub mod ticket;
pub mod transaction;
pub mod wal;

#[cfg(test)]
mod store_scenario_tests;

// Public exports
pub use cancel::CancelToken;
pub use error::{FileIssue, Result, TkError};
pub use id::TicketId;
pub use index::{IndexRow, QueryOptions, PREFIX_LOOKUP_CAP};
pub use lock::{FileLock, LockMode};
pub use logging::{set_verbosity, verbosity, Verbosity};
pub use oracle::{ListFilter, ModelTicket, Oracle, OracleError};
pub use store::Store;
pub use ticket::{Status, Ticket, TicketType, CURRENT_SCHEMA_VERSION, DEFAULT_PRIORITY};
pub use transaction::Transaction;
pub use wal::{Wal, WalOp, WalOpKind, WalState};
