// tk-core/src/store.rs
// The store handle: owns the root tree, the WAL and the SQL index

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Result, TkError};
use crate::fsio;
use crate::id::TicketId;
use crate::index::{Index, IndexRow, QueryOptions};
use crate::lock::{FileLock, LockMode};
use crate::recovery;
use crate::reindex::{self, INTERNAL_DIR};
use crate::ticket::{Ticket, CURRENT_SCHEMA_VERSION};
use crate::transaction::Transaction;
use crate::wal::Wal;
use crate::{tk_ops, tk_warn};

/// Name of the WAL file inside `.tk/`. Doubles as the advisory lock path.
const WAL_FILE: &str = "wal";

/// Name of the index database inside `.tk/`.
const INDEX_FILE: &str = "index.sqlite";

/// An open ticket store rooted at a directory of Markdown files.
///
/// Safe for concurrent use from multiple threads; cross-process
/// coordination happens through the advisory lock on the WAL path.
/// Dropping the handle closes it.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    wal: Wal,
    index: Mutex<Index>,
    /// Timeout applied to reader lock acquisition
    lock_timeout: Duration,
}

impl Store {
    /// Open (or initialize) the store at `root`.
    ///
    /// Idempotent: creates `.tk/` when missing, runs recovery under the
    /// exclusive lock, and rebuilds the index when `user_version` does not
    /// match the current schema.
    pub fn open(root: impl AsRef<Path>, timeout: Duration) -> Result<Store> {
        let root = root.as_ref().to_path_buf();
        let tk_dir = root.join(INTERNAL_DIR);
        fs::create_dir_all(&tk_dir)?;

        let wal = Wal::new(tk_dir.join(WAL_FILE));
        let index = Index::open(&tk_dir.join(INDEX_FILE))?;
        let store = Store {
            root,
            wal,
            index: Mutex::new(index),
            lock_timeout: timeout,
        };

        let lock = FileLock::acquire(store.wal.path(), LockMode::Exclusive, timeout)?;
        let mut index = store.index.lock();
        match recovery::recover(&store.root, &store.wal, &mut index, &CancelToken::new()) {
            Ok(()) => {
                if index.user_version()? != CURRENT_SCHEMA_VERSION {
                    tk_ops!(
                        "store",
                        "index schema version mismatch at {}; rebuilding",
                        store.root.display()
                    );
                    reindex::reindex_locked(&store.root, &mut index, &CancelToken::new())?;
                }
            }
            // A corrupt WAL does not block opening: file reads stay
            // available, every write and index read keeps failing until
            // the operator removes or repairs the file.
            Err(TkError::WalCorrupt(msg)) => {
                tk_warn!("store", "opened with corrupt wal: {}", msg);
            }
            Err(e) => return Err(e),
        }
        drop(index);
        drop(lock);

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn wal(&self) -> &Wal {
        &self.wal
    }

    pub(crate) fn with_index<T>(&self, f: impl FnOnce(&mut Index) -> Result<T>) -> Result<T> {
        let mut index = self.index.lock();
        f(&mut index)
    }

    /// Start a write transaction: exclusive lock, then recovery, then an
    /// empty op buffer.
    pub fn begin(&self, timeout: Duration) -> Result<Transaction<'_>> {
        let lock = FileLock::acquire(self.wal.path(), LockMode::Exclusive, timeout)?;
        let mut index = self.index.lock();
        recovery::recover(&self.root, &self.wal, &mut index, &CancelToken::new())?;
        drop(index);
        Ok(Transaction::new(self, lock))
    }

    /// Read one ticket. The file at `derive_path(id)`, not the index, is
    /// the source of truth; the result includes the body.
    pub fn get(&self, id: &TicketId) -> Result<Ticket> {
        let _lock = self.read_lock(true)?;
        let rel = id.rel_path();
        let abs = self.root.join(&rel);
        let text = match fs::read_to_string(&abs) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TkError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ticket::parse_file(&text, &rel, fsio::mtime_ns(&abs).unwrap_or(0))
    }

    /// Filtered, paginated listing from the index.
    pub fn query(&self, opts: &QueryOptions) -> Result<Vec<IndexRow>> {
        let _lock = self.read_lock(false)?;
        self.index.lock().query(opts)
    }

    /// Resolve a short-id or id prefix against the index.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Vec<IndexRow>> {
        let _lock = self.read_lock(false)?;
        self.index.lock().get_by_prefix(prefix)
    }

    /// Rescan every ticket file and rebuild the index from scratch.
    /// Returns the number of indexed tickets.
    pub fn reindex(&self, cancel: &CancelToken) -> Result<usize> {
        let _lock = FileLock::acquire(self.wal.path(), LockMode::Exclusive, self.lock_timeout)?;
        let mut index = self.index.lock();
        recovery::recover(&self.root, &self.wal, &mut index, cancel)?;
        reindex::reindex_locked(&self.root, &mut index, cancel)
    }

    /// Reader protocol: hold a shared lock and an empty WAL at the same
    /// time. A non-empty WAL forces an upgrade to exclusive, recovery,
    /// and another round, so no reader ever sees half-applied state.
    ///
    /// `tolerate_corrupt` keeps file-based reads alive when the WAL is
    /// corrupt; index-based reads always surface the error.
    fn read_lock(&self, tolerate_corrupt: bool) -> Result<FileLock> {
        loop {
            let shared = FileLock::acquire(self.wal.path(), LockMode::Shared, self.lock_timeout)?;
            if self.wal.size()? == 0 {
                return Ok(shared);
            }
            drop(shared);

            let excl =
                FileLock::acquire(self.wal.path(), LockMode::Exclusive, self.lock_timeout)?;
            let mut index = self.index.lock();
            match recovery::recover(&self.root, &self.wal, &mut index, &CancelToken::new()) {
                Ok(()) => {}
                Err(TkError::WalCorrupt(msg)) if tolerate_corrupt => {
                    tk_warn!("store", "reading around a corrupt wal: {}", msg);
                    drop(index);
                    drop(excl);
                    return FileLock::acquire(
                        self.wal.path(),
                        LockMode::Shared,
                        self.lock_timeout,
                    );
                }
                Err(e) => return Err(e),
            }
            drop(index);
            drop(excl);
        }
    }
}
