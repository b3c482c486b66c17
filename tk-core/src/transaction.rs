// tk-core/src/transaction.rs
// Write transaction: buffered ops under the exclusive lock, committed
// through the WAL

use std::collections::BTreeMap;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::TicketId;
use crate::lock::FileLock;
use crate::recovery;
use crate::store::Store;
use crate::ticket::Ticket;
use crate::tk_warn;
use crate::wal::{self, WalOp};

/// A write transaction.
///
/// Holds the exclusive WAL lock for its whole lifetime. Operations are
/// buffered in an id-keyed map, so the last put or delete for an id wins.
/// `commit` consumes the transaction; once committed (or rolled back) no
/// further operations are possible, by construction.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s Store,
    ops: BTreeMap<TicketId, WalOp>,
    // Held until the transaction is dropped, on every exit path
    _lock: FileLock,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store, lock: FileLock) -> Transaction<'s> {
        Transaction {
            store,
            ops: BTreeMap::new(),
            _lock: lock,
        }
    }

    /// Buffer a put. The input is copied, canonicalized and validated; the
    /// stored form (derived fields included) is returned. A later put or
    /// delete for the same id overwrites this one.
    pub fn put(&mut self, ticket: &Ticket) -> Result<Ticket> {
        let mut stored = ticket.clone();
        stored.canonicalize();
        stored.validate()?;
        self.ops.insert(stored.id, WalOp::put(&stored));
        Ok(stored)
    }

    /// Buffer a delete. Deleting an id with no file on disk is allowed;
    /// the effect is observed at commit.
    pub fn delete(&mut self, id: &TicketId) -> Result<()> {
        self.ops.insert(*id, WalOp::delete(id));
        Ok(())
    }

    /// Number of buffered operations (coalesced by id).
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Run the commit sequence: encode + install the WAL (the fsync inside
    /// `install` is the commit point), replay files, update the index,
    /// truncate the WAL.
    ///
    /// Failures after the install are recoverable: the committed WAL stays
    /// put and the next opener replays it. A truncate failure alone is
    /// non-fatal for the same reason.
    pub fn commit(self, cancel: &CancelToken) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops: Vec<WalOp> = self.ops.values().cloned().collect();
        let bytes = wal::encode(&ops)?;
        self.store.wal().install(&bytes)?;

        // Past the commit point: the WAL stays committed on any failure
        // below, and the next opener replays it.
        let applied = recovery::replay_files(self.store.root(), &ops, cancel).and_then(|()| {
            self.store
                .with_index(|index| index.apply_ops(self.store.root(), &ops, cancel))
        });
        if let Err(e) = applied {
            if e.is_recoverable_commit_failure() {
                tk_warn!(
                    "commit",
                    "apply interrupted after the commit point ({}); wal retained for replay",
                    e
                );
            }
            return Err(e);
        }

        if let Err(e) = self.store.wal().truncate() {
            tk_warn!(
                "commit",
                "wal truncate failed after commit ({}); next open will replay",
                e
            );
        }
        Ok(())
    }

    /// Discard all buffered operations and release the lock.
    pub fn rollback(self) {
        // Dropping releases the lock; the buffer was never persisted
    }
}
