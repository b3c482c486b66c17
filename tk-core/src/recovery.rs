// tk-core/src/recovery.rs
// WAL recovery: truncate uncommitted logs, replay committed ones, surface
// corruption. Always runs with the exclusive lock held.

use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::{Result, TkError};
use crate::fsio;
use crate::index::Index;
use crate::ticket;
use crate::wal::{self, Wal, WalOp, WalOpKind, WalState};
use crate::{tk_debug, tk_ops};

/// Bring the store back to a consistent state.
///
/// - Empty WAL: nothing to do.
/// - Uncommitted: the crash happened before the commit point; truncate.
/// - Corrupt: surface `WalCorrupt` and leave the file for the operator.
/// - Committed: decode, replay files, update the index, truncate.
///
/// Replay and index update are idempotent; on any error the WAL stays
/// untruncated so the next opener retries the same ops.
pub fn recover(root: &Path, wal: &Wal, index: &mut Index, cancel: &CancelToken) -> Result<()> {
    match wal.state()? {
        WalState::Empty => Ok(()),
        WalState::Uncommitted => {
            tk_debug!("recovery", "discarding uncommitted wal at {}", wal.path().display());
            wal.truncate()
        }
        WalState::Corrupt => Err(TkError::WalCorrupt(format!(
            "checksum mismatch in {}",
            wal.path().display()
        ))),
        WalState::Committed(body) => {
            let ops = wal::decode(&body)?;
            // Validate every put up front so a bad op never half-applies
            for op in &ops {
                op.ticket()?;
            }
            replay_files(root, &ops, cancel)?;
            index.apply_ops(root, &ops, cancel)?;
            wal.truncate()?;
            tk_ops!(
                "recovery",
                "replayed {} wal op(s) from {}",
                ops.len(),
                wal.path().display()
            );
            Ok(())
        }
    }
}

/// Apply file operations in recorded order: puts render the logged
/// frontmatter + body and write atomically; deletes unlink durably, with
/// missing targets ignored.
pub(crate) fn replay_files(root: &Path, ops: &[WalOp], cancel: &CancelToken) -> Result<()> {
    for op in ops {
        cancel.check()?;
        match op.op {
            WalOpKind::Put => {
                let fm = op.frontmatter.as_ref().ok_or_else(|| {
                    TkError::WalReplay(format!("op {}: put without frontmatter", op.id))
                })?;
                let text = ticket::render_file(fm, op.body.as_deref().unwrap_or(""));
                fsio::atomic_write(&root.join(&op.path), text.as_bytes())?;
            }
            WalOpKind::Delete => {
                fsio::remove_durable(&root.join(&op.path))?;
            }
        }
    }
    Ok(())
}
