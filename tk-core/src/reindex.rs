// tk-core/src/reindex.rs
// Full index rebuild: scan every `*.md` under the root (skipping `.tk/`),
// parse all-or-nothing, rebuild the tables in one transaction

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{FileIssue, Result, TkError};
use crate::fsio;
use crate::frontmatter;
use crate::index::Index;
use crate::ticket::Ticket;
use crate::tk_ops;

/// Directory holding the index and WAL; never scanned for tickets.
pub const INTERNAL_DIR: &str = ".tk";

/// Rebuild the index from disk. Caller holds the exclusive lock and has
/// already run recovery.
///
/// Any unreadable or invalid file aborts the rebuild with
/// `IndexScan { issues }` before the database is touched, so a reindex
/// either reflects every ticket on disk or changes nothing.
pub fn reindex_locked(root: &Path, index: &mut Index, cancel: &CancelToken) -> Result<usize> {
    let mut entries: Vec<(Ticket, i64)> = Vec::new();
    let mut issues: Vec<FileIssue> = Vec::new();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == INTERNAL_DIR))
    {
        cancel.check()?;
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| rel_or_self(p, root))
                    .unwrap_or_else(|| PathBuf::from("<unknown>"));
                issues.push(FileIssue {
                    path,
                    id: None,
                    error: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "md") {
            continue;
        }
        let rel = rel_or_self(path, root);

        match load_ticket(path, &rel) {
            Ok(parsed) => entries.push(parsed),
            Err((id, error)) => issues.push(FileIssue {
                path: rel,
                id,
                error,
            }),
        }
    }

    if !issues.is_empty() {
        return Err(TkError::IndexScan {
            total: issues.len(),
            issues,
        });
    }

    let count = index.rebuild(&entries)?;
    tk_ops!("reindex", "indexed {} ticket(s) under {}", count, root.display());
    Ok(count)
}

fn rel_or_self(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

/// Read and parse one ticket file; on failure, salvage the id when the
/// frontmatter got far enough to carry one.
fn load_ticket(abs: &Path, rel: &Path) -> std::result::Result<(Ticket, i64), (Option<String>, String)> {
    let text = match std::fs::read_to_string(abs) {
        Ok(t) => t,
        Err(e) => return Err((None, e.to_string())),
    };
    let mtime = fsio::mtime_ns(abs).unwrap_or(0);
    match Ticket::parse_file(&text, rel, mtime) {
        Ok(ticket) => Ok((ticket, mtime)),
        Err(e) => Err((salvage_id(&text), e.to_string())),
    }
}

fn salvage_id(text: &str) -> Option<String> {
    let (fm, _) = frontmatter::parse(text).ok()?;
    fm.get("id").and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::QueryOptions;
    use crate::ticket::TicketType;

    fn write_ticket(root: &Path, ticket: &Ticket) {
        fsio::atomic_write(&root.join(ticket.rel_path()), ticket.marshal_file().as_bytes())
            .unwrap();
    }

    fn fresh_index() -> Index {
        Index::open_in_memory().unwrap()
    }

    #[test]
    fn test_reindex_counts_every_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();
        let a = Ticket::new("a", TicketType::Task, 2);
        let b = Ticket::new("b", TicketType::Bug, 1);
        write_ticket(dir.path(), &a);
        write_ticket(dir.path(), &b);

        let count = reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(index.query(&QueryOptions::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_reindex_skips_internal_dir_and_non_md() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();
        let t = Ticket::new("real", TicketType::Task, 2);
        write_ticket(dir.path(), &t);

        // Decoys: .tk internals and a stray text file
        let tk = dir.path().join(INTERNAL_DIR);
        std::fs::create_dir_all(&tk).unwrap();
        std::fs::write(tk.join("junk.md"), b"not a ticket").unwrap();
        std::fs::write(dir.path().join("README.txt"), b"hello").unwrap();

        let count = reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reindex_aborts_on_any_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();
        index.rebuild(&[]).unwrap();

        let good = Ticket::new("good", TicketType::Task, 2);
        write_ticket(dir.path(), &good);
        std::fs::create_dir_all(dir.path().join("2025/01-01")).unwrap();
        std::fs::write(dir.path().join("2025/01-01/NOTATICKET00.md"), b"garbage").unwrap();

        let err = reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap_err();
        match err {
            TkError::IndexScan { total, issues } => {
                assert_eq!(total, 1);
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, PathBuf::from("2025/01-01/NOTATICKET00.md"));
                assert!(issues[0].id.is_none());
            }
            other => panic!("expected IndexScan, got {}", other),
        }
        // Index untouched
        assert!(index.query(&QueryOptions::new()).unwrap().is_empty());
    }

    #[test]
    fn test_issue_salvages_id_from_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();

        // Valid frontmatter, but the file sits at the wrong path
        let t = Ticket::new("misplaced", TicketType::Task, 2);
        let wrong = dir.path().join("2001/01-01").join("WRONGSPOT000.md");
        fsio::atomic_write(&wrong, t.marshal_file().as_bytes()).unwrap();

        let err = reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap_err();
        let TkError::IndexScan { issues, .. } = err else {
            panic!("expected IndexScan");
        };
        assert_eq!(issues[0].id.as_deref(), Some(t.id.to_string().as_str()));
    }

    #[test]
    fn test_reindex_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();
        let mut t = Ticket::new("stable", TicketType::Feature, 3);
        t.tags = vec!["x".to_string()];
        write_ticket(dir.path(), &t);

        reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap();
        let first = index.query(&QueryOptions::new()).unwrap();
        reindex_locked(dir.path(), &mut index, &CancelToken::new()).unwrap();
        let second = index.query(&QueryOptions::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reindex_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fresh_index();
        let token = CancelToken::new();
        token.cancel();
        let err = reindex_locked(dir.path(), &mut index, &token).unwrap_err();
        assert!(matches!(err, TkError::Cancelled));
    }
}
