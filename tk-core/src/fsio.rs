// tk-core/src/fsio.rs
// Durable filesystem primitives: atomic writes, durable deletes, mtime

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Result, TkError};

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the destination, fsync the directory. A crash at any
/// point leaves either the old content or the new content, never a mix.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TkError::invalid("path", format!("no file name in {}", path.display())))?;
    let tmp_path = dir.join(format!(".{}.tmp", file_name));

    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    fsync_dir(dir)
}

/// Remove `path` and fsync its parent directory. A missing target is not
/// an error, so deletes replay idempotently.
pub fn remove_durable(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fsync_dir(parent_dir(path)?)
}

/// fsync a directory so renames and unlinks inside it are durable.
pub fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// File modification time in nanoseconds since the Unix epoch.
pub fn mtime_ns(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    let ns = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(ns)
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| TkError::invalid("path", format!("no parent directory for {}", path.display())))
}
