// tk-core/src/wal/mod.rs
// The single write-ahead log file: state classification, install, truncate

mod codec;

pub use codec::{decode, encode, footer, WalOp, WalOpKind, FOOTER_SIZE, MAGIC};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TkError};

/// Classification of the WAL file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalState {
    /// Zero length; nothing to do
    Empty,
    /// Footer missing or not self-consistent; safe to truncate
    Uncommitted,
    /// Footer self-consistent but the body checksum mismatches; left on
    /// disk for the operator
    Corrupt,
    /// Footer and checksum verify; carries the validated body bytes
    Committed(Vec<u8>),
}

/// Handle to the store's WAL file. The same path doubles as the advisory
/// lock target; mutation only happens under the exclusive lock.
#[derive(Debug, Clone)]
pub struct Wal {
    path: PathBuf,
}

impl Wal {
    pub fn new(path: PathBuf) -> Wal {
        Wal { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size; a missing file counts as empty.
    pub fn size(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Classify the WAL exactly as recovery sees it.
    pub fn state(&self) -> Result<WalState> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WalState::Empty),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(WalState::Empty);
        }
        if size < FOOTER_SIZE as u64 {
            return Ok(WalState::Uncommitted);
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        if &footer[0..8] != MAGIC {
            return Ok(WalState::Uncommitted);
        }
        let len = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let nlen = u64::from_le_bytes(footer[16..24].try_into().unwrap());
        let crc = u32::from_le_bytes(footer[24..28].try_into().unwrap());
        let ncrc = u32::from_le_bytes(footer[28..32].try_into().unwrap());
        if nlen != !len || ncrc != !crc {
            return Ok(WalState::Uncommitted);
        }
        if len > size - FOOTER_SIZE as u64 {
            return Ok(WalState::Uncommitted);
        }

        file.seek(SeekFrom::Start(0))?;
        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;
        if crc32c::crc32c(&body) != crc {
            return Ok(WalState::Corrupt);
        }
        Ok(WalState::Committed(body))
    }

    /// Write encoded body+footer from offset 0, truncate to the exact
    /// length, and fsync. The fsync is the commit point.
    pub fn install(&self, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(bytes)?;
        file.set_len(bytes.len() as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reset to zero length and fsync.
    pub fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Committed body or a typed error for the two bad states.
    pub fn committed_body(&self) -> Result<Option<Vec<u8>>> {
        match self.state()? {
            WalState::Empty | WalState::Uncommitted => Ok(None),
            WalState::Corrupt => Err(TkError::WalCorrupt(format!(
                "checksum mismatch in {}",
                self.path.display()
            ))),
            WalState::Committed(body) => Ok(Some(body)),
        }
    }
}
