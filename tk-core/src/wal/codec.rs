// tk-core/src/wal/codec.rs
// JSONL operation stream + 32-byte footer (magic, length, ~length, CRC-32C,
// ~CRC-32C)

use serde::{Deserialize, Serialize};

use crate::error::{Result, TkError};
use crate::frontmatter::Frontmatter;
use crate::id::TicketId;
use crate::ticket::Ticket;

/// Bumped whenever the on-disk layout changes; a mismatch classifies the
/// WAL as uncommitted and therefore truncatable.
pub const MAGIC: &[u8; 8] = b"TKWAL001";

/// magic (8) + body_len (8) + ~body_len (8) + crc (4) + ~crc (4)
pub const FOOTER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOpKind {
    Put,
    Delete,
}

/// One logged operation. Put carries the complete frontmatter and body;
/// delete carries only the id and its derived path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalOp {
    pub op: WalOpKind,
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontmatter: Option<Frontmatter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl WalOp {
    pub fn put(ticket: &Ticket) -> WalOp {
        WalOp {
            op: WalOpKind::Put,
            id: ticket.id.to_string(),
            path: ticket.rel_path().to_string_lossy().into_owned(),
            frontmatter: Some(ticket.to_frontmatter()),
            body: Some(ticket.body.clone()),
        }
    }

    pub fn delete(id: &TicketId) -> WalOp {
        WalOp {
            op: WalOpKind::Delete,
            id: id.to_string(),
            path: id.rel_path().to_string_lossy().into_owned(),
            frontmatter: None,
            body: None,
        }
    }

    /// Parse and revalidate the id (version and variant included).
    pub fn ticket_id(&self) -> Result<TicketId> {
        TicketId::parse(&self.id).map_err(|e| replay_err(format!("op id `{}`: {}", self.id, e)))
    }

    /// For a put op, rebuild and validate the full ticket record from the
    /// logged frontmatter. Deletes yield `None`.
    pub fn ticket(&self) -> Result<Option<Ticket>> {
        match self.op {
            WalOpKind::Delete => Ok(None),
            WalOpKind::Put => {
                let fm = self.frontmatter.as_ref().ok_or_else(|| {
                    replay_err(format!("op {}: put without frontmatter", self.id))
                })?;
                let ticket = Ticket::from_frontmatter(fm, self.body.clone().unwrap_or_default())
                    .map_err(|e| replay_err(format!("op {}: {}", self.id, e)))?;
                Ok(Some(ticket))
            }
        }
    }

    /// Everything `decode` promises about a single op.
    pub fn validate(&self) -> Result<()> {
        let id = self.ticket_id()?;

        if self.path.is_empty() {
            return Err(replay_err(format!("op {}: empty path", self.id)));
        }
        if self.path.starts_with('/') {
            return Err(replay_err(format!(
                "op {}: path `{}` is absolute",
                self.id, self.path
            )));
        }
        for component in self.path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(replay_err(format!(
                    "op {}: path `{}` is not clean",
                    self.id, self.path
                )));
            }
        }
        if !self.path.ends_with(".md") {
            return Err(replay_err(format!(
                "op {}: path `{}` does not end in .md",
                self.id, self.path
            )));
        }
        let derived = id.rel_path();
        if derived.to_string_lossy() != self.path {
            return Err(replay_err(format!(
                "op {}: path `{}` does not match derived `{}`",
                self.id,
                self.path,
                derived.display()
            )));
        }
        if self.op == WalOpKind::Put && self.frontmatter.is_none() {
            return Err(replay_err(format!(
                "op {}: put without frontmatter",
                self.id
            )));
        }
        Ok(())
    }
}

fn replay_err(reason: String) -> TkError {
    TkError::WalReplay(reason)
}

/// Footer over a finished body.
pub fn footer(body: &[u8]) -> [u8; FOOTER_SIZE] {
    let mut out = [0u8; FOOTER_SIZE];
    let len = body.len() as u64;
    let crc = crc32c::crc32c(body);
    out[0..8].copy_from_slice(MAGIC);
    out[8..16].copy_from_slice(&len.to_le_bytes());
    out[16..24].copy_from_slice(&(!len).to_le_bytes());
    out[24..28].copy_from_slice(&crc.to_le_bytes());
    out[28..32].copy_from_slice(&(!crc).to_le_bytes());
    out
}

/// Serialize ops as JSONL and append the footer.
pub fn encode(ops: &[WalOp]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for op in ops {
        serde_json::to_writer(&mut body, op)
            .map_err(|e| replay_err(format!("encode op {}: {}", op.id, e)))?;
        body.push(b'\n');
    }
    let f = footer(&body);
    body.extend_from_slice(&f);
    Ok(body)
}

/// Decode a validated WAL body back into ops, re-checking every invariant.
pub fn decode(body: &[u8]) -> Result<Vec<WalOp>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| replay_err(format!("body is not utf-8: {}", e)))?;
    let mut ops = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let op: WalOp = serde_json::from_str(line)
            .map_err(|e| replay_err(format!("line {}: {}", lineno + 1, e)))?;
        op.validate()?;
        ops.push(op);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::TicketType;

    fn sample_ops() -> Vec<WalOp> {
        let mut ticket = Ticket::new("WAL codec test", TicketType::Bug, 1);
        ticket.body = "details".to_string();
        let gone = TicketId::mint();
        vec![WalOp::put(&ticket), WalOp::delete(&gone)]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let ops = sample_ops();
        let encoded = encode(&ops).unwrap();
        assert!(encoded.len() > FOOTER_SIZE);

        let body = &encoded[..encoded.len() - FOOTER_SIZE];
        let decoded = decode(body).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_footer_layout() {
        let body = b"{}\n";
        let f = footer(body);
        assert_eq!(&f[0..8], MAGIC);
        let len = u64::from_le_bytes(f[8..16].try_into().unwrap());
        let nlen = u64::from_le_bytes(f[16..24].try_into().unwrap());
        assert_eq!(len, body.len() as u64);
        assert_eq!(nlen, !len);
        let crc = u32::from_le_bytes(f[24..28].try_into().unwrap());
        let ncrc = u32::from_le_bytes(f[28..32].try_into().unwrap());
        assert_eq!(crc, crc32c::crc32c(body));
        assert_eq!(ncrc, !crc);
    }

    #[test]
    fn test_decode_rejects_non_v7_id() {
        let op = WalOp {
            op: WalOpKind::Delete,
            id: uuid::Uuid::new_v4().to_string(),
            path: "2025/01-01/AAAAAAAAAAAA.md".to_string(),
            frontmatter: None,
            body: None,
        };
        let line = serde_json::to_vec(&op).unwrap();
        let err = decode(&line).unwrap_err();
        assert!(matches!(err, TkError::WalReplay(_)), "{}", err);
    }

    #[test]
    fn test_decode_rejects_path_mismatch() {
        let id = TicketId::mint();
        let op = WalOp {
            op: WalOpKind::Delete,
            id: id.to_string(),
            path: "2000/01-01/WRONGPLACE00.md".to_string(),
            frontmatter: None,
            body: None,
        };
        let err = decode(&serde_json::to_vec(&op).unwrap()).unwrap_err();
        assert!(err.to_string().contains("does not match derived"), "{}", err);
    }

    #[test]
    fn test_decode_rejects_dirty_paths() {
        let id = TicketId::mint();
        for bad in ["/abs/p.md", "a//b.md", "a/../b.md", "./a.md", "a/b.txt", ""] {
            let op = WalOp {
                op: WalOpKind::Delete,
                id: id.to_string(),
                path: bad.to_string(),
                frontmatter: None,
                body: None,
            };
            assert!(op.validate().is_err(), "path `{}` should fail", bad);
        }
    }

    #[test]
    fn test_decode_rejects_put_without_frontmatter() {
        let id = TicketId::mint();
        let op = WalOp {
            op: WalOpKind::Put,
            id: id.to_string(),
            path: id.rel_path().to_string_lossy().into_owned(),
            frontmatter: None,
            body: Some(String::new()),
        };
        let err = op.validate().unwrap_err();
        assert!(err.to_string().contains("put without frontmatter"));
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode(b"{not json\n").unwrap_err();
        assert!(matches!(err, TkError::WalReplay(_)));
    }

    #[test]
    fn test_valid_op_passes() {
        for op in sample_ops() {
            op.validate().unwrap();
        }
    }
}
