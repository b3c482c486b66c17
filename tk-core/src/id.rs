// tk-core/src/id.rs
// Time-ordered ticket identifiers (UUIDv7) and the paths derived from them

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use rand::RngCore;
use uuid::Uuid;

use crate::error::{Result, TkError};

/// Crockford base-32 alphabet (no I, L, O, U)
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of characters in a short id (12 * 5 bits = 60 bits)
pub const SHORT_ID_LEN: usize = 12;

/// Identifier of a single ticket.
///
/// Layout is UUIDv7: 48 bits of UTC millisecond timestamp, the version
/// nibble, the RFC4122 variant bits, and 74 bits of randomness. Ids minted
/// by one process sort strictly after every id minted before them, so
/// sorting by id equals sorting by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(Uuid);

/// Unpacked v7 fields, used for minting and short-id derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Fields {
    /// Unix milliseconds, 48 bits
    ms: u64,
    /// 12 random bits
    rand_a: u16,
    /// 62 random bits
    rand_b: u64,
}

impl Fields {
    fn pack(&self) -> Uuid {
        let mut b = [0u8; 16];
        b[0] = (self.ms >> 40) as u8;
        b[1] = (self.ms >> 32) as u8;
        b[2] = (self.ms >> 24) as u8;
        b[3] = (self.ms >> 16) as u8;
        b[4] = (self.ms >> 8) as u8;
        b[5] = self.ms as u8;
        b[6] = 0x70 | ((self.rand_a >> 8) as u8 & 0x0F);
        b[7] = self.rand_a as u8;
        b[8] = 0x80 | ((self.rand_b >> 56) as u8 & 0x3F);
        b[9] = (self.rand_b >> 48) as u8;
        b[10] = (self.rand_b >> 40) as u8;
        b[11] = (self.rand_b >> 32) as u8;
        b[12] = (self.rand_b >> 24) as u8;
        b[13] = (self.rand_b >> 16) as u8;
        b[14] = (self.rand_b >> 8) as u8;
        b[15] = self.rand_b as u8;
        Uuid::from_bytes(b)
    }

    fn unpack(id: &Uuid) -> Fields {
        let b = id.as_bytes();
        let ms = ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | (b[5] as u64);
        let rand_a = (((b[6] & 0x0F) as u16) << 8) | (b[7] as u16);
        let rand_b = (((b[8] & 0x3F) as u64) << 56)
            | ((b[9] as u64) << 48)
            | ((b[10] as u64) << 40)
            | ((b[11] as u64) << 32)
            | ((b[12] as u64) << 24)
            | ((b[13] as u64) << 16)
            | ((b[14] as u64) << 8)
            | (b[15] as u64);
        Fields { ms, rand_a, rand_b }
    }

    /// Smallest field tuple that still sorts strictly after `self`
    fn successor(&self) -> Fields {
        let mut next = *self;
        next.rand_b = (next.rand_b + 1) & 0x3FFF_FFFF_FFFF_FFFF;
        if next.rand_b == 0 {
            next.rand_a = (next.rand_a + 1) & 0x0FFF;
            if next.rand_a == 0 {
                next.ms += 1;
            }
        }
        next
    }
}

lazy_static! {
    // Last minted fields; mint() bumps a colliding candidate past this so
    // ids stay strictly monotonic within the process.
    static ref LAST_MINTED: Mutex<Option<Fields>> = Mutex::new(None);
}

impl TicketId {
    /// Mint a fresh id for the current instant.
    pub fn mint() -> TicketId {
        Self::mint_at(Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Mint an id with an explicit millisecond timestamp. The monotonic
    /// guard still applies: the result sorts after every previous mint.
    pub fn mint_at(ms: u64) -> TicketId {
        let mut rng = rand::thread_rng();
        let rand_a = (rng.next_u32() & 0x0FFF) as u16;
        let rand_b = rng.next_u64() & 0x3FFF_FFFF_FFFF_FFFF;
        let mut candidate = Fields {
            ms: ms & 0xFFFF_FFFF_FFFF,
            rand_a,
            rand_b,
        };

        let mut last = LAST_MINTED.lock();
        if let Some(prev) = *last {
            if candidate <= prev {
                candidate = prev.successor();
            }
        }
        *last = Some(candidate);
        TicketId(candidate.pack())
    }

    /// Parse the canonical hyphenated text form, rejecting anything that is
    /// not a v7 / RFC4122 identifier.
    pub fn parse(s: &str) -> Result<TicketId> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| TkError::invalid("id", format!("not a uuid: {}", e)))?;
        Self::from_uuid(uuid)
    }

    /// Wrap an already-parsed uuid, enforcing version and variant.
    pub fn from_uuid(uuid: Uuid) -> Result<TicketId> {
        if uuid.get_version_num() != 7 {
            return Err(TkError::invalid(
                "id",
                format!("expected uuid version 7, got {}", uuid.get_version_num()),
            ));
        }
        if uuid.get_variant() != uuid::Variant::RFC4122 {
            return Err(TkError::invalid("id", "uuid variant is not RFC4122"));
        }
        Ok(TicketId(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Milliseconds since the Unix epoch embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        Fields::unpack(&self.0).ms
    }

    /// Creation instant embedded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms() as i64)
            .unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap())
    }

    /// 12-character Crockford base-32 handle, derived from the top 60
    /// random bits. Changing the timestamp never changes the short id.
    pub fn short_id(&self) -> String {
        let f = Fields::unpack(&self.0);
        let value = ((f.rand_a as u64) << 48) | (f.rand_b >> 14);
        let mut out = String::with_capacity(SHORT_ID_LEN);
        for i in (0..SHORT_ID_LEN).rev() {
            let idx = ((value >> (i * 5)) & 0x1F) as usize;
            out.push(CROCKFORD[idx] as char);
        }
        out
    }

    /// Canonical store-relative location: `YYYY/MM-DD/<short_id>.md`,
    /// using the UTC calendar date embedded in the id.
    pub fn rel_path(&self) -> PathBuf {
        let date = self.created_at().date_naive();
        PathBuf::from(format!(
            "{}/{}.md",
            date.format("%Y/%m-%d"),
            self.short_id()
        ))
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TicketId {
    type Err = TkError;

    fn from_str(s: &str) -> Result<TicketId> {
        TicketId::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_is_valid_v7() {
        let id = TicketId::mint();
        assert_eq!(id.as_uuid().get_version_num(), 7);
        assert_eq!(id.as_uuid().get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn test_parse_round_trip() {
        let id = TicketId::mint();
        let parsed = TicketId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_v4() {
        let v4 = Uuid::new_v4().to_string();
        assert!(TicketId::parse(&v4).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TicketId::parse("not-a-uuid").is_err());
        assert!(TicketId::parse("").is_err());
    }

    #[test]
    fn test_mint_is_strictly_monotonic() {
        let mut prev = TicketId::mint();
        for _ in 0..1000 {
            let next = TicketId::mint();
            assert!(next > prev, "{} should sort after {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_monotonic_across_clock_stall() {
        // Same explicit millisecond: the guard must still order them.
        let a = TicketId::mint_at(1_700_000_000_000);
        let b = TicketId::mint_at(1_700_000_000_000);
        assert!(b > a);
    }

    #[test]
    fn test_short_id_shape() {
        let id = TicketId::mint();
        let short = id.short_id();
        assert_eq!(short.len(), SHORT_ID_LEN);
        for c in short.chars() {
            assert!(CROCKFORD.contains(&(c as u8)), "bad char {}", c);
        }
    }

    #[test]
    fn test_short_id_ignores_timestamp() {
        // Two ids sharing random bits but minted a day apart
        let fields = Fields {
            ms: 1_700_000_000_000,
            rand_a: 0x0ABC,
            rand_b: 0x1234_5678_9ABC_DEF0 & 0x3FFF_FFFF_FFFF_FFFF,
        };
        let earlier = TicketId(fields.pack());
        let later = TicketId(
            Fields {
                ms: fields.ms + 86_400_000,
                ..fields
            }
            .pack(),
        );
        assert_ne!(earlier, later);
        assert_eq!(earlier.short_id(), later.short_id());
    }

    #[test]
    fn test_short_id_known_vector() {
        // All-zero random bits encode as twelve '0' characters.
        let id = TicketId(
            Fields {
                ms: 1_700_000_000_000,
                rand_a: 0,
                rand_b: 0,
            }
            .pack(),
        );
        assert_eq!(id.short_id(), "000000000000");
    }

    #[test]
    fn test_rel_path_uses_utc_date() {
        // 2023-11-14T22:13:20Z
        let id = TicketId(
            Fields {
                ms: 1_700_000_000_000,
                rand_a: 0,
                rand_b: 0,
            }
            .pack(),
        );
        assert_eq!(
            id.rel_path(),
            PathBuf::from("2023/11-14/000000000000.md")
        );
    }

    #[test]
    fn test_created_at_matches_embedded_ms() {
        let id = TicketId(
            Fields {
                ms: 1_700_000_000_000,
                rand_a: 1,
                rand_b: 2,
            }
            .pack(),
        );
        assert_eq!(id.created_at().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_successor_carries() {
        let max_b = Fields {
            ms: 10,
            rand_a: 5,
            rand_b: 0x3FFF_FFFF_FFFF_FFFF,
        };
        let next = max_b.successor();
        assert_eq!(next.rand_b, 0);
        assert_eq!(next.rand_a, 6);
        assert_eq!(next.ms, 10);

        let max_ab = Fields {
            ms: 10,
            rand_a: 0x0FFF,
            rand_b: 0x3FFF_FFFF_FFFF_FFFF,
        };
        let next = max_ab.successor();
        assert_eq!(next.rand_b, 0);
        assert_eq!(next.rand_a, 0);
        assert_eq!(next.ms, 11);
    }
}
