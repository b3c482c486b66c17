// tk-core/src/ticket.rs
// The ticket record: validation, frontmatter mapping, file marshal/parse

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Result, TkError};
use crate::frontmatter::{self, Frontmatter, Value};
use crate::id::TicketId;

/// Version stamped into every ticket file and into `PRAGMA user_version`.
/// Any mismatch forces a full rebuild of the index.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Priority assigned when the caller does not pick one (1 = most urgent).
pub const DEFAULT_PRIORITY: u8 = 2;

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Open,
    InProgress,
    Closed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Status> {
        match s {
            "open" => Ok(Status::Open),
            "in_progress" => Ok(Status::InProgress),
            "closed" => Ok(Status::Closed),
            other => Err(TkError::invalid(
                "status",
                format!("unknown status `{}`", other),
            )),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketType {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketType::Bug => "bug",
            TicketType::Feature => "feature",
            TicketType::Task => "task",
            TicketType::Epic => "epic",
            TicketType::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Result<TicketType> {
        match s {
            "bug" => Ok(TicketType::Bug),
            "feature" => Ok(TicketType::Feature),
            "task" => Ok(TicketType::Task),
            "epic" => Ok(TicketType::Epic),
            "chore" => Ok(TicketType::Chore),
            other => Err(TkError::invalid(
                "type",
                format!("unknown ticket type `{}`", other),
            )),
        }
    }
}

impl Default for TicketType {
    fn default() -> Self {
        TicketType::Task
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative ticket record, serialized to one Markdown file with a
/// YAML frontmatter header. `short_id` and the on-disk path are derived
/// from `id`, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: TicketId,
    pub status: Status,
    pub ticket_type: TicketType,
    pub priority: u8,
    pub title: String,
    /// Free-form Markdown; canonical form carries no trailing newline
    pub body: String,
    pub assignee: Option<String>,
    pub parent: Option<TicketId>,
    pub external_ref: Option<String>,
    pub blocked_by: Vec<TicketId>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a fresh open ticket. `created_at` comes from the minted id's
    /// embedded timestamp, so sorting by id equals sorting by creation time.
    pub fn new(title: impl Into<String>, ticket_type: TicketType, priority: u8) -> Ticket {
        let id = TicketId::mint();
        Ticket {
            created_at: id.created_at(),
            id,
            status: Status::Open,
            ticket_type,
            priority,
            title: title.into(),
            body: String::new(),
            assignee: None,
            parent: None,
            external_ref: None,
            blocked_by: Vec::new(),
            tags: Vec::new(),
            closed_at: None,
        }
    }

    pub fn short_id(&self) -> String {
        self.id.short_id()
    }

    pub fn rel_path(&self) -> std::path::PathBuf {
        self.id.rel_path()
    }

    /// Bring the record to the exact form a marshal/parse round trip
    /// produces: trailing newlines stripped from the body and timestamps
    /// clamped to the millisecond precision of the RFC3339 rendering.
    pub fn canonicalize(&mut self) {
        while self.body.ends_with('\n') {
            self.body.pop();
        }
        self.created_at = truncate_ms(self.created_at);
        self.closed_at = self.closed_at.map(truncate_ms);
    }

    /// Enforce every structural invariant of the record.
    pub fn validate(&self) -> Result<()> {
        if self.title.is_empty() {
            return Err(TkError::invalid("title", "must not be empty"));
        }
        if !(1..=4).contains(&self.priority) {
            return Err(TkError::invalid(
                "priority",
                format!("{} is outside 1..=4", self.priority),
            ));
        }
        if self.created_at.timestamp_millis() == 0 {
            return Err(TkError::invalid("created_at", "must be set"));
        }
        match (self.status, self.closed_at) {
            (Status::Closed, None) => {
                return Err(TkError::invalid("closed_at", "required when status is closed"))
            }
            (Status::Closed, Some(closed)) if closed < self.created_at => {
                return Err(TkError::invalid("closed_at", "precedes created_at"))
            }
            (Status::Closed, Some(_)) => {}
            (_, Some(_)) => {
                return Err(TkError::invalid(
                    "closed_at",
                    "only allowed when status is closed",
                ))
            }
            (_, None) => {}
        }
        let mut seen = std::collections::HashSet::new();
        for blocker in &self.blocked_by {
            if *blocker == self.id {
                return Err(TkError::invalid("blocked_by", "ticket cannot block itself"));
            }
            if !seen.insert(*blocker) {
                return Err(TkError::invalid(
                    "blocked_by",
                    format!("duplicate blocker {}", blocker),
                ));
            }
        }
        let mut seen_tags = std::collections::HashSet::new();
        for tag in &self.tags {
            if tag.is_empty() {
                return Err(TkError::invalid("tags", "empty tag"));
            }
            if !seen_tags.insert(tag.as_str()) {
                return Err(TkError::invalid("tags", format!("duplicate tag `{}`", tag)));
            }
        }
        Ok(())
    }

    /// Frontmatter map carrying every stored field.
    pub fn to_frontmatter(&self) -> Frontmatter {
        let mut fm = Frontmatter::new();
        fm.insert("id".into(), Value::str(self.id.to_string()));
        fm.insert("schema_version".into(), Value::int(CURRENT_SCHEMA_VERSION));
        fm.insert("created_at".into(), Value::str(rfc3339(&self.created_at)));
        if let Some(closed) = &self.closed_at {
            fm.insert("closed_at".into(), Value::str(rfc3339(closed)));
        }
        fm.insert("status".into(), Value::str(self.status.as_str()));
        fm.insert("type".into(), Value::str(self.ticket_type.as_str()));
        fm.insert("priority".into(), Value::int(self.priority as i64));
        fm.insert("title".into(), Value::str(self.title.clone()));
        if let Some(assignee) = &self.assignee {
            fm.insert("assignee".into(), Value::str(assignee.clone()));
        }
        if let Some(parent) = &self.parent {
            fm.insert("parent".into(), Value::str(parent.to_string()));
        }
        if let Some(external_ref) = &self.external_ref {
            fm.insert("external_ref".into(), Value::str(external_ref.clone()));
        }
        fm.insert(
            "blocked_by".into(),
            Value::List(self.blocked_by.iter().map(|b| b.to_string()).collect()),
        );
        fm.insert("tags".into(), Value::List(self.tags.clone()));
        fm
    }

    /// Rebuild a ticket from a frontmatter map and (already normalized)
    /// body. Each field gets its bucket-specific type check; the result is
    /// fully validated.
    pub fn from_frontmatter(fm: &Frontmatter, body: String) -> Result<Ticket> {
        for key in fm.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(TkError::invalid(
                    "frontmatter",
                    format!("unknown key `{}`", key),
                ));
            }
        }

        let schema_version = require_int(fm, "schema_version")?;
        if schema_version != CURRENT_SCHEMA_VERSION {
            return Err(TkError::invalid(
                "schema_version",
                format!(
                    "expected {}, found {}",
                    CURRENT_SCHEMA_VERSION, schema_version
                ),
            ));
        }

        let id = TicketId::parse(require_str(fm, "id")?)?;
        let status = Status::parse(require_str(fm, "status")?)?;
        let ticket_type = TicketType::parse(require_str(fm, "type")?)?;
        let priority = require_int(fm, "priority")?;
        let priority = u8::try_from(priority)
            .map_err(|_| TkError::invalid("priority", format!("{} is outside 1..=4", priority)))?;

        let created_at = parse_timestamp("created_at", require_str(fm, "created_at")?)?;
        let closed_at = optional_str(fm, "closed_at")?
            .map(|s| parse_timestamp("closed_at", s))
            .transpose()?;

        let blocked_by = require_list(fm, "blocked_by")?
            .iter()
            .map(|s| TicketId::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let tags = require_list(fm, "tags")?.to_vec();

        let parent = optional_str(fm, "parent")?
            .map(TicketId::parse)
            .transpose()?;

        let ticket = Ticket {
            id,
            status,
            ticket_type,
            priority,
            title: require_str(fm, "title")?.to_string(),
            body,
            assignee: optional_str(fm, "assignee")?.map(str::to_string),
            parent,
            external_ref: optional_str(fm, "external_ref")?.map(str::to_string),
            blocked_by,
            tags,
            created_at,
            closed_at,
        };
        ticket.validate()?;
        Ok(ticket)
    }

    /// Serialize to file bytes: frontmatter, blank line, body, and exactly
    /// one trailing newline.
    pub fn marshal_file(&self) -> String {
        render_file(&self.to_frontmatter(), &self.body)
    }

    /// Parse file contents and verify the file sits at its derived path.
    ///
    /// `mtime_ns` is the file's stat time, destined for the caller's index
    /// row; it is checked here so a bad stat never reaches the index, but
    /// it is never trusted for ordering.
    pub fn parse_file(text: &str, rel_path: &Path, mtime_ns: i64) -> Result<Ticket> {
        if mtime_ns < 0 {
            return Err(TkError::invalid("mtime_ns", "must not be negative"));
        }
        let (fm, raw_body) = frontmatter::parse(text)?;
        let ticket = Ticket::from_frontmatter(&fm, normalize_raw_body(raw_body))?;
        let expected = ticket.id.rel_path();
        if expected != rel_path {
            return Err(TkError::invalid(
                "path",
                format!(
                    "file at {} but id {} derives {}",
                    rel_path.display(),
                    ticket.id,
                    expected.display()
                ),
            ));
        }
        Ok(ticket)
    }
}

/// Keys a ticket file may carry; anything else is a parse failure.
const KNOWN_KEYS: [&str; 12] = [
    "id",
    "schema_version",
    "assignee",
    "blocked_by",
    "closed_at",
    "created_at",
    "external_ref",
    "parent",
    "priority",
    "status",
    "tags",
    "title",
];

/// Render frontmatter + body the way ticket files are stored. Shared by
/// `marshal_file` and WAL replay so both produce identical bytes.
pub fn render_file(fm: &Frontmatter, body: &str) -> String {
    let mut out = frontmatter::emit(fm);
    let body = body.trim_end_matches('\n');
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
    out
}

/// Inverse of `render_file` for the body part: drop the separating blank
/// line and the trailing newline.
pub fn normalize_raw_body(raw: &str) -> String {
    let without_sep = raw.strip_prefix('\n').unwrap_or(raw);
    without_sep.trim_end_matches('\n').to_string()
}

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_ms(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn parse_timestamp(field: &'static str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TkError::invalid(field, format!("bad timestamp `{}`: {}", s, e)))
}

fn require<'a>(fm: &'a Frontmatter, key: &'static str) -> Result<&'a Value> {
    fm.get(key)
        .ok_or_else(|| TkError::invalid(key, "missing required key"))
}

fn require_str<'a>(fm: &'a Frontmatter, key: &'static str) -> Result<&'a str> {
    let value = require(fm, key)?;
    value
        .as_str()
        .ok_or_else(|| TkError::invalid(key, format!("expected string, found {}", value.kind())))
}

fn require_int(fm: &Frontmatter, key: &'static str) -> Result<i64> {
    let value = require(fm, key)?;
    value
        .as_int()
        .ok_or_else(|| TkError::invalid(key, format!("expected integer, found {}", value.kind())))
}

fn require_list<'a>(fm: &'a Frontmatter, key: &'static str) -> Result<&'a [String]> {
    let value = require(fm, key)?;
    value
        .as_list()
        .ok_or_else(|| TkError::invalid(key, format!("expected list, found {}", value.kind())))
}

fn optional_str<'a>(fm: &'a Frontmatter, key: &'static str) -> Result<Option<&'a str>> {
    match fm.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| TkError::invalid(key, format!("expected string, found {}", value.kind()))),
    }
}
