// tk-core/src/index.rs
// Derived SQLite index: tickets + ticket_blockers, rebuilt from disk or
// updated incrementally from the WAL

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use crate::cancel::CancelToken;
use crate::error::{Result, TkError};
use crate::fsio;
use crate::id::TicketId;
use crate::ticket::{Status, Ticket, TicketType, CURRENT_SCHEMA_VERSION};
use crate::wal::WalOp;

/// Hard cap on prefix-lookup results.
pub const PREFIX_LOOKUP_CAP: usize = 50;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    id           TEXT PRIMARY KEY,
    short_id     TEXT NOT NULL,
    path         TEXT NOT NULL,
    mtime_ns     INTEGER NOT NULL,
    status       TEXT NOT NULL,
    type         TEXT NOT NULL,
    priority     INTEGER NOT NULL,
    assignee     TEXT,
    parent       TEXT,
    created_at   TEXT NOT NULL,
    closed_at    TEXT,
    external_ref TEXT,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ticket_blockers (
    ticket_id  TEXT NOT NULL,
    blocker_id TEXT NOT NULL,
    PRIMARY KEY (ticket_id, blocker_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_tickets_status_priority ON tickets(status, priority);
CREATE INDEX IF NOT EXISTS idx_tickets_status_type ON tickets(status, type);
CREATE INDEX IF NOT EXISTS idx_tickets_parent ON tickets(parent);
CREATE INDEX IF NOT EXISTS idx_tickets_short_id ON tickets(short_id);
CREATE INDEX IF NOT EXISTS idx_blockers_blocker ON ticket_blockers(blocker_id);
"#;

/// Filters for `Index::query`. Zero means "unset" for `priority` and
/// "unbounded" for `limit`; negatives are rejected.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub status: Option<Status>,
    pub ticket_type: Option<TicketType>,
    pub priority: i64,
    pub parent: Option<TicketId>,
    pub short_id_prefix: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, ticket_type: TicketType) -> Self {
        self.ticket_type = Some(ticket_type);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: TicketId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_short_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.short_id_prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.limit < 0 {
            return Err(TkError::invalid("limit", "must not be negative"));
        }
        if self.offset < 0 {
            return Err(TkError::invalid("offset", "must not be negative"));
        }
        if self.priority < 0 {
            return Err(TkError::invalid("priority", "must not be negative"));
        }
        Ok(())
    }
}

/// Denormalized index row: the ticket's scalar columns plus its blockers.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub id: String,
    pub short_id: String,
    pub path: String,
    pub mtime_ns: i64,
    pub status: Status,
    pub ticket_type: TicketType,
    pub priority: u8,
    pub assignee: Option<String>,
    pub parent: Option<String>,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub external_ref: Option<String>,
    pub title: String,
    pub body: String,
    pub blockers: Vec<String>,
}

/// The derived SQL index. Not thread-safe by itself; the `Store` guards it
/// with a mutex.
#[derive(Debug)]
pub struct Index {
    conn: Connection,
}

impl Index {
    /// Open (or create) the index database and apply the connection
    /// pragmas. The schema is ensured so WAL replay can always insert;
    /// `user_version` is only stamped by a full rebuild.
    pub fn open(path: &Path) -> Result<Index> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(conn)
    }

    /// In-memory index, used by tests.
    pub fn open_in_memory() -> Result<Index> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Index> {
        // These two report their new value back as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.query_row("PRAGMA mmap_size = 268435456", [], |_| Ok(()))?;
        conn.execute_batch(
            "PRAGMA synchronous = FULL;\n\
             PRAGMA cache_size = -20000;\n\
             PRAGMA temp_store = MEMORY;",
        )?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Index { conn })
    }

    pub fn user_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Apply committed WAL ops in one immediate transaction. Put ops are
    /// re-parsed from their logged frontmatter; `mtime_ns` is taken from
    /// the already-replayed file.
    pub fn apply_ops(&mut self, root: &Path, ops: &[WalOp], cancel: &CancelToken) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(index_err)?;
        for op in ops {
            cancel.check()?;
            match op.ticket()? {
                Some(ticket) => {
                    let mtime = fsio::mtime_ns(&root.join(&op.path)).unwrap_or(0);
                    upsert_ticket(&tx, &ticket, mtime).map_err(index_err)?;
                }
                None => {
                    delete_ticket(&tx, &op.id).map_err(index_err)?;
                }
            }
        }
        tx.commit().map_err(index_err)
    }

    /// Drop both tables, recreate the schema, insert every ticket, stamp
    /// `user_version`. One transaction: readers see the old index or the
    /// new one, nothing in between.
    pub fn rebuild(&mut self, entries: &[(Ticket, i64)]) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(index_err)?;
        tx.execute_batch(
            "DROP TABLE IF EXISTS ticket_blockers;\n\
             DROP TABLE IF EXISTS tickets;",
        )
        .map_err(index_err)?;
        tx.execute_batch(SCHEMA).map_err(index_err)?;
        for (ticket, mtime_ns) in entries {
            upsert_ticket(&tx, ticket, *mtime_ns).map_err(index_err)?;
        }
        tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
            .map_err(index_err)?;
        tx.commit().map_err(index_err)?;
        Ok(entries.len())
    }

    /// Filtered listing. Pagination runs in a subquery before the blocker
    /// left-join, so `limit`/`offset` count tickets rather than joined
    /// rows. Ordering is id ascending, blockers ascending within a ticket.
    pub fn query(&self, opts: &QueryOptions) -> Result<Vec<IndexRow>> {
        opts.validate()?;

        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(status) = opts.status {
            clauses.push("status = ?");
            params.push(status.as_str().to_string().into());
        }
        if let Some(ticket_type) = opts.ticket_type {
            clauses.push("type = ?");
            params.push(ticket_type.as_str().to_string().into());
        }
        if opts.priority > 0 {
            clauses.push("priority = ?");
            params.push(opts.priority.into());
        }
        if let Some(parent) = &opts.parent {
            clauses.push("parent = ?");
            params.push(parent.to_string().into());
        }
        if let Some(prefix) = &opts.short_id_prefix {
            clauses.push("short_id LIKE ? ESCAPE '\\'");
            params.push(like_prefix(prefix).into());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let mut inner = format!("SELECT * FROM tickets{} ORDER BY id ASC", where_sql);
        if opts.limit > 0 || opts.offset > 0 {
            inner.push_str(" LIMIT ? OFFSET ?");
            let limit = if opts.limit == 0 { -1 } else { opts.limit };
            params.push(limit.into());
            params.push(opts.offset.into());
        }

        let sql = format!(
            "SELECT t.id, t.short_id, t.path, t.mtime_ns, t.status, t.type, t.priority, \
             t.assignee, t.parent, t.created_at, t.closed_at, t.external_ref, t.title, t.body, \
             b.blocker_id \
             FROM ({}) t \
             LEFT JOIN ticket_blockers b ON b.ticket_id = t.id \
             ORDER BY t.id ASC, b.blocker_id ASC",
            inner
        );
        self.run_row_query(&sql, rusqlite::params_from_iter(params))
    }

    /// Look up by short-id or full-id prefix, capped and ordered by id.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Vec<IndexRow>> {
        if prefix.is_empty() {
            return Err(TkError::invalid("prefix", "must not be empty"));
        }
        let like = like_prefix(prefix);
        let sql = format!(
            "SELECT t.id, t.short_id, t.path, t.mtime_ns, t.status, t.type, t.priority, \
             t.assignee, t.parent, t.created_at, t.closed_at, t.external_ref, t.title, t.body, \
             b.blocker_id \
             FROM (SELECT * FROM tickets \
                   WHERE short_id LIKE ?1 ESCAPE '\\' OR id LIKE ?1 ESCAPE '\\' \
                   ORDER BY id ASC LIMIT {}) t \
             LEFT JOIN ticket_blockers b ON b.ticket_id = t.id \
             ORDER BY t.id ASC, b.blocker_id ASC",
            PREFIX_LOOKUP_CAP
        );
        self.run_row_query(&sql, rusqlite::params![like])
    }

    fn run_row_query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<IndexRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw_rows = stmt.query_map(params, |row| {
            Ok(RawRow {
                id: row.get(0)?,
                short_id: row.get(1)?,
                path: row.get(2)?,
                mtime_ns: row.get(3)?,
                status: row.get(4)?,
                ticket_type: row.get(5)?,
                priority: row.get(6)?,
                assignee: row.get(7)?,
                parent: row.get(8)?,
                created_at: row.get(9)?,
                closed_at: row.get(10)?,
                external_ref: row.get(11)?,
                title: row.get(12)?,
                body: row.get(13)?,
                blocker: row.get(14)?,
            })
        })?;

        let mut rows: Vec<IndexRow> = Vec::new();
        for raw in raw_rows {
            let raw = raw?;
            match rows.last_mut() {
                Some(last) if last.id == raw.id => {
                    if let Some(blocker) = raw.blocker {
                        last.blockers.push(blocker);
                    }
                }
                _ => rows.push(raw.into_row()?),
            }
        }
        Ok(rows)
    }
}

struct RawRow {
    id: String,
    short_id: String,
    path: String,
    mtime_ns: i64,
    status: String,
    ticket_type: String,
    priority: i64,
    assignee: Option<String>,
    parent: Option<String>,
    created_at: String,
    closed_at: Option<String>,
    external_ref: Option<String>,
    title: String,
    body: String,
    blocker: Option<String>,
}

impl RawRow {
    fn into_row(self) -> Result<IndexRow> {
        Ok(IndexRow {
            status: Status::parse(&self.status)?,
            ticket_type: TicketType::parse(&self.ticket_type)?,
            priority: u8::try_from(self.priority)
                .map_err(|_| TkError::invalid("priority", format!("{} in index", self.priority)))?,
            id: self.id,
            short_id: self.short_id,
            path: self.path,
            mtime_ns: self.mtime_ns,
            assignee: self.assignee,
            parent: self.parent,
            created_at: self.created_at,
            closed_at: self.closed_at,
            external_ref: self.external_ref,
            title: self.title,
            body: self.body,
            blockers: self.blocker.into_iter().collect(),
        })
    }
}

/// INSERT OR REPLACE one ticket and rebuild its blocker rows.
pub(crate) fn upsert_ticket(
    tx: &rusqlite::Transaction<'_>,
    ticket: &Ticket,
    mtime_ns: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO tickets \
         (id, short_id, path, mtime_ns, status, type, priority, assignee, parent, \
          created_at, closed_at, external_ref, title, body) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            ticket.id.to_string(),
            ticket.short_id(),
            ticket.rel_path().to_string_lossy(),
            mtime_ns,
            ticket.status.as_str(),
            ticket.ticket_type.as_str(),
            ticket.priority as i64,
            ticket.assignee,
            ticket.parent.map(|p| p.to_string()),
            ticket
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ticket
                .closed_at
                .map(|c| c.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            ticket.external_ref,
            ticket.title,
            ticket.body,
        ],
    )?;
    tx.execute(
        "DELETE FROM ticket_blockers WHERE ticket_id = ?1",
        rusqlite::params![ticket.id.to_string()],
    )?;
    let mut insert = tx.prepare_cached(
        "INSERT INTO ticket_blockers (ticket_id, blocker_id) VALUES (?1, ?2)",
    )?;
    for blocker in &ticket.blocked_by {
        insert.execute(rusqlite::params![ticket.id.to_string(), blocker.to_string()])?;
    }
    Ok(())
}

pub(crate) fn delete_ticket(tx: &rusqlite::Transaction<'_>, id: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM tickets WHERE id = ?1", rusqlite::params![id])?;
    tx.execute(
        "DELETE FROM ticket_blockers WHERE ticket_id = ?1",
        rusqlite::params![id],
    )?;
    Ok(())
}

fn index_err(e: rusqlite::Error) -> TkError {
    TkError::IndexUpdate(e.to_string())
}

/// Escape LIKE metacharacters and append the wildcard.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
