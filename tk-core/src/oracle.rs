// tk-core/src/oracle.rs
// Pure in-memory reference model for ticket semantics: the state machine,
// blocker DAG, readiness and listing rules callers must honor

use std::collections::BTreeMap;

use thiserror::Error;

use crate::index::IndexRow;
use crate::ticket::{Status, TicketType};

/// Semantic violations, each with a stable snake_case code for callers
/// that map errors to message buckets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("ticket not found: {0}")]
    NotFound(String),

    #[error("ticket already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot start a ticket that is {0}")]
    StartNotOpen(String),

    #[error("cannot close a ticket that was never started")]
    CloseNotStarted,

    #[error("cannot close a ticket that is already closed")]
    CloseAlreadyClosed,

    #[error("cannot reopen a ticket that is {0}")]
    ReopenNotClosed(String),

    #[error("cannot start: open blockers remain ({})", _0.join(", "))]
    HasOpenBlockers(Vec<String>),

    #[error("cannot close: open children remain ({})", _0.join(", "))]
    HasOpenChildren(Vec<String>),

    #[error("cannot reopen: parent {0} is closed")]
    ParentClosed(String),

    #[error("a ticket cannot block itself")]
    SelfBlock,

    #[error("blocker already present: {0}")]
    DuplicateBlocker(String),

    #[error("blocker cycle: {}", path.join(" -> "))]
    BlockerCycle { path: Vec<String> },

    #[error("negative {0}")]
    NegativePage(&'static str),

    #[error("offset {offset} out of bounds for {count} matching ticket(s)")]
    OffsetOutOfBounds { offset: i64, count: usize },
}

impl OracleError {
    /// Stable identifier for message buckets.
    pub fn code(&self) -> &'static str {
        match self {
            OracleError::NotFound(_) => "not_found",
            OracleError::AlreadyExists(_) => "already_exists",
            OracleError::StartNotOpen(_) => "start_not_open",
            OracleError::CloseNotStarted => "close_not_started",
            OracleError::CloseAlreadyClosed => "close_already_closed",
            OracleError::ReopenNotClosed(_) => "reopen_not_closed",
            OracleError::HasOpenBlockers(_) => "has_open_blockers",
            OracleError::HasOpenChildren(_) => "has_open_children",
            OracleError::ParentClosed(_) => "parent_closed",
            OracleError::SelfBlock => "self_block",
            OracleError::DuplicateBlocker(_) => "duplicate_blocker",
            OracleError::BlockerCycle { .. } => "blocker_cycle",
            OracleError::NegativePage(_) => "negative_page",
            OracleError::OffsetOutOfBounds { .. } => "offset_out_of_bounds",
        }
    }

    /// Coarse bucket matching the store's error taxonomy.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            OracleError::StartNotOpen(_)
                | OracleError::CloseNotStarted
                | OracleError::CloseAlreadyClosed
                | OracleError::ReopenNotClosed(_)
                | OracleError::HasOpenBlockers(_)
                | OracleError::HasOpenChildren(_)
                | OracleError::ParentClosed(_)
        )
    }
}

type OracleResult<T> = std::result::Result<T, OracleError>;

/// A ticket as the model sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTicket {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub ticket_type: TicketType,
    pub priority: u8,
    pub parent: Option<String>,
    pub blocked_by: Vec<String>,
    /// Creation sequence; drives listing order
    seq: usize,
}

/// Filters for `Oracle::list`, AND-ed together.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub ticket_type: Option<TicketType>,
    pub priority: Option<u8>,
    pub parent: Option<String>,
}

impl ListFilter {
    fn matches(&self, t: &ModelTicket) -> bool {
        self.status.map_or(true, |s| t.status == s)
            && self.ticket_type.map_or(true, |ty| t.ticket_type == ty)
            && self.priority.map_or(true, |p| t.priority == p)
            && self
                .parent
                .as_ref()
                .map_or(true, |p| t.parent.as_deref() == Some(p.as_str()))
    }
}

/// The semantics oracle. Pure and in-memory; no I/O, no store handle.
#[derive(Debug, Default)]
pub struct Oracle {
    tickets: BTreeMap<String, ModelTicket>,
    next_seq: usize,
}

impl Oracle {
    pub fn new() -> Oracle {
        Oracle::default()
    }

    /// Load the model from index rows (as returned by `Store::query`).
    /// Rows arrive in id order, which for minted ids is creation order;
    /// blockers are attached in a second pass so forward references work.
    pub fn from_rows(rows: &[IndexRow]) -> crate::error::Result<Oracle> {
        let mut oracle = Oracle::new();
        for row in rows {
            oracle.create(
                &row.id,
                &row.title,
                row.ticket_type,
                row.priority,
                row.parent.as_deref(),
            )?;
            oracle
                .tickets
                .get_mut(&row.id)
                .expect("just created")
                .status = row.status;
        }
        for row in rows {
            for blocker in &row.blockers {
                oracle.block(&row.id, blocker)?;
            }
        }
        Ok(oracle)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn get(&self, id: &str) -> OracleResult<&ModelTicket> {
        self.tickets
            .get(id)
            .ok_or_else(|| OracleError::NotFound(id.to_string()))
    }

    /// Add an open ticket. The parent, when given, must already exist;
    /// parent pointers are never reassigned afterwards, which is what
    /// keeps the parent graph acyclic.
    pub fn create(
        &mut self,
        id: &str,
        title: &str,
        ticket_type: TicketType,
        priority: u8,
        parent: Option<&str>,
    ) -> OracleResult<()> {
        if self.tickets.contains_key(id) {
            return Err(OracleError::AlreadyExists(id.to_string()));
        }
        if let Some(parent) = parent {
            if !self.tickets.contains_key(parent) {
                return Err(OracleError::NotFound(parent.to_string()));
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tickets.insert(
            id.to_string(),
            ModelTicket {
                id: id.to_string(),
                title: title.to_string(),
                status: Status::Open,
                ticket_type,
                priority,
                parent: parent.map(str::to_string),
                blocked_by: Vec::new(),
                seq,
            },
        );
        Ok(())
    }

    /// open → in_progress. Requires every direct blocker to be closed.
    pub fn start(&mut self, id: &str) -> OracleResult<()> {
        let ticket = self.get(id)?;
        if ticket.status != Status::Open {
            return Err(OracleError::StartNotOpen(ticket.status.to_string()));
        }
        let open_blockers: Vec<String> = ticket
            .blocked_by
            .iter()
            .filter(|b| {
                self.tickets
                    .get(*b)
                    .map_or(true, |t| t.status != Status::Closed)
            })
            .cloned()
            .collect();
        if !open_blockers.is_empty() {
            return Err(OracleError::HasOpenBlockers(open_blockers));
        }
        self.tickets.get_mut(id).expect("checked").status = Status::InProgress;
        Ok(())
    }

    /// in_progress → closed. Requires every child to be closed.
    pub fn close(&mut self, id: &str) -> OracleResult<()> {
        let ticket = self.get(id)?;
        match ticket.status {
            Status::Open => return Err(OracleError::CloseNotStarted),
            Status::Closed => return Err(OracleError::CloseAlreadyClosed),
            Status::InProgress => {}
        }
        let open_children: Vec<String> = self
            .tickets
            .values()
            .filter(|t| t.parent.as_deref() == Some(id) && t.status != Status::Closed)
            .map(|t| t.id.clone())
            .collect();
        if !open_children.is_empty() {
            return Err(OracleError::HasOpenChildren(open_children));
        }
        self.tickets.get_mut(id).expect("checked").status = Status::Closed;
        Ok(())
    }

    /// closed → open. Rejected when the parent has already been closed.
    pub fn reopen(&mut self, id: &str) -> OracleResult<()> {
        let ticket = self.get(id)?;
        if ticket.status != Status::Closed {
            return Err(OracleError::ReopenNotClosed(ticket.status.to_string()));
        }
        if let Some(parent_id) = &ticket.parent {
            if let Some(parent) = self.tickets.get(parent_id) {
                if parent.status == Status::Closed {
                    return Err(OracleError::ParentClosed(parent_id.clone()));
                }
            }
        }
        self.tickets.get_mut(id).expect("checked").status = Status::Open;
        Ok(())
    }

    /// Record that `id` is blocked by `blocker`. Rejects self-references,
    /// duplicates, and anything that would close a cycle in the DAG; the
    /// cycle error carries the full path `[id, blocker, …, id]`.
    pub fn block(&mut self, id: &str, blocker: &str) -> OracleResult<()> {
        if id == blocker {
            return Err(OracleError::SelfBlock);
        }
        self.get(id)?;
        self.get(blocker)?;
        if self
            .get(id)
            .expect("checked")
            .blocked_by
            .iter()
            .any(|b| b == blocker)
        {
            return Err(OracleError::DuplicateBlocker(blocker.to_string()));
        }
        if let Some(mut path) = self.find_path(blocker, id) {
            // path runs blocker → … → id; close the loop at both ends
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(id.to_string());
            cycle.append(&mut path);
            return Err(OracleError::BlockerCycle { path: cycle });
        }
        self.tickets
            .get_mut(id)
            .expect("checked")
            .blocked_by
            .push(blocker.to_string());
        Ok(())
    }

    pub fn unblock(&mut self, id: &str, blocker: &str) -> OracleResult<()> {
        self.get(id)?;
        let blocked_by = &mut self.tickets.get_mut(id).expect("checked").blocked_by;
        let before = blocked_by.len();
        blocked_by.retain(|b| b != blocker);
        if blocked_by.len() == before {
            return Err(OracleError::NotFound(blocker.to_string()));
        }
        Ok(())
    }

    /// DFS along blocked_by edges from `from` looking for `to`; returns
    /// the path `[from, …, to]` when one exists.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = std::collections::HashSet::new();
        let mut path = Vec::new();
        if self.dfs(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs<'a>(
        &'a self,
        current: &'a str,
        target: &str,
        visited: &mut std::collections::HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current.to_string());
        if current == target {
            return true;
        }
        if let Some(ticket) = self.tickets.get(current) {
            for next in &ticket.blocked_by {
                if self.dfs(next, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// A ticket is ready when it is open, all of its direct blockers are
    /// closed, its parent (if any) has been started or closed, and no
    /// ancestor is itself waiting on an open blocker.
    pub fn is_ready(&self, id: &str) -> OracleResult<bool> {
        let ticket = self.get(id)?;
        if ticket.status != Status::Open {
            return Ok(false);
        }
        if self.has_open_blockers(ticket) {
            return Ok(false);
        }
        if let Some(parent_id) = &ticket.parent {
            if let Some(parent) = self.tickets.get(parent_id) {
                if parent.status == Status::Open {
                    return Ok(false);
                }
            }
        }
        // Walk the ancestor chain for open blockers
        let mut current = ticket.parent.as_deref();
        while let Some(ancestor_id) = current {
            let Some(ancestor) = self.tickets.get(ancestor_id) else {
                break;
            };
            if self.has_open_blockers(ancestor) {
                return Ok(false);
            }
            current = ancestor.parent.as_deref();
        }
        Ok(true)
    }

    fn has_open_blockers(&self, ticket: &ModelTicket) -> bool {
        ticket.blocked_by.iter().any(|b| {
            self.tickets
                .get(b)
                .map_or(true, |t| t.status != Status::Closed)
        })
    }

    /// Ready queue: priority ascending, stable in creation order.
    pub fn ready(&self) -> Vec<&ModelTicket> {
        let mut ready: Vec<&ModelTicket> = self
            .in_creation_order()
            .filter(|t| self.is_ready(&t.id).unwrap_or(false))
            .collect();
        ready.sort_by_key(|t| t.priority);
        ready
    }

    /// Filtered listing in creation order, offset applied before limit.
    /// A positive offset at or past the end of the filtered set is an
    /// error rather than an empty page, so paging bugs stay visible.
    pub fn list(
        &self,
        filter: &ListFilter,
        offset: i64,
        limit: i64,
    ) -> OracleResult<Vec<&ModelTicket>> {
        if offset < 0 {
            return Err(OracleError::NegativePage("offset"));
        }
        if limit < 0 {
            return Err(OracleError::NegativePage("limit"));
        }
        let filtered: Vec<&ModelTicket> = self
            .in_creation_order()
            .filter(|t| filter.matches(t))
            .collect();
        if offset > 0 && offset as usize >= filtered.len() {
            return Err(OracleError::OffsetOutOfBounds {
                offset,
                count: filtered.len(),
            });
        }
        let iter = filtered.into_iter().skip(offset as usize);
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit as usize).collect()
        })
    }

    fn in_creation_order(&self) -> impl Iterator<Item = &ModelTicket> {
        let mut all: Vec<&ModelTicket> = self.tickets.values().collect();
        all.sort_by_key(|t| t.seq);
        all.into_iter()
    }
}
