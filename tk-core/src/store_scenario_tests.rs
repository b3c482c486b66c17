// tk-core/src/store_scenario_tests.rs
// End-to-end scenarios exercising the store, transaction, recovery and
// oracle layers together

use std::time::Duration;

use chrono::Utc;

use crate::cancel::CancelToken;
use crate::error::TkError;
use crate::index::QueryOptions;
use crate::oracle::{Oracle, OracleError};
use crate::recovery;
use crate::store::Store;
use crate::ticket::{Status, Ticket, TicketType, CURRENT_SCHEMA_VERSION, DEFAULT_PRIORITY};
use crate::wal::{self, WalOp, WalState};

const T: Duration = Duration::from_secs(1);

fn open_store(dir: &tempfile::TempDir) -> Store {
    Store::open(dir.path(), T).unwrap()
}

fn create(store: &Store, title: &str) -> Ticket {
    let mut tx = store.begin(T).unwrap();
    let stored = tx
        .put(&Ticket::new(title, TicketType::default(), DEFAULT_PRIORITY))
        .unwrap();
    tx.commit(&CancelToken::new()).unwrap();
    stored
}

fn update(store: &Store, ticket: &Ticket) -> Ticket {
    let mut tx = store.begin(T).unwrap();
    let stored = tx.put(ticket).unwrap();
    tx.commit(&CancelToken::new()).unwrap();
    stored
}

fn oracle_of(store: &Store) -> Oracle {
    let rows = store.query(&QueryOptions::new()).unwrap();
    Oracle::from_rows(&rows).unwrap()
}

/// Create → start → close → list, checking both the index and the file.
#[test]
fn scenario_create_start_close_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let mut ticket = create(&store, "Update docs");
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, Status::Open);
    assert_eq!(rows[0].title, "Update docs");

    ticket.status = Status::InProgress;
    ticket = update(&store, &ticket);
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows[0].status, Status::InProgress);

    ticket.status = Status::Closed;
    ticket.closed_at = Some(Utc::now());
    let ticket = update(&store, &ticket);
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows[0].status, Status::Closed);

    let on_disk =
        std::fs::read_to_string(dir.path().join(ticket.rel_path())).unwrap();
    assert!(on_disk.contains("status: closed"), "{}", on_disk);
    assert!(on_disk.contains("closed_at: "), "{}", on_disk);
}

/// Blocker chain A ← B ← C worked through the ready queue.
#[test]
fn scenario_blocker_chain_ready_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let a = create(&store, "A");
    let mut b = Ticket::new("B", TicketType::default(), DEFAULT_PRIORITY);
    b.blocked_by = vec![a.id];
    let b = update(&store, &b);
    let mut c = Ticket::new("C", TicketType::default(), DEFAULT_PRIORITY);
    c.blocked_by = vec![b.id];
    update(&store, &c);

    let ready: Vec<String> = oracle_of(&store)
        .ready()
        .iter()
        .map(|t| t.title.clone())
        .collect();
    assert_eq!(ready, ["A"]);

    // Start and close A
    let mut a = store.get(&a.id).unwrap();
    a.status = Status::InProgress;
    let mut a = update(&store, &a);
    a.status = Status::Closed;
    a.closed_at = Some(Utc::now());
    update(&store, &a);

    let ready: Vec<String> = oracle_of(&store)
        .ready()
        .iter()
        .map(|t| t.title.clone())
        .collect();
    assert_eq!(ready, ["B"]);

    let mut b = store.get(&b.id).unwrap();
    b.status = Status::InProgress;
    let mut b = update(&store, &b);
    b.status = Status::Closed;
    b.closed_at = Some(Utc::now());
    update(&store, &b);

    let ready: Vec<String> = oracle_of(&store)
        .ready()
        .iter()
        .map(|t| t.title.clone())
        .collect();
    assert_eq!(ready, ["C"]);
}

/// Starting a blocked ticket is rejected and changes nothing.
#[test]
fn scenario_blocked_start_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let a = create(&store, "A");
    let mut b = Ticket::new("B", TicketType::default(), DEFAULT_PRIORITY);
    b.blocked_by = vec![a.id];
    let b = update(&store, &b);

    let mut oracle = oracle_of(&store);
    let err = oracle.start(&b.id.to_string()).unwrap_err();
    assert_eq!(err.code(), "has_open_blockers");
    assert!(err.is_state_violation());
    assert_eq!(oracle.get(&a.id.to_string()).unwrap().status, Status::Open);
    assert_eq!(oracle.get(&b.id.to_string()).unwrap().status, Status::Open);
}

/// A cycle through three tickets is rejected with the full path.
#[test]
fn scenario_cycle_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let a = create(&store, "A").id.to_string();
    let b = create(&store, "B").id.to_string();
    let c = create(&store, "C").id.to_string();

    let mut oracle = oracle_of(&store);
    oracle.block(&a, &b).unwrap();
    oracle.block(&b, &c).unwrap();

    let err = oracle.block(&c, &a).unwrap_err();
    let OracleError::BlockerCycle { path } = &err else {
        panic!("expected cycle, got {}", err);
    };
    assert_eq!(path, &[c.clone(), a.clone(), b.clone(), c.clone()]);
    assert!(oracle.get(&c).unwrap().blocked_by.is_empty());
}

/// Crash between file replay and index update: reopening finishes the
/// commit exactly once.
#[test]
fn scenario_crash_safe_commit() {
    let dir = tempfile::tempdir().unwrap();
    let ticket = Ticket::new("survivor", TicketType::Bug, 1);

    {
        let store = open_store(&dir);
        // Drive the commit sequence by hand and stop after the file
        // write, before the index update
        let ops = vec![WalOp::put(&ticket)];
        let bytes = wal::encode(&ops).unwrap();
        store.wal().install(&bytes).unwrap();
        recovery::replay_files(store.root(), &ops, &CancelToken::new()).unwrap();
        // "crash" here: WAL still committed, index never updated
        assert!(matches!(
            store.wal().state().unwrap(),
            WalState::Committed(_)
        ));
    }

    let store = open_store(&dir);
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, ticket.id.to_string());
    assert!(dir.path().join(ticket.rel_path()).exists());
    assert_eq!(store.wal().state().unwrap(), WalState::Empty);
}

/// A foreign user_version forces a full rebuild on open.
#[test]
fn scenario_schema_mismatch_forces_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir);
        create(&store, "one");
        create(&store, "two");
    }
    {
        let conn =
            rusqlite::Connection::open(dir.path().join(".tk").join("index.sqlite")).unwrap();
        conn.pragma_update(None, "user_version", 999).unwrap();
    }

    let store = open_store(&dir);
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows.len(), 2);
    store
        .with_index(|index| {
            assert_eq!(index.user_version().unwrap(), CURRENT_SCHEMA_VERSION);
            Ok(())
        })
        .unwrap();
}

/// Ids mint in strictly increasing order, and the index returns creation
/// order, so sort-by-id equals sort-by-created_at.
#[test]
fn scenario_listing_preserves_creation_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let titles = ["first", "second", "third", "fourth"];
    for title in titles {
        create(&store, title);
    }

    let rows = store.query(&QueryOptions::new()).unwrap();
    let listed: Vec<&str> = rows.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(listed, titles);

    let mut by_created = rows.clone();
    by_created.sort_by(|x, y| x.created_at.cmp(&y.created_at).then(x.id.cmp(&y.id)));
    assert_eq!(by_created, rows);
}

/// Deleting through a transaction removes the file and the row; the same
/// short-id prefix stops resolving.
#[test]
fn scenario_delete_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let keep = create(&store, "keep");
    let drop_me = create(&store, "drop me");

    let mut tx = store.begin(T).unwrap();
    tx.delete(&drop_me.id).unwrap();
    tx.commit(&CancelToken::new()).unwrap();

    assert!(!dir.path().join(drop_me.rel_path()).exists());
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, keep.id.to_string());
    assert!(matches!(
        store.get(&drop_me.id).unwrap_err(),
        TkError::NotFound(_)
    ));
    assert!(store
        .get_by_prefix(&drop_me.short_id())
        .unwrap()
        .is_empty());
}

/// Reindex after hand-editing files out from under the index.
#[test]
fn scenario_reindex_picks_up_external_edits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ticket = create(&store, "original title");

    // An external editor rewrites the file (legally) behind the index
    let mut edited = store.get(&ticket.id).unwrap();
    edited.title = "edited on disk".to_string();
    crate::fsio::atomic_write(
        &dir.path().join(ticket.rel_path()),
        edited.marshal_file().as_bytes(),
    )
    .unwrap();

    let count = store.reindex(&CancelToken::new()).unwrap();
    assert_eq!(count, 1);
    let rows = store.query(&QueryOptions::new()).unwrap();
    assert_eq!(rows[0].title, "edited on disk");
}

/// Many tickets with many blockers: pagination still counts tickets.
#[test]
fn scenario_pagination_counts_tickets() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let blockers: Vec<Ticket> = (0..3).map(|i| create(&store, &format!("blk{}", i))).collect();
    for i in 0..4 {
        let mut t = Ticket::new(format!("task{}", i), TicketType::Task, 2);
        t.blocked_by = blockers.iter().map(|b| b.id).collect();
        update(&store, &t);
    }

    let page = store
        .query(&QueryOptions::new().with_limit(2).with_offset(0))
        .unwrap();
    assert_eq!(page.len(), 2);
    let page = store
        .query(&QueryOptions::new().with_limit(5).with_offset(5))
        .unwrap();
    assert_eq!(page.len(), 2);
}
