use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tupl::{DatabaseConfig, DurabilityMode, Error, Key};

fn open_db(name: &str) -> (tupl::Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut path = PathBuf::from(dir.path());
    path.push(name);
    let config = DatabaseConfig::new(&path)
        .with_redo_log(path.with_extension("redo"))
        .without_periodic_checkpoint();
    let db = tupl::Database::open(config).unwrap();
    (db, dir)
}

fn v(b: &[u8]) -> Key {
    b.to_vec()
}

#[test]
fn basic_put_get_remove_round_trip() {
    let (db, _dir) = open_db("basic.db");
    let ix = db.create_index(Some("main")).unwrap();

    {
        let mut txn = db.begin();
        txn.store(ix, &v(b"1"), &v(b"one")).unwrap();
        txn.store(ix, &v(b"2"), &v(b"two")).unwrap();
        txn.store(ix, &v(b"3"), &v(b"three")).unwrap();
        txn.store(ix, &v(b"4"), &v(b"four")).unwrap();
        txn.store(ix, &v(b"5"), &v(b"five")).unwrap();
        assert_eq!(txn.get(ix, b"1").unwrap().unwrap(), v(b"one"));
        txn.commit().unwrap();
    }
    assert_eq!(db.view(ix, b"1").unwrap().unwrap(), v(b"one"));

    {
        let mut txn = db.begin();
        txn.store(ix, &v(b"2"), &v(b"two-two")).unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(db.view(ix, b"1").unwrap().unwrap(), v(b"one"));
    assert_eq!(db.view(ix, b"2").unwrap().unwrap(), v(b"two-two"));

    {
        let mut txn = db.begin();
        txn.remove(ix, b"3").unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(db.view(ix, b"1").unwrap().unwrap(), v(b"one"));
    assert_eq!(db.view(ix, b"2").unwrap().unwrap(), v(b"two-two"));
    assert_eq!(db.view(ix, b"3").unwrap(), None);
    assert_eq!(db.view(ix, b"4").unwrap().unwrap(), v(b"four"));
}

#[test]
fn rollback_on_drop_undoes_uncommitted_writes() {
    let (db, _dir) = open_db("rollback.db");
    let ix = db.create_index(None).unwrap();
    {
        let mut txn = db.begin();
        txn.store(ix, &v(b"a"), &v(b"1")).unwrap();
        // Dropped without commit -> rolled back.
    }
    assert_eq!(db.view(ix, b"a").unwrap(), None);
}

#[test]
fn explicit_rollback_restores_prior_value() {
    let (db, _dir) = open_db("explicit_rollback.db");
    let ix = db.create_index(None).unwrap();
    {
        let mut txn = db.begin();
        txn.store(ix, &v(b"a"), &v(b"1")).unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = db.begin();
        txn.store(ix, &v(b"a"), &v(b"2")).unwrap();
        txn.rollback().unwrap();
    }
    assert_eq!(db.view(ix, b"a").unwrap().unwrap(), v(b"1"));
}

#[test]
fn scopes_can_undo_part_of_a_transaction() {
    let (db, _dir) = open_db("scopes.db");
    let ix = db.create_index(None).unwrap();
    let mut txn = db.begin();
    txn.store(ix, &v(b"a"), &v(b"1")).unwrap();
    let savepoint = txn.enter_scope();
    txn.store(ix, &v(b"b"), &v(b"2")).unwrap();
    txn.exit_scope(savepoint, false).unwrap();
    txn.commit().unwrap();

    assert_eq!(db.view(ix, b"a").unwrap().unwrap(), v(b"1"));
    assert_eq!(db.view(ix, b"b").unwrap(), None);
}

#[test]
fn verify_counts_every_stored_key() {
    let (db, _dir) = open_db("verify.db");
    let ix = db.create_index(None).unwrap();
    let mut txn = db.begin();
    for i in 0..200u32 {
        txn.store(ix, &i.to_be_bytes().to_vec(), &v(b"x")).unwrap();
    }
    assert_eq!(txn.verify().unwrap(), 200);
    txn.commit().unwrap();
}

#[test]
fn large_dataset_survives_splits_and_merges() {
    let (db, _dir) = open_db("large.db");
    let ix = db.create_index(None).unwrap();
    const N: u32 = 5000;
    {
        let mut txn = db.begin();
        for i in 0..N {
            txn.store(ix, &i.to_be_bytes().to_vec(), &i.to_le_bytes().to_vec()).unwrap();
        }
        txn.commit().unwrap();
    }
    for i in (0..N).step_by(7) {
        assert_eq!(db.view(ix, &i.to_be_bytes()).unwrap().unwrap(), i.to_le_bytes().to_vec());
    }
    {
        let mut txn = db.begin();
        for i in (0..N).step_by(3) {
            txn.remove(ix, &i.to_be_bytes()).unwrap();
        }
        txn.verify().unwrap();
        txn.commit().unwrap();
    }
    for i in (0..N).step_by(3) {
        assert_eq!(db.view(ix, &i.to_be_bytes()).unwrap(), None);
    }
    for i in (1..N).step_by(3) {
        assert_eq!(db.view(ix, &i.to_be_bytes()).unwrap().unwrap(), i.to_le_bytes().to_vec());
    }
}

#[test]
fn manual_checkpoint_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("checkpointed.db");
    let redo_path = dir.path().join("checkpointed.redo");
    let ix;
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        ix = db.create_index(Some("main")).unwrap();
        let mut txn = db.begin();
        txn.store(ix, &v(b"k"), &v(b"v")).unwrap();
        txn.commit().unwrap();
        db.checkpoint().unwrap();
        db.close().unwrap();
    }
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        assert_eq!(db.view(ix, b"k").unwrap().unwrap(), v(b"v"));
    }
}

#[test]
fn zero_length_key_round_trips() {
    let (db, _dir) = open_db("empty_key.db");
    let ix = db.create_index(None).unwrap();
    {
        let mut txn = db.begin();
        txn.store(ix, &v(b""), &v(b"empty")).unwrap();
        txn.store(ix, &v(b"a"), &v(b"one")).unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(db.view(ix, b"").unwrap().unwrap(), v(b"empty"));
    assert_eq!(db.view(ix, b"a").unwrap().unwrap(), v(b"one"));

    {
        let mut txn = db.begin();
        txn.remove(ix, b"").unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(db.view(ix, b"").unwrap(), None);
    assert_eq!(db.view(ix, b"a").unwrap().unwrap(), v(b"one"));
}

#[test]
fn no_sync_durability_still_commits_locally() {
    let (db, _dir) = open_db("no_sync.db");
    let ix = db.create_index(None).unwrap();
    let mut txn = db.begin_with_durability(DurabilityMode::NoSync);
    txn.store(ix, &v(b"a"), &v(b"1")).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.view(ix, b"a").unwrap().unwrap(), v(b"1"));
}

/// Two concurrent write transactions taking the same two rows in opposite
/// order deadlock; exactly one fails with `Error::Deadlock` and the other
/// goes on to commit once the failed one rolls back and frees its lock.
#[test]
fn concurrent_writers_on_crossing_rows_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let mut path = PathBuf::from(dir.path());
    path.push("deadlock.db");
    let config = DatabaseConfig::new(&path).with_redo_log(path.with_extension("redo")).without_periodic_checkpoint();
    let db = Arc::new(tupl::Database::open(config).unwrap());
    let ix = db.create_index(None).unwrap();

    let mut first = db.begin();
    first.store(ix, &v(b"a"), &v(b"1")).unwrap();

    let (acquired_tx, acquired_rx) = std::sync::mpsc::channel::<()>();
    let db2 = db.clone();
    let second_thread = thread::spawn(move || {
        let mut second = db2.begin();
        second.store(ix, &v(b"b"), &v(b"2")).unwrap();
        acquired_tx.send(()).unwrap();
        // Give the first transaction time to block on `b` before this one
        // reaches for `a`, so the wait-for graph has a cycle to detect.
        thread::sleep(Duration::from_millis(50));
        let result = second.store(ix, &v(b"a"), &v(b"2"));
        if result.is_err() {
            second.rollback().unwrap();
        } else {
            second.commit().unwrap();
        }
        result
    });

    acquired_rx.recv().unwrap();
    let first_result = first.store(ix, &v(b"b"), &v(b"1"));
    if first_result.is_ok() {
        first.commit().unwrap();
    } else {
        first.rollback().unwrap();
    }

    let second_result = second_thread.join().unwrap();
    // Exactly one side sees the deadlock; the other completes normally.
    assert_ne!(first_result.is_ok(), second_result.is_ok());
    let failure = if first_result.is_err() { first_result } else { second_result };
    assert!(matches!(failure.unwrap_err(), Error::Deadlock(_)));
}

/// Without an intervening checkpoint, a committed transaction's pages may
/// still be dirty-in-cache only; the reopen must recover it from the redo
/// log rather than losing it.
#[test]
fn reopen_without_checkpoint_recovers_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("uncheckpointed.db");
    let redo_path = dir.path().join("uncheckpointed.redo");
    let ix;
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        ix = db.create_index(Some("main")).unwrap();
        let mut txn = db.begin();
        txn.store(ix, &v(b"k"), &v(b"v")).unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        assert_eq!(db.view(ix, b"k").unwrap().unwrap(), v(b"v"));
    }
}

/// A transaction that never committed before the crash must not reappear
/// after recovery, even though its stores were logged.
#[test]
fn reopen_drops_writes_from_a_transaction_that_never_committed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("in_flight.db");
    let redo_path = dir.path().join("in_flight.redo");
    let ix;
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        ix = db.create_index(Some("main")).unwrap();
        let mut txn = db.begin();
        txn.store(ix, &v(b"committed"), &v(b"1")).unwrap();
        txn.commit().unwrap();

        // Started but leaked past the block without commit/rollback: the
        // in-memory `Transaction` is simply never dropped, so no rollback
        // record is ever logged, matching a real crash mid-transaction.
        let mut in_flight = db.begin();
        in_flight.store(ix, &v(b"uncommitted"), &v(b"2")).unwrap();
        std::mem::forget(in_flight);

        db.close().unwrap();
    }
    {
        let config = DatabaseConfig::new(&db_path).with_redo_log(&redo_path).without_periodic_checkpoint();
        let db = tupl::Database::open(config).unwrap();
        assert_eq!(db.view(ix, b"committed").unwrap().unwrap(), v(b"1"));
        assert_eq!(db.view(ix, b"uncommitted").unwrap(), None);
    }
}
