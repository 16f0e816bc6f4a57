//! End-to-end replay: a master engine produces replication records, the
//! applier walks the copied log and re-executes them on a replica.

use bytes::Bytes;
use marlin_applier::{Applier, ApplierState, LogCache, MemReplica, StepOutcome};
use marlin_storage::record::{ReplData, ReplOp};
use marlin_storage::tran::{ClientIds, Isolation};
use marlin_storage::{Config, Engine};

fn client() -> ClientIds {
    ClientIds {
        user_name: "dba".into(),
        host_name: "master".into(),
        process_id: 7,
    }
}

fn repl(op: ReplOp, pkey: &str, data: &[u8]) -> ReplData {
    ReplData {
        op,
        class_name: "stock".into(),
        pkey: pkey.into(),
        data: Bytes::copy_from_slice(data),
    }
}

fn make_applier(dir: &std::path::Path) -> Applier<MemReplica> {
    let cache = LogCache::open(dir, "demo").unwrap();
    Applier::new(cache, MemReplica::new(), "demo", None).unwrap()
}

#[test]
fn insert_then_update_replays_on_the_replica() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::Insert, "1", b"(1,\"a\")"))
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::Update, "1", b"(1,\"b\")"))
        .unwrap();
    engine.commit(t).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}

    let db = applier.client();
    assert_eq!(db.committed_row("stock", "1").unwrap(), b"(1,\"b\")");
    assert_eq!(applier.info.insert_counter, 1);
    assert_eq!(applier.info.update_counter, 1);
    assert!(applier.info.commit_counter >= 1);
    assert!(!applier.info.committed_lsa.is_null());
    assert_eq!(applier.info.fail_counter, 0);
}

#[test]
fn aborted_master_transaction_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::Insert, "9", b"(9,\"x\")"))
        .unwrap();
    engine.abort(t).unwrap();

    let t2 = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(t2, repl(ReplOp::Insert, "2", b"(2,\"y\")"))
        .unwrap();
    engine.commit(t2).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}

    let db = applier.client();
    assert!(db.committed_row("stock", "9").is_none());
    assert_eq!(db.committed_row("stock", "2").unwrap(), b"(2,\"y\")");
    assert_eq!(applier.info.insert_counter, 1);
}

#[test]
fn per_item_failures_count_but_do_not_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    // delete of a row that was never inserted: a counted failure
    engine
        .add_repl_data(t, repl(ReplOp::Delete, "404", b""))
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::Insert, "3", b"(3,\"z\")"))
        .unwrap();
    engine.commit(t).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}

    assert_eq!(applier.info.fail_counter, 1);
    assert_eq!(applier.info.insert_counter, 1);
    assert!(applier.client().committed_row("stock", "3").is_some());
}

#[test]
fn multi_update_bracket_replays_as_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let seed = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(seed, repl(ReplOp::Insert, "a", b"1"))
        .unwrap();
    engine
        .add_repl_data(seed, repl(ReplOp::Insert, "b", b"1"))
        .unwrap();
    engine.commit(seed).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::UpdateStart, "", b""))
        .unwrap();
    engine.add_repl_data(t, repl(ReplOp::Update, "a", b"2")).unwrap();
    engine.add_repl_data(t, repl(ReplOp::Update, "b", b"2")).unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::UpdateEnd, "", b""))
        .unwrap();
    engine.commit(t).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}

    let db = applier.client();
    assert_eq!(db.committed_row("stock", "a").unwrap(), b"2");
    assert_eq!(db.committed_row("stock", "b").unwrap(), b"2");
    assert_eq!(applier.info.update_counter, 2);
}

#[test]
fn schema_records_run_under_the_recorded_user() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_schema(t, "create table stock (i int primary key)", "app_owner")
        .unwrap();
    engine.commit(t).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}

    assert_eq!(applier.info.schema_counter, 1);
    assert_eq!(
        applier.client().ddl_log,
        vec![(
            "create table stock (i int primary key)".to_owned(),
            "app_owner".to_owned()
        )]
    );
}

#[test]
fn state_machine_follows_the_master() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    // master announces ACTIVE
    engine.note_ha_state(1).unwrap();

    let mut applier = make_applier(dir.path());
    while applier.step().unwrap() == StepOutcome::Progress {}
    assert_eq!(applier.state(), ApplierState::Working);

    // master goes STANDBY and the log drains
    engine.note_ha_state(3).unwrap();
    while applier.step().unwrap() == StepOutcome::Progress {}
    assert_eq!(applier.state(), ApplierState::Done);

    let states = &applier.client().states;
    assert_eq!(states.first(), Some(&ApplierState::Recovering));
    assert!(states.contains(&ApplierState::Working));
    assert_eq!(states.last(), Some(&ApplierState::Done));
}

#[test]
fn bookkeeping_survives_applier_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();

    let t = engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap();
    engine
        .add_repl_data(t, repl(ReplOp::Insert, "1", b"v1"))
        .unwrap();
    engine.commit(t).unwrap();

    let cache = LogCache::open(dir.path(), "demo").unwrap();
    let mut applier = Applier::new(cache, MemReplica::new(), "demo", None).unwrap();
    while applier.step().unwrap() == StepOutcome::Progress {}
    let committed = applier.info.committed_lsa;
    assert!(!committed.is_null());

    // carry the replica (with its bookkeeping row) into a new applier:
    // it resumes from the stored LSA instead of replaying from scratch
    let replica = std::mem::take(applier.client_mut());
    let cache = LogCache::open(dir.path(), "demo").unwrap();
    let applier2 = Applier::new(cache, replica, "demo", None).unwrap();
    assert_eq!(applier2.final_lsa(), committed);
}
