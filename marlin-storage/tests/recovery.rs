//! Crash-recovery scenarios driven end to end through the engine: format
//! a volume, run transactions, "crash" by dropping the engine without a
//! clean shutdown, then reopen and let restart recovery repeat history.

use bytes::Bytes;
use marlin_storage::disk::header::{VolPurpose, SPECIAL_SECTOR};
use marlin_storage::disk::PageAlloc;
use marlin_storage::io;
use marlin_storage::record::{ParticipantId, RvIndex};
use marlin_storage::tran::{ClientIds, Isolation, TranState, TwopcTransport, Vote};
use marlin_storage::{Config, Engine};

fn client() -> ClientIds {
    ClientIds {
        user_name: "dba".into(),
        host_name: "localhost".into(),
        process_id: 42,
    }
}

fn begin(engine: &Engine) -> usize {
    engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap()
}

#[test]
fn committed_work_survives_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();

    let (volid, pageid, free_before_alloc) = {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let t1 = begin(&engine);
        let volid = engine
            .format_volume(t1, VolPurpose::PermData, 1000, "data volume")
            .unwrap();
        let free_before_alloc = engine.free_pages(volid).unwrap();

        let pageid = match engine
            .alloc_page(t1, volid, SPECIAL_SECTOR, 1, None)
            .unwrap()
        {
            PageAlloc::Allocated(p) => p,
            other => panic!("allocation failed: {other:?}"),
        };
        let payload = vec![0xC4u8; 64];
        engine
            .apply_undoredo(
                t1,
                RvIndex::HeapInsert,
                volid,
                pageid,
                0,
                Bytes::from(vec![0u8; 64]),
                Bytes::from(payload),
            )
            .unwrap();
        engine.commit(t1).unwrap();
        // crash: no shutdown, the data-page cache is simply lost
        (volid, pageid, free_before_alloc)
    };

    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    let page = engine.read_data_page(volid, pageid).unwrap();
    assert!(
        io::page_content(&page)[..64].iter().all(|&b| b == 0xC4),
        "redo must replay the insert"
    );
    assert_eq!(
        engine.free_pages(volid).unwrap(),
        free_before_alloc - 1,
        "redo must replay the allocation"
    );
}

#[test]
fn uncommitted_work_is_rolled_back_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();

    let (volid, pageid) = {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let setup = begin(&engine);
        let volid = engine
            .format_volume(setup, VolPurpose::PermData, 500, "")
            .unwrap();
        engine.commit(setup).unwrap();
        engine.checkpoint().unwrap();

        let t = begin(&engine);
        let pageid = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).unwrap() {
            PageAlloc::Allocated(p) => p,
            other => panic!("allocation failed: {other:?}"),
        };
        engine
            .apply_undoredo(
                t,
                RvIndex::HeapInsert,
                volid,
                pageid,
                0,
                Bytes::from(vec![0u8; 16]),
                Bytes::from(vec![0xEEu8; 16]),
            )
            .unwrap();
        // the checkpoint makes the uncommitted write durable, then crash
        engine.checkpoint().unwrap();
        (volid, pageid)
    };

    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    let page = engine.read_data_page(volid, pageid).unwrap();
    assert!(
        io::page_content(&page)[..16].iter().all(|&b| b == 0),
        "loser transaction must be undone"
    );
    let free_after = engine.free_pages(volid).unwrap();
    // the page allocation was undone as well
    let t = begin(&engine);
    let again = engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).unwrap();
    assert!(matches!(again, PageAlloc::Allocated(p) if p == pageid));
    let _ = free_after;
}

#[test]
fn rollback_to_savepoint_keeps_earlier_work() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    let volid = engine
        .format_volume(t, VolPurpose::PermData, 500, "")
        .unwrap();
    let pageid = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).unwrap() {
        PageAlloc::Allocated(p) => p,
        other => panic!("allocation failed: {other:?}"),
    };

    let write = |off: i16, val: u8| {
        engine
            .apply_undoredo(
                t,
                RvIndex::HeapUpdate,
                volid,
                pageid,
                off,
                Bytes::from(vec![0u8; 8]),
                Bytes::from(vec![val; 8]),
            )
            .unwrap();
    };
    write(0, 0xAA); // A
    write(8, 0xBB); // B
    engine.savepoint(t, "s").unwrap();
    write(16, 0xCC); // C
    write(24, 0xDD); // D

    engine.rollback_to_savepoint(t, "s").unwrap();

    let page = engine.read_data_page(volid, pageid).unwrap();
    let content = io::page_content(&page);
    assert!(content[0..8].iter().all(|&b| b == 0xAA));
    assert!(content[8..16].iter().all(|&b| b == 0xBB));
    assert!(content[16..32].iter().all(|&b| b == 0), "C and D undone");

    engine.commit(t).unwrap();
    let page = engine.read_data_page(volid, pageid).unwrap();
    let content = io::page_content(&page);
    assert!(content[0..8].iter().all(|&b| b == 0xAA));
    assert!(content[8..16].iter().all(|&b| b == 0xBB));
}

#[test]
fn missing_savepoint_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    engine.savepoint(t, "here").unwrap();
    assert!(engine.rollback_to_savepoint(t, "elsewhere").is_err());
}

#[test]
fn dealloc_restores_free_pages_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let setup = begin(&engine);
    let volid = engine
        .format_volume(setup, VolPurpose::PermData, 500, "")
        .unwrap();
    engine.commit(setup).unwrap();

    let free_before = engine.free_pages(volid).unwrap();
    let hint_before = engine.hint_allocsect(volid).unwrap();

    let t = begin(&engine);
    let first = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 4, None).unwrap() {
        PageAlloc::Allocated(p) => p,
        other => panic!("allocation failed: {other:?}"),
    };
    assert_eq!(engine.free_pages(volid).unwrap(), free_before - 4);

    // postponed: takes effect only at commit
    engine.dealloc_page(t, volid, first, 4).unwrap();
    assert_eq!(engine.free_pages(volid).unwrap(), free_before - 4);

    engine.commit(t).unwrap();
    assert_eq!(engine.free_pages(volid).unwrap(), free_before);
    assert_eq!(engine.hint_allocsect(volid).unwrap(), hint_before);
}

#[test]
fn aborted_dealloc_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let setup = begin(&engine);
    let volid = engine
        .format_volume(setup, VolPurpose::PermData, 500, "")
        .unwrap();
    engine.commit(setup).unwrap();
    let free_start = engine.free_pages(volid).unwrap();

    let t = begin(&engine);
    let first = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 2, None).unwrap() {
        PageAlloc::Allocated(p) => p,
        other => panic!("allocation failed: {other:?}"),
    };
    engine.dealloc_page(t, volid, first, 2).unwrap();
    engine.abort(t).unwrap();

    // the allocation was undone by rollback; the dealloc postpone never ran
    assert_eq!(engine.free_pages(volid).unwrap(), free_start);
}

#[test]
fn over_allocation_returns_no_space_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    let volid = engine
        .format_volume(t, VolPurpose::PermData, 100, "")
        .unwrap();
    let free = engine.free_pages(volid).unwrap();

    let out = engine
        .alloc_page(t, volid, SPECIAL_SECTOR, free + 1, None)
        .unwrap();
    assert!(matches!(out, PageAlloc::NoSpace { .. }));
    assert_eq!(engine.free_pages(volid).unwrap(), free);

    // allocating exactly every remaining free page succeeds
    let out = engine.alloc_page(t, volid, SPECIAL_SECTOR, free, None).unwrap();
    assert!(matches!(out, PageAlloc::Allocated(_)));
    assert_eq!(engine.free_pages(volid).unwrap(), 0);
}

#[test]
fn prepared_transaction_stays_in_doubt_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();

    {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let setup = begin(&engine);
        let volid = engine
            .format_volume(setup, VolPurpose::PermData, 500, "")
            .unwrap();
        engine.commit(setup).unwrap();

        let t = begin(&engine);
        let pageid = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).unwrap() {
            PageAlloc::Allocated(p) => p,
            other => panic!("allocation failed: {other:?}"),
        };
        engine
            .apply_undoredo(
                t,
                RvIndex::HeapInsert,
                volid,
                pageid,
                0,
                Bytes::from(vec![0u8; 8]),
                Bytes::from(vec![0x11u8; 8]),
            )
            .unwrap();
        engine
            .twopc_prepare(t, 777, 1, 1, Bytes::from_static(b"locks"))
            .unwrap();
        // crash while prepared
    }

    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    let in_doubt = engine.in_doubt_transactions();
    assert_eq!(in_doubt.len(), 1, "the prepared transaction must survive");
    let (index, gtrid, _trid) = in_doubt[0];
    assert_eq!(gtrid, 777);
    assert_eq!(
        engine.tran_state(index).unwrap(),
        TranState::Unactive2pcPrepare
    );

    // recovery decided nothing on its own; an external decision finishes it
    engine.resolve_in_doubt(index, true).unwrap();
    assert_eq!(
        engine.tran_state(index).unwrap(),
        TranState::UnactiveCommitted
    );
}

/// Delivers decisions to every participant except one host.
struct FlakyTransport {
    fail_host: i32,
}

impl TwopcTransport for FlakyTransport {
    fn send_prepare(&self, _particp: &ParticipantId) -> marlin_storage::Result<Vote> {
        Ok(Vote::Yes)
    }

    fn send_decision(&self, particp: &ParticipantId, _commit: bool) -> marlin_storage::Result<()> {
        if particp.host_id == self.fail_host {
            Err(marlin_storage::Error::Twopc("participant unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[test]
fn coordinator_resumes_informing_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();

    {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let t = begin(&engine);
        engine.savepoint(t, "global-work").unwrap();
        let particps = vec![
            ParticipantId {
                host_id: 1,
                tran_idx: 4,
            },
            ParticipantId {
                host_id: 2,
                tran_idx: 9,
            },
        ];
        // host 2 never hears the decision; the coordinator stays in the
        // informing state instead of declaring the protocol finished
        let committed = engine
            .twopc_execute(t, 321, particps, &FlakyTransport { fail_host: 2 })
            .unwrap();
        assert!(committed);
        assert_eq!(
            engine.tran_state(t).unwrap(),
            TranState::UnactiveCommittedInformingParticipants
        );
        // crash with one ack still missing
    }

    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    let informing = engine.informing_transactions();
    assert_eq!(informing.len(), 1, "the coordinator must be re-attached");
    let (index, gtrid, commit) = informing[0];
    assert_eq!(gtrid, 321);
    assert!(commit, "the logged decision was commit");

    // with the participant back, the second phase completes
    let done = engine
        .resume_informing(index, &FlakyTransport { fail_host: -1 })
        .unwrap();
    assert!(done);
    assert_eq!(
        engine.tran_state(index).unwrap(),
        TranState::UnactiveCommitted
    );
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();

    let (volid, pageid) = {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let t = begin(&engine);
        let volid = engine
            .format_volume(t, VolPurpose::PermData, 300, "")
            .unwrap();
        let pageid = match engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).unwrap() {
            PageAlloc::Allocated(p) => p,
            other => panic!("allocation failed: {other:?}"),
        };
        engine
            .apply_undoredo(
                t,
                RvIndex::HeapInsert,
                volid,
                pageid,
                0,
                Bytes::from(vec![0u8; 32]),
                Bytes::from(vec![0x5Au8; 32]),
            )
            .unwrap();
        engine.commit(t).unwrap();
        (volid, pageid)
    };

    // run recovery twice over the same prefix; page contents must match
    let snapshot = {
        let engine = Engine::open(cfg.clone(), "demo", dir.path()).unwrap();
        let page = engine.read_data_page(volid, pageid).unwrap();
        engine.shutdown().unwrap();
        page
    };
    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    let page = engine.read_data_page(volid, pageid).unwrap();
    assert_eq!(io::page_content(&snapshot), io::page_content(&page));
}
