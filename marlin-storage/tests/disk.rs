//! Disk-manager behavior through the engine: sector rotation, nested top
//! operations, temporary volumes and interruption.

use bytes::Bytes;
use marlin_storage::disk::cache::Contiguity;
use marlin_storage::disk::header::{VolPurpose, SECT_NPGS, SPECIAL_SECTOR};
use marlin_storage::disk::{PageAlloc, VolCheck};
use marlin_storage::io;
use marlin_storage::record::RvIndex;
use marlin_storage::tran::{ClientIds, Isolation};
use marlin_storage::{Config, Engine, Error};

fn client() -> ClientIds {
    ClientIds {
        user_name: "dba".into(),
        host_name: "localhost".into(),
        process_id: 9,
    }
}

fn begin(engine: &Engine) -> usize {
    engine
        .begin_tran(client(), Isolation::RepClassCommitInstance, -1)
        .unwrap()
}

#[test]
fn sector_allocation_rotates_and_respects_contiguity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    let volid = engine
        .format_volume(t, VolPurpose::PermData, 500, "")
        .unwrap();

    let s1 = engine.alloc_sector(t, volid, 1, 4).unwrap();
    assert!(s1 >= 1, "a real sector, not the special one");
    let s2 = engine.alloc_sector(t, volid, 1, 4).unwrap();
    assert!(s2 > s1, "the hint rotates forward");

    // pages allocated within the sector stay inside its range
    let pageid = match engine.alloc_page(t, volid, s1, 2, None).unwrap() {
        PageAlloc::Allocated(p) => p,
        other => panic!("allocation failed: {other:?}"),
    };
    assert!(pageid >= s1 * SECT_NPGS && pageid < (s1 + 1) * SECT_NPGS);

    assert_eq!(
        engine.check_volume(t, volid, false).unwrap(),
        VolCheck::Valid
    );
    engine.commit(t).unwrap();
    assert_eq!(
        engine.check_volume(t, volid, false).unwrap(),
        VolCheck::Valid
    );
}

#[test]
fn top_operation_abort_undoes_only_its_scope() {
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
                Bytes::from(vec![0u8; 4]),
                Bytes::from(vec![val; 4]),
            )
            .unwrap();
    };

    write(0, 0x11); // parent work
    engine.begin_topop(t).unwrap();
    write(8, 0x22); // nested work
    engine.abort_topop(t).unwrap();

    let page = engine.read_data_page(volid, pageid).unwrap();
    let content = io::page_content(&page);
    assert!(content[0..4].iter().all(|&b| b == 0x11), "parent intact");
    assert!(content[8..12].iter().all(|&b| b == 0), "nested undone");

    // a committed nested scope survives the parent commit
    engine.begin_topop(t).unwrap();
    write(16, 0x33);
    engine.commit_topop(t).unwrap();
    engine.commit(t).unwrap();

    let page = engine.read_data_page(volid, pageid).unwrap();
    let content = io::page_content(&page);
    assert!(content[0..4].iter().all(|&b| b == 0x11));
    assert!(content[16..20].iter().all(|&b| b == 0x33));
}

#[test]
fn temp_volume_grows_transparently_and_dies_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();
    let temp_path = {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let t = begin(&engine);
        // a permanent volume keeps the chain anchored
        engine
            .format_volume(t, VolPurpose::PermData, 200, "")
            .unwrap();
        let temp = engine
            .format_volume(t, VolPurpose::TempTemp, 60, "scratch")
            .unwrap();
        let free = engine.free_pages(temp).unwrap();

        // more than the volume holds: expansion kicks in transparently
        let out = engine
            .alloc_page(t, temp, SPECIAL_SECTOR, free + 20, None)
            .unwrap();
        assert!(matches!(out, PageAlloc::Allocated(_)));

        engine.commit(t).unwrap();
        engine.shutdown().unwrap();
        dir.path().join("demo_x001")
    };
    assert!(temp_path.exists());

    // temporary volumes do not survive a restart
    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    assert!(!temp_path.exists());
    assert!(engine.free_pages(1).is_err());
}

#[test]
fn interrupt_stops_the_next_operation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    let volid = engine
        .format_volume(t, VolPurpose::PermData, 200, "")
        .unwrap();

    engine.set_interrupt(t, true).unwrap();
    assert!(matches!(
        engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None),
        Err(Error::Interrupted)
    ));
    // sticky until cleared
    assert!(matches!(
        engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None),
        Err(Error::Interrupted)
    ));
    engine.set_interrupt(t, false).unwrap();
    assert!(engine.alloc_page(t, volid, SPECIAL_SECTOR, 1, None).is_ok());
}

#[test]
fn purpose_cascade_picks_generic_when_data_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::create(Config::default(), "demo", dir.path()).unwrap();
    let t = begin(&engine);
    let data_vol = engine
        .format_volume(t, VolPurpose::PermData, 100, "")
        .unwrap();
    let generic_vol = engine
        .format_volume(t, VolPurpose::PermGeneric, 500, "")
        .unwrap();

    // drain the data volume so the cascade must fall through
    let free = engine.free_pages(data_vol).unwrap();
    engine
        .alloc_page(t, data_vol, SPECIAL_SECTOR, free, None)
        .unwrap();

    let (volid, _pageid) = engine
        .alloc_page_anyvol(t, VolPurpose::PermData, 10, Contiguity::NonContiguous)
        .unwrap();
    assert_eq!(volid, generic_vol);

    // nothing can serve a request larger than the database
    assert!(matches!(
        engine.alloc_page_anyvol(t, VolPurpose::PermData, 10_000, Contiguity::NonContiguous),
        Err(Error::NotEnoughPages { .. })
    ));
}

#[test]
fn volume_chain_links_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();
    {
        let engine = Engine::create(cfg.clone(), "demo", dir.path()).unwrap();
        let t = begin(&engine);
        engine
            .format_volume(t, VolPurpose::PermData, 200, "first")
            .unwrap();
        engine
            .format_volume(t, VolPurpose::PermIndex, 200, "second")
            .unwrap();
        engine.commit(t).unwrap();
        engine.shutdown().unwrap();
    }
    let engine = Engine::open(cfg, "demo", dir.path()).unwrap();
    assert!(engine.free_pages(0).is_ok());
    assert!(engine.free_pages(1).is_ok(), "linked volume was remounted");
}
