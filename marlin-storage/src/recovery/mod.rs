//! ARIES-style crash recovery: an analysis pass rebuilds the transaction
//! table from the last checkpoint, redo repeats history up to the crash,
//! and undo rolls back the losers in descending LSA order, emitting
//! compensation records so a crash during recovery is itself recoverable.
//!
//! The same single-record undo step drives runtime rollback (abort,
//! rollback-to-savepoint, top-operation abort).

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};

use crate::disk::{DiskManager, LogCtx};
use crate::error::Result;
use crate::log::{scan_forward, LogInner, SYSTEM_TRID};
use crate::lsa::Lsa;
use crate::record::{ParticipantId, RecordBody, RecordType, RvIndex};
use crate::recovery::rvfun::DeallocImage;
use crate::tran::{ClientIds, Coordinator, Isolation, TranLog, TranState};
use crate::Engine;

pub mod rvfun;

/// Undo a single record of the back-chain: apply its undo image, emit the
/// compensation record, advance `undo_nxlsa`. Returns false once the
/// chain is exhausted or `stop_lsa` is reached.
pub(crate) fn undo_step(
    log: &mut LogInner,
    disk: &DiskManager,
    trid: i32,
    tlog: &mut TranLog,
    stop_lsa: Lsa,
) -> Result<bool> {
    let cur = tlog.undo_nxlsa;
    if cur.is_null() || cur <= stop_lsa {
        return Ok(false);
    }
    let rec = log.read_record(cur)?;
    let prev = rec.header.prev_tranlsa;
    match rec.body {
        RecordBody::UndoRedo { rcv, ref undo, .. } => {
            undo_apply(log, disk, trid, tlog, rcv.rcvindex, rcv, undo.clone(), prev)?;
        }
        RecordBody::Undo { rcv, ref data } => {
            undo_apply(log, disk, trid, tlog, rcv.rcvindex, rcv, data.clone(), prev)?;
        }
        RecordBody::Compensate { undo_nxlsa, .. }
        | RecordBody::LogicalCompensate { undo_nxlsa, .. } => {
            // already-compensated work is skipped, never re-undone
            tlog.undo_nxlsa = undo_nxlsa;
        }
        _ => {
            tlog.undo_nxlsa = prev;
        }
    }
    Ok(true)
}

fn undo_apply(
    log: &mut LogInner,
    disk: &DiskManager,
    trid: i32,
    tlog: &mut TranLog,
    rcvindex: RvIndex,
    rcv: crate::record::RcvAddr,
    undo_img: Bytes,
    prev_tranlsa: Lsa,
) -> Result<()> {
    if rvfun::entry(rcvindex).is_logical {
        // a logical undo is not tied to one page: log the position-only
        // compensation, then run the out-of-core routine
        log.append(
            trid,
            tlog,
            &RecordBody::LogicalCompensate {
                rcvindex,
                undo_nxlsa: prev_tranlsa,
            },
        )?;
        match rcvindex {
            RvIndex::VolHeaderFormat => {
                let fullname = String::from_utf8_lossy(&undo_img).into_owned();
                disk.unformat_by_fullname(&fullname)?;
            }
            other => {
                tracing::warn!(?other, "no logical undo routine registered");
            }
        }
    } else {
        let clr = log.append(
            trid,
            tlog,
            &RecordBody::Compensate {
                rcv,
                undo_nxlsa: prev_tranlsa,
                data: undo_img.clone(),
            },
        )?;
        disk.apply_undo_page(rcv, &undo_img, clr)?;
    }
    Ok(())
}

/// Roll a transaction's effects back to `stop_lsa` (NULL = everything).
pub(crate) fn rollback_records(
    log: &mut LogInner,
    disk: &DiskManager,
    trid: i32,
    tlog: &mut TranLog,
    stop_lsa: Lsa,
) -> Result<()> {
    while undo_step(log, disk, trid, tlog, stop_lsa)? {}
    Ok(())
}

// ------------------------------------------------------------ recovery

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub redone: usize,
    pub undone: usize,
    pub finished_postpone: usize,
    pub in_doubt: usize,
    /// Coordinators re-attached mid "informing participants".
    pub informing: usize,
}

#[derive(Debug)]
struct RecTdes {
    trid: i32,
    state: TranState,
    isolation: i32,
    gtrid: i32,
    user_name: String,
    log: TranLog,
    /// (lastparent_lsa, posp_lsa) pairs, innermost last.
    topops: Vec<(Lsa, Lsa)>,
    /// Postpone records already executed (their RUN_POSTPONE ref).
    run_postpones: HashSet<Lsa>,
    /// Participant block from 2PC_START, for coordinator re-attach.
    particps: Vec<ParticipantId>,
    /// Participant indexes whose decision ack made it to the log.
    acks: Vec<i32>,
}

impl RecTdes {
    fn new(trid: i32, head: Lsa) -> Self {
        let mut log = TranLog::default();
        log.head_lsa = head;
        Self {
            trid,
            state: TranState::Active,
            isolation: Isolation::RepClassCommitInstance as i32,
            gtrid: crate::tran::NULL_GTRID,
            user_name: String::new(),
            log,
            topops: Vec::new(),
            run_postpones: HashSet::new(),
            particps: Vec::new(),
            acks: Vec::new(),
        }
    }
}

/// Three-pass restart recovery, bounded by the checkpoint in the active
/// log header. `stopat` (unix millis) enables point-in-time restore.
pub fn recover(engine: &Engine, stopat: Option<i64>) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let system = engine.trantab.system_slot();
    let mut sys_tdes = system.tdes.lock();
    let mut log = engine.log.lock();
    let disk = &engine.disk;

    let chkpt = log.hdr.chkpt_lsa;
    let eof = log.hdr.eof_lsa;
    if chkpt.is_null() || chkpt >= eof {
        tracing::info!("nothing to recover");
        return Ok(report);
    }
    tracing::info!(%chkpt, %eof, "starting restart recovery");

    // ---------------------------------------------------------- analysis
    let mut atab: HashMap<i32, RecTdes> = HashMap::new();
    let mut chkpt_redo = chkpt;
    let mut last_record_lsa = Lsa::NULL;
    let mut cut_lsa = eof;

    scan_forward(&mut log, chkpt, eof, |_, rec| {
        // media recovery: stop the world at the first transaction end
        // stamped after the requested time
        if let Some(stop) = stopat {
            let at_time = match rec.body {
                RecordBody::Commit { at_time } | RecordBody::Abort { at_time } => Some(at_time),
                _ => None,
            };
            if matches!(at_time, Some(t) if t > stop) {
                cut_lsa = rec.lsa;
                return Ok(false);
            }
        }
        last_record_lsa = rec.lsa;
        let trid = rec.header.trid;

        if trid != SYSTEM_TRID {
            let e = atab
                .entry(trid)
                .or_insert_with(|| RecTdes::new(trid, rec.lsa));
            e.log.tail_lsa = rec.lsa;
            match &rec.body {
                RecordBody::UndoRedo { .. } | RecordBody::Undo { .. } => {
                    e.log.undo_nxlsa = rec.lsa;
                }
                RecordBody::Compensate { undo_nxlsa, .. }
                | RecordBody::LogicalCompensate { undo_nxlsa, .. } => {
                    e.log.undo_nxlsa = *undo_nxlsa;
                }
                RecordBody::Postpone { .. } => {
                    if e.log.posp_nxlsa.is_null() {
                        e.log.posp_nxlsa = rec.lsa;
                    }
                }
                RecordBody::RunPostpone { ref_lsa, .. } => {
                    e.run_postpones.insert(*ref_lsa);
                }
                RecordBody::Savepoint { .. } => {
                    e.log.savept_lsa = rec.lsa;
                }
                RecordBody::WillCommit => {
                    e.state = TranState::UnactiveWillCommit;
                }
                RecordBody::CommitWithPostpone { start_posp_lsa } => {
                    e.state = TranState::UnactiveCommittedWithPostpone;
                    e.log.posp_nxlsa = *start_posp_lsa;
                }
                RecordBody::Commit { .. } => {
                    // a later 2PC_*_INFORM_PARTICPS record may still move
                    // this coordinator back into an informing state
                    e.state = TranState::UnactiveCommitted;
                }
                RecordBody::Abort { .. } => {
                    e.state = TranState::UnactiveAborted;
                }
                RecordBody::CommitTopope { .. }
                | RecordBody::CommitTopopeWithPostpone { .. }
                | RecordBody::AbortTopope { .. } => {
                    e.log.tail_topresult_lsa = rec.lsa;
                    e.topops.pop();
                }
                RecordBody::TwopcStart { gtrid, particps, .. } => {
                    e.gtrid = *gtrid;
                    e.particps = particps.clone();
                    e.state = TranState::Unactive2pcCollectingVotes;
                }
                RecordBody::TwopcPrepare { gtrid, .. } => {
                    e.gtrid = *gtrid;
                    e.state = TranState::Unactive2pcPrepare;
                }
                RecordBody::TwopcCommitDecision => {
                    e.state = TranState::Unactive2pcCommitDecision;
                }
                RecordBody::TwopcAbortDecision => {
                    e.state = TranState::Unactive2pcAbortDecision;
                }
                RecordBody::TwopcCommitInformParticps => {
                    e.state = TranState::UnactiveCommittedInformingParticipants;
                }
                RecordBody::TwopcAbortInformParticps => {
                    e.state = TranState::UnactiveAbortedInformingParticipants;
                }
                RecordBody::TwopcRecvAck { particp_index } => {
                    e.acks.push(*particp_index);
                }
                _ => {}
            }
        } else if let RecordBody::EndChkpt(chk) = &rec.body {
            chkpt_redo = chk.redo_lsa.min(chkpt_redo);
            for t in &chk.trans {
                match atab.get_mut(&t.trid) {
                    Some(e) => {
                        // records scanned since START_CHKPT already refined
                        // the tail state; only the head can move back
                        if e.log.head_lsa.is_null() || t.head_lsa < e.log.head_lsa {
                            e.log.head_lsa = t.head_lsa;
                        }
                        if e.user_name.is_empty() {
                            e.user_name = t.user_name.clone();
                        }
                    }
                    None => {
                        let mut e = RecTdes::new(t.trid, t.head_lsa);
                        e.state = TranState::from_i32(t.state).unwrap_or(TranState::Active);
                        e.isolation = t.isolation;
                        e.user_name = t.user_name.clone();
                        e.log.tail_lsa = t.tail_lsa;
                        e.log.undo_nxlsa = t.undo_nxlsa;
                        e.log.posp_nxlsa = t.posp_nxlsa;
                        e.log.savept_lsa = t.savept_lsa;
                        e.log.tail_topresult_lsa = t.tail_topresult_lsa;
                        e.log.client_undo_lsa = t.client_undo_lsa;
                        e.log.client_posp_lsa = t.client_posp_lsa;
                        atab.insert(t.trid, e);
                    }
                }
            }
            for t in &chk.topops {
                if let Some(e) = atab.get_mut(&t.trid) {
                    e.topops.push((t.lastparent_lsa, t.posp_lsa));
                }
            }
        }
        Ok(true)
    })?;

    // transactions whose final record made it to disk are fully done;
    // everything else still needs finishing, undoing or re-attaching
    atab.retain(|_, e| {
        !matches!(e.state, TranState::UnactiveCommitted | TranState::UnactiveAborted)
    });

    // resume appends right after the last durable record
    log.set_append_position(last_record_lsa, cut_lsa)?;
    let mut max_trid = log.hdr.next_trid - 1;
    for (&trid, _) in atab.iter() {
        max_trid = max_trid.max(trid);
    }
    log.hdr.next_trid = max_trid + 1;

    // -------------------------------------------------------------- redo
    let mut redo_start = chkpt_redo;
    for e in atab.values() {
        if !e.log.head_lsa.is_null() {
            redo_start = redo_start.min(e.log.head_lsa);
        }
    }
    report.redone = redo_pass(&mut log, disk, redo_start, cut_lsa)?;
    disk.refresh_headers()?;

    // -------------------------------------------------------------- undo
    // finish committed-with-postpone transactions first
    let mut losers: Vec<RecTdes> = Vec::new();
    for (_, mut e) in atab.drain() {
        match e.state {
            TranState::UnactiveCommittedWithPostpone
            | TranState::Unactive2pcCommitDecision
            | TranState::UnactiveWillCommit => {
                finish_postpones(&mut log, disk, &mut e)?;
                report.finished_postpone += 1;
            }
            TranState::Unactive2pcPrepare => {
                reattach_in_doubt(engine, &e)?;
                report.in_doubt += 1;
            }
            TranState::UnactiveCommittedInformingParticipants
            | TranState::UnactiveAbortedInformingParticipants => {
                reattach_informing(engine, &e)?;
                report.informing += 1;
            }
            _ => losers.push(e),
        }
    }

    // undo the losers in descending LSA order, interleaved
    loop {
        let Some(idx) = losers
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.log.undo_nxlsa.is_null())
            .max_by_key(|(_, e)| e.log.undo_nxlsa)
            .map(|(i, _)| i)
        else {
            break;
        };
        let e = &mut losers[idx];
        e.state = TranState::RecoveryUndo;
        undo_step(&mut log, disk, e.trid, &mut e.log, Lsa::NULL)?;
    }
    for e in &mut losers {
        log.append(
            e.trid,
            &mut e.log,
            &RecordBody::Abort {
                at_time: chrono::Utc::now().timestamp_millis(),
            },
        )?;
        report.undone += 1;
    }

    // mark the restart in the log and make everything durable
    log.append(
        SYSTEM_TRID,
        &mut sys_tdes.log,
        &RecordBody::DummyCrashRecovery,
    )?;
    log.flush_all_append_pages()?;
    disk.flush_all(&mut log)?;

    if let Some(stop) = stopat {
        log.loginfo
            .media_recovery_finished(stop, report.redone, report.undone);
    }

    tracing::info!(
        redone = report.redone,
        undone = report.undone,
        in_doubt = report.in_doubt,
        informing = report.informing,
        "recovery complete"
    );
    Ok(report)
}

fn redo_pass(log: &mut LogInner, disk: &DiskManager, from: Lsa, to: Lsa) -> Result<usize> {
    let mut redone = 0usize;
    scan_forward(log, from, to, |_, rec| {
        let (rcv, data, is_diff, undo) = match &rec.body {
            RecordBody::UndoRedo {
                rcv, redo, diff, undo,
            } => (*rcv, redo.clone(), *diff, Some(undo.clone())),
            RecordBody::Redo { rcv, data } => (*rcv, data.clone(), false, None),
            RecordBody::RunPostpone { rcv, data, .. } => (*rcv, data.clone(), false, None),
            RecordBody::Compensate { rcv, data, .. } => (*rcv, data.clone(), false, None),
            RecordBody::DbExternRedo { rcvindex, .. } => {
                tracing::trace!(?rcvindex, "page-independent redo");
                return Ok(true);
            }
            _ => return Ok(true),
        };

        // the compensation path applies the *undo* function of the index
        let as_undo = rec.header.rectype == RecordType::Compensate;

        let image = if is_diff {
            xor_diff(undo.as_deref().unwrap_or(&[]), &data)
        } else {
            data
        };

        if rcv.rcvindex == RvIndex::VolHeaderFormat {
            disk.ensure_volume_for_redo(rcv.volid, &image)?;
        }
        let mut page = match disk.read_data_page(rcv.volid, rcv.pageid) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%rec.lsa, "skipping redo, page unavailable: {e}");
                return Ok(true);
            }
        };
        let page_lsa = crate::io::page_lsa(&page);
        if page_lsa >= rec.lsa && page_lsa != crate::io::TEMP_PAGE_LSA {
            return Ok(true);
        }
        let r = rvfun::Rcv {
            offset: rcv.offset,
            data: &image,
            lsa: rec.lsa,
        };
        let applied = if as_undo {
            rvfun::apply_undo(rcv.rcvindex, crate::io::page_content_mut(&mut page), &r)
        } else {
            rvfun::apply_redo(rcv.rcvindex, crate::io::page_content_mut(&mut page), &r)
        };
        if let Err(e) = applied {
            tracing::warn!(%rec.lsa, "redo function failed: {e}");
            return Ok(true);
        }
        crate::io::set_page_lsa(&mut page, rec.lsa);
        disk.recovery_write_page(rcv.volid, rcv.pageid, page)?;
        redone += 1;
        Ok(true)
    })?;
    Ok(redone)
}

/// Re-run the postpone work of a transaction that committed with
/// postpones pending, skipping what its RUN_POSTPONE trail already
/// covers, then close it with a commit record.
fn finish_postpones(log: &mut LogInner, disk: &DiskManager, e: &mut RecTdes) -> Result<()> {
    let start = e.log.posp_nxlsa;
    if !start.is_null() {
        let limit = log.append_lsa();
        let trid = e.trid;
        let already = e.run_postpones.clone();
        let mut pending = Vec::new();
        scan_forward(log, start, limit, |_, rec| {
            if rec.header.trid == trid && !already.contains(&rec.lsa) {
                if let RecordBody::Postpone { rcv, data } = &rec.body {
                    pending.push((rec.lsa, *rcv, data.clone()));
                }
            }
            Ok(true)
        })?;
        for (ref_lsa, rcv, data) in pending {
            let mut ctx = LogCtx {
                log: &mut *log,
                trid,
                tlog: &mut e.log,
            };
            if rcv.rcvindex == RvIndex::IdDeallocWithVolheader {
                let img = DeallocImage::from_bytes(&data)?;
                disk.run_dealloc(&mut ctx, rcv.volid, img, ref_lsa)?;
            } else {
                disk.apply_run_postpone(&mut ctx, rcv, data, ref_lsa)?;
            }
        }
    }
    log.append(
        e.trid,
        &mut e.log,
        &RecordBody::Commit {
            at_time: chrono::Utc::now().timestamp_millis(),
        },
    )?;
    e.state = TranState::UnactiveCommitted;
    Ok(())
}

/// A coordinator that crashed after its global decision but before every
/// participant acknowledged: re-attach it with the ack set rebuilt from
/// the log, so the decision can be re-sent to whoever is still waiting.
fn reattach_informing(engine: &Engine, e: &RecTdes) -> Result<()> {
    let slot = engine.trantab.assign(
        e.trid,
        ClientIds {
            user_name: e.user_name.clone(),
            host_name: String::new(),
            process_id: 0,
        },
        Isolation::from_i32(e.isolation).unwrap_or(Isolation::RepClassCommitInstance),
        -1,
    )?;
    let mut tdes = slot.tdes.lock();
    tdes.state = e.state;
    tdes.gtrid = e.gtrid;
    tdes.log = e.log;
    let mut coord = Coordinator::new(e.gtrid, e.particps.clone());
    for &idx in &e.acks {
        coord.mark_ack(idx as usize);
    }
    tdes.coord = Some(coord);
    tracing::warn!(
        trid = e.trid,
        gtrid = e.gtrid,
        "coordinator re-attached; participants still need the decision"
    );
    Ok(())
}

/// In-doubt distributed transactions get a live slot again and wait for
/// the external decision; recovery neither commits nor aborts them.
fn reattach_in_doubt(engine: &Engine, e: &RecTdes) -> Result<()> {
    let slot = engine.trantab.assign(
        e.trid,
        ClientIds {
            user_name: e.user_name.clone(),
            host_name: String::new(),
            process_id: 0,
        },
        Isolation::from_i32(e.isolation).unwrap_or(Isolation::RepClassCommitInstance),
        -1,
    )?;
    let mut tdes = slot.tdes.lock();
    tdes.state = TranState::Unactive2pcPrepare;
    tdes.gtrid = e.gtrid;
    tdes.log = e.log;
    tracing::warn!(
        trid = e.trid,
        gtrid = e.gtrid,
        "distributed transaction is in doubt; awaiting external resolution"
    );
    Ok(())
}

fn xor_diff(undo: &[u8], diff: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(diff.len());
    for (i, d) in diff.iter().enumerate() {
        out.push(d ^ undo.get(i).copied().unwrap_or(0));
    }
    Bytes::from(out)
}
