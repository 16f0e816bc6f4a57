//! The storage engine: one owned value collecting the log, the disk
//! manager and the transaction table, plus the background flusher and
//! archiver tasks. The critical sections of the design map to the locks
//! held inside; lock order is descriptor, then log, then volume.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::disk::header::VolPurpose;
use crate::disk::{DiskManager, LogCtx, PageAlloc, VolCheck};
use crate::error::{Error, Result};
use crate::log::flush::GroupCommit;
use crate::log::LogInner;
use crate::lsa::Lsa;
use crate::record::{RcvAddr, RecordBody, RvIndex};
use crate::recovery;
use crate::recovery::rvfun::DeallocImage;
use crate::tran::{ClientIds, Isolation, Tdes, TranState, TranTable};

pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) dbname: String,
    pub(crate) dir: PathBuf,
    pub(crate) log: Mutex<LogInner>,
    pub(crate) gc: GroupCommit,
    pub(crate) disk: DiskManager,
    pub(crate) trantab: TranTable,
    background: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    archive_tx: Mutex<Option<crossbeam::channel::Sender<()>>>,
}

impl Engine {
    /// Create a fresh database: active log plus bookkeeping, no volumes.
    pub fn create(cfg: Config, dbname: &str, dir: &Path) -> Result<Arc<Self>> {
        cfg.validate()?;
        let log = LogInner::create(&cfg, dbname, dir)?;
        let engine = Arc::new(Self {
            gc: GroupCommit::new(cfg.group_commit_interval),
            disk: DiskManager::new(dbname, dir, cfg.io_page_size),
            trantab: TranTable::new(cfg.max_clients),
            log: Mutex::new(log),
            dbname: dbname.to_owned(),
            dir: dir.to_owned(),
            cfg,
            background: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            archive_tx: Mutex::new(None),
        });
        // seed the log with a first checkpoint so recovery always has a
        // starting point
        engine.checkpoint()?;
        Ok(engine)
    }

    /// Mount an existing database and run crash recovery.
    pub fn open(cfg: Config, dbname: &str, dir: &Path) -> Result<Arc<Self>> {
        Self::open_with_stopat(cfg, dbname, dir, None)
    }

    /// Mount with an optional media-recovery bound: redo stops at the
    /// first transaction end stamped after `stopat` (unix millis).
    pub fn open_with_stopat(
        cfg: Config,
        dbname: &str,
        dir: &Path,
        stopat: Option<i64>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let log = LogInner::open(&cfg, dbname, dir)?;
        let engine = Arc::new(Self {
            gc: GroupCommit::new(cfg.group_commit_interval),
            disk: DiskManager::new(dbname, dir, cfg.io_page_size),
            trantab: TranTable::new(cfg.max_clients),
            log: Mutex::new(log),
            dbname: dbname.to_owned(),
            dir: dir.to_owned(),
            cfg,
            background: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            archive_tx: Mutex::new(None),
        });
        engine.disk.mount_all()?;
        recovery::recover(&engine, stopat)?;
        engine.checkpoint()?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    // ----------------------------------------------------- background

    /// Spawn the group-commit flusher and the background archiver.
    pub fn start_background(self: &Arc<Self>) {
        if self.background.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock();
        if self.gc.batching() {
            let eng = self.clone();
            threads.push(std::thread::spawn(move || {
                while eng.gc.flusher_wait() {
                    if let Err(e) = eng.flush_now() {
                        tracing::error!("group-commit flush failed: {e}");
                    }
                    let wants_chkpt = eng.log.lock().wants_chkpt;
                    if wants_chkpt {
                        if let Err(e) = eng.checkpoint() {
                            tracing::error!("scheduled checkpoint failed: {e}");
                        }
                    }
                }
            }));
        }
        if self.cfg.log_bg_archive {
            let (tx, rx) = crossbeam::channel::unbounded::<()>();
            *self.archive_tx.lock() = Some(tx);
            let eng = self.clone();
            threads.push(std::thread::spawn(move || {
                while rx.recv().is_ok() {
                    let mut log = eng.log.lock();
                    if log.wants_archive {
                        if let Err(e) = log.archive_active_log() {
                            tracing::warn!("background archive failed: {e}");
                        }
                    }
                }
            }));
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.gc.request_shutdown();
        self.archive_tx.lock().take(); // closes the archiver channel
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
        let mut log = self.log.lock();
        log.flush_all_append_pages()?;
        self.disk.flush_all(&mut log)?;
        log.mark_shutdown(true)?;
        Ok(())
    }

    pub(crate) fn flush_now(&self) -> Result<Lsa> {
        let lsa = {
            let mut log = self.log.lock();
            log.flush_all_append_pages()?;
            log.flushed_lsa()
        };
        self.gc.note_flushed(lsa);
        Ok(lsa)
    }

    /// Block until the log is durable up to `lsa`, batching with other
    /// committers when group commit is on.
    pub(crate) fn make_durable(&self, lsa: Lsa) -> Result<()> {
        if self.gc.batching() && self.background.load(Ordering::SeqCst) {
            self.gc.wait_durable(lsa);
            Ok(())
        } else {
            self.flush_now().map(|_| ())
        }
    }

    fn kick_archiver(&self) {
        if let Some(tx) = self.archive_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    // --------------------------------------------------- transactions

    /// Claim a transaction-table slot with a fresh transaction id.
    pub fn begin_tran(
        &self,
        client: ClientIds,
        isolation: Isolation,
        wait_secs: i32,
    ) -> Result<usize> {
        let trid = self.log.lock().next_trid();
        let slot = self.trantab.assign(trid, client, isolation, wait_secs)?;
        tracing::debug!(trid, index = slot.index, "transaction started");
        Ok(slot.index)
    }

    /// Reuse a slot for the client's next transaction.
    pub fn restart_tran(&self, index: usize) -> Result<i32> {
        let slot = self.trantab.get(index)?;
        let trid = self.log.lock().next_trid();
        let mut tdes = slot.tdes.lock();
        if tdes.state == TranState::Active {
            return Err(Error::Twopc("transaction still active".into()));
        }
        tdes.reuse(trid);
        Ok(trid)
    }

    /// Release the slot entirely (client detach).
    pub fn detach_tran(&self, index: usize) -> Result<()> {
        self.trantab.free(index)
    }

    pub fn set_interrupt(&self, index: usize, on: bool) -> Result<()> {
        self.trantab.get(index)?.set_interrupt(on);
        Ok(())
    }

    pub fn tran_state(&self, index: usize) -> Result<TranState> {
        Ok(self.trantab.get(index)?.tdes.lock().state)
    }

    /// Run the postpone records of `tdes` in `(after, limit)`, emitting a
    /// RUN_POSTPONE for each so recovery can tell how far we got.
    pub(crate) fn run_postpones(
        &self,
        log: &mut LogInner,
        tdes: &mut Tdes,
        start: Lsa,
        limit: Lsa,
    ) -> Result<()> {
        let trid = tdes.trid;
        let mut pending = Vec::new();
        crate::log::scan_forward(log, start, limit, |_, rec| {
            if rec.header.trid == trid {
                if let RecordBody::Postpone { rcv, data } = &rec.body {
                    pending.push((rec.lsa, *rcv, data.clone()));
                }
            }
            Ok(true)
        })?;
        for (ref_lsa, rcv, data) in pending {
            self.execute_postpone(log, tdes, rcv, data, ref_lsa)?;
        }
        Ok(())
    }

    fn execute_postpone(
        &self,
        log: &mut LogInner,
        tdes: &mut Tdes,
        rcv: RcvAddr,
        data: Bytes,
        ref_lsa: Lsa,
    ) -> Result<()> {
        let Tdes { trid, log: tlog, .. } = tdes;
        let mut ctx = LogCtx {
            log,
            trid: *trid,
            tlog,
        };
        if rcv.rcvindex == RvIndex::IdDeallocWithVolheader {
            let img = DeallocImage::from_bytes(&data)?;
            self.disk.run_dealloc(&mut ctx, rcv.volid, img, ref_lsa)
        } else {
            self.disk.apply_run_postpone(&mut ctx, rcv, data, ref_lsa)
        }
    }

    /// Append everything a local commit needs: the buffered replication
    /// records, the unlock marker, the postpone run and the commit record
    /// itself. Shared by plain commit and the 2PC decision paths.
    pub(crate) fn commit_records_locked(&self, tdes: &mut Tdes) -> Result<Lsa> {
        let mut log = self.log.lock();

        // replication records buffered on the descriptor go out first,
        // then the unlock marker that orders the applier's queue
        let had_repl = !tdes.repl_records.is_empty() || !tdes.repl_schema.is_empty();
        let repl: Vec<RecordBody> = tdes
            .repl_records
            .drain(..)
            .map(RecordBody::ReplicationData)
            .chain(
                tdes.repl_schema
                    .drain(..)
                    .map(|(ddl, user)| RecordBody::ReplicationSchema { ddl, user }),
            )
            .collect();
        for body in repl {
            log.append(tdes.trid, &mut tdes.log, &body)?;
        }
        if had_repl {
            log.append(tdes.trid, &mut tdes.log, &RecordBody::UnlockCommit)?;
        }

        if !tdes.log.posp_nxlsa.is_null() {
            let start_posp = tdes.log.posp_nxlsa;
            log.append(
                tdes.trid,
                &mut tdes.log,
                &RecordBody::CommitWithPostpone {
                    start_posp_lsa: start_posp,
                },
            )?;
            tdes.state = TranState::UnactiveCommittedWithPostpone;
            // the decision record must be durable before its effects
            log.flush_all_append_pages()?;
            let limit = log.append_lsa();
            self.run_postpones(&mut log, tdes, start_posp, limit)?;
            tdes.log.posp_nxlsa = Lsa::NULL;
        }

        log.append(tdes.trid, &mut tdes.log, &RecordBody::WillCommit)?;
        tdes.state = TranState::UnactiveWillCommit;
        let lsa = log.append(
            tdes.trid,
            &mut tdes.log,
            &RecordBody::Commit {
                at_time: chrono::Utc::now().timestamp_millis(),
            },
        )?;
        Ok(lsa)
    }

    /// Commit: replication flush, postpones, the commit record, then the
    /// group-commit wait. Durable or visibly aborted; nothing in between.
    pub fn commit(&self, index: usize) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        if tdes.state != TranState::Active {
            return Err(Error::Twopc("commit of a finished transaction".into()));
        }
        let commit_lsa = self.commit_records_locked(&mut tdes)?;
        self.make_durable(commit_lsa)?;
        tdes.state = TranState::UnactiveCommitted;
        tdes.topops.clear();
        tracing::debug!(trid = tdes.trid, %commit_lsa, "transaction committed");
        self.kick_archiver();
        Ok(())
    }

    /// Roll the transaction back completely.
    pub fn abort(&self, index: usize) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        self.abort_locked(&mut tdes, TranState::UnactiveAborted)
    }

    /// Server-side unilateral abort (deadlock victim, fatal error).
    pub fn abort_unilaterally(&self, index: usize) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        self.abort_locked(&mut tdes, TranState::UnactiveUnilaterallyAborted)
    }

    pub(crate) fn abort_locked(&self, tdes: &mut Tdes, end_state: TranState) -> Result<()> {
        let mut log = self.log.lock();
        let had_repl = !tdes.repl_records.is_empty() || !tdes.repl_schema.is_empty();
        tdes.repl_records.clear();
        tdes.repl_schema.clear();

        {
            let Tdes { trid, log: tlog, .. } = &mut *tdes;
            recovery::rollback_records(&mut log, &self.disk, *trid, tlog, Lsa::NULL)?;
        }
        if had_repl {
            log.append(tdes.trid, &mut tdes.log, &RecordBody::UnlockAbort)?;
        }
        log.append(
            tdes.trid,
            &mut tdes.log,
            &RecordBody::Abort {
                at_time: chrono::Utc::now().timestamp_millis(),
            },
        )?;
        tdes.state = end_state;
        tdes.topops.clear();
        tdes.log.posp_nxlsa = Lsa::NULL;
        tracing::debug!(trid = tdes.trid, "transaction aborted");
        Ok(())
    }

    // ------------------------------------------------------ savepoints

    pub fn savepoint(&self, index: usize, name: &str) -> Result<Lsa> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let body = RecordBody::Savepoint {
            prev_savept: tdes.log.savept_lsa,
            name: name.to_owned(),
        };
        let mut log = self.log.lock();
        log.append(tdes.trid, &mut tdes.log, &body)
    }

    /// Partial rollback: undo everything after the named savepoint, keep
    /// the transaction alive.
    pub fn rollback_to_savepoint(&self, index: usize, name: &str) -> Result<()> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();

        // locate the savepoint by walking the savepoint chain backwards
        let mut sp_lsa = tdes.log.savept_lsa;
        let found = loop {
            if sp_lsa.is_null() {
                break None;
            }
            let rec = log.read_record(sp_lsa)?;
            match rec.body {
                RecordBody::Savepoint {
                    prev_savept,
                    name: ref sp_name,
                } => {
                    if sp_name == name {
                        break Some(sp_lsa);
                    }
                    sp_lsa = prev_savept;
                }
                _ => return Err(Error::LogRecordCorrupted(sp_lsa)),
            }
        };
        let sp_lsa = found.ok_or_else(|| Error::UnknownSavepoint(name.to_owned()))?;

        let prv_topresult = tdes.log.tail_topresult_lsa;
        {
            let Tdes { trid, log: tlog, .. } = &mut *tdes;
            recovery::rollback_records(&mut log, &self.disk, *trid, tlog, sp_lsa)?;
        }
        log.append(
            tdes.trid,
            &mut tdes.log,
            &RecordBody::AbortTopope {
                lastparent_lsa: sp_lsa,
                prv_topresult_lsa: prv_topresult,
            },
        )?;
        tdes.log.savept_lsa = sp_lsa;
        Ok(())
    }

    // --------------------------------------------------------- topops

    /// Open a nested top-operation scope.
    pub fn begin_topop(&self, index: usize) -> Result<usize> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        Ok(tdes.push_topop())
    }

    /// Commit the innermost top operation; its postpones run now.
    pub fn commit_topop(&self, index: usize) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let entry = tdes
            .topops
            .pop()
            .ok_or_else(|| Error::Twopc("no open top operation".into()))?;
        let prv_topresult = tdes.log.tail_topresult_lsa;
        let mut log = self.log.lock();

        let new_postpones =
            !tdes.log.posp_nxlsa.is_null() && tdes.log.posp_nxlsa > entry.lastparent_lsa;
        if new_postpones {
            let start_posp = tdes.log.posp_nxlsa;
            log.append(
                tdes.trid,
                &mut tdes.log,
                &RecordBody::CommitTopopeWithPostpone {
                    lastparent_lsa: entry.lastparent_lsa,
                    start_posp_lsa: start_posp,
                },
            )?;
            let limit = log.append_lsa();
            self.run_postpones(&mut log, &mut tdes, start_posp, limit)?;
            tdes.log.posp_nxlsa = entry.posp_lsa;
        } else {
            log.append(
                tdes.trid,
                &mut tdes.log,
                &RecordBody::CommitTopope {
                    lastparent_lsa: entry.lastparent_lsa,
                    prv_topresult_lsa: prv_topresult,
                },
            )?;
        }
        Ok(())
    }

    /// Abort the innermost top operation: undo back to its parent LSA.
    pub fn abort_topop(&self, index: usize) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let entry = tdes
            .topops
            .pop()
            .ok_or_else(|| Error::Twopc("no open top operation".into()))?;
        let prv_topresult = tdes.log.tail_topresult_lsa;
        let mut log = self.log.lock();
        {
            let Tdes { trid, log: tlog, .. } = &mut *tdes;
            recovery::rollback_records(&mut log, &self.disk, *trid, tlog, entry.lastparent_lsa)?;
        }
        log.append(
            tdes.trid,
            &mut tdes.log,
            &RecordBody::AbortTopope {
                lastparent_lsa: entry.lastparent_lsa,
                prv_topresult_lsa: prv_topresult,
            },
        )?;
        Ok(())
    }

    // ------------------------------------------------------- disk API

    /// Format a new volume and link it into the volume chain.
    pub fn format_volume(
        &self,
        index: usize,
        purpose: VolPurpose,
        npages: i32,
        remarks: &str,
    ) -> Result<i16> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let db_creation = log.hdr.db_creation;

        let prev = self.disk.max_volid();
        let volid = prev.map(|v| v + 1).unwrap_or(0);
        let max_npages = if purpose == VolPurpose::TempTemp {
            self.cfg.bosr_maxtmp_pages
        } else {
            npages
        };
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        let volid = self
            .disk
            .format(&mut ctx, volid, purpose, npages, max_npages, remarks, db_creation)?;
        if let Some(prev) = prev {
            let fullname = self.disk.vol_path(volid).display().to_string();
            self.disk.set_link(&mut ctx, prev, &fullname)?;
        }
        Ok(volid)
    }

    pub fn alloc_sector(
        &self,
        index: usize,
        volid: i16,
        nsects: i32,
        exp_pages_in_sector: i32,
    ) -> Result<i32> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        self.disk.alloc_sector(&mut ctx, volid, nsects, exp_pages_in_sector)
    }

    /// Allocate pages; on volume exhaustion the caller may retry on a
    /// different volume chosen through the purpose cache.
    pub fn alloc_page(
        &self,
        index: usize,
        volid: i16,
        sect: i32,
        npages: i32,
        near_page: Option<i32>,
    ) -> Result<PageAlloc> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let out = {
            let Tdes { trid, log: tlog, .. } = &mut *tdes;
            let mut ctx = LogCtx {
                log: &mut log,
                trid: *trid,
                tlog,
            };
            self.disk.alloc_page(&mut ctx, volid, sect, npages, near_page)?
        };
        if let PageAlloc::NoSpace {
            enough_free_pages: false,
        } = out
        {
            // transparent temp expansion keeps scratch allocations alive
            if self.disk.purpose(volid)? == VolPurpose::TempTemp {
                self.disk
                    .expand_temp(volid, npages.max(32), self.cfg.bosr_maxtmp_pages)?;
                let Tdes { trid, log: tlog, .. } = &mut *tdes;
                let mut ctx = LogCtx {
                    log: &mut log,
                    trid: *trid,
                    tlog,
                };
                return self.disk.alloc_page(&mut ctx, volid, sect, npages, near_page);
            }
        }
        Ok(out)
    }

    /// Purpose-level allocation: pick a volume through the free-space
    /// cache cascade, retrying once on a volume whose hint turned out to
    /// be stale. Reports out-of-space for the whole database.
    pub fn alloc_page_anyvol(
        &self,
        index: usize,
        purpose: VolPurpose,
        npages: i32,
        contiguity: crate::disk::cache::Contiguity,
    ) -> Result<(i16, i32)> {
        let mut undesirable = None;
        for _ in 0..2 {
            let Some(volid) = self.disk.find_good_vol(purpose, npages, undesirable, contiguity)
            else {
                break;
            };
            match self.alloc_page(index, volid, crate::disk::header::SPECIAL_SECTOR, npages, None)?
            {
                PageAlloc::Allocated(pageid) => return Ok((volid, pageid)),
                PageAlloc::NoSpace { .. } => {
                    // the advisory hint overshot; skip this volume once
                    undesirable = Some(volid);
                }
            }
        }
        Err(Error::NotEnoughPages { requested: npages })
    }

    pub fn dealloc_page(&self, index: usize, volid: i16, pageid: i32, npages: i32) -> Result<()> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        self.disk.dealloc_page(&mut ctx, volid, pageid, npages)
    }

    pub fn dealloc_sector(&self, index: usize, volid: i16, sectid: i32, nsects: i32) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        self.disk.dealloc_sector(&mut ctx, volid, sectid, nsects)
    }

    pub fn check_volume(&self, index: usize, volid: i16, repair: bool) -> Result<VolCheck> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        self.disk.check(&mut ctx, volid, repair)
    }

    // -------------------------------------------------- data page ops

    /// Apply a logged byte-image operation to a data page (the heap
    /// layer's seam, and what the end-to-end tests drive).
    pub fn apply_undoredo(
        &self,
        index: usize,
        rcvindex: RvIndex,
        volid: i16,
        pageid: i32,
        offset: i16,
        undo: Bytes,
        redo: Bytes,
    ) -> Result<Lsa> {
        let slot = self.trantab.get(index)?;
        slot.check_interrupt()?;
        let mut tdes = slot.tdes.lock();
        let mut log = self.log.lock();
        let Tdes { trid, log: tlog, .. } = &mut *tdes;
        let mut ctx = LogCtx {
            log: &mut log,
            trid: *trid,
            tlog,
        };
        self.disk
            .apply_byte_op(&mut ctx, rcvindex, volid, pageid, offset, undo, redo)
    }

    /// Buffer a replication record on the descriptor; it reaches the log
    /// at commit, right before the unlock marker.
    pub fn add_repl_data(&self, index: usize, data: crate::record::ReplData) -> Result<()> {
        let slot = self.trantab.get(index)?;
        slot.tdes.lock().repl_records.push(data);
        Ok(())
    }

    pub fn add_repl_schema(&self, index: usize, ddl: &str, user: &str) -> Result<()> {
        let slot = self.trantab.get(index)?;
        slot.tdes
            .lock()
            .repl_schema
            .push((ddl.to_owned(), user.to_owned()));
        Ok(())
    }

    pub fn read_data_page(&self, volid: i16, pageid: i32) -> Result<Vec<u8>> {
        self.disk.read_data_page(volid, pageid)
    }

    /// Force an archive rotation regardless of fill level.
    pub fn force_archive(&self) -> Result<()> {
        let system = self.trantab.system_slot();
        let mut tdes = system.tdes.lock();
        let mut log = self.log.lock();
        log.force_archive(&mut tdes.log)
    }

    pub fn delete_unneeded_archives(&self, required_pageid: i32) -> Result<usize> {
        self.log.lock().delete_unneeded_archives(required_pageid)
    }

    pub fn flushed_lsa(&self) -> Lsa {
        self.log.lock().flushed_lsa()
    }

    pub fn append_lsa(&self) -> Lsa {
        self.log.lock().append_lsa()
    }

    pub fn free_pages(&self, volid: i16) -> Result<i32> {
        self.disk.free_pages(volid)
    }

    pub fn hint_allocsect(&self, volid: i16) -> Result<i32> {
        self.disk.hint_allocsect(volid)
    }

    /// Announce an HA server-state change in the log; replicas drive
    /// their applier state machine off this record.
    pub fn note_ha_state(&self, state: i32) -> Result<Lsa> {
        let system = self.trantab.system_slot();
        let mut tdes = system.tdes.lock();
        let mut log = self.log.lock();
        log.hdr.ha_server_state = state;
        let lsa = log.append(
            crate::log::SYSTEM_TRID,
            &mut tdes.log,
            &RecordBody::DummyHaServerState { state },
        )?;
        log.flush_all_append_pages()?;
        Ok(lsa)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.gc.request_shutdown();
        self.archive_tx.lock().take();
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
    }
}
