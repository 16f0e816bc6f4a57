//! The write-ahead log: active file management, append path, page buffer
//! and record reading. Everything here runs under the log critical
//! section; [`crate::engine::Engine`] owns the mutex.

use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::VolumeFile;
use crate::lsa::{Lsa, LsaRepr};
use crate::record::{
    align_up, LogRecord, RecordBody, RecordHeader, RecordRead, RecordType,
};
use crate::tran::TranLog;

pub mod archive;
pub mod flush;
pub mod header;
pub mod info;
pub mod page;
pub mod pgbuf;

use header::{ActiveLogHeader, ArchiveLogHeader};
use info::LogInfo;
use page::{LogPage, NO_FIRST_RECORD};
use pgbuf::PageBuf;

/// Bounded retry for log page reads; archives may be mid-copy.
const LOG_READ_RETRIES: usize = 10;

/// System transaction id, owner of checkpoint and recovery records.
pub const SYSTEM_TRID: i32 = 0;

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub arv_num: i32,
    pub fpageid: i32,
    pub npages: i32,
    pub path: PathBuf,
}

impl ArchiveInfo {
    pub fn contains(&self, pageid: i32) -> bool {
        pageid >= self.fpageid && pageid < self.fpageid + self.npages
    }
}

#[derive(Debug, Default)]
struct AppendState {
    /// LSA of the most recently appended record; its `forw_lsa` is patched
    /// by the next append.
    prev_lsa: Lsa,
    /// Slot pinned for the current append page.
    append_slot: Option<usize>,
    /// Slot pinned because it holds the previous record's header
    /// ("delayed free" page).
    prev_slot: Option<usize>,
}

/// Log state guarded by the log critical section.
#[derive(Debug)]
pub struct LogInner {
    cfg: Config,
    dbname: String,
    dir: PathBuf,
    file: VolumeFile,
    pub hdr: ActiveLogHeader,
    pgbuf: PageBuf,
    append: AppendState,
    /// Everything strictly below this LSA is durable in the active file.
    nxio_lsa: Lsa,
    pub archives: Vec<ArchiveInfo>,
    pub loginfo: LogInfo,
    pages_since_chkpt: u32,
    /// Set when the appended page count crosses the checkpoint threshold.
    pub wants_chkpt: bool,
    /// Set when the circular window is getting close to rotation.
    pub wants_archive: bool,
}

impl LogInner {
    pub fn active_log_path(dir: &Path, dbname: &str) -> PathBuf {
        dir.join(format!("{dbname}_lgat"))
    }

    pub fn archive_path(dir: &Path, dbname: &str, arv_num: i32) -> PathBuf {
        dir.join(format!("{dbname}_lgar{arv_num:03}"))
    }

    pub fn create(cfg: &Config, dbname: &str, dir: &Path) -> Result<Self> {
        cfg.validate()?;
        let path = Self::active_log_path(dir, dbname);
        let file = VolumeFile::format(&path, cfg.log_page_size, 1 + cfg.log_npages)?;
        let hdr = ActiveLogHeader::new(dbname, cfg, chrono::Utc::now().timestamp());
        let loginfo = LogInfo::open(dir, dbname)?;

        let mut log = Self {
            cfg: cfg.clone(),
            dbname: dbname.to_owned(),
            dir: dir.to_owned(),
            file,
            hdr,
            pgbuf: PageBuf::new(cfg.log_nbuffers, cfg.log_page_size),
            append: AppendState::default(),
            nxio_lsa: Lsa::new(0, 0),
            archives: Vec::new(),
            loginfo,
            pages_since_chkpt: 0,
            wants_chkpt: false,
            wants_archive: false,
        };
        log.setup_append_page(0)?;
        log.flush_all_append_pages()?;
        log.loginfo.log_created(dbname);
        Ok(log)
    }

    pub fn open(cfg: &Config, dbname: &str, dir: &Path) -> Result<Self> {
        let path = Self::active_log_path(dir, dbname);
        let file = VolumeFile::open(&path, cfg.log_page_size)?;
        let mut page = vec![0u8; cfg.log_page_size];
        // transient mount glitches get one header re-read
        let hdr = match file.read_page(0, &mut page) {
            Ok(()) => ActiveLogHeader::decode(&page, &path.display().to_string())?,
            Err(_) => {
                file.read_page(0, &mut page)?;
                ActiveLogHeader::decode(&page, &path.display().to_string())?
            }
        };
        let archives = Self::scan_archives(dir, dbname)?;
        let loginfo = LogInfo::open(dir, dbname)?;

        let mut log = Self {
            cfg: cfg.clone(),
            dbname: dbname.to_owned(),
            dir: dir.to_owned(),
            file,
            nxio_lsa: hdr.eof_lsa,
            hdr,
            pgbuf: PageBuf::new(cfg.log_nbuffers, cfg.log_page_size),
            append: AppendState::default(),
            archives,
            loginfo,
            pages_since_chkpt: 0,
            wants_chkpt: false,
            wants_archive: false,
        };
        // resume appending at the durable end of log; recovery then walks
        // the tail and fixes the prev-record chain
        let eof = log.hdr.eof_lsa;
        log.hdr.append_lsa = eof;
        log.resume_append_page(eof.pageid)?;
        Ok(log)
    }

    fn scan_archives(dir: &Path, dbname: &str) -> Result<Vec<ArchiveInfo>> {
        let prefix = format!("{dbname}_lgar");
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(numpart) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(arv_num) = numpart.parse::<i32>() else {
                continue;
            };
            let path = entry.path();
            // archive page size matches the active log page size
            let file = VolumeFile::open(&path, 512)?;
            let mut page = vec![0u8; 512];
            file.read_page(0, &mut page)?;
            let hdr = ArchiveLogHeader::decode(&page, &path.display().to_string())?;
            debug_assert_eq!(hdr.arv_num, arv_num);
            found.push(ArchiveInfo {
                arv_num,
                fpageid: hdr.fpageid,
                npages: hdr.npages,
                path,
            });
        }
        found.sort_by_key(|a| a.arv_num);
        Ok(found)
    }

    pub fn page_size(&self) -> usize {
        self.cfg.log_page_size
    }

    pub fn payload_size(&self) -> usize {
        self.cfg.log_page_size - page::LOG_PAGE_HDR_SIZE
    }

    pub fn append_lsa(&self) -> Lsa {
        self.hdr.append_lsa
    }

    pub fn prev_lsa(&self) -> Lsa {
        self.append.prev_lsa
    }

    pub fn flushed_lsa(&self) -> Lsa {
        self.nxio_lsa
    }

    pub fn next_trid(&mut self) -> i32 {
        let trid = self.hdr.next_trid;
        self.hdr.next_trid += 1;
        trid
    }

    fn phys_pageid(&self, logical: i32) -> i32 {
        1 + logical % self.hdr.npages
    }

    // ------------------------------------------------------------ fetch

    /// Bring a logical page into the buffer, returning its slot index.
    pub fn fetch_page(&mut self, pageid: i32) -> Result<usize> {
        if pageid < 0 || pageid > self.hdr.append_lsa.pageid {
            return Err(Error::LogPageCorrupted(pageid));
        }
        if let Some(idx) = self.pgbuf.lookup(pageid) {
            return Ok(idx);
        }
        let in_archive = pageid < self.hdr.nxarv_pageid;
        let mut buf = vec![0u8; self.cfg.log_page_size].into_boxed_slice();
        if in_archive {
            self.read_from_archive(pageid, &mut buf)?;
        } else {
            self.read_page_from_file(pageid, &mut buf)?;
        }
        let page = LogPage::from_bytes(buf);
        if page.pageid() != pageid {
            return Err(Error::LogPageCorrupted(pageid));
        }
        let idx = self.grab_victim()?;
        let phy = self.phys_pageid(pageid);
        let slot = self.pgbuf.install(idx, pageid, phy);
        slot.page = page;
        slot.in_archive = in_archive;
        Ok(idx)
    }

    fn grab_victim(&mut self) -> Result<usize> {
        loop {
            if let Some(idx) = self.pgbuf.victim() {
                return Ok(idx);
            }
            // every unpinned slot is dirty; make them clean and retry
            self.flush_all_append_pages()?;
        }
    }

    fn read_page_from_file(&self, pageid: i32, buf: &mut [u8]) -> Result<()> {
        let phy = self.phys_pageid(pageid);
        let mut last_err = None;
        for _ in 0..LOG_READ_RETRIES {
            match self.file.read_page(phy, buf) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    fn read_from_archive(&self, pageid: i32, buf: &mut [u8]) -> Result<()> {
        let info = self
            .archives
            .iter()
            .find(|a| a.contains(pageid))
            .ok_or(Error::LogPageCorrupted(pageid))?;
        let mut last_err = None;
        for _ in 0..LOG_READ_RETRIES {
            match VolumeFile::open(&info.path, self.cfg.log_page_size)
                .and_then(|f| f.read_page(1 + pageid - info.fpageid, buf))
            {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    /// Copy of a page for readers that outlive the buffer slot.
    pub fn fetch_page_copy(&mut self, pageid: i32) -> Result<LogPage> {
        let idx = self.fetch_page(pageid)?;
        Ok(self.pgbuf.slot(idx).page.clone())
    }

    // ----------------------------------------------------------- append

    fn setup_append_page(&mut self, pageid: i32) -> Result<()> {
        let idx = self.grab_victim()?;
        let phy = self.phys_pageid(pageid);
        let slot = self.pgbuf.install(idx, pageid, phy);
        slot.page.reset(pageid);
        self.pgbuf.fix(idx);
        self.pgbuf.mark_dirty(idx);
        self.append.append_slot = Some(idx);
        Ok(())
    }

    /// Re-pin the append page after a mount; keeps existing content when
    /// the on-disk page really is the one we expect.
    fn resume_append_page(&mut self, pageid: i32) -> Result<()> {
        let idx = match self.pgbuf.lookup(pageid) {
            Some(idx) => idx,
            None => {
                let mut buf = vec![0u8; self.cfg.log_page_size].into_boxed_slice();
                let read_ok = self.read_page_from_file(pageid, &mut buf).is_ok();
                let page = LogPage::from_bytes(buf);
                let idx = self.grab_victim()?;
                let phy = self.phys_pageid(pageid);
                let slot = self.pgbuf.install(idx, pageid, phy);
                if read_ok && page.pageid() == pageid {
                    slot.page = page;
                } else {
                    slot.page.reset(pageid);
                }
                idx
            }
        };
        self.pgbuf.fix(idx);
        self.pgbuf.mark_dirty(idx);
        self.append.append_slot = Some(idx);
        Ok(())
    }

    /// Set the append cursor; used by recovery once the true end of the
    /// record chain is known.
    pub fn set_append_position(&mut self, prev_lsa: Lsa, append_lsa: Lsa) -> Result<()> {
        if let Some(idx) = self.append.append_slot.take() {
            self.pgbuf.unfix(idx);
        }
        self.hdr.append_lsa = append_lsa;
        self.append.prev_lsa = prev_lsa;
        self.resume_append_page(append_lsa.pageid)
    }

    fn append_offset(&self) -> usize {
        self.hdr.append_lsa.offset as usize
    }

    /// Move to a fresh append page, rotating to an archive when the
    /// circular window would overwrite a page that is still needed.
    fn next_append_page(&mut self) -> Result<()> {
        let new_pageid = self.hdr.append_lsa.pageid + 1;

        if new_pageid - self.hdr.nxarv_pageid >= self.hdr.npages {
            // the window is full: rotation cannot be deferred any longer
            self.archive_active_log()?;
        } else if new_pageid - self.hdr.nxarv_pageid >= self.hdr.npages * 3 / 4 {
            self.wants_archive = true;
        }

        if let Some(idx) = self.append.append_slot.take() {
            self.pgbuf.unfix(idx);
        }
        self.setup_append_page(new_pageid)?;
        self.hdr.append_lsa = Lsa::new(new_pageid, 0);

        self.pages_since_chkpt += 1;
        if self.pages_since_chkpt >= self.cfg.chkpt_every_npages {
            self.wants_chkpt = true;
        }
        Ok(())
    }

    /// Guarantee `n` contiguous bytes in the current append page.
    fn ensure_append_room(&mut self, n: usize) -> Result<()> {
        debug_assert!(n <= self.payload_size());
        if self.payload_size() - self.append_offset() < n {
            self.next_append_page()?;
        }
        Ok(())
    }

    /// Copy bytes into the log at the append cursor, spilling across pages.
    fn append_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.append_offset() >= self.payload_size() {
                self.next_append_page()?;
            }
            let offset = self.append_offset();
            let avail = self.payload_size() - offset;
            let take = data.len().min(avail);
            let idx = self.append.append_slot.expect("append page not pinned");
            let slot = self.pgbuf.slot_mut(idx);
            slot.page.payload_mut()[offset..offset + take].copy_from_slice(&data[..take]);
            self.pgbuf.mark_dirty(idx);
            self.hdr.append_lsa.offset += take as i16;
            data = &data[take..];
        }
        Ok(())
    }

    fn align_append(&mut self) {
        let aligned = align_up(self.append_offset()).min(self.payload_size());
        self.hdr.append_lsa.offset = aligned as i16;
    }

    /// Point the previous record's `forw_lsa` at the record that follows
    /// it. The page holding that header stayed pinned for exactly this.
    fn patch_forw(&mut self, prev: Lsa, next: Lsa) -> Result<()> {
        let idx = self.fetch_page(prev.pageid)?;
        let off = prev.offset as usize + RecordHeader::FORW_LSA_OFFSET;
        let slot = self.pgbuf.slot_mut(idx);
        slot.page.payload_mut()[off..off + LsaRepr::SIZE]
            .copy_from_slice(LsaRepr::from(next).as_bytes());
        self.pgbuf.mark_dirty(idx);
        Ok(())
    }

    /// Append one record on behalf of transaction `trid`, updating the
    /// transaction's LSA anchors.
    pub fn append(&mut self, trid: i32, tlog: &mut TranLog, body: &RecordBody) -> Result<Lsa> {
        let rectype = body.rectype();
        let header = RecordHeader {
            trid,
            prev_tranlsa: tlog.tail_lsa,
            back_lsa: self.append.prev_lsa,
            forw_lsa: Lsa::NULL,
            rectype,
        };
        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + 128);
        header.encode(&mut buf);
        body.encode(&mut buf, self.cfg.compress_threshold);

        self.ensure_append_room(RecordHeader::SIZE)?;
        let rec_lsa = self.hdr.append_lsa;

        {
            let idx = self.append.append_slot.expect("append page not pinned");
            let slot = self.pgbuf.slot_mut(idx);
            if slot.page.offset_first_record() == NO_FIRST_RECORD {
                slot.page.set_offset_first_record(rec_lsa.offset);
            }
        }

        self.append_bytes(&buf)?;
        self.align_append();

        let prev = self.append.prev_lsa;
        if !prev.is_null() {
            self.patch_forw(prev, rec_lsa)?;
        }

        // shift the delayed-free pin to the page now holding the newest
        // record header
        if let Some(idx) = self.append.prev_slot.take() {
            self.pgbuf.unfix(idx);
        }
        let head_idx = self.fetch_page(rec_lsa.pageid)?;
        self.pgbuf.fix(head_idx);
        self.append.prev_slot = Some(head_idx);

        self.append.prev_lsa = rec_lsa;

        if tlog.head_lsa.is_null() {
            tlog.head_lsa = rec_lsa;
        }
        tlog.tail_lsa = rec_lsa;
        match body {
            RecordBody::UndoRedo { .. } | RecordBody::Undo { .. } => {
                tlog.undo_nxlsa = rec_lsa;
            }
            RecordBody::Compensate { undo_nxlsa, .. }
            | RecordBody::LogicalCompensate { undo_nxlsa, .. } => {
                tlog.undo_nxlsa = *undo_nxlsa;
            }
            RecordBody::Postpone { .. } => {
                if tlog.posp_nxlsa.is_null() {
                    tlog.posp_nxlsa = rec_lsa;
                }
            }
            RecordBody::Savepoint { .. } => {
                tlog.savept_lsa = rec_lsa;
            }
            RecordBody::CommitTopope { .. }
            | RecordBody::AbortTopope { .. }
            | RecordBody::CommitTopopeWithPostpone { .. } => {
                tlog.tail_topresult_lsa = rec_lsa;
            }
            _ => {}
        }

        tracing::trace!(%rec_lsa, ?rectype, trid, "appended record");
        Ok(rec_lsa)
    }

    // ------------------------------------------------------------ flush

    /// Write every dirty log page and the header, in ascending page order,
    /// and make them durable.
    pub fn flush_all_append_pages(&mut self) -> Result<()> {
        let dirty = self.pgbuf.dirty_slots();
        if dirty.is_empty() && self.nxio_lsa == self.hdr.append_lsa {
            return Ok(());
        }
        for idx in dirty {
            let (pageid, phy) = {
                let slot = self.pgbuf.slot(idx);
                (slot.pageid, slot.phy_pageid)
            };
            debug_assert!(pageid >= 0);
            let bytes: Vec<u8> = self.pgbuf.slot(idx).page.as_bytes().to_vec();
            self.file.write_page(phy, &bytes)?;
            self.pgbuf.slot_mut(idx).dirty = false;
            // append pages stay dirty-capable; they are re-marked on the
            // next byte written
        }
        self.file.sync()?;
        self.hdr.eof_lsa = self.hdr.append_lsa;
        self.write_header()?;
        self.nxio_lsa = self.hdr.append_lsa;
        tracing::debug!(flushed = %self.nxio_lsa, "log flushed");
        Ok(())
    }

    pub fn write_header(&mut self) -> Result<()> {
        let mut page = vec![0u8; self.cfg.log_page_size];
        self.hdr.encode(&mut page);
        self.file.write_page(0, &page)?;
        self.file.sync()?;
        Ok(())
    }

    /// Write-ahead rule enforcement: nothing above `lsa` may reach a data
    /// volume until the log covering it is durable.
    pub fn flush_log_for_wal(&mut self, lsa: Lsa) -> Result<()> {
        if lsa >= self.nxio_lsa {
            self.flush_all_append_pages()?;
        }
        Ok(())
    }

    pub fn mark_shutdown(&mut self, clean: bool) -> Result<()> {
        self.hdr.is_shutdown = clean;
        self.write_header()
    }

    pub fn reset_chkpt_counter(&mut self) {
        self.pages_since_chkpt = 0;
        self.wants_chkpt = false;
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ------------------------------------------------------------- read

    /// Decode the record at `lsa`.
    pub fn read_record(&mut self, lsa: Lsa) -> Result<LogRecord> {
        let mut reader = LogReader::new(self, lsa)?;
        let hdr_bytes = reader.read_bytes(RecordHeader::SIZE)?;
        let header = RecordHeader::decode(&hdr_bytes, lsa)?;
        let body = RecordBody::decode(header.rectype, &mut reader)?;
        Ok(LogRecord { lsa, header, body })
    }

    /// Read the record type at `lsa` without decoding the body.
    pub fn peek_header(&mut self, lsa: Lsa) -> Result<RecordHeader> {
        let mut reader = LogReader::new(self, lsa)?;
        let hdr_bytes = reader.read_bytes(RecordHeader::SIZE)?;
        RecordHeader::decode(&hdr_bytes, lsa)
    }
}

/// Forward byte reader over log pages; copies pages out of the buffer so
/// the underlying slots stay evictable.
pub struct LogReader<'a> {
    log: &'a mut LogInner,
    page: LogPage,
    pos: Lsa,
}

impl<'a> LogReader<'a> {
    pub fn new(log: &'a mut LogInner, start: Lsa) -> Result<Self> {
        let page = log.fetch_page_copy(start.pageid)?;
        Ok(Self {
            log,
            page,
            pos: start,
        })
    }

    fn advance_page(&mut self) -> Result<()> {
        let next = self.pos.pageid + 1;
        self.page = self.log.fetch_page_copy(next)?;
        self.pos = Lsa::new(next, 0);
        Ok(())
    }
}

impl RecordRead for LogReader<'_> {
    fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let payload_size = self.page.payload_size();
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            if self.pos.offset as usize >= payload_size {
                self.advance_page()?;
            }
            let offset = self.pos.offset as usize;
            let take = (n - out.len()).min(payload_size - offset);
            out.put_slice(&self.page.payload()[offset..offset + take]);
            self.pos.offset += take as i16;
        }
        Ok(out.freeze())
    }

    fn position(&self) -> Lsa {
        self.pos
    }
}

/// Next record position when a `forw_lsa` was never back-patched (the
/// record was the last one on its page when the page was sealed or
/// archived): realign to the first record start on a following page.
fn realign_forward(log: &mut LogInner, after: Lsa, limit: Lsa) -> Result<Lsa> {
    let mut pageid = after.pageid + 1;
    while pageid <= limit.pageid {
        let page = log.fetch_page_copy(pageid)?;
        let first = page.offset_first_record();
        if first != NO_FIRST_RECORD {
            return Ok(Lsa::new(pageid, first));
        }
        pageid += 1;
    }
    Ok(Lsa::NULL)
}

/// Walk records forward from `start` (inclusive), stopping at the append
/// frontier. The callback returns `false` to stop early.
pub fn scan_forward(
    log: &mut LogInner,
    start: Lsa,
    limit: Lsa,
    mut f: impl FnMut(&mut LogInner, &LogRecord) -> Result<bool>,
) -> Result<()> {
    let mut lsa = start;
    while !lsa.is_null() && lsa < limit {
        let record = match log.read_record(lsa) {
            Ok(r) => r,
            Err(e) if e.is_corruption() => {
                tracing::warn!(%lsa, "stopping log scan on corrupt record: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut forw = record.header.forw_lsa;
        if !f(log, &record)? {
            return Ok(());
        }
        if record.header.rectype == RecordType::EndOfLog {
            return Ok(());
        }
        if forw.is_null() {
            forw = realign_forward(log, lsa, limit)?;
            if forw.is_null() {
                return Ok(());
            }
        }
        if forw <= lsa {
            return Err(Error::LogRecordCorrupted(lsa));
        }
        lsa = forw;
    }
    Ok(())
}
