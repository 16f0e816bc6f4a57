//! Disk manager: volume formatting, sector/page allocation bitmaps, the
//! per-purpose free-space cache and postponed deallocation.
//!
//! Every mutation of a permanent volume is logged through the WAL with
//! images precise enough to replay set/clear operations idempotently.
//! Temp-purpose volumes bypass the log entirely; their pages carry the
//! temporary-LSA sentinel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::{self, VolumeFile, PAGE_LSA_PREFIX, TEMP_PAGE_LSA};
use crate::log::LogInner;
use crate::lsa::Lsa;
use crate::record::{RcvAddr, RecordBody, RvIndex};
use crate::recovery::rvfun::{
    self, AllocTableImage, AllocTableInitImage, DeallocImage, DeallocKind, Rcv, VhdrDeltaImage,
};
use crate::tran::TranLog;

pub mod bitmap;
pub mod cache;
pub mod header;

use bitmap::{bits_per_page, RunScan};
use cache::{Contiguity, PurposeCache};
use header::{Hfid, VolHeader, VolPurpose, NULL_VOLID, SECT_NPGS, SPECIAL_SECTOR};

pub const NULL_PAGEID: i32 = -1;

/// Log context for a disk mutation: who is logging and through what.
pub struct LogCtx<'a> {
    pub log: &'a mut LogInner,
    pub trid: i32,
    pub tlog: &'a mut TranLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAlloc {
    Allocated(i32),
    /// Nothing found here; the flag tells the caller whether the volume
    /// still has enough scattered free pages (contiguity was the problem).
    NoSpace { enough_free_pages: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolCheck {
    Valid,
    Invalid,
    Repaired,
}

#[derive(Debug)]
pub struct Volume {
    pub volid: i16,
    pub hdr: VolHeader,
    file: VolumeFile,
    /// Next power-of-two divisor of `warnat` that will fire a warning;
    /// makes the space warnings progressively quieter.
    warn_shift: u32,
}

impl Volume {
    fn bits_pp(&self, io_page_size: usize) -> i32 {
        bits_per_page(io_page_size - PAGE_LSA_PREFIX)
    }
}

#[derive(Debug, Default)]
struct DataCache {
    pages: hashbrown::HashMap<(i16, i32), Vec<u8>>,
    /// Oldest LSA stamped on a cached WAL-protected page; the checkpoint
    /// redo bound.
    oldest_dirty_lsa: Option<Lsa>,
}

#[derive(Debug)]
pub struct DiskManager {
    dbname: String,
    dir: PathBuf,
    io_page_size: usize,
    vols: Mutex<BTreeMap<i16, Arc<Mutex<Volume>>>>,
    pub cache: PurposeCache,
    data_cache: Mutex<DataCache>,
}

impl DiskManager {
    pub fn new(dbname: &str, dir: &Path, io_page_size: usize) -> Self {
        Self {
            dbname: dbname.to_owned(),
            dir: dir.to_owned(),
            io_page_size,
            vols: Mutex::new(BTreeMap::new()),
            cache: PurposeCache::new(),
            data_cache: Mutex::new(DataCache::default()),
        }
    }

    pub fn vol_path(&self, volid: i16) -> PathBuf {
        if volid == 0 {
            self.dir.join(&self.dbname)
        } else {
            self.dir.join(format!("{}_x{volid:03}", self.dbname))
        }
    }

    fn content_size(&self) -> usize {
        self.io_page_size - PAGE_LSA_PREFIX
    }

    fn get_vol(&self, volid: i16) -> Result<Arc<Mutex<Volume>>> {
        self.vols
            .lock()
            .get(&volid)
            .cloned()
            .ok_or(Error::UnknownVolume(volid))
    }

    pub fn volids(&self) -> Vec<i16> {
        self.vols.lock().keys().copied().collect()
    }

    pub fn max_volid(&self) -> Option<i16> {
        self.vols.lock().keys().next_back().copied()
    }

    // --------------------------------------------------------- page io

    fn read_page(&self, vol: &Volume, pageid: i32) -> Result<Vec<u8>> {
        if pageid < 0 || pageid >= vol.hdr.total_pages {
            return Err(Error::BadPageId {
                volid: vol.volid,
                pageid,
            });
        }
        if let Some(page) = self.data_cache.lock().pages.get(&(vol.volid, pageid)) {
            return Ok(page.clone());
        }
        let mut page = vec![0u8; self.io_page_size];
        vol.file.read_page(pageid, &mut page)?;
        Ok(page)
    }

    fn cache_write(&self, volid: i16, pageid: i32, page: Vec<u8>, lsa: Lsa, wal: bool) {
        let mut cache = self.data_cache.lock();
        cache.pages.insert((volid, pageid), page);
        if wal {
            cache.oldest_dirty_lsa = Some(match cache.oldest_dirty_lsa {
                Some(old) if old <= lsa => old,
                _ => lsa,
            });
        }
    }

    /// Oldest LSA a crash could lose from the data cache; recovery must
    /// start redo at or before it.
    pub fn oldest_dirty_lsa(&self) -> Option<Lsa> {
        self.data_cache.lock().oldest_dirty_lsa
    }

    /// Write every cached page to its volume. The single log flush up
    /// front satisfies the write-ahead rule for all of them.
    pub fn flush_all(&self, log: &mut LogInner) -> Result<()> {
        let (pages, had_wal) = {
            let mut cache = self.data_cache.lock();
            if cache.pages.is_empty() {
                return Ok(());
            }
            let had_wal = cache.oldest_dirty_lsa.take().is_some();
            (std::mem::take(&mut cache.pages), had_wal)
        };
        if had_wal {
            log.flush_all_append_pages()?;
        }
        let mut touched = Vec::new();
        for ((volid, pageid), page) in pages {
            let vol_arc = self.get_vol(volid)?;
            let vol = vol_arc.lock();
            vol.file.write_page(pageid, &page)?;
            if !touched.contains(&volid) {
                touched.push(volid);
            }
        }
        for volid in touched {
            let vol_arc = self.get_vol(volid)?;
            vol_arc.lock().file.sync()?;
        }
        Ok(())
    }

    /// One page mutation, logged when the volume is WAL-protected, and
    /// funneled through the recovery function so replay is identical.
    /// Header-page mutations refresh the decoded copy afterwards; the
    /// page bytes are the single source of truth.
    fn apply_logged(
        &self,
        ctx: &mut LogCtx<'_>,
        vol: &mut Volume,
        pageid: i32,
        rcvindex: RvIndex,
        offset: i16,
        undo: Option<Bytes>,
        redo: Bytes,
    ) -> Result<Lsa> {
        let logged = !vol.hdr.purpose.is_temp();
        let lsa = if logged {
            let rcv = RcvAddr {
                rcvindex,
                volid: vol.volid,
                pageid,
                offset,
            };
            let body = match undo {
                Some(undo) => RecordBody::UndoRedo {
                    rcv,
                    undo,
                    redo: redo.clone(),
                    diff: false,
                },
                None => RecordBody::Redo {
                    rcv,
                    data: redo.clone(),
                },
            };
            ctx.log.append(ctx.trid, ctx.tlog, &body)?
        } else {
            TEMP_PAGE_LSA
        };
        let mut page = self.read_page(vol, pageid)?;
        rvfun::apply_redo(
            rcvindex,
            io::page_content_mut(&mut page),
            &Rcv {
                offset,
                data: &redo,
                lsa,
            },
        )?;
        io::set_page_lsa(&mut page, lsa);
        if pageid == 0 {
            vol.hdr = VolHeader::decode(io::page_content(&page), vol.volid)?;
        }
        self.cache_write(vol.volid, pageid, page, lsa, logged);
        Ok(lsa)
    }

    /// Run-postpone application of a generic redo image; used by the
    /// commit-time postpone executor.
    pub fn apply_run_postpone(
        &self,
        ctx: &mut LogCtx<'_>,
        rcv: RcvAddr,
        data: Bytes,
        ref_lsa: Lsa,
    ) -> Result<()> {
        let vol_arc = self.get_vol(rcv.volid)?;
        let mut vol = vol_arc.lock();
        let logged = !vol.hdr.purpose.is_temp();
        let lsa = if logged {
            ctx.log.append(
                ctx.trid,
                ctx.tlog,
                &RecordBody::RunPostpone {
                    rcv,
                    ref_lsa,
                    data: data.clone(),
                },
            )?
        } else {
            TEMP_PAGE_LSA
        };
        let mut page = self.read_page(&vol, rcv.pageid)?;
        rvfun::apply_redo(
            rcv.rcvindex,
            io::page_content_mut(&mut page),
            &Rcv {
                offset: rcv.offset,
                data: &data,
                lsa,
            },
        )?;
        io::set_page_lsa(&mut page, lsa);
        if rcv.pageid == 0 {
            vol.hdr = VolHeader::decode(io::page_content(&page), vol.volid)?;
        }
        self.cache_write(vol.volid, rcv.pageid, page, lsa, logged);
        Ok(())
    }

    /// Apply an undo image during rollback or the recovery undo pass.
    /// The page is stamped with the compensation record's LSA.
    pub fn apply_undo_page(&self, rcv: RcvAddr, undo: &[u8], clr_lsa: Lsa) -> Result<()> {
        let vol_arc = self.get_vol(rcv.volid)?;
        let mut vol = vol_arc.lock();
        let logged = !vol.hdr.purpose.is_temp();
        let mut page = self.read_page(&vol, rcv.pageid)?;
        rvfun::apply_undo(
            rcv.rcvindex,
            io::page_content_mut(&mut page),
            &Rcv {
                offset: rcv.offset,
                data: undo,
                lsa: clr_lsa,
            },
        )?;
        let stamp = if logged { clr_lsa } else { TEMP_PAGE_LSA };
        io::set_page_lsa(&mut page, stamp);
        if rcv.pageid == 0 {
            vol.hdr = VolHeader::decode(io::page_content(&page), vol.volid)?;
        }
        self.cache_write(vol.volid, rcv.pageid, page, stamp, logged);
        Ok(())
    }

    // ---------------------------------------------------------- format

    /// Create and initialize a volume. For `TempTemp` the allocation
    /// tables are sized for `max_npages` so later expansion never needs a
    /// re-layout.
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        purpose: VolPurpose,
        npages: i32,
        max_npages: i32,
        remarks: &str,
        db_creation: i64,
    ) -> Result<i16> {
        if !purpose.storable() {
            return Err(Error::UnknownPurpose);
        }
        let path = self.vol_path(volid);
        let fullname = path.display().to_string();
        if fullname.len() + 1 > header::MAX_VOL_FULLNAME {
            return Err(Error::FullDatabaseNameTooLong(fullname));
        }

        let bits_pp = bits_per_page(self.content_size());
        let table_base_pages = if purpose == VolPurpose::TempTemp && max_npages > npages {
            max_npages
        } else {
            npages
        };
        let total_sects_max = ceil_div(table_base_pages, SECT_NPGS);
        let sect_alloctb_npages = ceil_div(total_sects_max, bits_pp).max(1);
        let page_alloctb_npages = ceil_div(table_base_pages, bits_pp).max(1);
        let sect_alloctb_page1 = 1;
        let page_alloctb_page1 = sect_alloctb_page1 + sect_alloctb_npages;
        let sys_lastpage = page_alloctb_page1 + page_alloctb_npages - 1;
        if npages <= sys_lastpage + 1 {
            return Err(Error::FormatBadNpages(npages));
        }

        let total_sects = ceil_div(npages, SECT_NPGS);
        let free_pages = npages - (sys_lastpage + 1);
        let hdr = VolHeader {
            iopagesize: self.io_page_size as i32,
            volid,
            purpose,
            sect_npgs: SECT_NPGS,
            total_pages: npages,
            free_pages,
            total_sects,
            // the special sector is never free
            free_sects: total_sects - 1,
            hint_allocsect: 1,
            sect_alloctb_npages,
            page_alloctb_npages,
            sect_alloctb_page1,
            page_alloctb_page1,
            sys_lastpage,
            warnat: (npages / 20).max(10),
            db_creation,
            chkpt_lsa: Lsa::NULL,
            boot_hfid: Hfid::default(),
            vol_fullname: fullname.clone(),
            next_vol_fullname: String::new(),
            vol_remarks: remarks.to_owned(),
        };
        let hdr_image = Bytes::from(hdr.encode(self.content_size())?);

        let file = VolumeFile::format(&path, self.io_page_size, npages)?;
        let vol = Volume {
            volid,
            hdr: hdr.clone(),
            file,
            warn_shift: 0,
        };
        let vol_arc = Arc::new(Mutex::new(vol));
        self.vols.lock().insert(volid, vol_arc.clone());

        {
            let mut vol = vol_arc.lock();
            // header: redo re-creates it, the logical undo deletes the file
            self.apply_logged(
                ctx,
                &mut vol,
                0,
                RvIndex::VolHeaderFormat,
                0,
                Some(Bytes::copy_from_slice(fullname.as_bytes())),
                hdr_image,
            )?;

            // sector table: sector 0 (special) pre-allocated
            for tp in 0..sect_alloctb_npages {
                let lo = tp * bits_pp;
                let img = AllocTableInitImage {
                    nset_prefix: (1 - lo).clamp(0, bits_pp),
                    first_invalid: (total_sects - lo).clamp(0, bits_pp),
                };
                self.apply_logged(
                    ctx,
                    &mut vol,
                    sect_alloctb_page1 + tp,
                    RvIndex::AllocTableInit,
                    0,
                    None,
                    img.to_bytes(),
                )?;
            }
            // page table: system pages [0, sys_lastpage] pre-allocated
            for tp in 0..page_alloctb_npages {
                let lo = tp * bits_pp;
                let img = AllocTableInitImage {
                    nset_prefix: (sys_lastpage + 1 - lo).clamp(0, bits_pp),
                    first_invalid: (npages - lo).clamp(0, bits_pp),
                };
                self.apply_logged(
                    ctx,
                    &mut vol,
                    page_alloctb_page1 + tp,
                    RvIndex::AllocTableInit,
                    0,
                    None,
                    img.to_bytes(),
                )?;
            }
        }

        self.cache
            .note_volume(volid, purpose, npages, free_pages, hdr.warnat);
        self.append_vinf(volid, &fullname);
        tracing::info!(volid, ?purpose, npages, "volume formatted");
        Ok(volid)
    }

    fn append_vinf(&self, volid: i16, fullname: &str) {
        use std::io::Write;
        let path = self.dir.join(format!("{}_vinf", self.dbname));
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{volid} {fullname}");
        }
    }

    /// Drop cached pages and delete the volume file.
    pub fn unformat(&self, volid: i16) -> Result<()> {
        let vol_arc = {
            let mut vols = self.vols.lock();
            vols.remove(&volid).ok_or(Error::UnknownVolume(volid))?
        };
        self.data_cache
            .lock()
            .pages
            .retain(|(v, _), _| *v != volid);
        self.cache.forget_volume(volid);
        match Arc::try_unwrap(vol_arc) {
            Ok(m) => m.into_inner().file.unformat()?,
            Err(arc) => {
                // someone still holds the volume; delete by path instead
                let path = arc.lock().hdr.vol_fullname.clone();
                std::fs::remove_file(path)?;
            }
        }
        tracing::info!(volid, "volume unformatted");
        Ok(())
    }

    pub fn unformat_by_fullname(&self, fullname: &str) -> Result<()> {
        let volid = {
            let vols = self.vols.lock();
            vols.iter()
                .find(|(_, v)| v.lock().hdr.vol_fullname == fullname)
                .map(|(id, _)| *id)
        };
        match volid {
            Some(volid) => self.unformat(volid),
            None => {
                // never mounted in this life; remove the file if it exists
                if Path::new(fullname).exists() {
                    std::fs::remove_file(fullname)?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------ allocation

    /// Scan a whole allocation table for a clear run of `run_len` within
    /// `[lo_bit, hi_bit)`, continuing runs across table pages.
    fn find_run_in_table(
        &self,
        vol: &Volume,
        table_page1: i32,
        lo_bit: i32,
        hi_bit: i32,
        run_len: i32,
    ) -> Result<Option<i32>> {
        if lo_bit >= hi_bit {
            return Ok(None);
        }
        let bits_pp = vol.bits_pp(self.io_page_size);
        let mut carry = 0i32;
        let first_tp = lo_bit / bits_pp;
        let last_tp = (hi_bit - 1) / bits_pp;
        for tp in first_tp..=last_tp {
            let page = self.read_page(vol, table_page1 + tp)?;
            let content = io::page_content(&page);
            let local_from = (lo_bit - tp * bits_pp).max(0);
            let local_to = (hi_bit - tp * bits_pp).min(bits_pp);
            match bitmap::find_clear_run(content, local_from, local_to, run_len, carry) {
                RunScan::Found(local_start) => {
                    return Ok(Some(tp * bits_pp + local_start));
                }
                RunScan::Carry(c) => carry = c,
            }
        }
        Ok(None)
    }

    /// Set or clear `nbits` starting at `start_bit` in an allocation
    /// table, logging one record per touched table page.
    fn update_table_bits(
        &self,
        ctx: &mut LogCtx<'_>,
        vol: &mut Volume,
        table_page1: i32,
        start_bit: i32,
        nbits: i32,
        set: bool,
    ) -> Result<()> {
        let bits_pp = vol.bits_pp(self.io_page_size);
        let mut bit = start_bit;
        let end = start_bit + nbits;
        while bit < end {
            let tp = bit / bits_pp;
            let local_start = bit - tp * bits_pp;
            let seg = (end - bit).min(bits_pp - local_start);
            let img = AllocTableImage {
                set,
                start_bit: local_start,
                nbits: seg,
            };
            self.apply_logged(
                ctx,
                vol,
                table_page1 + tp,
                RvIndex::AllocTableSet,
                0,
                Some(img.inverse().to_bytes()),
                img.to_bytes(),
            )?;
            bit += seg;
        }
        Ok(())
    }

    fn count_clear_in_table(
        &self,
        vol: &Volume,
        table_page1: i32,
        table_npages: i32,
        total_bits: i32,
    ) -> Result<i32> {
        let bits_pp = vol.bits_pp(self.io_page_size);
        let mut clear = 0;
        for tp in 0..table_npages {
            let page = self.read_page(vol, table_page1 + tp)?;
            let valid = (total_bits - tp * bits_pp).clamp(0, bits_pp);
            if valid == 0 {
                break;
            }
            clear += bitmap::count_clear(io::page_content(&page), valid);
        }
        Ok(clear)
    }

    /// Does this sector still hold `want` contiguous free pages?
    fn sector_has_room(&self, vol: &Volume, sect: i32, want: i32) -> Result<bool> {
        let lo = (sect * vol.hdr.sect_npgs).max(vol.hdr.sys_lastpage + 1);
        let hi = ((sect + 1) * vol.hdr.sect_npgs).min(vol.hdr.total_pages);
        Ok(self
            .find_run_in_table(vol, vol.hdr.page_alloctb_page1, lo, hi, want)?
            .is_some())
    }

    /// Allocate `nsects` contiguous sectors, rotating from the hint and
    /// wrapping once. Falls back to the special sector when the volume is
    /// exhausted or no candidate sector can host `exp_pages_in_sector`.
    pub fn alloc_sector(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        nsects: i32,
        exp_pages_in_sector: i32,
    ) -> Result<i32> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        let total = vol.hdr.total_sects;
        let hint = vol.hdr.hint_allocsect.clamp(1, (total - 1).max(1));

        let sect_table = vol.hdr.sect_alloctb_page1;
        let windows = [(hint, total), (1, hint)];
        for (lo, hi) in windows {
            let mut from = lo;
            while from < hi {
                let found = self.find_run_in_table(&vol, sect_table, from, hi, nsects)?;
                let Some(sect) = found else { break };
                if nsects == 1
                    && exp_pages_in_sector > 0
                    && !self.sector_has_room(&vol, sect, exp_pages_in_sector)?
                {
                    from = sect + 1;
                    continue;
                }
                self.update_table_bits(ctx, &mut vol, sect_table, sect, nsects, true)?;
                let new_hint = if sect + nsects >= total { 1 } else { sect + nsects };
                let img = VhdrDeltaImage {
                    delta: nsects,
                    new_hint,
                };
                self.apply_logged(
                    ctx,
                    &mut vol,
                    0,
                    RvIndex::VhdrSectAlloc,
                    0,
                    Some(img.to_bytes()),
                    img.to_bytes(),
                )?;
                return Ok(sect);
            }
        }
        // exhausted: hand out the special sector spanning the whole volume
        Ok(SPECIAL_SECTOR)
    }

    /// Allocate `npages` contiguous pages within `sect` (or anywhere for
    /// the special sector), preferring pages at or after `near_page`.
    pub fn alloc_page(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        sect: i32,
        npages: i32,
        near_page: Option<i32>,
    ) -> Result<PageAlloc> {
        if npages <= 0 {
            return Err(Error::BadPageId { volid, pageid: -1 });
        }
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        let (lo, hi) = if sect == SPECIAL_SECTOR {
            (vol.hdr.sys_lastpage + 1, vol.hdr.total_pages)
        } else {
            (
                (sect * vol.hdr.sect_npgs).max(vol.hdr.sys_lastpage + 1),
                ((sect + 1) * vol.hdr.sect_npgs).min(vol.hdr.total_pages),
            )
        };
        let near = near_page.unwrap_or(lo).clamp(lo, hi.max(lo));
        let page_table = vol.hdr.page_alloctb_page1;

        let found = match self.find_run_in_table(&vol, page_table, near, hi, npages)? {
            Some(p) => Some(p),
            None => self.find_run_in_table(&vol, page_table, lo, hi, npages)?,
        };
        let Some(first) = found else {
            return Ok(PageAlloc::NoSpace {
                enough_free_pages: vol.hdr.free_pages >= npages,
            });
        };

        self.update_table_bits(ctx, &mut vol, page_table, first, npages, true)?;
        // a special-sector grab that lands in the hinted sector pushes the
        // hint forward so sector allocation stops fighting it
        let new_hint = if sect == SPECIAL_SECTOR
            && first / vol.hdr.sect_npgs == vol.hdr.hint_allocsect
        {
            let advanced = (first + npages - 1) / vol.hdr.sect_npgs + 1;
            if advanced >= vol.hdr.total_sects {
                1
            } else {
                advanced
            }
        } else {
            -1
        };
        let img = VhdrDeltaImage {
            delta: npages,
            new_hint,
        };
        self.apply_logged(
            ctx,
            &mut vol,
            0,
            RvIndex::VhdrPgAlloc,
            0,
            Some(img.to_bytes()),
            img.to_bytes(),
        )?;
        self.cache.apply_delta(volid, -npages);
        self.maybe_warn_space(&mut vol);
        Ok(PageAlloc::Allocated(first))
    }

    fn maybe_warn_space(&self, vol: &mut Volume) {
        let threshold = vol.hdr.warnat >> vol.warn_shift;
        if threshold > 0 && vol.hdr.free_pages <= threshold {
            tracing::warn!(
                volid = vol.volid,
                free = vol.hdr.free_pages,
                "volume is running low on free pages"
            );
            vol.warn_shift += 1;
        }
    }

    // ---------------------------------------------------- deallocation

    /// Deallocations are postponed so they take effect only if the
    /// transaction commits.
    pub fn dealloc_page(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        pageid: i32,
        npages: i32,
    ) -> Result<()> {
        let vol_arc = self.get_vol(volid)?;
        let vol = vol_arc.lock();
        if pageid <= vol.hdr.sys_lastpage || pageid + npages > vol.hdr.total_pages {
            return Err(Error::BadPageId { volid, pageid });
        }
        let img = DeallocImage {
            kind: DeallocKind::Page,
            start: pageid,
            count: npages,
        };
        if vol.hdr.purpose.is_temp() {
            drop(vol);
            return self.run_dealloc(ctx, volid, img, Lsa::NULL);
        }
        ctx.log.append(
            ctx.trid,
            ctx.tlog,
            &RecordBody::Postpone {
                rcv: RcvAddr {
                    rcvindex: RvIndex::IdDeallocWithVolheader,
                    volid,
                    pageid: 0,
                    offset: 0,
                },
                data: img.to_bytes(),
            },
        )?;
        Ok(())
    }

    pub fn dealloc_sector(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        sectid: i32,
        nsects: i32,
    ) -> Result<()> {
        if sectid == SPECIAL_SECTOR {
            // the special sector is never really allocated
            return Ok(());
        }
        let vol_arc = self.get_vol(volid)?;
        let vol = vol_arc.lock();
        let img = DeallocImage {
            kind: DeallocKind::Sector,
            start: sectid,
            count: nsects,
        };
        if vol.hdr.purpose.is_temp() {
            drop(vol);
            return self.run_dealloc(ctx, volid, img, Lsa::NULL);
        }
        ctx.log.append(
            ctx.trid,
            ctx.tlog,
            &RecordBody::Postpone {
                rcv: RcvAddr {
                    rcvindex: RvIndex::IdDeallocWithVolheader,
                    volid,
                    pageid: 0,
                    offset: 0,
                },
                data: img.to_bytes(),
            },
        )?;
        Ok(())
    }

    /// Execute a postponed deallocation: bitmap clear and header counters
    /// as two linked redo-only mutations, each latching its own page.
    pub fn run_dealloc(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        img: DeallocImage,
        ref_lsa: Lsa,
    ) -> Result<()> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        let logged = !vol.hdr.purpose.is_temp();
        let bits_pp = vol.bits_pp(self.io_page_size);
        let table_page1 = match img.kind {
            DeallocKind::Page => vol.hdr.page_alloctb_page1,
            DeallocKind::Sector => vol.hdr.sect_alloctb_page1,
        };

        // bitmap-only records, one per touched table page
        let mut bit = img.start;
        let end = img.start + img.count;
        while bit < end {
            let tp = bit / bits_pp;
            let local_start = bit - tp * bits_pp;
            let seg = (end - bit).min(bits_pp - local_start);
            let seg_img = DeallocImage {
                kind: img.kind,
                start: local_start,
                count: seg,
            };
            self.run_postpone_apply(
                ctx,
                &mut vol,
                table_page1 + tp,
                RvIndex::IdDeallocBitmapOnly,
                seg_img,
                ref_lsa,
                logged,
            )?;
            bit += seg;
        }

        // header-counter record, latching the header page on its own
        let vhdr_img = DeallocImage {
            kind: img.kind,
            start: 0,
            count: img.count,
        };
        self.run_postpone_apply(
            ctx,
            &mut vol,
            0,
            RvIndex::IdDeallocVhdrOnly,
            vhdr_img,
            ref_lsa,
            logged,
        )?;

        if img.kind == DeallocKind::Page {
            self.cache.apply_delta(volid, img.count);
        }
        Ok(())
    }

    fn run_postpone_apply(
        &self,
        ctx: &mut LogCtx<'_>,
        vol: &mut Volume,
        pageid: i32,
        rcvindex: RvIndex,
        img: DeallocImage,
        ref_lsa: Lsa,
        logged: bool,
    ) -> Result<()> {
        let data = img.to_bytes();
        let lsa = if logged {
            ctx.log.append(
                ctx.trid,
                ctx.tlog,
                &RecordBody::RunPostpone {
                    rcv: RcvAddr {
                        rcvindex,
                        volid: vol.volid,
                        pageid,
                        offset: 0,
                    },
                    ref_lsa,
                    data: data.clone(),
                },
            )?
        } else {
            TEMP_PAGE_LSA
        };
        let mut page = self.read_page(vol, pageid)?;
        rvfun::apply_redo(
            rcvindex,
            io::page_content_mut(&mut page),
            &Rcv {
                offset: 0,
                data: &data,
                lsa,
            },
        )?;
        io::set_page_lsa(&mut page, lsa);
        if pageid == 0 {
            vol.hdr = VolHeader::decode(io::page_content(&page), vol.volid)?;
        }
        self.cache_write(vol.volid, pageid, page, lsa, logged);
        Ok(())
    }

    // ----------------------------------------------------- consistency

    /// Recompute free counters from the bitmaps and compare with the
    /// header; optionally repair the header with logged deltas.
    pub fn check(&self, ctx: &mut LogCtx<'_>, volid: i16, repair: bool) -> Result<VolCheck> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        let free_pages = self.count_clear_in_table(
            &vol,
            vol.hdr.page_alloctb_page1,
            vol.hdr.page_alloctb_npages,
            vol.hdr.total_pages,
        )?;
        let free_sects = self.count_clear_in_table(
            &vol,
            vol.hdr.sect_alloctb_page1,
            vol.hdr.sect_alloctb_npages,
            vol.hdr.total_sects,
        )?;
        let pages_ok = free_pages == vol.hdr.free_pages;
        let sects_ok = free_sects == vol.hdr.free_sects;
        if pages_ok && sects_ok {
            return Ok(VolCheck::Valid);
        }
        tracing::warn!(
            volid,
            hdr_free = vol.hdr.free_pages,
            bitmap_free = free_pages,
            "volume header and bitmap disagree"
        );
        if !repair {
            return Ok(VolCheck::Invalid);
        }
        if !pages_ok {
            let img = VhdrDeltaImage {
                delta: vol.hdr.free_pages - free_pages,
                new_hint: -1,
            };
            self.apply_logged(ctx, &mut vol, 0, RvIndex::VhdrPgAlloc, 0, None, img.to_bytes())?;
        }
        if !sects_ok {
            let img = VhdrDeltaImage {
                delta: vol.hdr.free_sects - free_sects,
                new_hint: -1,
            };
            self.apply_logged(ctx, &mut vol, 0, RvIndex::VhdrSectAlloc, 0, None, img.to_bytes())?;
        }
        Ok(VolCheck::Repaired)
    }

    // -------------------------------------------------- header fields

    fn logged_header_update(
        &self,
        ctx: &mut LogCtx<'_>,
        volid: i16,
        rcvindex: RvIndex,
        mutate: impl FnOnce(&mut VolHeader),
    ) -> Result<()> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        let old_image = Bytes::from(vol.hdr.encode(self.content_size())?);
        let mut new_hdr = vol.hdr.clone();
        mutate(&mut new_hdr);
        let new_image = Bytes::from(new_hdr.encode(self.content_size())?);
        self.apply_logged(ctx, &mut vol, 0, rcvindex, 0, Some(old_image), new_image)?;
        Ok(())
    }

    /// Link `volid` to the freshly formatted next volume. Logged with
    /// full images because the variable strings repack.
    pub fn set_link(&self, ctx: &mut LogCtx<'_>, volid: i16, next_fullname: &str) -> Result<()> {
        let next = next_fullname.to_owned();
        self.logged_header_update(ctx, volid, RvIndex::VolHeaderLink, move |hdr| {
            hdr.next_vol_fullname = next;
        })
    }

    pub fn set_boot_hfid(&self, ctx: &mut LogCtx<'_>, volid: i16, hfid: Hfid) -> Result<()> {
        self.logged_header_update(ctx, volid, RvIndex::VolHeaderBootHfid, move |hdr| {
            hdr.boot_hfid = hfid;
        })
    }

    pub fn set_creation_time(&self, ctx: &mut LogCtx<'_>, volid: i16, time: i64) -> Result<()> {
        self.logged_header_update(ctx, volid, RvIndex::VolHeaderCreation, move |hdr| {
            hdr.db_creation = time;
        })
    }

    /// Checkpoint stamps are recovery metadata and bypass the log.
    pub fn set_checkpoint(&self, volid: i16, chkpt_lsa: Lsa) -> Result<()> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        vol.hdr.chkpt_lsa = chkpt_lsa;
        let content = vol.hdr.encode(self.content_size())?;
        let mut page = self.read_page(&vol, 0)?;
        let lsa = io::page_lsa(&page);
        io::page_content_mut(&mut page).copy_from_slice(&content);
        self.cache_write(vol.volid, 0, page, lsa, false);
        Ok(())
    }

    pub fn get_checkpoint(&self, volid: i16) -> Result<Lsa> {
        Ok(self.get_vol(volid)?.lock().hdr.chkpt_lsa)
    }

    pub fn purpose(&self, volid: i16) -> Result<VolPurpose> {
        Ok(self.get_vol(volid)?.lock().hdr.purpose)
    }

    pub fn free_pages(&self, volid: i16) -> Result<i32> {
        Ok(self.get_vol(volid)?.lock().hdr.free_pages)
    }

    pub fn hint_allocsect(&self, volid: i16) -> Result<i32> {
        Ok(self.get_vol(volid)?.lock().hdr.hint_allocsect)
    }

    // ------------------------------------------------------ expansion

    /// Grow a TEMP_TEMP volume in place; its tables were pre-sized for
    /// this. `max_pages < 0` means unlimited.
    pub fn expand_temp(&self, volid: i16, add_pages: i32, max_pages: i32) -> Result<i32> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        if vol.hdr.purpose != VolPurpose::TempTemp {
            return Err(Error::UnknownPurpose);
        }
        let bits_pp = vol.bits_pp(self.io_page_size);
        let capacity = vol.hdr.page_alloctb_npages * bits_pp;
        let mut new_total = vol.hdr.total_pages + add_pages;
        if max_pages >= 0 {
            new_total = new_total.min(max_pages);
        }
        new_total = new_total.min(capacity);
        let grown = new_total - vol.hdr.total_pages;
        if grown <= 0 {
            return Ok(0);
        }
        vol.file.extend(grown)?;

        // open the invalid-bit fence over the new range
        let old_total = vol.hdr.total_pages;
        let mut bit = old_total;
        while bit < new_total {
            let tp = bit / bits_pp;
            let local_start = bit - tp * bits_pp;
            let seg = (new_total - bit).min(bits_pp - local_start);
            let pageid = vol.hdr.page_alloctb_page1 + tp;
            let mut page = self.read_page(&vol, pageid)?;
            bitmap::clear_range(io::page_content_mut(&mut page), local_start, seg);
            io::set_page_lsa(&mut page, TEMP_PAGE_LSA);
            self.cache_write(volid, pageid, page, TEMP_PAGE_LSA, false);
            bit += seg;
        }
        let old_sects = vol.hdr.total_sects;
        let new_sects = ceil_div(new_total, vol.hdr.sect_npgs);
        let mut s = old_sects;
        while s < new_sects {
            let tp = s / bits_pp;
            let local_start = s - tp * bits_pp;
            let seg = (new_sects - s).min(bits_pp - local_start);
            let pageid = vol.hdr.sect_alloctb_page1 + tp;
            let mut page = self.read_page(&vol, pageid)?;
            bitmap::clear_range(io::page_content_mut(&mut page), local_start, seg);
            io::set_page_lsa(&mut page, TEMP_PAGE_LSA);
            self.cache_write(volid, pageid, page, TEMP_PAGE_LSA, false);
            s += seg;
        }

        vol.hdr.free_pages += grown;
        vol.hdr.total_pages = new_total;
        vol.hdr.free_sects += new_sects - old_sects;
        vol.hdr.total_sects = new_sects;
        let content = vol.hdr.encode(self.content_size())?;
        let mut page = self.read_page(&vol, 0)?;
        io::page_content_mut(&mut page).copy_from_slice(&content);
        io::set_page_lsa(&mut page, TEMP_PAGE_LSA);
        self.cache_write(volid, 0, page, TEMP_PAGE_LSA, false);
        self.cache.apply_delta(volid, grown);
        tracing::debug!(volid, grown, new_total, "temporary volume expanded");
        Ok(grown)
    }

    // ----------------------------------------------------- heap bytes

    /// Byte-image mutation of a data page on behalf of the layers above
    /// (heap insert/delete/update). Undo image restores, redo applies.
    pub fn apply_byte_op(
        &self,
        ctx: &mut LogCtx<'_>,
        rcvindex: RvIndex,
        volid: i16,
        pageid: i32,
        offset: i16,
        undo: Bytes,
        redo: Bytes,
    ) -> Result<Lsa> {
        let vol_arc = self.get_vol(volid)?;
        let mut vol = vol_arc.lock();
        if pageid <= vol.hdr.sys_lastpage || pageid >= vol.hdr.total_pages {
            return Err(Error::BadPageId { volid, pageid });
        }
        self.apply_logged(ctx, &mut vol, pageid, rcvindex, offset, Some(undo), redo)
    }

    /// Raw page read for the layers above and for tests.
    pub fn read_data_page(&self, volid: i16, pageid: i32) -> Result<Vec<u8>> {
        let vol_arc = self.get_vol(volid)?;
        let vol = vol_arc.lock();
        self.read_page(&vol, pageid)
    }

    // ------------------------------------------------------- recovery

    /// Page write that bypasses logging; only recovery uses it.
    pub fn recovery_write_page(&self, volid: i16, pageid: i32, page: Vec<u8>) -> Result<()> {
        let lsa = io::page_lsa(&page);
        self.cache_write(volid, pageid, page, lsa, true);
        Ok(())
    }

    /// Make sure the volume a redo record targets is mounted, re-creating
    /// the file from the format image when the crash predates the flush.
    pub fn ensure_volume_for_redo(&self, volid: i16, header_image: &[u8]) -> Result<()> {
        if self.vols.lock().contains_key(&volid) {
            return Ok(());
        }
        let hdr = VolHeader::decode(header_image, volid)?;
        let path = PathBuf::from(&hdr.vol_fullname);
        let file = if path.exists() {
            VolumeFile::open(&path, self.io_page_size)?
        } else {
            VolumeFile::format(&path, self.io_page_size, hdr.total_pages)?
        };
        let free = hdr.free_pages;
        let total = hdr.total_pages;
        let warnat = hdr.warnat;
        let purpose = hdr.purpose;
        self.vols.lock().insert(
            volid,
            Arc::new(Mutex::new(Volume {
                volid,
                hdr,
                file,
                warn_shift: 0,
            })),
        );
        self.cache.note_volume(volid, purpose, total, free, warnat);
        Ok(())
    }

    /// Mount the volume chain starting at the primary volume, following
    /// `next_vol_fullname` links. Stale TEMP_TEMP volumes are destroyed.
    pub fn mount_all(&self) -> Result<usize> {
        let mut mounted = 0;
        let mut next = Some(self.vol_path(0));
        while let Some(path) = next.take() {
            if !path.exists() {
                break;
            }
            let file = VolumeFile::open(&path, self.io_page_size)?;
            let mut page = vec![0u8; self.io_page_size];
            file.read_page(0, &mut page)?;
            let hdr = match VolHeader::decode(io::page_content(&page), NULL_VOLID) {
                Ok(hdr) => hdr,
                Err(e) => {
                    // the crash predates the header flush; the format
                    // record's redo will rebuild this volume
                    tracing::warn!("volume {} not mountable yet: {e}", path.display());
                    break;
                }
            };
            if hdr.purpose == VolPurpose::TempTemp {
                // temp volumes do not survive a restart
                drop(file);
                std::fs::remove_file(&path)?;
                break;
            }
            if !hdr.next_vol_fullname.is_empty() {
                next = Some(PathBuf::from(&hdr.next_vol_fullname));
            }
            let volid = hdr.volid;
            self.cache.note_volume(
                volid,
                hdr.purpose,
                hdr.total_pages,
                hdr.free_pages,
                hdr.warnat,
            );
            self.vols.lock().insert(
                volid,
                Arc::new(Mutex::new(Volume {
                    volid,
                    hdr,
                    file,
                    warn_shift: 0,
                })),
            );
            mounted += 1;
        }
        Ok(mounted)
    }

    /// Reload decoded headers from the (possibly redone) header pages.
    pub fn refresh_headers(&self) -> Result<()> {
        let vols: Vec<_> = self.vols.lock().values().cloned().collect();
        for vol_arc in vols {
            let mut vol = vol_arc.lock();
            let page = self.read_page(&vol, 0)?;
            vol.hdr = VolHeader::decode(io::page_content(&page), vol.volid)?;
        }
        self.rebuild_cache();
        Ok(())
    }

    /// Rebuild the purpose cache by scanning every mounted volume.
    pub fn rebuild_cache(&self) {
        let vols = self.vols.lock();
        let entries: Vec<_> = vols
            .values()
            .map(|v| {
                let v = v.lock();
                (
                    v.volid,
                    v.hdr.purpose,
                    v.hdr.total_pages,
                    v.hdr.free_pages,
                    v.hdr.warnat,
                )
            })
            .collect();
        drop(vols);
        self.cache.rebuild(entries.into_iter());
    }

    pub fn find_good_vol(
        &self,
        purpose: VolPurpose,
        exp_npages: i32,
        undesirable_volid: Option<i16>,
        contiguity: Contiguity,
    ) -> Option<i16> {
        self.cache
            .find_good_vol(purpose, exp_npages, undesirable_volid, contiguity)
    }

    pub fn sync_all(&self) -> Result<()> {
        let vols: Vec<_> = self.vols.lock().values().cloned().collect();
        for vol in vols {
            vol.lock().file.sync()?;
        }
        Ok(())
    }
}

fn ceil_div(a: i32, b: i32) -> i32 {
    (a + b - 1) / b
}
