//! Page cache over the master's copied active log and archives.
//!
//! The master ships `<db>_lgat` and `<db>_lgar<nnn>` files into a local
//! directory; pages below `nxarv_pageid` come from archives located by
//! their headers. Reads retry a bounded number of times with a re-open in
//! between, because a file may be mid-copy when we get to it.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use marlin_storage::io::VolumeFile;
use marlin_storage::log::header::{ActiveLogHeader, ArchiveLogHeader};
use marlin_storage::log::page::{LogPage, LOG_PAGE_HDR_SIZE};
use marlin_storage::lsa::Lsa;
use marlin_storage::record::{RecordBody, RecordHeader, RecordRead};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Default number of cached pages, matching the historical default.
const CACHE_BUFFERS: usize = 100;

/// Bounded retry for a page that should exist but does not read cleanly.
/// The original retried forever; that can hang on a file that never
/// becomes valid, so the count is capped here.
const MAX_FETCH_RETRIES: usize = 10;

#[derive(Debug, Clone)]
struct ArchiveRange {
    fpageid: i32,
    npages: i32,
    path: PathBuf,
}

pub struct LogCache {
    dir: PathBuf,
    prefix: String,
    active_path: PathBuf,
    pub hdr: ActiveLogHeader,
    page_size: usize,
    archives: Vec<ArchiveRange>,
    pages: HashMap<i32, Arc<LogPage>>,
    order: VecDeque<i32>,
}

impl LogCache {
    /// Open the copied active log, validating magic, prefix and page
    /// size.
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        let active_path = dir.join(format!("{prefix}_lgat"));
        // read the header with a minimal page first; the real page size
        // comes out of the header itself
        let probe = VolumeFile::open(&active_path, 512)?;
        let mut page = vec![0u8; 512];
        probe.read_page(0, &mut page)?;
        let hdr = ActiveLogHeader::decode(&page, &active_path.display().to_string())?;
        if hdr.prefix_name != prefix {
            return Err(Error::Storage(marlin_storage::Error::LogMountFail {
                path: active_path.display().to_string(),
            }));
        }
        let page_size = hdr.db_logpagesize as usize;
        let mut cache = Self {
            dir: dir.to_owned(),
            prefix: prefix.to_owned(),
            active_path,
            hdr,
            page_size,
            archives: Vec::new(),
            pages: HashMap::with_capacity(CACHE_BUFFERS),
            order: VecDeque::with_capacity(CACHE_BUFFERS),
        };
        cache.refresh_header()?;
        cache.scan_archives();
        Ok(cache)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn payload_size(&self) -> usize {
        self.page_size - LOG_PAGE_HDR_SIZE
    }

    pub fn eof_lsa(&self) -> Lsa {
        self.hdr.eof_lsa
    }

    /// Re-read the copied header page; the master refreshes it on every
    /// flush, moving `eof_lsa` forward.
    pub fn refresh_header(&mut self) -> Result<()> {
        let file = VolumeFile::open(&self.active_path, self.page_size)?;
        let mut page = vec![0u8; self.page_size];
        file.read_page(0, &mut page)?;
        self.hdr = ActiveLogHeader::decode(&page, &self.active_path.display().to_string())?;
        Ok(())
    }

    fn scan_archives(&mut self) {
        self.archives.clear();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let arv_prefix = format!("{}_lgar", self.prefix);
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.strip_prefix(&arv_prefix).map_or(true, |n| n.parse::<i32>().is_err()) {
                continue;
            }
            let path = entry.path();
            let Ok(file) = VolumeFile::open(&path, self.page_size) else {
                continue;
            };
            let mut page = vec![0u8; self.page_size];
            if file.read_page(0, &mut page).is_err() {
                continue;
            }
            if let Ok(hdr) = ArchiveLogHeader::decode(&page, &path.display().to_string()) {
                self.archives.push(ArchiveRange {
                    fpageid: hdr.fpageid,
                    npages: hdr.npages,
                    path,
                });
            }
        }
        self.archives.sort_by_key(|a| a.fpageid);
    }

    fn cache_put(&mut self, pageid: i32, page: Arc<LogPage>) {
        if self.pages.len() >= CACHE_BUFFERS {
            if let Some(old) = self.order.pop_front() {
                self.pages.remove(&old);
            }
        }
        self.pages.insert(pageid, page);
        self.order.push_back(pageid);
    }

    /// Fetch a logical page, active file preferred, archives for pages
    /// already rotated out.
    pub fn fetch(&mut self, pageid: i32) -> Result<Arc<LogPage>> {
        if let Some(page) = self.pages.get(&pageid) {
            return Ok(page.clone());
        }
        let mut last_err: Option<Error> = None;
        for attempt in 0..MAX_FETCH_RETRIES {
            match self.try_read(pageid) {
                Ok(page) => {
                    let page = Arc::new(page);
                    self.cache_put(pageid, page.clone());
                    return Ok(page);
                }
                Err(e) => {
                    if attempt + 1 < MAX_FETCH_RETRIES {
                        // the copy may still be in flight; rescan and retry
                        self.refresh_header().ok();
                        self.scan_archives();
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    last_err = Some(e);
                }
            }
        }
        tracing::error!(pageid, "log page unavailable after {MAX_FETCH_RETRIES} attempts");
        Err(last_err.unwrap_or(Error::ArchiveUnavailable(pageid)))
    }

    fn try_read(&self, pageid: i32) -> Result<LogPage> {
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        if pageid >= self.hdr.nxarv_pageid {
            let file = VolumeFile::open(&self.active_path, self.page_size)?;
            let phy = 1 + pageid % self.hdr.npages;
            file.read_page(phy, &mut buf)?;
        } else {
            let range = self
                .archives
                .iter()
                .find(|a| pageid >= a.fpageid && pageid < a.fpageid + a.npages)
                .ok_or(Error::ArchiveUnavailable(pageid))?;
            let file = VolumeFile::open(&range.path, self.page_size)?;
            file.read_page(1 + pageid - range.fpageid, &mut buf)?;
        }
        let page = LogPage::from_bytes(buf);
        if page.pageid() != pageid {
            return Err(Error::BadPage(pageid));
        }
        Ok(page)
    }

    /// Decode the record at `lsa`, returning it plus the position of the
    /// byte after its body.
    pub fn read_record(&mut self, lsa: Lsa) -> Result<(RecordHeader, RecordBody, Lsa)> {
        let mut reader = CacheReader::new(self, lsa)?;
        let hdr_bytes = reader.read_bytes(RecordHeader::SIZE)?;
        let header = RecordHeader::decode(&hdr_bytes, lsa)?;
        let body = RecordBody::decode(header.rectype, &mut reader)?;
        let end = reader.position();
        Ok((header, body, end))
    }

    /// Where the next record after `at` starts when `forw_lsa` was never
    /// back-patched: the first record start on a following page.
    pub fn realign(&mut self, at: Lsa, limit: Lsa) -> Result<Lsa> {
        let mut pageid = at.pageid + 1;
        while pageid <= limit.pageid {
            let page = self.fetch(pageid)?;
            let first = page.offset_first_record();
            if first >= 0 {
                return Ok(Lsa::new(pageid, first));
            }
            pageid += 1;
        }
        Ok(Lsa::NULL)
    }
}

struct CacheReader<'a> {
    cache: &'a mut LogCache,
    page: Arc<LogPage>,
    pos: Lsa,
}

impl<'a> CacheReader<'a> {
    fn new(cache: &'a mut LogCache, start: Lsa) -> Result<Self> {
        let page = cache.fetch(start.pageid)?;
        Ok(Self {
            cache,
            page,
            pos: start,
        })
    }
}

impl RecordRead for CacheReader<'_> {
    fn read_bytes(&mut self, n: usize) -> marlin_storage::Result<bytes::Bytes> {
        use bytes::BufMut;
        let payload_size = self.page.payload_size();
        let mut out = bytes::BytesMut::with_capacity(n);
        while out.len() < n {
            if self.pos.offset as usize >= payload_size {
                let next = self.pos.pageid + 1;
                self.page = self
                    .cache
                    .fetch(next)
                    .map_err(|_| marlin_storage::Error::LogPageCorrupted(next))?;
                self.pos = Lsa::new(next, 0);
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
