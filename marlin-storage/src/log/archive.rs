//! Archive rotation: sealed pages of the circular active log are copied
//! into numbered archive files before the window wraps over them.

use crate::error::Result;
use crate::io::VolumeFile;
use crate::record::RecordBody;
use crate::tran::TranLog;

use super::header::ArchiveLogHeader;
use super::{ArchiveInfo, LogInner, SYSTEM_TRID};

impl LogInner {
    /// Copy every sealed, unarchived page `[nxarv_pageid, append.pageid)`
    /// into a fresh archive file and advance the archive bookkeeping.
    pub fn archive_active_log(&mut self) -> Result<()> {
        let first = self.hdr.nxarv_pageid;
        let last = self.hdr.append_lsa.pageid; // exclusive
        if first >= last {
            return Ok(());
        }
        // the archive is copied from the active file, so it must be current
        self.flush_all_append_pages()?;

        let arv_num = self.hdr.nxarv_num;
        let path = Self::archive_path(self.dir(), self.dbname(), arv_num);
        let npages = last - first;
        let page_size = self.page_size();
        let arv = VolumeFile::format(&path, page_size, 1 + npages)?;

        let mut hdr_page = vec![0u8; page_size];
        ArchiveLogHeader {
            db_creation: self.hdr.db_creation,
            next_trid: self.hdr.next_trid,
            npages,
            fpageid: first,
            arv_num,
        }
        .encode(&mut hdr_page);
        arv.write_page(0, &hdr_page)?;

        let mut buf = vec![0u8; page_size];
        for pageid in first..last {
            self.read_page_for_archive(pageid, &mut buf)?;
            arv.write_page(1 + pageid - first, &buf)?;
        }
        arv.sync()?;

        self.archives.push(ArchiveInfo {
            arv_num,
            fpageid: first,
            npages,
            path: path.clone(),
        });
        self.hdr.nxarv_num += 1;
        self.hdr.nxarv_pageid = last;
        self.hdr.nxarv_phy_pageid = 1 + last % self.hdr.npages;
        self.hdr.last_arv_num_for_syscrashes = arv_num;
        self.write_header()?;

        self.loginfo.archive_created(&path, first, last - 1);
        self.wants_archive = false;
        tracing::info!(arv_num, first, last, "log archive created");
        Ok(())
    }

    fn read_page_for_archive(&mut self, pageid: i32, buf: &mut [u8]) -> Result<()> {
        // prefer the buffered copy; it may carry a forw_lsa back-patch the
        // file copy lacks
        if let Some(idx) = self.pgbuf.lookup(pageid) {
            buf.copy_from_slice(self.pgbuf.slot(idx).page.as_bytes());
            return Ok(());
        }
        self.read_page_from_file(pageid, buf)
    }

    /// Seal the current append page with a filler record and rotate, so an
    /// explicit archive request never waits for the page to fill up.
    pub fn force_archive(&mut self, system_tlog: &mut TranLog) -> Result<()> {
        if self.hdr.nxarv_pageid == self.hdr.append_lsa.pageid
            && self.hdr.append_lsa.offset == 0
        {
            return Ok(());
        }
        self.append(SYSTEM_TRID, system_tlog, &RecordBody::DummyFillpageForArchive)?;
        self.next_append_page()?;
        self.archive_active_log()
    }

    /// Delete archives wholly below `required_pageid` (nothing any live
    /// transaction or replica still needs), noting it in the trail.
    pub fn delete_unneeded_archives(&mut self, required_pageid: i32) -> Result<usize> {
        let mut deleted = 0usize;
        let mut first_arv = None;
        let mut last_arv = None;
        self.archives.retain(|info| {
            let removable = info.fpageid + info.npages <= required_pageid;
            if removable {
                if std::fs::remove_file(&info.path).is_err() {
                    tracing::warn!("could not remove archive {}", info.path.display());
                }
                first_arv.get_or_insert(info.arv_num);
                last_arv = Some(info.arv_num);
                deleted += 1;
            }
            !removable
        });
        if let (Some(first), Some(last)) = (first_arv, last_arv) {
            self.hdr.last_deleted_arv_num = last;
            self.write_header()?;
            self.loginfo.archives_deletable(first, last);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::header::MAGIC_LOG_ARCHIVE;
    use crate::Config;

    #[test]
    fn archive_header_magic_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            log_npages: 8,
            log_page_size: 512,
            ..Config::default()
        };
        let mut log = LogInner::create(&cfg, "demo", dir.path()).unwrap();
        let mut tlog = TranLog::default();
        // fill past the window to force a rotation
        let payload = vec![1u8; 200];
        for _ in 0..40 {
            log.append(
                SYSTEM_TRID,
                &mut tlog,
                &RecordBody::DbExternRedo {
                    rcvindex: crate::record::RvIndex::HeapInsert,
                    data: payload.clone().into(),
                },
            )
            .unwrap();
        }
        log.force_archive(&mut tlog).unwrap();
        assert!(log.hdr.nxarv_num >= 1);

        let arv_path = LogInner::archive_path(dir.path(), "demo", 0);
        let bytes = std::fs::read(&arv_path).unwrap();
        assert_eq!(&bytes[..16], &MAGIC_LOG_ARCHIVE);

        let trail = std::fs::read_to_string(log.loginfo.path()).unwrap();
        assert!(trail.contains("demo_lgar000"));
    }
}
