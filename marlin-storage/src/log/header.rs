//! Active and archive log file headers. Both live on the first physical
//! page of their file and are validated at mount.

use zerocopy::byteorder::little_endian::{I32, I64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::lsa::{Lsa, LsaRepr};

pub const MAGIC_LOG_ACTIVE: [u8; 16] = *b"MARLIN_LOG_ACTV\0";
pub const MAGIC_LOG_ARCHIVE: [u8; 16] = *b"MARLIN_LOG_ARCH\0";

const RELEASE: &[u8] = b"marlin-1.0";

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct ActiveHdrRepr {
    magic: [u8; 16],
    db_creation: I64,
    release: [u8; 16],
    db_iopagesize: I32,
    db_logpagesize: I32,
    is_shutdown: I32,
    next_trid: I32,
    npages: I32,
    fpageid: I32,
    append_lsa: LsaRepr,
    chkpt_lsa: LsaRepr,
    nxarv_pageid: I32,
    nxarv_phy_pageid: I32,
    nxarv_num: I32,
    last_arv_num_for_syscrashes: I32,
    last_deleted_arv_num: I32,
    ha_server_state: I32,
    eof_lsa: LsaRepr,
    bkup_level0_lsa: LsaRepr,
    bkup_level1_lsa: LsaRepr,
    bkup_level2_lsa: LsaRepr,
    prefix_name: [u8; 64],
}

/// Decoded active log header. The struct of record for append position,
/// checkpoint position and archive bookkeeping; rewritten to the header
/// page on every flush.
#[derive(Debug, Clone)]
pub struct ActiveLogHeader {
    pub db_creation: i64,
    pub db_iopagesize: i32,
    pub db_logpagesize: i32,
    pub is_shutdown: bool,
    pub next_trid: i32,
    /// Payload pages in the circular active file.
    pub npages: i32,
    /// Logical page id the circular window started at.
    pub fpageid: i32,
    pub append_lsa: Lsa,
    pub chkpt_lsa: Lsa,
    /// Next logical page to archive; everything below it is in archives.
    pub nxarv_pageid: i32,
    pub nxarv_phy_pageid: i32,
    pub nxarv_num: i32,
    pub last_arv_num_for_syscrashes: i32,
    pub last_deleted_arv_num: i32,
    pub ha_server_state: i32,
    pub eof_lsa: Lsa,
    pub bkup_level0_lsa: Lsa,
    pub bkup_level1_lsa: Lsa,
    pub bkup_level2_lsa: Lsa,
    pub prefix_name: String,
}

impl ActiveLogHeader {
    pub fn new(dbname: &str, cfg: &crate::Config, db_creation: i64) -> Self {
        Self {
            db_creation,
            db_iopagesize: cfg.io_page_size as i32,
            db_logpagesize: cfg.log_page_size as i32,
            is_shutdown: false,
            next_trid: 1,
            npages: cfg.log_npages,
            fpageid: 0,
            append_lsa: Lsa::new(0, 0),
            chkpt_lsa: Lsa::NULL,
            nxarv_pageid: 0,
            nxarv_phy_pageid: 1,
            nxarv_num: 0,
            last_arv_num_for_syscrashes: -1,
            last_deleted_arv_num: -1,
            ha_server_state: 0,
            eof_lsa: Lsa::new(0, 0),
            bkup_level0_lsa: Lsa::NULL,
            bkup_level1_lsa: Lsa::NULL,
            bkup_level2_lsa: Lsa::NULL,
            prefix_name: dbname.to_owned(),
        }
    }

    pub fn encode(&self, page: &mut [u8]) {
        let mut prefix = [0u8; 64];
        let name = self.prefix_name.as_bytes();
        let n = name.len().min(63);
        prefix[..n].copy_from_slice(&name[..n]);
        let mut release = [0u8; 16];
        release[..RELEASE.len()].copy_from_slice(RELEASE);

        let repr = ActiveHdrRepr {
            magic: MAGIC_LOG_ACTIVE,
            db_creation: self.db_creation.into(),
            release,
            db_iopagesize: self.db_iopagesize.into(),
            db_logpagesize: self.db_logpagesize.into(),
            is_shutdown: (self.is_shutdown as i32).into(),
            next_trid: self.next_trid.into(),
            npages: self.npages.into(),
            fpageid: self.fpageid.into(),
            append_lsa: self.append_lsa.into(),
            chkpt_lsa: self.chkpt_lsa.into(),
            nxarv_pageid: self.nxarv_pageid.into(),
            nxarv_phy_pageid: self.nxarv_phy_pageid.into(),
            nxarv_num: self.nxarv_num.into(),
            last_arv_num_for_syscrashes: self.last_arv_num_for_syscrashes.into(),
            last_deleted_arv_num: self.last_deleted_arv_num.into(),
            ha_server_state: self.ha_server_state.into(),
            eof_lsa: self.eof_lsa.into(),
            bkup_level0_lsa: self.bkup_level0_lsa.into(),
            bkup_level1_lsa: self.bkup_level1_lsa.into(),
            bkup_level2_lsa: self.bkup_level2_lsa.into(),
            prefix_name: prefix,
        };
        let bytes = repr.as_bytes();
        page[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn decode(page: &[u8], path: &str) -> Result<Self> {
        let repr = ActiveHdrRepr::read_from_prefix(page).ok_or(Error::LogMountFail {
            path: path.to_owned(),
        })?;
        if repr.magic != MAGIC_LOG_ACTIVE {
            return Err(Error::LogMountFail {
                path: path.to_owned(),
            });
        }
        let sz = repr.db_logpagesize.get();
        if !(512..=16384).contains(&sz) || (sz as u32).count_ones() != 1 {
            return Err(Error::BadLogPageSize(sz));
        }
        let prefix_name = cstr_field(&repr.prefix_name);
        Ok(Self {
            db_creation: repr.db_creation.get(),
            db_iopagesize: repr.db_iopagesize.get(),
            db_logpagesize: sz,
            is_shutdown: repr.is_shutdown.get() != 0,
            next_trid: repr.next_trid.get(),
            npages: repr.npages.get(),
            fpageid: repr.fpageid.get(),
            append_lsa: repr.append_lsa.get(),
            chkpt_lsa: repr.chkpt_lsa.get(),
            nxarv_pageid: repr.nxarv_pageid.get(),
            nxarv_phy_pageid: repr.nxarv_phy_pageid.get(),
            nxarv_num: repr.nxarv_num.get(),
            last_arv_num_for_syscrashes: repr.last_arv_num_for_syscrashes.get(),
            last_deleted_arv_num: repr.last_deleted_arv_num.get(),
            ha_server_state: repr.ha_server_state.get(),
            eof_lsa: repr.eof_lsa.get(),
            bkup_level0_lsa: repr.bkup_level0_lsa.get(),
            bkup_level1_lsa: repr.bkup_level1_lsa.get(),
            bkup_level2_lsa: repr.bkup_level2_lsa.get(),
            prefix_name,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct ArchiveHdrRepr {
    magic: [u8; 16],
    db_creation: I64,
    next_trid: I32,
    npages: I32,
    fpageid: I32,
    arv_num: I32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLogHeader {
    pub db_creation: i64,
    pub next_trid: i32,
    /// Payload pages in this archive.
    pub npages: i32,
    /// First logical page id held by this archive.
    pub fpageid: i32,
    pub arv_num: i32,
}

impl ArchiveLogHeader {
    pub fn encode(&self, page: &mut [u8]) {
        let repr = ArchiveHdrRepr {
            magic: MAGIC_LOG_ARCHIVE,
            db_creation: self.db_creation.into(),
            next_trid: self.next_trid.into(),
            npages: self.npages.into(),
            fpageid: self.fpageid.into(),
            arv_num: self.arv_num.into(),
        };
        let bytes = repr.as_bytes();
        page[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn decode(page: &[u8], path: &str) -> Result<Self> {
        let repr = ArchiveHdrRepr::read_from_prefix(page).ok_or(Error::LogMountFail {
            path: path.to_owned(),
        })?;
        if repr.magic != MAGIC_LOG_ARCHIVE {
            return Err(Error::LogMountFail {
                path: path.to_owned(),
            });
        }
        Ok(Self {
            db_creation: repr.db_creation.get(),
            next_trid: repr.next_trid.get(),
            npages: repr.npages.get(),
            fpageid: repr.fpageid.get(),
            arv_num: repr.arv_num.get(),
        })
    }
}

fn cstr_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    #[test]
    fn active_header_round_trip() {
        let cfg = Config::default();
        let mut hdr = ActiveLogHeader::new("demo", &cfg, 1_700_000_000);
        hdr.append_lsa = Lsa::new(17, 512);
        hdr.chkpt_lsa = Lsa::new(3, 8);
        hdr.nxarv_num = 4;
        let mut page = vec![0u8; cfg.log_page_size];
        hdr.encode(&mut page);
        let back = ActiveLogHeader::decode(&page, "demo_lgat").unwrap();
        assert_eq!(back.append_lsa, hdr.append_lsa);
        assert_eq!(back.chkpt_lsa, hdr.chkpt_lsa);
        assert_eq!(back.nxarv_num, 4);
        assert_eq!(back.prefix_name, "demo");
    }

    #[test]
    fn bad_magic_fails_mount() {
        let page = vec![0u8; 4096];
        assert!(ActiveLogHeader::decode(&page, "x").is_err());
    }

    #[test]
    fn archive_header_round_trip() {
        let hdr = ArchiveLogHeader {
            db_creation: 9,
            next_trid: 44,
            npages: 8,
            fpageid: 0,
            arv_num: 0,
        };
        let mut page = vec![0u8; 4096];
        hdr.encode(&mut page);
        assert_eq!(ArchiveLogHeader::decode(&page, "x").unwrap(), hdr);
    }
}
