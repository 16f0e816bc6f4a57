//! Volume header: first page of every data volume. A fixed zerocopy
//! prefix plus three variable-length strings (volume path, next-volume
//! path, remarks) packed contiguously behind it, located by offsets.

use zerocopy::byteorder::little_endian::{I16, I32, I64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::lsa::{Lsa, LsaRepr};

pub const MAGIC_DATABASE_VOLUME: [u8; 16] = *b"MARLIN_DB_VOLUM\0";

/// Pages per sector. Fixed for the life of a database.
pub const SECT_NPGS: i32 = 10;

/// Sector id 0 addresses the whole volume ("all pages").
pub const SPECIAL_SECTOR: i32 = 0;

pub const NULL_VOLID: i16 = -1;

/// Longest accepted volume full name, NUL included.
pub const MAX_VOL_FULLNAME: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VolPurpose {
    PermData = 0,
    PermIndex = 1,
    PermGeneric = 2,
    PermTemp = 3,
    TempTemp = 4,
    /// Search preference only; never stored in a header.
    EitherTemp = 5,
}

impl VolPurpose {
    pub fn from_i32(v: i32) -> Option<Self> {
        use VolPurpose::*;
        Some(match v {
            0 => PermData,
            1 => PermIndex,
            2 => PermGeneric,
            3 => PermTemp,
            4 => TempTemp,
            5 => EitherTemp,
            _ => return None,
        })
    }

    /// Temp-purpose volumes are outside WAL protection.
    pub fn is_temp(&self) -> bool {
        matches!(self, VolPurpose::PermTemp | VolPurpose::TempTemp | VolPurpose::EitherTemp)
    }

    pub fn storable(&self) -> bool {
        !matches!(self, VolPurpose::EitherTemp)
    }
}

/// Heap file id of the boot catalog, carried in the first volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hfid {
    pub volid: i16,
    pub fileid: i32,
    pub hpgid: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct VolHeaderRepr {
    magic: [u8; 16],
    iopagesize: I32,
    volid: I16,
    _pad0: [u8; 2],
    purpose: I32,
    sect_npgs: I32,
    total_pages: I32,
    free_pages: I32,
    total_sects: I32,
    free_sects: I32,
    hint_allocsect: I32,
    sect_alloctb_npages: I32,
    page_alloctb_npages: I32,
    sect_alloctb_page1: I32,
    page_alloctb_page1: I32,
    sys_lastpage: I32,
    warnat: I32,
    db_creation: I64,
    chkpt_lsa: LsaRepr,
    boot_hfid_volid: I16,
    _pad1: [u8; 2],
    boot_hfid_fileid: I32,
    boot_hfid_hpgid: I32,
    offset_to_vol_fullname: I16,
    offset_to_next_vol_fullname: I16,
    offset_to_vol_remarks: I16,
    _pad2: [u8; 2],
}

pub const VOL_HEADER_FIXED_SIZE: usize = std::mem::size_of::<VolHeaderRepr>();

/// Decoded volume header.
#[derive(Debug, Clone, PartialEq)]
pub struct VolHeader {
    pub iopagesize: i32,
    pub volid: i16,
    pub purpose: VolPurpose,
    pub sect_npgs: i32,
    pub total_pages: i32,
    pub free_pages: i32,
    pub total_sects: i32,
    pub free_sects: i32,
    /// Rotating allocation hint, in sector ids.
    pub hint_allocsect: i32,
    pub sect_alloctb_npages: i32,
    pub page_alloctb_npages: i32,
    pub sect_alloctb_page1: i32,
    pub page_alloctb_page1: i32,
    pub sys_lastpage: i32,
    /// Free-page low-water threshold for space warnings.
    pub warnat: i32,
    pub db_creation: i64,
    pub chkpt_lsa: Lsa,
    pub boot_hfid: Hfid,
    pub vol_fullname: String,
    pub next_vol_fullname: String,
    pub vol_remarks: String,
}

impl VolHeader {
    /// Serialize into a page content area (LSA prefix excluded). Fails if
    /// the variable strings do not fit; remarks are truncated first.
    pub fn encode(&self, content_size: usize) -> Result<Vec<u8>> {
        if self.vol_fullname.len() + 1 > MAX_VOL_FULLNAME
            || self.next_vol_fullname.len() + 1 > MAX_VOL_FULLNAME
        {
            return Err(Error::FullDatabaseNameTooLong(self.vol_fullname.clone()));
        }
        let mut out = vec![0u8; content_size];
        let var_base = VOL_HEADER_FIXED_SIZE;
        let mut cursor = 0usize;

        let off_fullname = cursor as i16;
        cursor += self.vol_fullname.len() + 1;
        let off_next = cursor as i16;
        cursor += self.next_vol_fullname.len() + 1;
        let off_remarks = cursor as i16;
        let remarks_room = content_size
            .checked_sub(var_base + cursor + 1)
            .ok_or_else(|| Error::FullDatabaseNameTooLong(self.vol_fullname.clone()))?;
        let remarks = &self.vol_remarks[..self.vol_remarks.len().min(remarks_room)];

        let repr = VolHeaderRepr {
            magic: MAGIC_DATABASE_VOLUME,
            iopagesize: self.iopagesize.into(),
            volid: self.volid.into(),
            _pad0: [0; 2],
            purpose: (self.purpose as i32).into(),
            sect_npgs: self.sect_npgs.into(),
            total_pages: self.total_pages.into(),
            free_pages: self.free_pages.into(),
            total_sects: self.total_sects.into(),
            free_sects: self.free_sects.into(),
            hint_allocsect: self.hint_allocsect.into(),
            sect_alloctb_npages: self.sect_alloctb_npages.into(),
            page_alloctb_npages: self.page_alloctb_npages.into(),
            sect_alloctb_page1: self.sect_alloctb_page1.into(),
            page_alloctb_page1: self.page_alloctb_page1.into(),
            sys_lastpage: self.sys_lastpage.into(),
            warnat: self.warnat.into(),
            db_creation: self.db_creation.into(),
            chkpt_lsa: self.chkpt_lsa.into(),
            boot_hfid_volid: self.boot_hfid.volid.into(),
            _pad1: [0; 2],
            boot_hfid_fileid: self.boot_hfid.fileid.into(),
            boot_hfid_hpgid: self.boot_hfid.hpgid.into(),
            offset_to_vol_fullname: off_fullname.into(),
            offset_to_next_vol_fullname: off_next.into(),
            offset_to_vol_remarks: off_remarks.into(),
            _pad2: [0; 2],
        };
        out[..VOL_HEADER_FIXED_SIZE].copy_from_slice(repr.as_bytes());

        put_cstr(&mut out, var_base + off_fullname as usize, &self.vol_fullname);
        put_cstr(&mut out, var_base + off_next as usize, &self.next_vol_fullname);
        put_cstr(&mut out, var_base + off_remarks as usize, remarks);
        Ok(out)
    }

    pub fn decode(content: &[u8], volid_hint: i16) -> Result<Self> {
        let repr = VolHeaderRepr::read_from_prefix(content)
            .ok_or(Error::InconsistentVolHeader(volid_hint))?;
        if repr.magic != MAGIC_DATABASE_VOLUME {
            return Err(Error::InconsistentVolHeader(volid_hint));
        }
        let purpose = VolPurpose::from_i32(repr.purpose.get())
            .filter(VolPurpose::storable)
            .ok_or(Error::InconsistentVolHeader(volid_hint))?;
        let var_base = VOL_HEADER_FIXED_SIZE;
        let hdr = Self {
            iopagesize: repr.iopagesize.get(),
            volid: repr.volid.get(),
            purpose,
            sect_npgs: repr.sect_npgs.get(),
            total_pages: repr.total_pages.get(),
            free_pages: repr.free_pages.get(),
            total_sects: repr.total_sects.get(),
            free_sects: repr.free_sects.get(),
            hint_allocsect: repr.hint_allocsect.get(),
            sect_alloctb_npages: repr.sect_alloctb_npages.get(),
            page_alloctb_npages: repr.page_alloctb_npages.get(),
            sect_alloctb_page1: repr.sect_alloctb_page1.get(),
            page_alloctb_page1: repr.page_alloctb_page1.get(),
            sys_lastpage: repr.sys_lastpage.get(),
            warnat: repr.warnat.get(),
            db_creation: repr.db_creation.get(),
            chkpt_lsa: repr.chkpt_lsa.get(),
            boot_hfid: Hfid {
                volid: repr.boot_hfid_volid.get(),
                fileid: repr.boot_hfid_fileid.get(),
                hpgid: repr.boot_hfid_hpgid.get(),
            },
            vol_fullname: get_cstr(content, var_base + repr.offset_to_vol_fullname.get() as usize),
            next_vol_fullname: get_cstr(
                content,
                var_base + repr.offset_to_next_vol_fullname.get() as usize,
            ),
            vol_remarks: get_cstr(content, var_base + repr.offset_to_vol_remarks.get() as usize),
        };
        if hdr.sys_lastpage != hdr.page_alloctb_page1 + hdr.page_alloctb_npages - 1 {
            return Err(Error::InconsistentVolHeader(volid_hint));
        }
        Ok(hdr)
    }
}

fn put_cstr(buf: &mut [u8], at: usize, s: &str) {
    buf[at..at + s.len()].copy_from_slice(s.as_bytes());
    buf[at + s.len()] = 0;
}

fn get_cstr(buf: &[u8], at: usize) -> String {
    let tail = &buf[at.min(buf.len())..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> VolHeader {
        VolHeader {
            iopagesize: 4096,
            volid: 0,
            purpose: VolPurpose::PermData,
            sect_npgs: SECT_NPGS,
            total_pages: 1000,
            free_pages: 995,
            total_sects: 100,
            free_sects: 100,
            hint_allocsect: 1,
            sect_alloctb_npages: 1,
            page_alloctb_npages: 1,
            sect_alloctb_page1: 1,
            page_alloctb_page1: 2,
            sys_lastpage: 2,
            warnat: 20,
            db_creation: 1_700_000_000,
            chkpt_lsa: Lsa::NULL,
            boot_hfid: Hfid::default(),
            vol_fullname: "/data/demo".into(),
            next_vol_fullname: String::new(),
            vol_remarks: "first volume".into(),
        }
    }

    #[test]
    fn pack_unpack_identity() {
        let hdr = sample();
        let content = hdr.encode(4088).unwrap();
        let back = VolHeader::decode(&content, 0).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn sys_lastpage_invariant_checked() {
        let mut hdr = sample();
        hdr.sys_lastpage = 7;
        let content = hdr.encode(4088).unwrap();
        assert!(matches!(
            VolHeader::decode(&content, 0),
            Err(Error::InconsistentVolHeader(0))
        ));
    }

    #[test]
    fn over_long_fullname_rejected() {
        let mut hdr = sample();
        hdr.vol_fullname = "x".repeat(MAX_VOL_FULLNAME);
        assert!(matches!(
            hdr.encode(8192),
            Err(Error::FullDatabaseNameTooLong(_))
        ));
    }

    #[test]
    fn long_remarks_truncated() {
        let mut hdr = sample();
        hdr.vol_remarks = "r".repeat(8000);
        let content = hdr.encode(4088).unwrap();
        let back = VolHeader::decode(&content, 0).unwrap();
        assert!(back.vol_remarks.len() < 4088);
        assert!(back.vol_remarks.starts_with('r'));
    }
}
