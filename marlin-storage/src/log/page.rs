//! Log page layout: an 8-byte header followed by the payload area that
//! records are packed into. LSA offsets address the payload area, so
//! offset 0 is the first payload byte.

use zerocopy::byteorder::little_endian::{I16, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const LOG_PAGE_HDR_SIZE: usize = 8;

/// Sentinel for "no record starts on this page".
pub const NO_FIRST_RECORD: i16 = -1;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct LogPageHdr {
    logical_pageid: I32,
    /// Payload offset of the first record that *starts* on this page, or
    /// [`NO_FIRST_RECORD`] if every byte belongs to a spilled record.
    offset_first_record: I16,
    _pad: [u8; 2],
}

/// An owned log page buffer.
#[derive(Debug, Clone)]
pub struct LogPage {
    buf: Box<[u8]>,
}

impl LogPage {
    pub fn new(page_size: usize) -> Self {
        let mut page = Self {
            buf: vec![0u8; page_size].into_boxed_slice(),
        };
        page.set_pageid(-1);
        page.set_offset_first_record(NO_FIRST_RECORD);
        page
    }

    pub fn from_bytes(buf: Box<[u8]>) -> Self {
        debug_assert!(buf.len() > LOG_PAGE_HDR_SIZE);
        Self { buf }
    }

    pub fn page_size(&self) -> usize {
        self.buf.len()
    }

    pub fn payload_size(&self) -> usize {
        self.buf.len() - LOG_PAGE_HDR_SIZE
    }

    fn hdr(&self) -> LogPageHdr {
        LogPageHdr::read_from_prefix(&self.buf[..]).expect("page smaller than its header")
    }

    fn set_hdr(&mut self, hdr: LogPageHdr) {
        self.buf[..LOG_PAGE_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    }

    pub fn pageid(&self) -> i32 {
        self.hdr().logical_pageid.get()
    }

    pub fn set_pageid(&mut self, pageid: i32) {
        let mut hdr = self.hdr();
        hdr.logical_pageid = pageid.into();
        self.set_hdr(hdr);
    }

    pub fn offset_first_record(&self) -> i16 {
        self.hdr().offset_first_record.get()
    }

    pub fn set_offset_first_record(&mut self, offset: i16) {
        let mut hdr = self.hdr();
        hdr.offset_first_record = offset.into();
        self.set_hdr(hdr);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[LOG_PAGE_HDR_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[LOG_PAGE_HDR_SIZE..]
    }

    /// Reinitialize for reuse as a fresh append page.
    pub fn reset(&mut self, pageid: i32) {
        self.buf.fill(0);
        self.set_pageid(pageid);
        self.set_offset_first_record(NO_FIRST_RECORD);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_accessors() {
        let mut page = LogPage::new(4096);
        assert_eq!(page.pageid(), -1);
        assert_eq!(page.offset_first_record(), NO_FIRST_RECORD);
        page.set_pageid(88);
        page.set_offset_first_record(120);
        assert_eq!(page.pageid(), 88);
        assert_eq!(page.offset_first_record(), 120);
        assert_eq!(page.payload_size(), 4096 - LOG_PAGE_HDR_SIZE);
    }

    #[test]
    fn reset_clears_payload() {
        let mut page = LogPage::new(512);
        page.payload_mut()[0] = 0xFF;
        page.reset(3);
        assert_eq!(page.pageid(), 3);
        assert_eq!(page.payload()[0], 0);
    }
}
