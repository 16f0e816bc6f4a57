//! Static recovery function registry, keyed by [`RvIndex`].
//!
//! Every function is a pure page transformation `(content, image) ->
//! content` and is idempotent with respect to re-application at the same
//! LSA; the redo driver guards on the page LSA, not the function.
//! Runtime mutators funnel through the same functions, so replay is
//! byte-identical with first execution.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::disk::bitmap;
use crate::disk::header::VolHeader;
use crate::error::{Error, Result};
use crate::lsa::Lsa;
use crate::record::RvIndex;

/// What a recovery function gets to work with.
pub struct Rcv<'a> {
    pub offset: i16,
    pub data: &'a [u8],
    pub lsa: Lsa,
}

pub type RvApply = fn(&mut [u8], &Rcv) -> Result<()>;

pub struct RvEntry {
    pub name: &'static str,
    pub redo: Option<RvApply>,
    pub undo: Option<RvApply>,
    /// Logical operations are not tied to a single page; the undo driver
    /// routes them out-of-core instead of calling `undo`.
    pub is_logical: bool,
}

pub static RV_TABLE: [RvEntry; RvIndex::COUNT] = [
    RvEntry {
        name: "VOLHDR_FORMAT",
        redo: Some(rv_copy_bytes),
        undo: None, // logical: delete the volume file
        is_logical: true,
    },
    RvEntry {
        name: "VOLHDR_LINK",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "VOLHDR_CREATION",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "VOLHDR_BOOT_HFID",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "ALLOCTB_SET",
        redo: Some(rv_alloctable_apply),
        undo: Some(rv_alloctable_apply),
        is_logical: false,
    },
    RvEntry {
        name: "VHDR_PGALLOC",
        redo: Some(rv_vhdr_pg_redo),
        undo: Some(rv_vhdr_pg_undo),
        is_logical: false,
    },
    RvEntry {
        name: "VHDR_SECTALLOC",
        redo: Some(rv_vhdr_sect_redo),
        undo: Some(rv_vhdr_sect_undo),
        is_logical: false,
    },
    RvEntry {
        name: "IDDEALLOC_WITH_VOLHEADER",
        // postpone marker only; run-postpone expands it into the two
        // records below
        redo: None,
        undo: None,
        is_logical: true,
    },
    RvEntry {
        name: "IDDEALLOC_BITMAP_ONLY",
        redo: Some(rv_dealloc_bitmap),
        undo: None,
        is_logical: false,
    },
    RvEntry {
        name: "IDDEALLOC_VHDR_ONLY",
        redo: Some(rv_dealloc_vhdr),
        undo: None,
        is_logical: false,
    },
    RvEntry {
        name: "HF_INSERT",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "HF_DELETE",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "HF_UPDATE",
        redo: Some(rv_copy_bytes),
        undo: Some(rv_copy_bytes),
        is_logical: false,
    },
    RvEntry {
        name: "ALLOCTB_INIT",
        redo: Some(rv_alloctable_init),
        undo: None,
        is_logical: false,
    },
];

pub fn entry(idx: RvIndex) -> &'static RvEntry {
    &RV_TABLE[idx as usize]
}

pub fn apply_redo(idx: RvIndex, content: &mut [u8], rcv: &Rcv) -> Result<()> {
    match entry(idx).redo {
        Some(f) => f(content, rcv),
        None => Err(Error::LogRecordCorrupted(rcv.lsa)),
    }
}

pub fn apply_undo(idx: RvIndex, content: &mut [u8], rcv: &Rcv) -> Result<()> {
    match entry(idx).undo {
        Some(f) => f(content, rcv),
        None => Err(Error::LogRecordCorrupted(rcv.lsa)),
    }
}

// ------------------------------------------------------------- images

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocTableImage {
    pub set: bool,
    pub start_bit: i32,
    pub nbits: i32,
}

impl AllocTableImage {
    pub fn to_bytes(self) -> Bytes {
        let mut b = BytesMut::with_capacity(9);
        b.put_u8(self.set as u8);
        b.put_i32_le(self.start_bit);
        b.put_i32_le(self.nbits);
        b.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(Error::LogRecordCorrupted(Lsa::NULL));
        }
        Ok(Self {
            set: data.get_u8() != 0,
            start_bit: data.get_i32_le(),
            nbits: data.get_i32_le(),
        })
    }

    pub fn inverse(self) -> Self {
        Self {
            set: !self.set,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocTableInitImage {
    /// Bits `[0, nset_prefix)` start life allocated (system ids).
    pub nset_prefix: i32,
    /// Bits at or beyond this index map past the end of the volume and
    /// are permanently allocated.
    pub first_invalid: i32,
}

impl AllocTableInitImage {
    pub fn to_bytes(self) -> Bytes {
        let mut b = BytesMut::with_capacity(8);
        b.put_i32_le(self.nset_prefix);
        b.put_i32_le(self.first_invalid);
        b.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::LogRecordCorrupted(Lsa::NULL));
        }
        Ok(Self {
            nset_prefix: data.get_i32_le(),
            first_invalid: data.get_i32_le(),
        })
    }
}

/// Header counter delta; `new_hint` of -1 leaves the rotating hint alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VhdrDeltaImage {
    pub delta: i32,
    pub new_hint: i32,
}

impl VhdrDeltaImage {
    pub fn to_bytes(self) -> Bytes {
        let mut b = BytesMut::with_capacity(8);
        b.put_i32_le(self.delta);
        b.put_i32_le(self.new_hint);
        b.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::LogRecordCorrupted(Lsa::NULL));
        }
        Ok(Self {
            delta: data.get_i32_le(),
            new_hint: data.get_i32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeallocKind {
    Page = 0,
    Sector = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeallocImage {
    pub kind: DeallocKind,
    pub start: i32,
    pub count: i32,
}

impl DeallocImage {
    pub fn to_bytes(self) -> Bytes {
        let mut b = BytesMut::with_capacity(9);
        b.put_u8(self.kind as u8);
        b.put_i32_le(self.start);
        b.put_i32_le(self.count);
        b.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(Error::LogRecordCorrupted(Lsa::NULL));
        }
        let kind = match data.get_u8() {
            0 => DeallocKind::Page,
            1 => DeallocKind::Sector,
            _ => return Err(Error::LogRecordCorrupted(Lsa::NULL)),
        };
        Ok(Self {
            kind,
            start: data.get_i32_le(),
            count: data.get_i32_le(),
        })
    }
}

// ---------------------------------------------------------- functions

/// Byte-image application: the image replaces `data.len()` bytes at
/// `rcv.offset`. Serves the heap indexes and the header-field mutators.
fn rv_copy_bytes(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let at = rcv.offset as usize;
    let end = at + rcv.data.len();
    if end > content.len() {
        return Err(Error::LogRecordCorrupted(rcv.lsa));
    }
    content[at..end].copy_from_slice(rcv.data);
    Ok(())
}

fn rv_alloctable_apply(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = AllocTableImage::from_bytes(rcv.data)?;
    if img.set {
        bitmap::set_range(content, img.start_bit, img.nbits);
    } else {
        bitmap::clear_range(content, img.start_bit, img.nbits);
    }
    Ok(())
}

fn rv_alloctable_init(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = AllocTableInitImage::from_bytes(rcv.data)?;
    content.fill(0);
    bitmap::set_range(content, 0, img.nset_prefix);
    let nbits = bitmap::bits_per_page(content.len());
    if img.first_invalid < nbits {
        bitmap::set_range(content, img.first_invalid, nbits - img.first_invalid);
    }
    Ok(())
}

fn with_header(content: &mut [u8], lsa: Lsa, f: impl FnOnce(&mut VolHeader)) -> Result<()> {
    let mut hdr = VolHeader::decode(content, -1).map_err(|_| Error::LogRecordCorrupted(lsa))?;
    f(&mut hdr);
    let fresh = hdr
        .encode(content.len())
        .map_err(|_| Error::LogRecordCorrupted(lsa))?;
    content.copy_from_slice(&fresh);
    Ok(())
}

fn rv_vhdr_pg_redo(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = VhdrDeltaImage::from_bytes(rcv.data)?;
    with_header(content, rcv.lsa, |hdr| {
        hdr.free_pages -= img.delta;
        if img.new_hint >= 0 {
            hdr.hint_allocsect = img.new_hint;
        }
    })
}

fn rv_vhdr_pg_undo(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = VhdrDeltaImage::from_bytes(rcv.data)?;
    with_header(content, rcv.lsa, |hdr| {
        hdr.free_pages += img.delta;
    })
}

fn rv_vhdr_sect_redo(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = VhdrDeltaImage::from_bytes(rcv.data)?;
    with_header(content, rcv.lsa, |hdr| {
        hdr.free_sects -= img.delta;
        if img.new_hint >= 0 {
            hdr.hint_allocsect = img.new_hint;
        }
    })
}

fn rv_vhdr_sect_undo(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = VhdrDeltaImage::from_bytes(rcv.data)?;
    with_header(content, rcv.lsa, |hdr| {
        hdr.free_sects += img.delta;
    })
}

fn rv_dealloc_bitmap(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = DeallocImage::from_bytes(rcv.data)?;
    bitmap::clear_range(content, img.start, img.count);
    Ok(())
}

fn rv_dealloc_vhdr(content: &mut [u8], rcv: &Rcv) -> Result<()> {
    let img = DeallocImage::from_bytes(rcv.data)?;
    with_header(content, rcv.lsa, |hdr| match img.kind {
        DeallocKind::Page => hdr.free_pages += img.count,
        DeallocKind::Sector => hdr.free_sects += img.count,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_is_keyed_by_rcvindex() {
        assert_eq!(entry(RvIndex::HeapInsert).name, "HF_INSERT");
        assert_eq!(entry(RvIndex::AllocTableSet).name, "ALLOCTB_SET");
        assert!(entry(RvIndex::VolHeaderFormat).is_logical);
        assert!(entry(RvIndex::IdDeallocWithVolheader).redo.is_none());
    }

    #[test]
    fn copy_bytes_is_idempotent() {
        let mut content = vec![0u8; 64];
        let rcv = Rcv {
            offset: 8,
            data: b"payload",
            lsa: Lsa::new(1, 0),
        };
        apply_redo(RvIndex::HeapInsert, &mut content, &rcv).unwrap();
        let once = content.clone();
        apply_redo(RvIndex::HeapInsert, &mut content, &rcv).unwrap();
        assert_eq!(content, once);
        assert_eq!(&content[8..15], b"payload");
    }

    #[test]
    fn alloctable_set_then_undo_restores() {
        let mut content = vec![0u8; 16];
        let img = AllocTableImage {
            set: true,
            start_bit: 5,
            nbits: 9,
        };
        let rcv = Rcv {
            offset: 0,
            data: &img.to_bytes(),
            lsa: Lsa::new(1, 0),
        };
        apply_redo(RvIndex::AllocTableSet, &mut content, &rcv).unwrap();
        assert_eq!(bitmap::count_clear(&content, 128), 128 - 9);

        let inv = img.inverse().to_bytes();
        let rcv = Rcv {
            offset: 0,
            data: &inv,
            lsa: Lsa::new(1, 64),
        };
        apply_undo(RvIndex::AllocTableSet, &mut content, &rcv).unwrap();
        assert_eq!(bitmap::count_clear(&content, 128), 128);
    }

    #[test]
    fn alloctable_init_fences_invalid_bits() {
        let mut content = vec![0xAAu8; 16]; // garbage
        let img = AllocTableInitImage {
            nset_prefix: 3,
            first_invalid: 100,
        };
        let rcv = Rcv {
            offset: 0,
            data: &img.to_bytes(),
            lsa: Lsa::new(1, 0),
        };
        apply_redo(RvIndex::AllocTableInit, &mut content, &rcv).unwrap();
        assert!(bitmap::bit_get(&content, 0));
        assert!(bitmap::bit_get(&content, 2));
        assert!(!bitmap::bit_get(&content, 3));
        assert!(!bitmap::bit_get(&content, 99));
        assert!(bitmap::bit_get(&content, 100));
        assert!(bitmap::bit_get(&content, 127));
    }
}
