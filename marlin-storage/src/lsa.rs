use std::fmt;

use zerocopy::byteorder::little_endian::{I16, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// A log sequence address: the logical log page holding a record plus the
/// byte offset of the record within that page's payload area.
///
/// Ordering is lexicographic, which the derive gives us from field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsa {
    pub pageid: i32,
    pub offset: i16,
}

pub const NULL_PAGEID: i32 = -1;
pub const NULL_OFFSET: i16 = -1;

impl Lsa {
    pub const NULL: Lsa = Lsa {
        pageid: NULL_PAGEID,
        offset: NULL_OFFSET,
    };

    pub const fn new(pageid: i32, offset: i16) -> Self {
        Self { pageid, offset }
    }

    pub fn is_null(&self) -> bool {
        self.pageid == NULL_PAGEID
    }
}

impl Default for Lsa {
    fn default() -> Self {
        Lsa::NULL
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}|{})", self.pageid, self.offset)
    }
}

/// On-disk representation: 8 bytes, little endian, 2 bytes of padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct LsaRepr {
    pageid: I32,
    offset: I16,
    _pad: [u8; 2],
}

impl LsaRepr {
    pub const SIZE: usize = 8;

    pub fn get(&self) -> Lsa {
        Lsa::new(self.pageid.get(), self.offset.get())
    }

    pub fn set(&mut self, lsa: Lsa) {
        self.pageid = lsa.pageid.into();
        self.offset = lsa.offset.into();
    }
}

impl From<Lsa> for LsaRepr {
    fn from(lsa: Lsa) -> Self {
        LsaRepr {
            pageid: lsa.pageid.into(),
            offset: lsa.offset.into(),
            _pad: [0; 2],
        }
    }
}

impl From<LsaRepr> for Lsa {
    fn from(r: LsaRepr) -> Self {
        r.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Lsa::new(1, 100) < Lsa::new(2, 0));
        assert!(Lsa::new(2, 0) < Lsa::new(2, 1));
        assert!(Lsa::NULL < Lsa::new(0, 0));
    }

    #[test]
    fn repr_round_trip() {
        let lsa = Lsa::new(42, 1234);
        let repr = LsaRepr::from(lsa);
        assert_eq!(repr.as_bytes().len(), LsaRepr::SIZE);
        let back = LsaRepr::read_from(repr.as_bytes()).unwrap();
        assert_eq!(back.get(), lsa);
    }
}
