//! On-disk record formats for the cull index and atimes file (spec §3).
//!
//! `IndexRecordHeader` is the fixed two-byte prefix of a packed
//! `{ len, type, fh[len] }` record; the variable-length `fh` tail is kept
//! separate since its length is data-dependent and zerocopy's derives need
//! a fixed-size type to operate on.

use smallvec::SmallVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum file handle length we'll ever see from `name_to_handle_at`;
/// used only to size the inline buffer, not as an on-disk limit.
pub const INLINE_HANDLE_BYTES: usize = 32;

#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IndexRecordHeader {
    pub len: u8,
    pub type_: u8,
}

/// A decoded index record: a slot is "empty" when `len == 0 || type_ == 0`
/// (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexRecord {
    pub type_: u8,
    pub fh: SmallVec<[u8; INLINE_HANDLE_BYTES]>,
}

impl IndexRecord {
    pub fn empty() -> Self {
        IndexRecord {
            type_: 0,
            fh: SmallVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fh.is_empty() || self.type_ == 0
    }

    /// Decode a record occupying `ent_size` bytes starting at `buf[0]`.
    pub fn decode(buf: &[u8]) -> Self {
        let header =
            IndexRecordHeader::read_from_bytes(&buf[..2]).expect("2-byte header slice");
        let len = header.len as usize;
        let fh = if len == 0 {
            SmallVec::new()
        } else {
            SmallVec::from_slice(&buf[2..2 + len])
        };
        IndexRecord {
            type_: header.type_,
            fh,
        }
    }

    /// Encode this record into `buf`, zero-padding the remainder of the
    /// `ent_size`-byte slot (spec §3: "unused tail bytes are zero").
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf.fill(0);
        let header = IndexRecordHeader {
            len: self.fh.len() as u8,
            type_: self.type_,
        };
        buf[..2].copy_from_slice(header.as_bytes());
        buf[2..2 + self.fh.len()].copy_from_slice(&self.fh);
    }
}

/// A little-endian-native `u32` atime slot, as stored in the atimes file.
/// The file is host-native byte order (spec §6: "not portable between
/// endian classes"), so this is a bare `u32` read/written with the
/// platform's native layout rather than an explicit-endian wrapper.
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Atime(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_populated_record() {
        let rec = IndexRecord {
            type_: 7,
            fh: SmallVec::from_slice(&[1, 2, 3, 4, 5]),
        };
        let mut buf = vec![0xffu8; 16];
        rec.encode_into(&mut buf);
        let decoded = IndexRecord::decode(&buf);
        assert_eq!(decoded, rec);
        assert!(!decoded.is_empty());
        // tail bytes beyond len are zeroed
        assert!(buf[2 + 5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_record_has_zero_len_and_type() {
        let rec = IndexRecord::empty();
        let mut buf = vec![0xffu8; 16];
        rec.encode_into(&mut buf);
        let decoded = IndexRecord::decode(&buf);
        assert!(decoded.is_empty());
    }
}
