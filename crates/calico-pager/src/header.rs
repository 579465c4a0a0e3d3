//! The 100-byte file header at the front of page 1.

use calico_error::{CalicoError, Result};
use calico_types::{PageSize, get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

/// Identifies a database file.
pub const FILE_MAGIC: [u8; 16] = *b"CalicoDB format\0";

/// Format version written by this engine.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the header on page 1.
pub const FILE_HDR_SIZE: usize = 100;

/// Decoded file header.
///
/// Mirrored into the pager at transaction start; written back to page 1
/// on every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Database size in pages.
    pub page_count: u32,
    /// Highest bucket-root page id ever allocated.
    pub largest_root: u32,
    /// First freelist trunk page, 0 when the freelist is empty.
    pub freelist_head: u32,
    /// Total unused pages reachable from `freelist_head`.
    pub freelist_len: u32,
    pub page_size: PageSize,
    /// Bumped once per committed write transaction.
    pub change_counter: u64,
}

impl FileHeader {
    /// Header for a freshly created database of one page.
    #[must_use]
    pub fn new(page_size: PageSize) -> Self {
        Self {
            page_count: 1,
            largest_root: 1,
            freelist_head: 0,
            freelist_len: 0,
            page_size,
            change_counter: 0,
        }
    }

    /// Write into the front of page 1.
    pub fn encode(&self, out: &mut [u8]) {
        out[..16].copy_from_slice(&FILE_MAGIC);
        put_u32(out, 16, FORMAT_VERSION);
        put_u32(out, 20, self.page_count);
        put_u32(out, 24, self.largest_root);
        put_u32(out, 28, self.freelist_head);
        put_u32(out, 32, self.freelist_len);
        put_u16(out, 36, self.page_size.to_header_field());
        put_u16(out, 38, 0);
        put_u64(out, 40, self.change_counter);
        out[48..FILE_HDR_SIZE].fill(0);
    }

    /// Decode and validate the front of page 1.
    ///
    /// A wrong magic or version is `InvalidArgument` (not our file); a
    /// nonsensical field is `Corruption`.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < FILE_HDR_SIZE {
            return Err(CalicoError::invalid_argument("file too small for a database"));
        }
        if raw[..16] != FILE_MAGIC {
            return Err(CalicoError::invalid_argument("not a database file"));
        }
        let version = get_u32(raw, 16);
        if version != FORMAT_VERSION {
            return Err(CalicoError::invalid_argument(format!(
                "unsupported format version {version}"
            )));
        }
        let page_size = PageSize::from_header_field(get_u16(raw, 36))
            .ok_or_else(|| CalicoError::corruption("page size out of range"))?;
        let hdr = Self {
            page_count: get_u32(raw, 20),
            largest_root: get_u32(raw, 24),
            freelist_head: get_u32(raw, 28),
            freelist_len: get_u32(raw, 32),
            page_size,
            change_counter: get_u64(raw, 40),
        };
        if hdr.page_count == 0
            || hdr.freelist_head > hdr.page_count
            || hdr.freelist_len >= hdr.page_count
        {
            return Err(CalicoError::corruption("file header fields inconsistent"));
        }
        Ok(hdr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hdr = FileHeader {
            page_count: 99,
            largest_root: 12,
            freelist_head: 47,
            freelist_len: 30,
            page_size: PageSize::new(512).unwrap(),
            change_counter: 1234,
        };
        let mut raw = [0_u8; FILE_HDR_SIZE];
        hdr.encode(&mut raw);
        assert_eq!(FileHeader::decode(&raw).unwrap(), hdr);
    }

    #[test]
    fn bad_magic_is_invalid_argument() {
        let mut raw = [0_u8; FILE_HDR_SIZE];
        FileHeader::new(PageSize::DEFAULT).encode(&mut raw);
        raw[0] = b'X';
        assert!(FileHeader::decode(&raw).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn bad_version_is_invalid_argument() {
        let mut raw = [0_u8; FILE_HDR_SIZE];
        FileHeader::new(PageSize::DEFAULT).encode(&mut raw);
        put_u32(&mut raw, 16, 7);
        assert!(FileHeader::decode(&raw).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn inconsistent_fields_are_corruption() {
        let mut raw = [0_u8; FILE_HDR_SIZE];
        let mut hdr = FileHeader::new(PageSize::DEFAULT);
        hdr.page_count = 10;
        hdr.freelist_head = 11;
        hdr.encode(&mut raw);
        assert!(FileHeader::decode(&raw).unwrap_err().is_corruption());

        put_u16(&mut raw, 36, 300); // not a power of two
        assert!(FileHeader::decode(&raw).unwrap_err().is_corruption());
    }
}
