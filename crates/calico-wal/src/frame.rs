//! On-disk layout of the WAL file: the 32-byte file header and the
//! 24-byte header preceding each page-sized frame payload.

use calico_error::{CalicoError, Result};
use calico_types::{get_u32, put_u32};

use crate::cksum::checksum;

/// Identifies a WAL file.
pub const WAL_MAGIC: u32 = 0x5CA1_C0DB;

/// WAL format version written by this engine.
pub const WAL_VERSION: u32 = 1;

/// Size of the WAL file header.
pub const WAL_HDR_SIZE: usize = 32;

/// Size of the header preceding each frame payload.
pub const FRAME_HDR_SIZE: usize = 24;

/// Decoded WAL file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub page_size: u32,
    pub ckpt_seq: u32,
    pub salts: (u32, u32),
}

impl WalHeader {
    /// Encode, computing the trailing checksum over the first 24 bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; WAL_HDR_SIZE] {
        let mut out = [0_u8; WAL_HDR_SIZE];
        put_u32(&mut out, 0, WAL_MAGIC);
        put_u32(&mut out, 4, WAL_VERSION);
        put_u32(&mut out, 8, self.page_size);
        put_u32(&mut out, 12, self.ckpt_seq);
        put_u32(&mut out, 16, self.salts.0);
        put_u32(&mut out, 20, self.salts.1);
        let (c1, c2) = checksum((0, 0), &out[..24]);
        put_u32(&mut out, 24, c1);
        put_u32(&mut out, 28, c2);
        out
    }

    /// Decode and validate a WAL file header.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < WAL_HDR_SIZE {
            return Err(CalicoError::corruption("wal header truncated"));
        }
        if get_u32(raw, 0) != WAL_MAGIC {
            return Err(CalicoError::invalid_argument("not a wal file"));
        }
        if get_u32(raw, 4) != WAL_VERSION {
            return Err(CalicoError::invalid_argument(format!(
                "unsupported wal version {}",
                get_u32(raw, 4)
            )));
        }
        let (c1, c2) = checksum((0, 0), &raw[..24]);
        if (c1, c2) != (get_u32(raw, 24), get_u32(raw, 28)) {
            return Err(CalicoError::corruption("wal header checksum mismatch"));
        }
        Ok(Self {
            page_size: get_u32(raw, 8),
            ckpt_seq: get_u32(raw, 12),
            salts: (get_u32(raw, 16), get_u32(raw, 20)),
        })
    }

    /// Checksum seed for the first frame: the chain starts from the
    /// header's own checksummed prefix.
    #[must_use]
    pub fn seed(&self) -> (u32, u32) {
        checksum((0, 0), &self.encode()[..24])
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Page this frame holds.
    pub page_id: u32,
    /// 0 for a non-commit frame; for a commit frame, the database size
    /// in pages after the commit.
    pub db_size: u32,
    pub salts: (u32, u32),
    pub cksum: (u32, u32),
}

impl FrameHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HDR_SIZE] {
        let mut out = [0_u8; FRAME_HDR_SIZE];
        put_u32(&mut out, 0, self.page_id);
        put_u32(&mut out, 4, self.db_size);
        put_u32(&mut out, 8, self.salts.0);
        put_u32(&mut out, 12, self.salts.1);
        put_u32(&mut out, 16, self.cksum.0);
        put_u32(&mut out, 20, self.cksum.1);
        out
    }

    #[must_use]
    pub fn decode(raw: &[u8; FRAME_HDR_SIZE]) -> Self {
        Self {
            page_id: get_u32(raw, 0),
            db_size: get_u32(raw, 4),
            salts: (get_u32(raw, 8), get_u32(raw, 12)),
            cksum: (get_u32(raw, 16), get_u32(raw, 20)),
        }
    }
}

/// Continue the checksum chain over one frame.
///
/// Covers the first 8 bytes of the frame header (page id and commit
/// field) followed by the payload.
#[must_use]
pub fn frame_checksum(prev: (u32, u32), page_id: u32, db_size: u32, payload: &[u8]) -> (u32, u32) {
    let mut prefix = [0_u8; 8];
    put_u32(&mut prefix, 0, page_id);
    put_u32(&mut prefix, 4, db_size);
    checksum(checksum(prev, &prefix), payload)
}

/// Byte offset of 1-based frame `frame` in the WAL file.
#[must_use]
pub fn frame_offset(frame: u32, page_size: usize) -> u64 {
    WAL_HDR_SIZE as u64 + u64::from(frame - 1) * (FRAME_HDR_SIZE + page_size) as u64
}
