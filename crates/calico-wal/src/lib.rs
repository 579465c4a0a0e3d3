//! Write-ahead logging.
//!
//! The WAL is the engine's sole redo log: a writer appends page images
//! as frames, a commit is one frame group whose last frame carries the
//! post-commit database size, and readers resolve pages through the
//! shared-memory index bounded by their snapshot frame. Checkpointing
//! transfers committed frames back into the database file.

mod cksum;
mod frame;
mod index;
mod wal;

pub use cksum::checksum;
pub use frame::{
    FRAME_HDR_SIZE, FrameHeader, WAL_HDR_SIZE, WAL_MAGIC, WAL_VERSION, WalHeader, frame_checksum,
    frame_offset,
};
pub use index::{INDEX_HDR_SIZE, IndexHeader, READ_MARK_UNUSED, READER_COUNT, WalIndex, hash_slot};
pub use wal::{BusyHandler, CheckpointMode, Wal};
