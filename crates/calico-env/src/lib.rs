//! The storage environment consumed by the engine core.
//!
//! [`Env`] abstracts the platform: file creation and deletion, random
//! numbers, and sleeping. [`File`] abstracts one open file: positional
//! I/O, advisory whole-file locks, and the shared-memory companion used
//! by the WAL index (region mapping, byte-range locks, memory barriers).
//!
//! The core never touches the OS directly; it is written entirely
//! against these traits. [`MemEnv`] is the complete in-memory
//! implementation, equivalent to a persistent environment in every
//! respect except durability across process restarts.

mod mem;

use std::sync::Arc;

use bitflags::bitflags;
use calico_error::{CalicoError, Result};
use parking_lot::Mutex;

pub use mem::MemEnv;

/// Size in bytes of one shared-memory region.
pub const SHM_REGION_SIZE: usize = 32 * 1024;

/// Number of byte-sized lock slots in the shared-memory file.
pub const SHM_LOCK_COUNT: usize = 8;

bitflags! {
    /// Mode bits for [`Env::new_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ_ONLY = 1;
        const READ_WRITE = 2;
        const CREATE = 4;
    }
}

bitflags! {
    /// Request bits for [`File::shm_lock`].
    ///
    /// Exactly one of `LOCK`/`UNLOCK` and one of `READER`/`WRITER` must
    /// be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmLockFlags: u8 {
        const LOCK = 1;
        const UNLOCK = 2;
        const READER = 4;
        const WRITER = 8;
    }
}

/// Advisory whole-file lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLockMode {
    Shared,
    Exclusive,
}

/// Handle to one mapped shared-memory region.
///
/// Regions are shared between every connection to the same database
/// within and across processes; the mutex stands in for the volatile
/// mapped memory a persistent environment would hand out.
pub type ShmRegion = Arc<Mutex<Box<[u8]>>>;

/// One open file.
pub trait File: Send + Sync {
    /// Read up to `out.len()` bytes at `offset`. Returns the number of
    /// bytes read; short reads happen only at end of file.
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<usize>;

    /// Read exactly `out.len()` bytes at `offset`, failing on EOF.
    fn read_exact(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let n = self.read(offset, out)?;
        if n == out.len() {
            Ok(())
        } else {
            Err(CalicoError::io(format!(
                "short read: wanted {} bytes at offset {offset}, got {n}",
                out.len()
            )))
        }
    }

    /// Write all of `data` at `offset`, extending the file as needed.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush buffered writes to durable storage.
    fn sync(&self) -> Result<()>;

    /// Truncate or extend the file to `size` bytes.
    fn resize(&self, size: u64) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;

    /// Take the advisory file lock in `mode`, upgrading a held shared
    /// lock when possible. Fails with `Busy` instead of blocking.
    fn file_lock(&self, mode: FileLockMode) -> Result<()>;

    /// Drop whatever advisory file lock this handle holds.
    fn file_unlock(&self);

    /// Map shared-memory region `region` (32 KiB each).
    ///
    /// With `extend` set, missing regions up to and including `region`
    /// are created zeroed; otherwise `Ok(None)` reports that the region
    /// does not exist yet.
    fn shm_map(&self, region: usize, extend: bool) -> Result<Option<ShmRegion>>;

    /// Lock or unlock `count` shared-memory lock bytes starting at
    /// `start`. Reader locks are shared, writer locks exclusive. Fails
    /// with `Busy` instead of blocking. All-or-nothing.
    fn shm_lock(&self, start: usize, count: usize, flags: ShmLockFlags) -> Result<()>;

    /// Unmap this handle's shared memory; with `unlink`, destroy the
    /// underlying shm object (last connection out).
    fn shm_unmap(&self, unlink: bool);

    /// Full memory barrier ordering shared-memory access.
    fn shm_barrier(&self);
}

/// Sink for diagnostic log lines.
pub trait Logger: Send + Sync {
    fn logv(&self, msg: &str);
}

/// The storage environment.
pub trait Env: Send + Sync {
    /// Open (and with [`OpenMode::CREATE`], possibly create) a file.
    fn new_file(&self, path: &str, mode: OpenMode) -> Result<Arc<dyn File>>;

    fn file_exists(&self, path: &str) -> bool;

    fn file_size(&self, path: &str) -> Result<u64>;

    fn resize_file(&self, path: &str, size: u64) -> Result<()>;

    fn remove_file(&self, path: &str) -> Result<()>;

    /// Reseed the environment RNG.
    fn srand(&self, seed: u32);

    /// Next pseudorandom value (WAL salts, backoff jitter).
    fn rand(&self) -> u32;

    /// Put the calling thread to sleep.
    fn sleep(&self, micros: u64);

    /// Open an append-only diagnostic log.
    fn new_logger(&self, path: &str) -> Result<Arc<dyn Logger>>;
}
