//! In-memory environment.
//!
//! Files are byte vectors, shared-memory regions are reference-counted
//! buffers, and advisory locks are virtualized in a per-file lock table
//! so that multiple connections inside one process contend exactly the
//! way separate processes would through the OS.

use std::sync::Arc;

use calico_error::{CalicoError, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::{
    Env, File, FileLockMode, Logger, OpenMode, SHM_LOCK_COUNT, SHM_REGION_SIZE, ShmLockFlags,
    ShmRegion,
};

/// Shared lock state for one file node.
#[derive(Default)]
struct NodeLocks {
    /// Number of handles holding the shared file lock.
    file_shared: usize,
    /// Whether some handle holds the exclusive file lock.
    file_exclusive: bool,
    /// Per-byte shm locks: reader counts and writer flags.
    shm_readers: [usize; SHM_LOCK_COUNT],
    shm_writers: [bool; SHM_LOCK_COUNT],
}

/// One file in the in-memory filesystem.
///
/// Handles share the node through an `Arc`, so a file stays readable
/// after `remove_file` until the last handle is dropped, matching
/// unlink-while-open semantics.
#[derive(Default)]
struct MemNode {
    data: Mutex<Vec<u8>>,
    shm: Mutex<Vec<ShmRegion>>,
    locks: Mutex<NodeLocks>,
}

/// Per-handle record of which shm bytes this handle has locked.
#[derive(Clone, Copy, PartialEq, Eq)]
enum HeldShm {
    None,
    Reader,
    Writer,
}

struct MemFile {
    node: Arc<MemNode>,
    held_file: Mutex<Option<FileLockMode>>,
    held_shm: Mutex<[HeldShm; SHM_LOCK_COUNT]>,
}

impl MemFile {
    fn new(node: Arc<MemNode>) -> Self {
        Self {
            node,
            held_file: Mutex::new(None),
            held_shm: Mutex::new([HeldShm::None; SHM_LOCK_COUNT]),
        }
    }
}

impl File for MemFile {
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let data = self.node.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = out.len().min(data.len() - offset);
        out[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.node.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn resize(&self, size: u64) -> Result<()> {
        self.node.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.node.data.lock().len() as u64)
    }

    fn file_lock(&self, mode: FileLockMode) -> Result<()> {
        let mut held = self.held_file.lock();
        if *held == Some(mode) {
            return Ok(());
        }
        let mut locks = self.node.locks.lock();
        match (mode, *held) {
            (FileLockMode::Shared, None) => {
                if locks.file_exclusive {
                    return Err(CalicoError::busy());
                }
                locks.file_shared += 1;
            }
            (FileLockMode::Shared, Some(FileLockMode::Exclusive)) => {
                // Downgrade.
                locks.file_exclusive = false;
                locks.file_shared += 1;
            }
            (FileLockMode::Exclusive, Some(FileLockMode::Shared)) => {
                // Upgrade allowed only for the sole shared holder.
                if locks.file_exclusive || locks.file_shared != 1 {
                    return Err(CalicoError::busy());
                }
                locks.file_shared = 0;
                locks.file_exclusive = true;
            }
            (FileLockMode::Exclusive, None) => {
                if locks.file_exclusive || locks.file_shared != 0 {
                    return Err(CalicoError::busy());
                }
                locks.file_exclusive = true;
            }
            _ => {}
        }
        *held = Some(mode);
        Ok(())
    }

    fn file_unlock(&self) {
        let mut held = self.held_file.lock();
        if let Some(mode) = held.take() {
            let mut locks = self.node.locks.lock();
            match mode {
                FileLockMode::Shared => locks.file_shared -= 1,
                FileLockMode::Exclusive => locks.file_exclusive = false,
            }
        }
    }

    fn shm_map(&self, region: usize, extend: bool) -> Result<Option<ShmRegion>> {
        let mut shm = self.node.shm.lock();
        if region >= shm.len() {
            if !extend {
                return Ok(None);
            }
            while shm.len() <= region {
                shm.push(Arc::new(Mutex::new(
                    vec![0_u8; SHM_REGION_SIZE].into_boxed_slice(),
                )));
            }
        }
        Ok(Some(Arc::clone(&shm[region])))
    }

    fn shm_lock(&self, start: usize, count: usize, flags: ShmLockFlags) -> Result<()> {
        assert!(count >= 1 && start + count <= SHM_LOCK_COUNT);
        assert!(flags.contains(ShmLockFlags::LOCK) != flags.contains(ShmLockFlags::UNLOCK));
        assert!(flags.contains(ShmLockFlags::READER) != flags.contains(ShmLockFlags::WRITER));

        let range = start..start + count;
        let mut held = self.held_shm.lock();
        let mut locks = self.node.locks.lock();

        if flags.contains(ShmLockFlags::UNLOCK) {
            for i in range {
                match held[i] {
                    HeldShm::Reader => locks.shm_readers[i] -= 1,
                    HeldShm::Writer => locks.shm_writers[i] = false,
                    HeldShm::None => {}
                }
                held[i] = HeldShm::None;
            }
            return Ok(());
        }

        let want_writer = flags.contains(ShmLockFlags::WRITER);
        // All-or-nothing: refuse the whole range before touching state.
        for i in range.clone() {
            let foreign_writer = locks.shm_writers[i] && held[i] != HeldShm::Writer;
            let foreign_readers =
                locks.shm_readers[i] > usize::from(held[i] == HeldShm::Reader);
            if foreign_writer || (want_writer && foreign_readers) {
                trace!(byte = i, want_writer, "shm lock contended");
                return Err(CalicoError::busy());
            }
        }
        for i in range {
            // Release whatever this handle already holds on the byte.
            match held[i] {
                HeldShm::Reader => locks.shm_readers[i] -= 1,
                HeldShm::Writer => locks.shm_writers[i] = false,
                HeldShm::None => {}
            }
            if want_writer {
                locks.shm_writers[i] = true;
                held[i] = HeldShm::Writer;
            } else {
                locks.shm_readers[i] += 1;
                held[i] = HeldShm::Reader;
            }
        }
        Ok(())
    }

    fn shm_unmap(&self, unlink: bool) {
        // Release any shm locks this handle still holds.
        let mut held = self.held_shm.lock();
        let mut locks = self.node.locks.lock();
        for i in 0..SHM_LOCK_COUNT {
            match held[i] {
                HeldShm::Reader => locks.shm_readers[i] -= 1,
                HeldShm::Writer => locks.shm_writers[i] = false,
                HeldShm::None => {}
            }
            held[i] = HeldShm::None;
        }
        drop(locks);
        drop(held);
        if unlink {
            self.node.shm.lock().clear();
        }
    }

    fn shm_barrier(&self) {
        // Region buffers are mutex-guarded; the lock edges are the
        // barrier.
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.file_unlock();
        self.shm_unmap(false);
    }
}

struct MemLogger {
    node: Arc<MemNode>,
}

impl Logger for MemLogger {
    fn logv(&self, msg: &str) {
        let mut data = self.node.data.lock();
        data.extend_from_slice(msg.as_bytes());
        data.push(b'\n');
    }
}

/// The in-memory [`Env`].
///
/// Cloning shares the filesystem, so connections built from clones of
/// one `MemEnv` see the same files and contend on the same locks.
#[derive(Clone)]
pub struct MemEnv {
    files: Arc<Mutex<HashMap<String, Arc<MemNode>>>>,
    rng: Arc<Mutex<SmallRng>>,
}

impl Default for MemEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEnv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            rng: Arc::new(Mutex::new(SmallRng::seed_from_u64(0))),
        }
    }

    fn find(&self, path: &str) -> Option<Arc<MemNode>> {
        self.files.lock().get(path).cloned()
    }
}

impl Env for MemEnv {
    fn new_file(&self, path: &str, mode: OpenMode) -> Result<Arc<dyn File>> {
        let mut files = self.files.lock();
        let node = match files.get(path) {
            Some(node) => Arc::clone(node),
            None if mode.contains(OpenMode::CREATE) => {
                let node = Arc::new(MemNode::default());
                files.insert(path.to_owned(), Arc::clone(&node));
                node
            }
            None => return Err(CalicoError::NotFound),
        };
        Ok(Arc::new(MemFile::new(node)))
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        self.find(path)
            .map(|node| node.data.lock().len() as u64)
            .ok_or(CalicoError::NotFound)
    }

    fn resize_file(&self, path: &str, size: u64) -> Result<()> {
        let node = self.find(path).ok_or(CalicoError::NotFound)?;
        node.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or(CalicoError::NotFound)
    }

    fn srand(&self, seed: u32) {
        *self.rng.lock() = SmallRng::seed_from_u64(u64::from(seed));
    }

    fn rand(&self) -> u32 {
        self.rng.lock().r#gen()
    }

    fn sleep(&self, micros: u64) {
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }

    fn new_logger(&self, path: &str) -> Result<Arc<dyn Logger>> {
        let mut files = self.files.lock();
        let node = files
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(MemNode::default()));
        Ok(Arc::new(MemLogger {
            node: Arc::clone(node),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(env: &MemEnv, path: &str) -> Arc<dyn File> {
        env.new_file(path, OpenMode::CREATE | OpenMode::READ_WRITE)
            .unwrap()
    }

    #[test]
    fn read_write_round_trip() {
        let env = MemEnv::new();
        let file = open(&env, "db");
        file.write(4, b"hello").unwrap();
        let mut out = [0_u8; 5];
        file.read_exact(4, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(file.size().unwrap(), 9);
    }

    #[test]
    fn short_reads_at_eof() {
        let env = MemEnv::new();
        let file = open(&env, "db");
        file.write(0, b"abc").unwrap();
        let mut out = [0_u8; 8];
        assert_eq!(file.read(1, &mut out).unwrap(), 2);
        assert_eq!(file.read(3, &mut out).unwrap(), 0);
        assert!(file.read_exact(0, &mut out).is_err());
    }

    #[test]
    fn missing_file_without_create() {
        let env = MemEnv::new();
        assert!(matches!(
            env.new_file("nope", OpenMode::READ_WRITE),
            Err(CalicoError::NotFound)
        ));
        assert!(!env.file_exists("nope"));
    }

    #[test]
    fn removed_file_stays_readable_through_open_handle() {
        let env = MemEnv::new();
        let file = open(&env, "db");
        file.write(0, b"still here").unwrap();
        env.remove_file("db").unwrap();
        assert!(!env.file_exists("db"));
        let mut out = [0_u8; 10];
        file.read_exact(0, &mut out).unwrap();
        assert_eq!(&out, b"still here");
    }

    #[test]
    fn file_lock_conflicts() {
        let env = MemEnv::new();
        let a = open(&env, "db");
        let b = open(&env, "db");

        a.file_lock(FileLockMode::Shared).unwrap();
        b.file_lock(FileLockMode::Shared).unwrap();
        // Upgrade blocked by the other shared holder.
        assert!(a.file_lock(FileLockMode::Exclusive).unwrap_err().is_busy());
        b.file_unlock();
        a.file_lock(FileLockMode::Exclusive).unwrap();
        assert!(b.file_lock(FileLockMode::Shared).unwrap_err().is_busy());
        a.file_unlock();
        b.file_lock(FileLockMode::Shared).unwrap();
    }

    #[test]
    fn dropping_a_handle_releases_its_locks() {
        let env = MemEnv::new();
        let a = open(&env, "db");
        a.file_lock(FileLockMode::Exclusive).unwrap();
        a.shm_lock(0, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
            .unwrap();
        drop(a);
        let b = open(&env, "db");
        b.file_lock(FileLockMode::Exclusive).unwrap();
        b.shm_lock(0, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
            .unwrap();
    }

    #[test]
    fn shm_reader_writer_compatibility() {
        let env = MemEnv::new();
        let a = open(&env, "db");
        let b = open(&env, "db");

        a.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::READER)
            .unwrap();
        b.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::READER)
            .unwrap();
        assert!(
            a.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
                .unwrap_err()
                .is_busy()
        );
        b.shm_lock(3, 1, ShmLockFlags::UNLOCK | ShmLockFlags::READER)
            .unwrap();
        // Sole reader may convert to writer in place.
        a.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
            .unwrap();
        assert!(
            b.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::READER)
                .unwrap_err()
                .is_busy()
        );
    }

    #[test]
    fn shm_range_locks_are_all_or_nothing() {
        let env = MemEnv::new();
        let a = open(&env, "db");
        let b = open(&env, "db");
        a.shm_lock(4, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
            .unwrap();
        assert!(
            b.shm_lock(3, 3, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
                .unwrap_err()
                .is_busy()
        );
        // Byte 3 must not have been taken by the failed range request.
        a.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
            .unwrap();
    }

    #[test]
    fn shm_regions_are_shared_between_handles() {
        let env = MemEnv::new();
        let a = open(&env, "db");
        let b = open(&env, "db");
        assert!(a.shm_map(0, false).unwrap().is_none());
        let region_a = a.shm_map(0, true).unwrap().unwrap();
        region_a.lock()[7] = 0xAB;
        let region_b = b.shm_map(0, false).unwrap().unwrap();
        assert_eq!(region_b.lock()[7], 0xAB);
        assert_eq!(region_b.lock().len(), SHM_REGION_SIZE);
    }

    #[test]
    fn srand_makes_rand_deterministic() {
        let env = MemEnv::new();
        env.srand(42);
        let first = (env.rand(), env.rand());
        env.srand(42);
        let second = (env.rand(), env.rand());
        assert_eq!(first, second);
    }

    #[test]
    fn logger_appends_lines() {
        let env = MemEnv::new();
        let logger = env.new_logger("log").unwrap();
        logger.logv("first");
        logger.logv("second");
        assert_eq!(env.file_size("log").unwrap(), 13);
    }
}
