//! The write-ahead log: frame appends, snapshot reads, rollback, tail
//! recovery, and the checkpoint protocol.
//!
//! One `Wal` belongs to one connection. Cross-connection coordination
//! happens entirely through the shm index and the shm lock bytes:
//!
//! | byte | lock |
//! |---|---|
//! | 0 | WRITE |
//! | 1 | CHECKPOINT |
//! | 2 | RECOVER |
//! | 3..8 | READ\[0..5\] |
//!
//! A reader claims a slot whose mark equals its snapshot `max_frame`;
//! holding the slot's shared lock pins checkpoint backfill at or below
//! that mark. READ\[0\] is the "database only" slot used when the WAL
//! is empty.

use std::sync::Arc;

use calico_error::{CalicoError, Result};
use calico_env::{Env, File, ShmLockFlags};
use tracing::{debug, trace, warn};

use crate::frame::{
    FRAME_HDR_SIZE, FrameHeader, WAL_HDR_SIZE, WalHeader, frame_checksum, frame_offset,
};
use crate::index::{IndexHeader, READ_MARK_UNUSED, READER_COUNT, WalIndex};

const LOCK_WRITE: usize = 0;
const LOCK_CHECKPOINT: usize = 1;
const LOCK_RECOVER: usize = 2;

const fn read_lock(slot: usize) -> usize {
    3 + slot
}

/// How far a checkpoint is willing to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Transfer what the current readers allow; never wait for anyone.
    Passive,
    /// Wait (through the busy handler) until every frame is transferred.
    Full,
    /// Full, then reset the WAL so the next writer starts from frame 1.
    Restart,
}

/// Callback consulted before retrying a contended lock. Returning
/// `false` gives up with `Busy`.
pub type BusyHandler<'a> = &'a mut dyn FnMut() -> bool;

/// Per-connection WAL handle.
pub struct Wal {
    env: Arc<dyn Env>,
    db_file: Arc<dyn File>,
    wal_file: Arc<dyn File>,
    page_size: u32,
    index: WalIndex,
    /// Local copy of the last index header this connection observed
    /// (its snapshot while reading, the published tip while writing).
    hdr: IndexHeader,
    /// First WAL frame this snapshot must consult; earlier frames were
    /// already backfilled when the snapshot was taken.
    min_frame: u32,
    reader_slot: Option<usize>,
    writer: bool,
    /// Highest frame physically appended by this connection; equal to
    /// `hdr.max_frame` except transiently inside an append.
    applied: u32,
    /// Checksum chain value at `applied`.
    redo_cksum: (u32, u32),
    /// Checkpoint sequence number for the WAL file header.
    ckpt_seq: u32,
}

impl Wal {
    pub fn new(
        env: Arc<dyn Env>,
        db_file: Arc<dyn File>,
        wal_file: Arc<dyn File>,
        page_size: u32,
    ) -> Self {
        let index = WalIndex::new(Arc::clone(&db_file));
        Self {
            env,
            db_file,
            wal_file,
            page_size,
            index,
            hdr: IndexHeader {
                change: 0,
                is_init: false,
                page_size,
                max_frame: 0,
                page_count: 0,
                frame_cksum: (0, 0),
                salts: (0, 0),
            },
            min_frame: 1,
            reader_slot: None,
            writer: false,
            applied: 0,
            redo_cksum: (0, 0),
            ckpt_seq: 0,
        }
    }

    /// Database size in pages at the current snapshot (0 when the WAL
    /// has no committed frames; size then comes from the file).
    #[must_use]
    pub const fn db_size(&self) -> u32 {
        self.hdr.page_count
    }

    /// Committed frames in the log; drives the auto-checkpoint
    /// threshold.
    #[must_use]
    pub const fn frames(&self) -> u32 {
        self.hdr.max_frame
    }

    #[must_use]
    pub const fn is_reader(&self) -> bool {
        self.reader_slot.is_some()
    }

    #[must_use]
    pub const fn is_writer(&self) -> bool {
        self.writer
    }

    // --- shm lock helpers -------------------------------------------------

    fn try_excl(&self, start: usize, count: usize) -> Result<()> {
        self.db_file
            .shm_lock(start, count, ShmLockFlags::LOCK | ShmLockFlags::WRITER)
    }

    fn unlock_excl(&self, start: usize, count: usize) {
        let _ = self
            .db_file
            .shm_lock(start, count, ShmLockFlags::UNLOCK | ShmLockFlags::WRITER);
    }

    fn try_shared(&self, byte: usize) -> Result<()> {
        self.db_file
            .shm_lock(byte, 1, ShmLockFlags::LOCK | ShmLockFlags::READER)
    }

    fn unlock_shared(&self, byte: usize) {
        let _ = self
            .db_file
            .shm_lock(byte, 1, ShmLockFlags::UNLOCK | ShmLockFlags::READER);
    }

    fn lock_excl_busy(&self, start: usize, count: usize, busy: BusyHandler) -> Result<()> {
        loop {
            match self.try_excl(start, count) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_busy() => {
                    if !busy() {
                        return Err(CalicoError::busy());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    // --- recovery ---------------------------------------------------------

    /// Rebuild the shm index from the WAL file.
    ///
    /// Caller holds WRITE, CHECKPOINT, and RECOVER exclusively, so no
    /// reader trusts the index while it is rebuilt.
    fn recover(&mut self) -> Result<()> {
        let old_change = self.hdr.change;
        let db_pages = (self.db_file.size()? / u64::from(self.page_size)) as u32;
        let mut hdr = IndexHeader {
            change: old_change.wrapping_add(1),
            is_init: true,
            page_size: self.page_size,
            max_frame: 0,
            page_count: db_pages,
            frame_cksum: (0, 0),
            salts: (self.env.rand(), self.env.rand()),
        };

        self.index.cleanup(0)?;

        let wal_size = self.wal_file.size()?;
        if wal_size >= WAL_HDR_SIZE as u64 {
            let mut raw = [0_u8; WAL_HDR_SIZE];
            self.wal_file.read_exact(0, &mut raw)?;
            match WalHeader::decode(&raw) {
                Ok(wal_hdr) if wal_hdr.page_size == self.page_size => {
                    self.ckpt_seq = wal_hdr.ckpt_seq;
                    hdr.salts = wal_hdr.salts;
                    let (max_frame, page_count, cksum) = self.scan_frames(&wal_hdr)?;
                    if max_frame > 0 {
                        hdr.max_frame = max_frame;
                        hdr.page_count = page_count;
                        hdr.frame_cksum = cksum;
                    }
                    self.index.cleanup(hdr.max_frame)?;
                }
                Ok(_) | Err(_) => {
                    // Unusable header: the file is recycled wholesale.
                    warn!("wal header invalid; discarding log");
                }
            }
        }

        self.index.set_backfill(0)?;
        self.index.set_mark(0, 0)?;
        for slot in 1..READER_COUNT {
            self.index.set_mark(slot, READ_MARK_UNUSED)?;
        }
        self.index.write_header(&hdr)?;
        self.hdr = hdr;
        self.applied = hdr.max_frame;
        self.redo_cksum = hdr.frame_cksum;
        debug!(
            max_frame = hdr.max_frame,
            page_count = hdr.page_count,
            "wal recovery complete"
        );
        Ok(())
    }

    /// Walk the frame chain, indexing every frame whose checksum chain
    /// validates. Returns the last commit frame, its database size, and
    /// the chain value there.
    fn scan_frames(&mut self, wal_hdr: &WalHeader) -> Result<(u32, u32, (u32, u32))> {
        let page_size = self.page_size as usize;
        let mut payload = vec![0_u8; page_size];
        let mut chain = wal_hdr.seed();
        let mut frame = 1_u32;
        let mut last_commit = (0, 0, (0, 0));
        loop {
            let off = frame_offset(frame, page_size);
            let mut raw_hdr = [0_u8; FRAME_HDR_SIZE];
            if self.wal_file.read(off, &mut raw_hdr)? != FRAME_HDR_SIZE {
                break;
            }
            let fh = FrameHeader::decode(&raw_hdr);
            if fh.salts != wal_hdr.salts {
                break;
            }
            if self
                .wal_file
                .read(off + FRAME_HDR_SIZE as u64, &mut payload)?
                != page_size
            {
                break;
            }
            let expect = frame_checksum(chain, fh.page_id, fh.db_size, &payload);
            if expect != fh.cksum {
                trace!(frame, "checksum chain breaks; ignoring tail");
                break;
            }
            chain = expect;
            self.index.assign(fh.page_id, frame)?;
            if fh.db_size != 0 {
                last_commit = (frame, fh.db_size, chain);
            }
            frame += 1;
        }
        Ok(last_commit)
    }

    /// Run recovery if the index is torn or uninitialized. Returns
    /// `false` when the locks could not be had (caller retries).
    fn maybe_recover(&mut self) -> Result<bool> {
        if let Some(hdr) = self.index.read_header()? {
            if hdr.is_init {
                return Ok(true);
            }
        }
        if self.try_excl(LOCK_WRITE, 1).is_err() {
            return Ok(false);
        }
        if self.try_excl(LOCK_CHECKPOINT, 1).is_err() {
            self.unlock_excl(LOCK_WRITE, 1);
            return Ok(false);
        }
        if self.try_excl(LOCK_RECOVER, 1).is_err() {
            self.unlock_excl(LOCK_CHECKPOINT, 1);
            self.unlock_excl(LOCK_WRITE, 1);
            return Ok(false);
        }
        // Re-check: someone else may have finished recovery while we
        // were queueing on the locks.
        let result = match self.index.read_header()? {
            Some(hdr) if hdr.is_init => Ok(true),
            _ => self.recover().map(|()| true),
        };
        self.unlock_excl(LOCK_RECOVER, 1);
        self.unlock_excl(LOCK_CHECKPOINT, 1);
        self.unlock_excl(LOCK_WRITE, 1);
        result
    }

    // --- reader protocol --------------------------------------------------

    /// Take a read snapshot. Returns whether the database changed since
    /// this connection's previous snapshot.
    pub fn start_read(&mut self) -> Result<bool> {
        debug_assert!(self.reader_slot.is_none());
        let mut tries = 0;
        loop {
            tries += 1;
            if tries > 64 {
                return Err(CalicoError::retry());
            }
            if tries > 1 {
                // Brief jittered backoff keeps claim races from
                // livelocking.
                self.env.sleep(u64::from(self.env.rand()) % 300 + 50);
            }
            if let Some(changed) = self.try_start_read()? {
                return Ok(changed);
            }
        }
    }

    fn try_start_read(&mut self) -> Result<Option<bool>> {
        if !self.maybe_recover()? {
            return Ok(None);
        }
        let Some(hdr) = self.index.read_header()? else {
            return Ok(None);
        };

        if hdr.max_frame == 0 {
            // Database-only snapshot.
            if self.try_shared(read_lock(0)).is_err() {
                return Ok(None);
            }
            self.db_file.shm_barrier();
            if self.index.read_header()? != Some(hdr) {
                self.unlock_shared(read_lock(0));
                return Ok(None);
            }
            let changed = hdr.change != self.hdr.change;
            self.hdr = hdr;
            self.min_frame = 1;
            self.applied = 0;
            self.redo_cksum = hdr.frame_cksum;
            self.reader_slot = Some(0);
            return Ok(Some(changed));
        }

        let backfill = self.index.backfill()?;
        let mut chosen = None;
        for slot in 1..READER_COUNT {
            if self.index.read_mark(slot)? == hdr.max_frame && self.try_shared(read_lock(slot)).is_ok()
            {
                chosen = Some(slot);
                break;
            }
        }
        if chosen.is_none() {
            // Claim a slot: write our mark under the exclusive lock,
            // then downgrade to shared.
            for slot in 1..READER_COUNT {
                if self.try_excl(read_lock(slot), 1).is_ok() {
                    self.index.set_mark(slot, hdr.max_frame)?;
                    self.unlock_excl(read_lock(slot), 1);
                    if self.try_shared(read_lock(slot)).is_ok() {
                        chosen = Some(slot);
                    }
                    break;
                }
            }
        }
        let Some(slot) = chosen else {
            return Ok(None);
        };

        self.db_file.shm_barrier();
        // The mark and header must still describe our snapshot now that
        // the shared lock pins them.
        if self.index.read_mark(slot)? != hdr.max_frame || self.index.read_header()? != Some(hdr) {
            self.unlock_shared(read_lock(slot));
            return Ok(None);
        }
        let changed = hdr.change != self.hdr.change;
        self.hdr = hdr;
        self.min_frame = backfill + 1;
        self.applied = hdr.max_frame;
        self.redo_cksum = hdr.frame_cksum;
        self.reader_slot = Some(slot);
        trace!(slot, max_frame = hdr.max_frame, "read snapshot taken");
        Ok(Some(changed))
    }

    /// Release the read snapshot (and the write lock, if held).
    pub fn finish_read(&mut self) {
        self.finish_write();
        if let Some(slot) = self.reader_slot.take() {
            self.unlock_shared(read_lock(slot));
        }
    }

    /// Fetch `page_id` from the snapshot. Returns `false` when the page
    /// is not in the WAL and must come from the database file.
    pub fn read_page(&mut self, page_id: u32, out: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(out.len(), self.page_size as usize);
        match self
            .index
            .lookup(page_id, self.min_frame, self.hdr.max_frame)?
        {
            Some(frame) => {
                let off = frame_offset(frame, self.page_size as usize) + FRAME_HDR_SIZE as u64;
                self.wal_file.read_exact(off, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- writer protocol --------------------------------------------------

    /// Become the writer. Fails with `Busy` when another writer holds
    /// the lock, or with a retry hint when this snapshot is stale.
    pub fn start_write(&mut self) -> Result<()> {
        if self.writer {
            return Ok(());
        }
        debug_assert!(self.reader_slot.is_some());
        self.try_excl(LOCK_WRITE, 1)
            .map_err(|_| CalicoError::busy())?;
        // A writer must build on the newest commit; a stale snapshot
        // has to re-read before retrying.
        if self.index.read_header()? != Some(self.hdr) {
            self.unlock_excl(LOCK_WRITE, 1);
            return Err(CalicoError::retry());
        }
        self.writer = true;
        self.applied = self.hdr.max_frame;
        self.redo_cksum = self.hdr.frame_cksum;
        Ok(())
    }

    /// Drop the write lock without touching published state.
    pub fn finish_write(&mut self) {
        if self.writer {
            self.unlock_excl(LOCK_WRITE, 1);
            self.writer = false;
        }
    }

    /// Append one commit group: every dirty page, the last frame
    /// carrying the post-commit database size. Publishes the new index
    /// header once the frames are durable (per `sync`).
    pub fn write_frames(&mut self, pages: &[(u32, &[u8])], db_size: u32, sync: bool) -> Result<()> {
        debug_assert!(self.writer);
        debug_assert!(!pages.is_empty() && db_size != 0);

        if self.applied == 0 {
            // Fresh or reset log: the file header starts the chain.
            let wal_hdr = WalHeader {
                page_size: self.page_size,
                ckpt_seq: self.ckpt_seq,
                salts: self.hdr.salts,
            };
            self.wal_file.write(0, &wal_hdr.encode())?;
            self.redo_cksum = wal_hdr.seed();
        }

        let page_size = self.page_size as usize;
        let mut frame = self.applied;
        for (i, (page_id, data)) in pages.iter().enumerate() {
            debug_assert_eq!(data.len(), page_size);
            frame += 1;
            let commit = if i + 1 == pages.len() { db_size } else { 0 };
            let cksum = frame_checksum(self.redo_cksum, *page_id, commit, data);
            let header = FrameHeader {
                page_id: *page_id,
                db_size: commit,
                salts: self.hdr.salts,
                cksum,
            };
            let off = frame_offset(frame, page_size);
            self.wal_file.write(off, &header.encode())?;
            self.wal_file.write(off + FRAME_HDR_SIZE as u64, data)?;
            self.index.assign(*page_id, frame)?;
            self.redo_cksum = cksum;
        }
        self.applied = frame;

        if sync {
            self.wal_file.sync()?;
        }

        self.hdr.max_frame = frame;
        self.hdr.page_count = db_size;
        self.hdr.frame_cksum = self.redo_cksum;
        self.hdr.change = self.hdr.change.wrapping_add(1);
        self.index.write_header(&self.hdr)?;
        debug!(
            frames = pages.len(),
            max_frame = frame,
            db_size,
            "commit group published"
        );
        Ok(())
    }

    /// Undo every frame appended since the last published commit,
    /// reporting each undone page id so the pager can invalidate it.
    pub fn undo(&mut self, mut on_undo: impl FnMut(u32) -> Result<()>) -> Result<()> {
        if !self.writer {
            return Ok(());
        }
        for frame in (self.hdr.max_frame + 1)..=self.applied {
            on_undo(self.index.frame_page(frame)?)?;
        }
        if self.applied != self.hdr.max_frame {
            self.index.cleanup(self.hdr.max_frame)?;
            self.applied = self.hdr.max_frame;
            self.redo_cksum = self.hdr.frame_cksum;
        }
        Ok(())
    }

    // --- checkpoint -------------------------------------------------------

    /// Transfer committed frames into the database file.
    pub fn checkpoint(&mut self, mode: CheckpointMode, busy: BusyHandler) -> Result<()> {
        if self.try_excl(LOCK_CHECKPOINT, 1).is_err() {
            if mode == CheckpointMode::Passive || !busy() {
                return Err(CalicoError::busy());
            }
            self.lock_excl_busy(LOCK_CHECKPOINT, 1, busy)?;
        }
        let result = self.checkpoint_locked(mode, busy);
        self.unlock_excl(LOCK_CHECKPOINT, 1);
        result
    }

    fn checkpoint_locked(&mut self, mode: CheckpointMode, busy: BusyHandler) -> Result<()> {
        // Validate (and repair) the tail under RECOVER.
        if self.try_excl(LOCK_RECOVER, 1).is_err() {
            if mode == CheckpointMode::Passive {
                return Err(CalicoError::busy());
            }
            self.lock_excl_busy(LOCK_RECOVER, 1, busy)?;
        }
        let recover_result = self.maybe_recover();
        self.unlock_excl(LOCK_RECOVER, 1);
        if !recover_result? {
            return Err(CalicoError::busy());
        }

        // Exclude writers. Passive gives up instead of waiting. When
        // this connection is itself mid-transaction (auto-checkpoint
        // from commit) the lock is already held and must stay held.
        let own_write = !self.writer;
        if own_write {
            if self.try_excl(LOCK_WRITE, 1).is_err() {
                if mode == CheckpointMode::Passive {
                    return Err(CalicoError::busy());
                }
                self.lock_excl_busy(LOCK_WRITE, 1, busy)?;
            }
        }
        let result = self.backfill_and_reset(mode, busy);
        if own_write {
            self.unlock_excl(LOCK_WRITE, 1);
        }
        result
    }

    fn backfill_and_reset(&mut self, mode: CheckpointMode, busy: BusyHandler) -> Result<()> {
        // Snapshot the tip only now that writers are excluded: a commit
        // sneaking in before the WRITE lock must not be left behind a
        // restart.
        let mut hdr = self
            .index
            .read_header()?
            .ok_or_else(|| CalicoError::corruption("wal index header unreadable"))?;
        let page_size = self.page_size as usize;
        let mut backfill = self.index.backfill()?;

        if hdr.max_frame > backfill {
            // READ[0] is held exclusively while the database file is
            // rewritten so no reader starts a database-only snapshot
            // mid-transfer.
            if self.try_excl(read_lock(0), 1).is_err() {
                if mode == CheckpointMode::Passive {
                    return Err(CalicoError::busy());
                }
                self.lock_excl_busy(read_lock(0), 1, busy)?;
            }

            // Frames above a live reader's mark stay in the WAL.
            let mut mx_safe = hdr.max_frame;
            for slot in 1..READER_COUNT {
                loop {
                    let mark = self.index.read_mark(slot)?;
                    if mark == READ_MARK_UNUSED || mark >= mx_safe {
                        break;
                    }
                    if self.try_excl(read_lock(slot), 1).is_ok() {
                        self.index.set_mark(slot, READ_MARK_UNUSED)?;
                        self.unlock_excl(read_lock(slot), 1);
                        break;
                    }
                    if mode == CheckpointMode::Passive || !busy() {
                        mx_safe = mx_safe.min(mark);
                        break;
                    }
                }
            }

            if mx_safe > backfill {
                let mut payload = vec![0_u8; page_size];
                for (page_id, frame) in self.index.iterate(mx_safe)? {
                    if frame <= backfill {
                        continue;
                    }
                    let off = frame_offset(frame, page_size) + FRAME_HDR_SIZE as u64;
                    self.wal_file.read_exact(off, &mut payload)?;
                    self.db_file
                        .write(u64::from(page_id - 1) * page_size as u64, &payload)?;
                }
                if mx_safe == hdr.max_frame && hdr.page_count != 0 {
                    self.db_file
                        .resize(u64::from(hdr.page_count) * page_size as u64)?;
                }
                self.db_file.sync()?;
                self.index.set_backfill(mx_safe)?;
                backfill = mx_safe;
                debug!(backfill, max_frame = hdr.max_frame, "checkpoint transferred");
            }
            self.unlock_excl(read_lock(0), 1);
            if self.reader_slot == Some(0) {
                // The exclusive fence displaced this connection's own
                // database-only snapshot lock; restore it.
                self.try_shared(read_lock(0))?;
            }

            if backfill < hdr.max_frame && mode != CheckpointMode::Passive {
                return Err(CalicoError::busy());
            }
        }

        if mode == CheckpointMode::Restart {
            if backfill < hdr.max_frame {
                return Err(CalicoError::busy());
            }
            // Every reader slot is fenced while the log restarts.
            self.lock_excl_busy(read_lock(0), READER_COUNT, busy)?;
            self.ckpt_seq = self.ckpt_seq.wrapping_add(1);
            hdr.max_frame = 0;
            hdr.salts = (hdr.salts.0.wrapping_add(1), self.env.rand());
            hdr.frame_cksum = (0, 0);
            hdr.change = hdr.change.wrapping_add(1);
            self.index.write_header(&hdr)?;
            self.index.cleanup(0)?;
            self.index.set_backfill(0)?;
            self.index.set_mark(0, 0)?;
            for slot in 1..READER_COUNT {
                self.index.set_mark(slot, READ_MARK_UNUSED)?;
            }
            self.wal_file.resize(0)?;
            self.unlock_excl(read_lock(0), READER_COUNT);
            debug!(salt = hdr.salts.0, "wal restarted");
        }

        // A checkpoint runs outside any snapshot; adopt the tip so a
        // subsequent writer starts from published state.
        if self.reader_slot.is_none() {
            self.hdr = hdr;
            self.applied = hdr.max_frame;
            self.redo_cksum = hdr.frame_cksum;
        }
        Ok(())
    }

    /// Unmap shared memory, optionally destroying it (last connection).
    pub fn close(&mut self, unlink: bool) {
        self.index = WalIndex::new(Arc::clone(&self.db_file));
        self.db_file.shm_unmap(unlink);
    }
}
