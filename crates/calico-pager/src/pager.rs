//! The pager: transaction arbiter over the page cache and the WAL.
//!
//! One pager serves one connection, one transaction at a time. Reads
//! resolve cache → WAL snapshot → database file; writes dirty cached
//! frames and reach the WAL only as one sorted group at commit. The
//! first error observed mid-transaction is latched and every later
//! operation short-circuits until `finish`.

use std::sync::Arc;

use calico_env::{Env, File, FileLockMode, OpenMode};
use calico_error::{CalicoError, Result};
use calico_types::{PageId, PageSize};
use calico_wal::{BusyHandler, CheckpointMode, Wal};
use tracing::{debug, trace, warn};

use crate::freelist;
use crate::header::{FILE_HDR_SIZE, FileHeader};
use crate::page_cache::{PageCache, PageRef};
use crate::pointer_map;

/// Transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    /// No transaction.
    Open,
    /// Read snapshot held.
    Read,
    /// Write lock held, nothing dirtied yet.
    Write,
    /// Write lock held, dirty pages outstanding.
    Dirty,
    /// A mid-write failure poisoned the transaction; only `finish` is
    /// allowed.
    Error,
}

/// What to do with the cache entry when a page reference is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseAction {
    /// Leave the frame cached.
    #[default]
    Keep,
    /// Evict immediately if clean.
    NoCache,
    /// Evict even if dirty (scratch pages).
    Discard,
}

/// WAL durability levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never sync; durability comes from checkpoints.
    Off,
    /// Sync the WAL once per commit.
    #[default]
    Normal,
    /// Like `Normal`, plus sync on checkpoint boundaries.
    Full,
}

/// Pager construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    pub page_size: PageSize,
    /// Cache capacity in frames.
    pub cache_size: usize,
    pub sync_mode: SyncMode,
    /// Run a passive checkpoint after a commit leaves at least this
    /// many frames in the WAL. 0 disables.
    pub auto_checkpoint: u32,
    /// Hold the exclusive file lock for the life of the connection
    /// instead of the shared one.
    pub lock_exclusive: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            cache_size: 1024,
            sync_mode: SyncMode::default(),
            auto_checkpoint: 1000,
            lock_exclusive: false,
        }
    }
}

/// Cumulative counters surfaced through database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub frames_written: u64,
    pub commits: u64,
}

pub struct Pager {
    env: Arc<dyn Env>,
    db_file: Arc<dyn File>,
    wal: Wal,
    cache: PageCache,
    state: PagerState,
    /// Latched error; checked at every entry point.
    status: Result<()>,
    page_size: PageSize,
    /// Logical database size in pages at the current snapshot.
    page_count: u32,
    /// File-header fields mirrored for the duration of a transaction.
    pub(crate) freelist_head: u32,
    pub(crate) freelist_len: u32,
    largest_root: u32,
    change_counter: u64,
    /// Rollback baseline: header state as of the last commit.
    saved: FileHeader,
    sync_mode: SyncMode,
    auto_checkpoint: u32,
    frames_written: u64,
    commits: u64,
    wal_path: String,
}

impl Pager {
    /// Open the database and WAL files and build a pager. Takes (and
    /// keeps) the shared file lock that marks a live connection.
    pub fn open(env: Arc<dyn Env>, db_path: &str, options: &PagerOptions) -> Result<Self> {
        let mode = OpenMode::CREATE | OpenMode::READ_WRITE;
        let db_file = env.new_file(db_path, mode)?;
        let lock = if options.lock_exclusive {
            FileLockMode::Exclusive
        } else {
            FileLockMode::Shared
        };
        db_file.file_lock(lock)?;
        let wal_path = format!("{db_path}-wal");
        let wal_file = env.new_file(&wal_path, mode)?;
        let wal = Wal::new(
            Arc::clone(&env),
            Arc::clone(&db_file),
            wal_file,
            options.page_size.get(),
        );
        Ok(Self {
            env,
            db_file,
            wal,
            cache: PageCache::new(options.page_size.as_usize(), options.cache_size),
            state: PagerState::Open,
            status: Ok(()),
            page_size: options.page_size,
            page_count: 0,
            freelist_head: 0,
            freelist_len: 0,
            largest_root: 1,
            change_counter: 0,
            saved: FileHeader::new(options.page_size),
            sync_mode: options.sync_mode,
            auto_checkpoint: options.auto_checkpoint,
            frames_written: 0,
            commits: 0,
            wal_path,
        })
    }

    #[must_use]
    pub const fn state(&self) -> PagerState {
        self.state
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.page_count
    }

    #[must_use]
    pub const fn freelist_len(&self) -> u32 {
        self.freelist_len
    }

    #[must_use]
    pub const fn largest_root(&self) -> u32 {
        self.largest_root
    }

    /// Record a newly allocated bucket root.
    pub fn note_root(&mut self, root: PageId) {
        self.largest_root = self.largest_root.max(root.get());
    }

    #[must_use]
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            frames_written: self.frames_written,
            commits: self.commits,
        }
    }

    fn check_status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Latch `err` (first one wins) and poison the transaction if it
    /// was writing.
    fn latch(&mut self, err: CalicoError) -> CalicoError {
        if self.status.is_ok() {
            warn!(%err, "pager status latched");
            self.status = Err(err.clone());
        }
        if matches!(self.state, PagerState::Dirty) {
            self.state = PagerState::Error;
        }
        err
    }

    // --- transaction lifecycle --------------------------------------------

    /// Begin a read transaction: take a WAL snapshot. Sets `changed`
    /// when the database moved since this connection's last snapshot
    /// (stale cached pages are purged).
    pub fn lock_reader(&mut self) -> Result<bool> {
        debug_assert_eq!(self.state, PagerState::Open);
        self.check_status()?;
        let changed = self.wal.start_read()?;
        if changed {
            self.cache.purge_unpinned();
        }
        let mut pages = self.wal.db_size();
        if pages == 0 {
            pages = (self.db_file.size()? / u64::from(self.page_size.get())) as u32;
        }
        self.page_count = pages;
        self.state = PagerState::Read;
        trace!(page_count = pages, changed, "reader locked");
        Ok(changed)
    }

    /// Upgrade to writer. On success the file-header fields are
    /// refreshed from page 1 of the snapshot.
    pub fn begin_writer(&mut self) -> Result<()> {
        self.check_status()?;
        match self.state {
            PagerState::Write | PagerState::Dirty => return Ok(()),
            PagerState::Read => {}
            _ => return Err(CalicoError::invalid_argument("no read transaction")),
        }
        self.wal.start_write()?;
        if self.page_count > 0 {
            if let Err(err) = self.refresh_header() {
                self.wal.finish_write();
                return Err(self.latch(err));
            }
        }
        self.saved = self.header();
        self.state = PagerState::Write;
        Ok(())
    }

    fn header(&self) -> FileHeader {
        FileHeader {
            page_count: self.page_count,
            largest_root: self.largest_root,
            freelist_head: self.freelist_head,
            freelist_len: self.freelist_len,
            page_size: self.page_size,
            change_counter: self.change_counter,
        }
    }

    fn restore_header(&mut self, hdr: FileHeader) {
        self.page_count = hdr.page_count;
        self.largest_root = hdr.largest_root;
        self.freelist_head = hdr.freelist_head;
        self.freelist_len = hdr.freelist_len;
        self.change_counter = hdr.change_counter;
    }

    /// Re-read the authoritative header from page 1.
    fn refresh_header(&mut self) -> Result<()> {
        let root = self.acquire_internal(PageId::ROOT)?;
        let decoded = FileHeader::decode(&self.cache.data(root)[..FILE_HDR_SIZE]);
        self.release(root);
        let hdr = decoded?;
        if hdr.page_size != self.page_size {
            return Err(CalicoError::corruption("page size changed under connection"));
        }
        self.restore_header(hdr);
        Ok(())
    }

    /// Flush the dirty pages as one WAL commit group.
    pub fn commit(&mut self) -> Result<()> {
        self.check_status()?;
        match self.state {
            PagerState::Write => {
                // Nothing written; drop back to reader.
                self.wal.finish_write();
                self.state = PagerState::Read;
                Ok(())
            }
            PagerState::Dirty => match self.commit_dirty() {
                Ok(()) => {
                    self.state = PagerState::Write;
                    Ok(())
                }
                Err(err) => Err(self.latch(err)),
            },
            _ => Err(CalicoError::invalid_argument("no write transaction")),
        }
    }

    fn commit_dirty(&mut self) -> Result<()> {
        self.change_counter += 1;
        let root = self.acquire_internal(PageId::ROOT)?;
        self.mark_dirty(root);
        let hdr = self.header();
        hdr.encode(&mut self.cache.data_mut(root)[..FILE_HDR_SIZE]);
        self.release(root);

        let dirty = self.cache.sorted_dirty();
        let cache = &self.cache;
        let group: Vec<(u32, &[u8])> = dirty
            .iter()
            .map(|page| (page.page_id().get(), cache.data(*page)))
            .collect();
        self.wal
            .write_frames(&group, self.page_count, self.sync_mode != SyncMode::Off)?;
        self.frames_written += group.len() as u64;
        drop(group);
        for page in dirty {
            self.cache.mark_clean(page);
        }
        self.saved = self.header();
        self.commits += 1;
        debug!(
            page_count = self.page_count,
            change = self.change_counter,
            "commit flushed"
        );

        if self.auto_checkpoint > 0 && self.wal.frames() >= self.auto_checkpoint {
            match self.wal.checkpoint(CheckpointMode::Passive, &mut || false) {
                Ok(()) => {}
                Err(err) if err.is_busy() => trace!("auto checkpoint skipped: busy"),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// End the transaction. Rolls back in-flight writes, releases every
    /// WAL lock, and clears the latched status.
    pub fn finish(&mut self) {
        match self.state {
            PagerState::Open => {}
            PagerState::Read | PagerState::Write => self.wal.finish_read(),
            PagerState::Dirty | PagerState::Error => {
                let cache = &mut self.cache;
                let undo = self.wal.undo(|page_id| {
                    if let Some(id) = PageId::new(page_id) {
                        cache.erase(id);
                    }
                    Ok(())
                });
                if let Err(err) = undo {
                    warn!(%err, "wal rollback failed");
                }
                self.cache.discard_dirty();
                let saved = self.saved;
                self.restore_header(saved);
                self.wal.finish_read();
                debug!("write transaction rolled back");
            }
        }
        self.state = PagerState::Open;
        self.status = Ok(());
    }

    /// Drive a checkpoint. Requires no open transaction on this
    /// connection.
    pub fn checkpoint(&mut self, mode: CheckpointMode, busy: BusyHandler) -> Result<()> {
        self.check_status()?;
        if self.state != PagerState::Open {
            return Err(CalicoError::invalid_argument(
                "checkpoint requires an idle connection",
            ));
        }
        self.wal.checkpoint(mode, busy)
    }

    // --- page access ------------------------------------------------------

    /// Fetch a page for tree code. Pointer-map pages are never handed
    /// out here.
    pub fn acquire(&mut self, id: PageId) -> Result<PageRef> {
        if id.get() >= 2 && pointer_map::is_map_page(id, self.page_size.get()) {
            return Err(self.latch(CalicoError::corruption(format!(
                "page {id} is a pointer map page"
            ))));
        }
        self.acquire_internal(id)
    }

    /// Fetch any page, including pointer-map pages.
    pub(crate) fn acquire_internal(&mut self, id: PageId) -> Result<PageRef> {
        self.check_status()?;
        debug_assert!(self.state != PagerState::Open);
        if let Some(page) = self.cache.lookup(id) {
            return Ok(page);
        }
        if id.get() == self.page_count + 1 {
            // Extending the database by one page.
            if !matches!(self.state, PagerState::Write | PagerState::Dirty) {
                return Err(self.latch(CalicoError::corruption(format!(
                    "page {id} beyond end of database"
                ))));
            }
            let frame = match self.cache.allocate() {
                Ok(frame) => frame,
                Err(err) => return Err(self.latch(err)),
            };
            self.cache.fill(frame).fill(0);
            self.page_count += 1;
            return Ok(self.cache.install(frame, id));
        }
        if id.get() > self.page_count {
            return Err(self.latch(CalicoError::corruption(format!(
                "page {id} out of range (database has {} pages)",
                self.page_count
            ))));
        }
        match self.read_page(id) {
            Ok(page) => Ok(page),
            Err(err) => Err(self.latch(err)),
        }
    }

    fn read_page(&mut self, id: PageId) -> Result<PageRef> {
        let frame = self.cache.allocate()?;
        if let Err(err) = self.populate(frame, id) {
            self.cache.discard(frame);
            return Err(err);
        }
        Ok(self.cache.install(frame, id))
    }

    fn populate(&mut self, frame: PageRef, id: PageId) -> Result<()> {
        let found = {
            let buf = self.cache.fill(frame);
            self.wal.read_page(id.get(), buf)?
        };
        if !found {
            let offset = id.offset(self.page_size.get());
            let buf = self.cache.fill(frame);
            let n = self.db_file.read(offset, buf)?;
            // Pages past the file's physical end exist only as zeroes
            // until checkpointed.
            buf[n..].fill(0);
        }
        Ok(())
    }

    /// Allocate a page for new data: freelist first, then extend the
    /// file, skipping pointer-map slots. Returned dirty and pinned.
    pub fn allocate(&mut self) -> Result<PageRef> {
        self.check_status()?;
        match self.allocate_inner() {
            Ok(page) => Ok(page),
            Err(err) => Err(self.latch(err)),
        }
    }

    fn allocate_inner(&mut self) -> Result<PageRef> {
        if let Some(id) = freelist::pop(self)? {
            let page = self.acquire_internal(id)?;
            self.mark_dirty(page);
            self.cache.data_mut(page).fill(0);
            return Ok(page);
        }
        let mut next = PageId::new(self.page_count + 1)
            .ok_or_else(|| CalicoError::corruption("page count overflow"))?;
        if pointer_map::is_map_page(next, self.page_size.get()) {
            // Materialize the map page itself so the file stays dense.
            let map = self.acquire_internal(next)?;
            self.mark_dirty(map);
            self.release(map);
            next = PageId::new(self.page_count + 1)
                .ok_or_else(|| CalicoError::corruption("page count overflow"))?;
        }
        let page = self.acquire_internal(next)?;
        self.mark_dirty(page);
        Ok(page)
    }

    /// Return a page to the freelist. Consumes the reference.
    pub fn free(&mut self, page: PageRef) -> Result<()> {
        self.check_status()?;
        match freelist::push(self, page) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(err)),
        }
    }

    /// Pop one page id off the freelist without acquiring it. Used by
    /// vacuum to drain relocation targets.
    pub fn pop_freelist(&mut self) -> Result<Option<PageId>> {
        self.check_status()?;
        match freelist::pop(self) {
            Ok(id) => Ok(id),
            Err(err) => Err(self.latch(err)),
        }
    }

    /// Unthread a specific free page (vacuum is truncating it).
    pub fn remove_from_freelist(&mut self, id: PageId) -> Result<()> {
        self.check_status()?;
        match freelist::remove_page(self, id) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(err)),
        }
    }

    /// A pinned scratch frame with no page identity.
    pub fn get_unused_page(&mut self) -> Result<PageRef> {
        self.check_status()?;
        let frame = match self.cache.allocate() {
            Ok(frame) => frame,
            Err(err) => return Err(self.latch(err)),
        };
        self.cache.add_ref(frame);
        Ok(frame)
    }

    /// Give the dirty page behind `src` a new identity `dst`,
    /// displacing whatever the cache holds under `dst`. Returns the
    /// reference under the new id.
    pub fn move_page(&mut self, src: PageRef, dst: PageId) -> Result<PageRef> {
        self.check_status()?;
        debug_assert!(self.cache.is_dirty(src));
        let scratch = self.get_unused_page()?;
        let content = self.cache.data(src).to_vec();
        self.cache.fill(scratch).copy_from_slice(&content);
        self.cache.discard(src);
        let page = self.cache.rekey(scratch, dst);
        self.mark_dirty(page);
        trace!(from = %src.page_id(), to = %dst, "page moved");
        Ok(page)
    }

    /// Shrink the logical database. Cached pages beyond the boundary
    /// are dropped; the file itself shrinks at the next checkpoint.
    pub fn set_page_count(&mut self, pages: u32) {
        debug_assert!(pages >= 1 && pages <= self.page_count);
        self.cache.drop_pages_above(pages);
        self.page_count = pages;
    }

    /// First modification gate: transitions Write -> Dirty and adds the
    /// frame to the dirty list.
    pub fn mark_dirty(&mut self, page: PageRef) {
        debug_assert!(matches!(
            self.state,
            PagerState::Write | PagerState::Dirty | PagerState::Error
        ));
        if self.state == PagerState::Write {
            self.state = PagerState::Dirty;
        }
        self.cache.mark_dirty(page);
    }

    /// Release with the default `Keep` policy.
    pub fn release(&mut self, page: PageRef) {
        self.release_with(page, ReleaseAction::Keep);
    }

    pub fn release_with(&mut self, page: PageRef, action: ReleaseAction) {
        match action {
            ReleaseAction::Keep => self.cache.unref(page),
            ReleaseAction::NoCache => {
                self.cache.unref(page);
                if self.cache.refcount(page) == 0 && !self.cache.is_dirty(page) {
                    self.cache.erase(page.page_id());
                }
            }
            ReleaseAction::Discard => self.cache.discard(page),
        }
    }

    /// Page contents.
    #[must_use]
    pub fn data(&self, page: PageRef) -> &[u8] {
        self.cache.data(page)
    }

    /// Mutable page contents; the page must have been marked dirty.
    pub fn data_mut(&mut self, page: PageRef) -> &mut [u8] {
        self.cache.data_mut(page)
    }

    /// Walk the freelist and confirm it is structurally sound and that
    /// `freelist_len` is exact.
    pub fn validate_freelist(&mut self) -> Result<()> {
        freelist::validate(self)
    }

    /// Close the connection: best-effort checkpoint when this is the
    /// last one out, then drop shm and locks.
    pub fn close(&mut self) {
        debug_assert_eq!(self.state, PagerState::Open);
        let last = self.db_file.file_lock(FileLockMode::Exclusive).is_ok();
        if last {
            if let Err(err) = self.wal.checkpoint(CheckpointMode::Passive, &mut || false) {
                debug!(%err, "close checkpoint skipped");
            }
            self.wal.close(true);
            let _ = self.env.remove_file(&self.wal_path);
        } else {
            self.wal.close(false);
        }
        self.db_file.file_unlock();
    }
}
