//! The database handle.
//!
//! A `Db` is one connection: a pager over the database and WAL files.
//! It serves one transaction at a time; concurrency comes from opening
//! more connections (in this or another process) against the same
//! environment.

use std::sync::Arc;

use calico_env::{Env, OpenMode};
use calico_error::{CalicoError, Result};
use calico_pager::{
    FILE_HDR_SIZE, FileHeader, Pager, PagerOptions, PagerState, PagerStats,
};
use calico_tree::Tree;
use calico_types::PageSize;
use calico_wal::{CheckpointMode, WAL_HDR_SIZE, WalHeader};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::options::{LockMode, Options};
use crate::tx::{Tx, TxInfo};

/// Counters and sizes surfaced for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub pager: PagerStats,
    pub page_count: u32,
    pub freelist_len: u32,
}

pub(crate) struct DbShared {
    pub(crate) env: Arc<dyn Env>,
    pub(crate) pager: Pager,
    pub(crate) tx: Option<TxInfo>,
    /// Bumped per transaction; stale handles compare against it.
    pub(crate) seq: u64,
    pub(crate) busy_timeout: u64,
}

impl DbShared {
    pub(crate) fn live_tx(&mut self, seq: u64) -> Result<&mut TxInfo> {
        if self.seq != seq {
            return Err(CalicoError::invalid_argument(
                "handle outlives its transaction",
            ));
        }
        self.tx
            .as_mut()
            .ok_or_else(|| CalicoError::invalid_argument("no active transaction"))
    }
}

impl Drop for DbShared {
    fn drop(&mut self) {
        if self.pager.state() != PagerState::Open {
            self.pager.finish();
        }
        self.pager.close();
    }
}

/// A database connection.
pub struct Db {
    pub(crate) shared: Arc<Mutex<DbShared>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open (or create) the database at `path`.
    pub fn open(env: Arc<dyn Env>, path: &str, options: &Options) -> Result<Self> {
        let exists = env.file_exists(path) && env.file_size(path)? > 0;
        if exists && options.error_if_exists {
            return Err(CalicoError::invalid_argument(format!(
                "{path} already exists"
            )));
        }
        if !exists && !options.create_if_missing {
            return Err(CalicoError::NotFound);
        }

        let page_size = if exists {
            let file = env.new_file(path, OpenMode::READ_WRITE)?;
            let mut raw = [0_u8; FILE_HDR_SIZE];
            file.read_exact(0, &mut raw)
                .map_err(|_| CalicoError::invalid_argument("file too small for a database"))?;
            FileHeader::decode(&raw)?.page_size
        } else {
            // A crash can leave every page in the WAL with the
            // database file still empty; the log then dictates the
            // page size.
            wal_page_size(env.as_ref(), path)?.unwrap_or(options.page_size)
        };

        let pager_options = PagerOptions {
            page_size,
            cache_size: options.cache_size,
            sync_mode: options.sync_mode,
            auto_checkpoint: options.auto_checkpoint,
            lock_exclusive: options.lock_mode == LockMode::Exclusive,
        };
        let pager = Pager::open(Arc::clone(&env), path, &pager_options)?;
        debug!(path, page_size = page_size.get(), exists, "database opened");
        Ok(Self {
            shared: Arc::new(Mutex::new(DbShared {
                env,
                pager,
                tx: None,
                seq: 0,
                busy_timeout: options.busy_timeout,
            })),
        })
    }

    /// Remove every file belonging to the database at `path`.
    pub fn destroy(env: &dyn Env, path: &str) -> Result<()> {
        env.remove_file(path)?;
        for companion in [format!("{path}-wal"), format!("{path}-shm")] {
            match env.remove_file(&companion) {
                Ok(()) | Err(CalicoError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Begin a transaction. At most one runs per connection at a time.
    pub fn begin(&self, write: bool) -> Result<Tx> {
        let mut shared = self.shared.lock();
        if shared.tx.is_some() {
            return Err(CalicoError::invalid_argument(
                "a transaction is already active on this connection",
            ));
        }
        let mut waited = 0_u64;
        loop {
            match begin_inner(&mut shared, write) {
                Ok(()) => break,
                Err(err) if err.is_busy() && waited < shared.busy_timeout => {
                    let step = 1000.min(shared.busy_timeout - waited);
                    shared.env.sleep(step);
                    waited += step;
                }
                Err(err) => return Err(err),
            }
        }
        shared.seq += 1;
        let seq = shared.seq;
        shared.tx = Some(TxInfo::new(write));
        drop(shared);
        Ok(Tx::new(Arc::clone(&self.shared), seq, write))
    }

    /// Run `f` inside a read transaction.
    pub fn view<R>(&self, f: impl FnOnce(&Tx) -> Result<R>) -> Result<R> {
        let tx = self.begin(false)?;
        f(&tx)
    }

    /// Run `f` inside a write transaction, committing on success.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tx) -> Result<R>) -> Result<R> {
        let mut tx = self.begin(true)?;
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Transfer committed WAL frames into the database file.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.tx.is_some() {
            return Err(CalicoError::invalid_argument(
                "checkpoint requires an idle connection",
            ));
        }
        let env = Arc::clone(&shared.env);
        let mut budget = shared.busy_timeout;
        shared.pager.checkpoint(mode, &mut || {
            if budget == 0 {
                return false;
            }
            let step = 1000.min(budget);
            env.sleep(step);
            budget -= step;
            true
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let shared = self.shared.lock();
        Stats {
            pager: shared.pager.stats(),
            page_count: shared.pager.page_count(),
            freelist_len: shared.pager.freelist_len(),
        }
    }
}

fn begin_inner(shared: &mut DbShared, write: bool) -> Result<()> {
    shared.pager.lock_reader()?;
    if write {
        if let Err(err) = shared.pager.begin_writer() {
            shared.pager.finish();
            return Err(err);
        }
        if shared.pager.page_count() == 0 {
            // Brand-new database: page 1 hosts the file header and an
            // empty schema tree.
            if let Err(err) = Tree::bootstrap_root(&mut shared.pager) {
                shared.pager.finish();
                return Err(err);
            }
            debug_assert_eq!(shared.pager.page_count(), 1);
        }
    }
    Ok(())
}

fn wal_page_size(env: &dyn Env, path: &str) -> Result<Option<PageSize>> {
    let wal_path = format!("{path}-wal");
    if !env.file_exists(&wal_path) {
        return Ok(None);
    }
    let file = env.new_file(&wal_path, OpenMode::READ_WRITE)?;
    let mut raw = [0_u8; WAL_HDR_SIZE];
    if file.read(0, &mut raw)? != WAL_HDR_SIZE {
        return Ok(None);
    }
    match WalHeader::decode(&raw) {
        Ok(hdr) => Ok(PageSize::new(hdr.page_size)),
        Err(err) => {
            warn!(%err, "ignoring unreadable wal header");
            Ok(None)
        }
    }
}
