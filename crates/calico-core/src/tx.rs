//! Transactions, bucket handles, and cursors.
//!
//! A [`Tx`] borrows the connection's single transaction slot. Buckets
//! resolve to tree handles kept in the transaction's bucket table;
//! the [`Bucket`] value handed to callers is a plain index stamped
//! with the transaction sequence, so a stale handle can never touch a
//! later transaction's state.

use std::sync::Arc;

use calico_error::{CalicoError, Result};
use calico_pager::Pager;
use calico_tree::{Cursor as TreeCursor, Tree};
use calico_types::PageId;
use parking_lot::Mutex;
use tracing::debug;

use crate::db::DbShared;
use crate::schema;

pub(crate) struct BucketState {
    pub(crate) tree: Tree,
    pub(crate) dropped: bool,
}

pub(crate) struct TxInfo {
    pub(crate) write: bool,
    pub(crate) schema: Tree,
    pub(crate) buckets: Vec<BucketState>,
}

impl TxInfo {
    pub(crate) fn new(write: bool) -> Self {
        Self {
            write,
            schema: Tree::open(PageId::ROOT),
            buckets: Vec::new(),
        }
    }
}

/// Handle to an open bucket, valid for the transaction that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    slot: usize,
    seq: u64,
}

/// One transaction on one connection.
///
/// Dropping a write transaction without [`Tx::commit`] rolls it back.
pub struct Tx {
    shared: Arc<Mutex<DbShared>>,
    seq: u64,
    write: bool,
    done: bool,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("write", &self.write)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Tx {
    pub(crate) fn new(shared: Arc<Mutex<DbShared>>, seq: u64, write: bool) -> Self {
        Self {
            shared,
            seq,
            write,
            done: false,
        }
    }

    #[must_use]
    pub const fn is_writer(&self) -> bool {
        self.write
    }

    fn writable(&self) -> Result<()> {
        if self.write {
            Ok(())
        } else {
            Err(CalicoError::invalid_argument(
                "operation requires a write transaction",
            ))
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut DbShared) -> Result<R>) -> Result<R> {
        let mut shared = self.shared.lock();
        shared.live_tx(self.seq)?;
        f(&mut shared)
    }

    /// Resolve a bucket handle into its tree state index.
    fn resolve(shared: &mut DbShared, seq: u64, bucket: Bucket) -> Result<usize> {
        if bucket.seq != seq {
            return Err(CalicoError::invalid_argument(
                "bucket handle outlives its transaction",
            ));
        }
        let tx = shared.live_tx(seq)?;
        let state = tx
            .buckets
            .get(bucket.slot)
            .ok_or_else(|| CalicoError::invalid_argument("unknown bucket handle"))?;
        if state.dropped {
            return Err(CalicoError::invalid_argument("bucket has been dropped"));
        }
        Ok(bucket.slot)
    }

    fn install_bucket(&self, shared: &mut DbShared, tree: Tree) -> Bucket {
        let tx = shared.tx.as_mut().expect("transaction checked");
        // Two opens of the same bucket share one state so cursors see
        // every mutation.
        if let Some(slot) = tx
            .buckets
            .iter()
            .position(|state| !state.dropped && state.tree.root == tree.root)
        {
            return Bucket {
                slot,
                seq: self.seq,
            };
        }
        tx.buckets.push(BucketState {
            tree,
            dropped: false,
        });
        Bucket {
            slot: tx.buckets.len() - 1,
            seq: self.seq,
        }
    }

    fn empty_database(pager: &Pager) -> bool {
        pager.page_count() == 0
    }

    // --- bucket management ------------------------------------------------

    /// Open a top-level bucket.
    pub fn open_bucket(&self, name: &[u8]) -> Result<Bucket> {
        self.with(|shared| {
            if Self::empty_database(&shared.pager) {
                return Err(CalicoError::NotFound);
            }
            let tx = shared.tx.as_mut().expect("transaction checked");
            let schema = tx.schema;
            let tree = schema::open_bucket(&mut shared.pager, &schema, name)?;
            Ok(self.install_bucket(shared, tree))
        })
    }

    /// Open a top-level bucket, creating it if missing.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket> {
        self.writable()?;
        self.with(|shared| {
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let tree = schema::create_bucket(&mut shared.pager, &mut tx.schema, name)?;
            Ok(self.install_bucket(shared, tree))
        })
    }

    /// Open a bucket nested inside `parent`.
    pub fn open_bucket_in(&self, parent: Bucket, name: &[u8]) -> Result<Bucket> {
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, parent)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let parent_tree = tx.buckets[slot].tree;
            let tree = schema::open_bucket(&mut shared.pager, &parent_tree, name)?;
            Ok(self.install_bucket(shared, tree))
        })
    }

    /// Create (or open) a bucket nested inside `parent`.
    pub fn create_bucket_in(&mut self, parent: Bucket, name: &[u8]) -> Result<Bucket> {
        self.writable()?;
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, parent)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let tree = {
                let parent_state = &mut tx.buckets[slot];
                schema::create_bucket(&mut shared.pager, &mut parent_state.tree, name)?
            };
            Ok(self.install_bucket(shared, tree))
        })
    }

    /// Drop a top-level bucket and every record and nested bucket in
    /// it.
    pub fn drop_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.writable()?;
        self.with(|shared| {
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let root = schema::drop_bucket(&mut shared.pager, &mut tx.schema, name)?;
            Self::mark_dropped(&mut shared.pager, tx, root);
            Ok(())
        })
    }

    /// Drop a bucket nested inside `parent`.
    pub fn drop_bucket_in(&mut self, parent: Bucket, name: &[u8]) -> Result<()> {
        self.writable()?;
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, parent)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let root = {
                let parent_state = &mut tx.buckets[slot];
                schema::drop_bucket(&mut shared.pager, &mut parent_state.tree, name)?
            };
            Self::mark_dropped(&mut shared.pager, tx, root);
            Ok(())
        })
    }

    /// Invalidate handles whose tree just went away (the dropped
    /// bucket and any nested bucket freed with it).
    fn mark_dropped(pager: &mut Pager, tx: &mut TxInfo, root: PageId) {
        for state in &mut tx.buckets {
            if state.dropped {
                continue;
            }
            if state.tree.root == root {
                state.dropped = true;
                continue;
            }
            let still_root = schema::verify_root(pager, &schema::encode_root(state.tree.root));
            if !matches!(still_root, Ok(Some(_))) {
                state.dropped = true;
            }
        }
    }

    /// Names of the buckets recorded at the top level, in key order.
    pub fn list_buckets(&self) -> Result<Vec<Vec<u8>>> {
        self.with(|shared| {
            if Self::empty_database(&shared.pager) {
                return Ok(Vec::new());
            }
            let shared = &mut *shared;
            let tx = shared.tx.as_ref().expect("transaction checked");
            schema::list_buckets(&mut shared.pager, &tx.schema)
        })
    }

    // --- records ----------------------------------------------------------

    /// Fetch the value stored under `key` in `bucket`.
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, bucket)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_ref().expect("transaction checked");
            tx.buckets[slot].tree.get(&mut shared.pager, key)
        })
    }

    /// Insert or overwrite a record.
    pub fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.writable()?;
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, bucket)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            tx.buckets[slot].tree.put(&mut shared.pager, key, value)
        })
    }

    /// Remove a record; absent keys succeed silently.
    pub fn erase(&mut self, bucket: Bucket, key: &[u8]) -> Result<()> {
        self.writable()?;
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, bucket)?;
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            tx.buckets[slot].tree.erase(&mut shared.pager, key)
        })
    }

    /// A cursor over `bucket`, initially unpositioned.
    pub fn cursor(&self, bucket: Bucket) -> Result<Cursor> {
        self.with(|shared| {
            let slot = Self::resolve(shared, self.seq, bucket)?;
            Ok(Cursor {
                shared: Arc::clone(&self.shared),
                seq: self.seq,
                slot,
                inner: TreeCursor::new(),
            })
        })
    }

    // --- maintenance ------------------------------------------------------

    /// Compact the database into its live prefix. The file shrinks at
    /// the next restart checkpoint.
    pub fn vacuum(&mut self) -> Result<()> {
        self.writable()?;
        self.with(|shared| {
            let shared = &mut *shared;
            let tx = shared.tx.as_mut().expect("transaction checked");
            let reroots = schema::vacuum(&mut shared.pager)?;
            schema::apply_reroots(&mut shared.pager, &mut tx.schema, &reroots)?;
            for state in &mut tx.buckets {
                if let Some(new_root) = reroots.get(&state.tree.root.get()) {
                    state.tree.root = *new_root;
                }
                // Every position may have moved; cursors must
                // re-anchor.
                state.tree.epoch += 1;
            }
            tx.schema.epoch += 1;
            debug!(reroots = reroots.len(), "vacuum applied");
            Ok(())
        })
    }

    /// Validate tree structure, bucket records, and the freelist.
    pub fn check_integrity(&self) -> Result<()> {
        self.with(|shared| {
            if Self::empty_database(&shared.pager) {
                return Ok(());
            }
            let shared = &mut *shared;
            let tx = shared.tx.as_ref().expect("transaction checked");
            schema::check_all(&mut shared.pager, &tx.schema)?;
            shared.pager.validate_freelist()
        })
    }

    /// Commit the transaction. Read transactions just release their
    /// snapshot.
    pub fn commit(mut self) -> Result<()> {
        let result = {
            let mut shared = self.shared.lock();
            shared.live_tx(self.seq)?;
            if self.write {
                shared.pager.commit()
            } else {
                Ok(())
            }
        };
        self.finish();
        result
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut shared = self.shared.lock();
        if shared.seq == self.seq && shared.tx.is_some() {
            shared.tx = None;
            shared.pager.finish();
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Ordered cursor over one bucket.
///
/// Stays usable across mutations in the same transaction: the cursor
/// re-anchors on its current key whenever the tree changes under it.
pub struct Cursor {
    shared: Arc<Mutex<DbShared>>,
    seq: u64,
    slot: usize,
    inner: TreeCursor,
}

impl Cursor {
    fn with<R>(
        &mut self,
        f: impl FnOnce(&mut TreeCursor, &mut Pager, &Tree) -> Result<R>,
    ) -> Result<R> {
        let mut shared = self.shared.lock();
        let shared = &mut *shared;
        let tx = shared.live_tx(self.seq)?;
        let state = tx
            .buckets
            .get(self.slot)
            .ok_or_else(|| CalicoError::invalid_argument("unknown bucket handle"))?;
        if state.dropped {
            return Err(CalicoError::invalid_argument("bucket has been dropped"));
        }
        let tree = state.tree;
        f(&mut self.inner, &mut shared.pager, &tree)
    }

    /// Position on the first record with key `>= key`; returns whether
    /// the match was exact.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.with(|cursor, pager, tree| cursor.seek(pager, tree, key))
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.with(|cursor, pager, tree| cursor.seek_first(pager, tree))
    }

    pub fn seek_last(&mut self) -> Result<()> {
        self.with(|cursor, pager, tree| cursor.seek_last(pager, tree))
    }

    pub fn next(&mut self) -> Result<()> {
        self.with(|cursor, pager, tree| cursor.next(pager, tree))
    }

    pub fn previous(&mut self) -> Result<()> {
        self.with(|cursor, pager, tree| cursor.previous(pager, tree))
    }

    /// Re-resolve the current record after mutations; returns
    /// validity.
    pub fn refresh(&mut self) -> Result<bool> {
        self.with(|cursor, pager, tree| cursor.refresh(pager, tree))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    /// Key of the current record.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    /// Value of the current record.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.inner.value()
    }
}
