//! Cursors: ordered iteration with save/restore across structural
//! mutation.
//!
//! A cursor never holds page references between operations; it
//! remembers `(leaf page, index)` plus the full key and value of the
//! record it sits on. When the owning tree's epoch moves past the
//! cursor's, the position is stale and the cached key becomes the
//! anchor: the next operation re-seeks it. An anchor whose record was
//! erased resolves to the nearest neighbour in the direction of
//! travel, so erasing under a cursor leaves it on the successor.

use calico_error::{CalicoError, Result};
use calico_pager::Pager;
use calico_types::PageId;

use crate::node::{self, node_base};
use crate::tree::{Tree, descend, read_pair_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    /// Never positioned (or explicitly invalidated).
    Unset,
    /// Sitting on `(leaf, index)`.
    At(PageId, usize),
}

/// A cursor over one tree.
///
/// All operations take the pager and the owning [`Tree`] explicitly;
/// the cursor itself is plain data and stays valid across commits as
/// long as the tree handle does.
#[derive(Debug)]
pub struct Cursor {
    pos: Pos,
    epoch: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    status: Result<()>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Cursor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pos: Pos::Unset,
            epoch: 0,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            status: Ok(()),
        }
    }

    /// Whether the cursor sits on a record.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// First error any operation on this cursor hit.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Key of the current record.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// Value of the current record.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.value
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if self.status.is_ok() {
                self.status = Err(err.clone());
            }
            self.valid = false;
            self.pos = Pos::Unset;
        }
        result
    }

    fn load(&mut self, pager: &mut Pager, leaf: PageId, index: usize) -> Result<()> {
        let (key, value) = read_pair_at(pager, leaf, index)?;
        self.key = key;
        self.value = value;
        self.pos = Pos::At(leaf, index);
        self.valid = true;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.pos = Pos::Unset;
        self.valid = false;
    }

    /// Position on the first record with key `>= key`.
    pub fn seek(&mut self, pager: &mut Pager, tree: &Tree, key: &[u8]) -> Result<bool> {
        self.epoch = tree.epoch;
        let result = self.seek_inner(pager, tree, key);
        self.latch(result)
    }

    fn seek_inner(&mut self, pager: &mut Pager, tree: &Tree, key: &[u8]) -> Result<bool> {
        let found = descend(pager, tree.root, key)?;
        let &(leaf, index) = found.path.last().expect("path never empty");
        match self.normalize_forward(pager, leaf, index)? {
            Some((leaf, index)) => {
                self.load(pager, leaf, index)?;
                Ok(found.exact)
            }
            None => {
                self.invalidate();
                Ok(false)
            }
        }
    }

    /// Position on the smallest key in the tree.
    pub fn seek_first(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        self.epoch = tree.epoch;
        let result = self.seek_edge(pager, tree, false);
        self.latch(result)
    }

    /// Position on the largest key in the tree.
    pub fn seek_last(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        self.epoch = tree.epoch;
        let result = self.seek_edge(pager, tree, true);
        self.latch(result)
    }

    fn seek_edge(&mut self, pager: &mut Pager, tree: &Tree, last: bool) -> Result<()> {
        let mut current = tree.root;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > 32 {
                return Err(CalicoError::corruption("tree deeper than supported"));
            }
            let page = pager.acquire(current)?;
            let base = node_base(current);
            let (external, count) = {
                let data = pager.data(page);
                (node::is_external(data, base)?, node::cell_count(data, base))
            };
            if external {
                pager.release(page);
                if count == 0 {
                    self.invalidate();
                    return Ok(());
                }
                let index = if last { count - 1 } else { 0 };
                return self.load(pager, current, index);
            }
            let slot = if last { count } else { 0 };
            let child = crate::tree::child_at(pager, page, base, slot)?;
            pager.release(page);
            current = child;
        }
    }

    /// Advance to the next record in key order.
    pub fn next(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        let result = self.next_inner(pager, tree);
        self.latch(result)
    }

    fn next_inner(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        if self.pos == Pos::Unset {
            return Ok(());
        }
        if self.epoch != tree.epoch {
            // The tree moved; the cached key anchors the re-seek. If
            // the anchor itself is gone, its successor is already the
            // answer.
            self.epoch = tree.epoch;
            let anchor = std::mem::take(&mut self.key);
            let exact = self.seek_inner(pager, tree, &anchor)?;
            if !exact {
                return Ok(());
            }
        }
        let Pos::At(leaf, index) = self.pos else {
            return Ok(());
        };
        match self.step_forward(pager, leaf, index)? {
            Some((leaf, index)) => self.load(pager, leaf, index),
            None => {
                self.invalidate();
                Ok(())
            }
        }
    }

    /// Step back to the previous record in key order.
    pub fn previous(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        let result = self.previous_inner(pager, tree);
        self.latch(result)
    }

    fn previous_inner(&mut self, pager: &mut Pager, tree: &Tree) -> Result<()> {
        if self.pos == Pos::Unset {
            return Ok(());
        }
        if self.epoch != tree.epoch {
            self.epoch = tree.epoch;
            let anchor = std::mem::take(&mut self.key);
            let found = descend(pager, tree.root, &anchor)?;
            let &(leaf, index) = found.path.last().expect("path never empty");
            if found.exact {
                self.load(pager, leaf, index)?;
            } else {
                // The anchor is gone: its predecessor is the previous
                // record.
                match self.step_back(pager, leaf, index)? {
                    Some((leaf, index)) => return self.load(pager, leaf, index),
                    None => {
                        self.invalidate();
                        return Ok(());
                    }
                }
            }
        }
        let Pos::At(leaf, index) = self.pos else {
            return Ok(());
        };
        match self.step_back(pager, leaf, index)? {
            Some((leaf, index)) => self.load(pager, leaf, index),
            None => {
                self.invalidate();
                Ok(())
            }
        }
    }

    /// Re-resolve the cached record after a mutation, landing on the
    /// successor when the record was erased. Returns validity.
    pub fn refresh(&mut self, pager: &mut Pager, tree: &Tree) -> Result<bool> {
        if self.pos == Pos::Unset {
            return Ok(false);
        }
        if self.epoch != tree.epoch {
            self.epoch = tree.epoch;
            let anchor = std::mem::take(&mut self.key);
            self.seek_inner(pager, tree, &anchor)?;
        }
        Ok(self.valid)
    }

    /// Clamp `(leaf, index)` forward onto a real record, hopping to the
    /// next sibling when the index falls off the end.
    fn normalize_forward(
        &self,
        pager: &mut Pager,
        leaf: PageId,
        index: usize,
    ) -> Result<Option<(PageId, usize)>> {
        let page = pager.acquire(leaf)?;
        let base = node_base(leaf);
        let (count, next) = {
            let data = pager.data(page);
            (node::cell_count(data, base), node::next_sibling(data, base))
        };
        pager.release(page);
        if index < count {
            return Ok(Some((leaf, index)));
        }
        match PageId::new(next) {
            Some(next) => Ok(Some((next, 0))),
            None => Ok(None),
        }
    }

    fn step_forward(
        &self,
        pager: &mut Pager,
        leaf: PageId,
        index: usize,
    ) -> Result<Option<(PageId, usize)>> {
        self.normalize_forward(pager, leaf, index + 1)
    }

    fn step_back(
        &self,
        pager: &mut Pager,
        leaf: PageId,
        index: usize,
    ) -> Result<Option<(PageId, usize)>> {
        if index > 0 {
            return Ok(Some((leaf, index - 1)));
        }
        let page = pager.acquire(leaf)?;
        let prev = node::prev_sibling(pager.data(page), node_base(leaf));
        pager.release(page);
        let Some(prev) = PageId::new(prev) else {
            return Ok(None);
        };
        let page = pager.acquire(prev)?;
        let count = node::cell_count(pager.data(page), node_base(prev));
        pager.release(page);
        if count == 0 {
            return Err(CalicoError::corruption("empty leaf in sibling chain"));
        }
        Ok(Some((prev, count - 1)))
    }
}
