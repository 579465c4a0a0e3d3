//! B+-tree operations: search, insert with byte-balanced splits and
//! suffix-truncated separators, erase with merge/rotate rebalancing,
//! bulk free, relocation for vacuum, and structural validation.
//!
//! Internal nodes hold separators with left-child pointers plus a
//! rightmost child: every key in child `i` is strictly less than
//! separator `i`, which is less than or equal to everything in child
//! `i + 1`. External nodes form a doubly linked list in key order.

use std::cmp::Ordering;

use calico_error::{CalicoError, Result};
use calico_pager::{PageKind, PageRef, Pager, PtrEntry, pointer_map};
use calico_types::{PageId, get_u32, put_u32};
use smallvec::SmallVec;
use tracing::trace;

use crate::cell::{self, compose_cell, local_size};
use crate::node::{self, node_base};
use crate::overflow;

/// Largest accepted key.
pub const MAX_KEY_LEN: usize = 1 << 20;

/// Largest accepted value.
pub const MAX_VALUE_LEN: usize = 1 << 28;

/// Search path from the root to a leaf: `(page id, index)` per level.
/// At internal levels the index is the child slot taken
/// (`cell_count` means the rightmost child); at the leaf it is the
/// cell position.
pub(crate) type Path = SmallVec<[(PageId, usize); 12]>;

pub(crate) struct SearchResult {
    pub path: Path,
    pub exact: bool,
}

/// One B+-tree rooted at a fixed page.
///
/// `epoch` advances on every structural mutation; cursors compare it
/// to decide when their saved position must be re-derived.
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    pub root: PageId,
    pub epoch: u64,
}

impl Tree {
    /// Open an existing tree.
    #[must_use]
    pub const fn open(root: PageId) -> Self {
        Self { root, epoch: 0 }
    }

    /// Allocate and format a fresh bucket tree.
    pub fn create(pager: &mut Pager) -> Result<Self> {
        let page = pager.allocate()?;
        let id = page.page_id();
        node::init(pager.data_mut(page), 0, true);
        pager.release(page);
        pointer_map::write_entry(
            pager,
            id,
            PtrEntry {
                kind: PageKind::TreeRoot,
                back: 0,
            },
        )?;
        pager.note_root(id);
        Ok(Self::open(id))
    }

    /// Format page 1's node area for a brand-new database.
    pub fn bootstrap_root(pager: &mut Pager) -> Result<()> {
        let page = pager.acquire(PageId::ROOT)?;
        pager.mark_dirty(page);
        node::init(pager.data_mut(page), node_base(PageId::ROOT), true);
        pager.release(page);
        Ok(())
    }

    /// Fetch the value for `key`.
    pub fn get(&self, pager: &mut Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let found = descend(pager, self.root, key)?;
        if !found.exact {
            return Ok(None);
        }
        let &(leaf, index) = found.path.last().expect("path never empty");
        let (_, value) = read_pair_at(pager, leaf, index)?;
        Ok(Some(value))
    }

    /// Insert or overwrite `key`.
    pub fn put(&mut self, pager: &mut Pager, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(CalicoError::no_memory("value exceeds the payload limit"));
        }
        let found = descend(pager, self.root, key)?;
        let &(leaf, index) = found.path.last().expect("path never empty");

        let page_size = pager.page_size() as usize;
        let total = key.len() + value.len();
        let local_len = local_size(total, page_size);
        let mut payload = Vec::with_capacity(total);
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);

        let old_overflow = if found.exact {
            let page = pager.acquire(leaf)?;
            let old = node::read_cell(pager.data(page), node_base(leaf), index)?;
            pager.release(page);
            old.overflow
        } else {
            0
        };

        // Spill the payload tail, reusing the replaced record's chain
        // pages where they exist.
        let overflow_head = if local_len < total {
            overflow::write_chain(pager, old_overflow, &payload[local_len..])?
        } else {
            if old_overflow != 0 {
                overflow::free_chain(pager, old_overflow)?;
            }
            0
        };
        if overflow_head != 0 {
            set_chain_owner(pager, overflow_head, leaf)?;
        }
        let cell = compose_cell(
            true,
            0,
            key.len(),
            value.len(),
            &payload[..local_len],
            overflow_head,
        );

        if found.exact {
            let page = pager.acquire(leaf)?;
            pager.mark_dirty(page);
            node::remove_cell(pager.data_mut(page), node_base(leaf), index)?;
            pager.release(page);
        }
        overflow_insert(pager, self, &found.path, found.path.len() - 1, index, &cell)?;
        self.epoch += 1;
        Ok(())
    }

    /// Remove `key` if present. Absent keys succeed silently.
    pub fn erase(&mut self, pager: &mut Pager, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        let found = descend(pager, self.root, key)?;
        if !found.exact {
            return Ok(());
        }
        let &(leaf, index) = found.path.last().expect("path never empty");
        let page = pager.acquire(leaf)?;
        let overflow = node::read_cell(pager.data(page), node_base(leaf), index)?.overflow;
        pager.release(page);
        if overflow != 0 {
            overflow::free_chain(pager, overflow)?;
        }
        let page = pager.acquire(leaf)?;
        pager.mark_dirty(page);
        node::remove_cell(pager.data_mut(page), node_base(leaf), index)?;
        pager.release(page);
        rebalance(pager, self, &found.path, found.path.len() - 1)?;
        self.epoch += 1;
        Ok(())
    }

    /// Free every page of the tree, overflow chains included. Used by
    /// bucket drops; the root page itself goes on the freelist too.
    pub fn free_all(&mut self, pager: &mut Pager) -> Result<()> {
        free_subtree(pager, self.root)?;
        self.epoch += 1;
        Ok(())
    }

    /// Validate structural invariants: in-node key order, global key
    /// order across leaves, sibling links, uniform depth, and
    /// pointer-map parent entries.
    pub fn check(&self, pager: &mut Pager) -> Result<()> {
        let mut leaves = Vec::new();
        let mut leaf_depth = None;
        check_node(pager, self.root, self.root, 0, &mut leaf_depth, &mut leaves)?;
        let mut last_key: Option<Vec<u8>> = None;
        for i in 0..leaves.len() {
            let (id, first_key) = leaves[i].clone();
            let page = pager.acquire(id)?;
            let base = node_base(id);
            let prev = node::prev_sibling(pager.data(page), base);
            let next = node::next_sibling(pager.data(page), base);
            pager.release(page);
            let want_prev = if i == 0 { 0 } else { leaves[i - 1].0.get() };
            let want_next = if i + 1 == leaves.len() {
                0
            } else {
                leaves[i + 1].0.get()
            };
            if prev != want_prev || next != want_next {
                return Err(CalicoError::corruption(format!(
                    "leaf {id} sibling links broken"
                )));
            }
            if let (Some(last), Some(first)) = (&last_key, &first_key) {
                if first <= last {
                    return Err(CalicoError::corruption("keys not ascending across leaves"));
                }
            }
            if let Some(first) = first_key {
                last_key = Some(first);
            }
        }
        Ok(())
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(CalicoError::invalid_argument("keys must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CalicoError::no_memory("key exceeds the payload limit"));
    }
    Ok(())
}

fn set_chain_owner(pager: &mut Pager, head: u32, owner: PageId) -> Result<()> {
    pointer_map::write_entry(
        pager,
        PageId::new(head).ok_or_else(|| CalicoError::corruption("null overflow head"))?,
        PtrEntry {
            kind: PageKind::OverflowHead,
            back: owner.get(),
        },
    )
}

// --- search ---------------------------------------------------------------

/// Compare cell `index`'s key against `needle`, following the overflow
/// chain only as far as the comparison requires.
pub(crate) fn cmp_cell_key(
    pager: &mut Pager,
    page: PageRef,
    base: usize,
    index: usize,
    needle: &[u8],
) -> Result<Ordering> {
    let (prefix, key_len, overflow) = {
        let data = pager.data(page);
        let cell = node::read_cell(data, base, index)?;
        let lk = cell.local_key_len();
        (
            data[cell.local_off..cell.local_off + lk].to_vec(),
            cell.key_len,
            cell.overflow,
        )
    };
    let n = prefix.len().min(needle.len());
    let order = prefix[..n].cmp(&needle[..n]);
    if order != Ordering::Equal {
        return Ok(order);
    }
    if key_len <= prefix.len() {
        // Fully inline key; equal prefixes leave length to decide.
        return Ok(key_len.cmp(&needle.len()));
    }
    if needle.len() <= prefix.len() {
        return Ok(Ordering::Greater);
    }
    overflow::compare_suffix(pager, overflow, &needle[prefix.len()..], key_len - prefix.len())
}

/// Binary search within one node: `(position, exact)`.
pub(crate) fn node_search(
    pager: &mut Pager,
    page: PageRef,
    base: usize,
    key: &[u8],
) -> Result<(usize, bool)> {
    let count = node::cell_count(pager.data(page), base);
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp_cell_key(pager, page, base, mid, key)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok((mid, true)),
            Ordering::Greater => hi = mid,
        }
    }
    Ok((lo, false))
}

/// Child page referenced at slot `index` (`cell_count` selects the
/// rightmost child).
pub(crate) fn child_at(
    pager: &Pager,
    page: PageRef,
    base: usize,
    index: usize,
) -> Result<PageId> {
    let data = pager.data(page);
    let raw = if index == node::cell_count(data, base) {
        node::right_child(data, base)
    } else {
        node::read_cell(data, base, index)?.child
    };
    u32::try_from(raw)
        .ok()
        .and_then(PageId::new)
        .ok_or_else(|| CalicoError::corruption(format!("child pointer {raw} out of range")))
}

/// Walk from `root` to the leaf position for `key`.
pub(crate) fn descend(pager: &mut Pager, root: PageId, key: &[u8]) -> Result<SearchResult> {
    let mut path = Path::new();
    let mut current = root;
    loop {
        if path.len() > 32 {
            return Err(CalicoError::corruption("tree deeper than supported"));
        }
        let page = pager.acquire(current)?;
        let base = node_base(current);
        let external = node::is_external(pager.data(page), base)?;
        let (pos, exact) = node_search(pager, page, base, key)?;
        if external {
            pager.release(page);
            path.push((current, pos));
            return Ok(SearchResult { path, exact });
        }
        // Keys equal to a separator live in the right subtree.
        let slot = if exact { pos + 1 } else { pos };
        let child = child_at(pager, page, base, slot)?;
        pager.release(page);
        path.push((current, slot));
        current = child;
    }
}

/// Assemble the full key of cell `index` on `id`.
pub(crate) fn read_key_at(pager: &mut Pager, id: PageId, index: usize) -> Result<Vec<u8>> {
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let (mut key, key_len, overflow) = {
        let data = pager.data(page);
        let cell = node::read_cell(data, base, index)?;
        let lk = cell.local_key_len();
        (
            data[cell.local_off..cell.local_off + lk].to_vec(),
            cell.key_len,
            cell.overflow,
        )
    };
    pager.release(page);
    if key.len() < key_len {
        let missing = key_len - key.len();
        overflow::read_chain(pager, overflow, 0, missing, &mut key)?;
    }
    Ok(key)
}

/// Assemble the full `(key, value)` of cell `index` on leaf `id`.
pub(crate) fn read_pair_at(
    pager: &mut Pager,
    id: PageId,
    index: usize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let (mut key, mut value, key_len, value_len, overflow) = {
        let data = pager.data(page);
        let cell = node::read_cell(data, base, index)?;
        let lk = cell.local_key_len();
        let local = &data[cell.local_off..cell.local_off + cell.local_len];
        (
            local[..lk].to_vec(),
            local[lk..].to_vec(),
            cell.key_len,
            cell.value_len,
            cell.overflow,
        )
    };
    pager.release(page);
    let inline_key = key.len();
    if inline_key < key_len {
        overflow::read_chain(pager, overflow, 0, key_len - inline_key, &mut key)?;
    }
    if value.len() < value_len {
        // The chain stores the key remainder first, then the value
        // remainder.
        let chain_key_bytes = key_len - inline_key;
        let missing = value_len - value.len();
        overflow::read_chain(pager, overflow, chain_key_bytes, missing, &mut value)?;
    }
    Ok((key, value))
}

// --- insert / split -------------------------------------------------------

/// Shortest separator `p` with `left < p <= right` (byte-wise).
pub(crate) fn truncated_separator(left: &[u8], right: &[u8]) -> Vec<u8> {
    debug_assert!(left < right);
    let common = left
        .iter()
        .zip(right.iter())
        .take_while(|(a, b)| a == b)
        .count();
    right[..common + 1].to_vec()
}

/// Split index balancing encoded byte occupancy between the halves.
fn split_point(cells: &[Vec<u8>], internal: bool) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + 2).sum();
    let mut acc = 0;
    let mut point = cells.len() / 2;
    for (i, c) in cells.iter().enumerate() {
        acc += c.len() + 2;
        if acc * 2 >= total {
            point = i;
            break;
        }
    }
    // Both halves stay populated; an internal split also consumes the
    // middle cell.
    let max = if internal {
        cells.len().saturating_sub(2)
    } else {
        cells.len() - 1
    };
    point.clamp(1, max.max(1))
}

/// Re-point every child and overflow-chain head referenced from the
/// node at `id` back at `id` in the pointer map. Called on nodes that
/// received cells from elsewhere.
fn fix_links(pager: &mut Pager, id: PageId) -> Result<()> {
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let mut fixes: Vec<(u32, PageKind)> = Vec::new();
    {
        let data = pager.data(page);
        let external = node::is_external(data, base)?;
        for index in 0..node::cell_count(data, base) {
            let cell = node::read_cell(data, base, index)?;
            if !external {
                fixes.push((cell.child as u32, PageKind::TreeNode));
            }
            if cell.overflow != 0 {
                fixes.push((cell.overflow, PageKind::OverflowHead));
            }
        }
        if !external {
            fixes.push((node::right_child(data, base) as u32, PageKind::TreeNode));
        }
    }
    pager.release(page);
    for (raw, kind) in fixes {
        let target =
            PageId::new(raw).ok_or_else(|| CalicoError::corruption("null pointer in node"))?;
        pointer_map::write_entry(pager, target, PtrEntry { kind, back: id.get() })?;
    }
    Ok(())
}

fn take_all_cells(pager: &mut Pager, id: PageId) -> Result<Vec<Vec<u8>>> {
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let mut cells = Vec::new();
    {
        let data = pager.data(page);
        for index in 0..node::cell_count(data, base) {
            cells.push(node::cell_bytes(data, base, index)?.to_vec());
        }
    }
    pager.release(page);
    Ok(cells)
}

/// Rewrite a node from scratch with the given cells and link fields.
fn reload_node(
    pager: &mut Pager,
    id: PageId,
    external: bool,
    cells: &[Vec<u8>],
    links: (u32, u32),
    right_child: u64,
) -> Result<()> {
    let page = pager.acquire(id)?;
    pager.mark_dirty(page);
    let base = node_base(id);
    let mut fits = true;
    {
        let data = pager.data_mut(page);
        node::init(data, base, external);
        if external {
            node::set_prev_sibling(data, base, links.0);
            node::set_next_sibling(data, base, links.1);
        } else {
            node::set_right_child(data, base, right_child);
        }
        for (index, cell) in cells.iter().enumerate() {
            if !node::insert_cell(data, base, index, cell)? {
                fits = false;
                break;
            }
        }
    }
    pager.release(page);
    if fits {
        Ok(())
    } else {
        Err(CalicoError::corruption("cells no longer fit their node"))
    }
}

/// Full key of an encoded cell held outside any node.
fn cell_key(pager: &mut Pager, raw: &[u8], external: bool) -> Result<Vec<u8>> {
    let page_size = pager.page_size() as usize;
    let parsed = cell::parse_cell(raw, 0, external, page_size)?;
    let lk = parsed.local_key_len();
    let mut key = raw[parsed.local_off..parsed.local_off + lk].to_vec();
    if key.len() < parsed.key_len {
        overflow::read_chain(pager, parsed.overflow, 0, parsed.key_len - key.len(), &mut key)?;
    }
    Ok(key)
}

fn patch_child(cell: &mut [u8], child: u64) {
    cell[..8].copy_from_slice(&child.to_be_bytes());
}

/// Build an internal cell for `key`, spilling long keys to a chain
/// owned by `owner`.
fn build_internal_cell(
    pager: &mut Pager,
    child: PageId,
    key: &[u8],
    owner: PageId,
) -> Result<Vec<u8>> {
    let page_size = pager.page_size() as usize;
    let local_len = local_size(key.len(), page_size);
    let head = if local_len < key.len() {
        let head = overflow::write_chain(pager, 0, &key[local_len..])?;
        set_chain_owner(pager, head, owner)?;
        head
    } else {
        0
    };
    Ok(compose_cell(
        false,
        u64::from(child.get()),
        key.len(),
        0,
        &key[..local_len],
        head,
    ))
}

/// Insert `cell` at `index` of the node at `path[level]`, splitting as
/// needed all the way up.
fn overflow_insert(
    pager: &mut Pager,
    tree: &mut Tree,
    path: &[(PageId, usize)],
    level: usize,
    index: usize,
    cell: &[u8],
) -> Result<()> {
    let (id, _) = path[level];
    let page = pager.acquire(id)?;
    pager.mark_dirty(page);
    let base = node_base(id);
    let fit = node::insert_cell(pager.data_mut(page), base, index, cell)?;
    pager.release(page);
    if fit {
        return Ok(());
    }
    if id == tree.root {
        let child = split_root(pager, tree)?;
        let sub = [(tree.root, 0), (child, 0)];
        return overflow_insert(pager, tree, &sub, 1, index, cell);
    }
    split_nonroot(pager, tree, path, level, index, cell)
}

/// Push the root's entire content into a fresh child, leaving the root
/// as an empty internal node above it. The root page id never changes.
fn split_root(pager: &mut Pager, tree: &Tree) -> Result<PageId> {
    let root = tree.root;
    let base = node_base(root);
    let cells = take_all_cells(pager, root)?;
    let page = pager.acquire(root)?;
    let (external, right_child) = {
        let data = pager.data(page);
        let external = node::is_external(data, base)?;
        (
            external,
            if external { 0 } else { node::right_child(data, base) },
        )
    };
    pager.release(page);

    let child_page = pager.allocate()?;
    let child = child_page.page_id();
    pager.release(child_page);
    reload_node(pager, child, external, &cells, (0, 0), right_child)?;
    pointer_map::write_entry(
        pager,
        child,
        PtrEntry {
            kind: PageKind::TreeNode,
            back: root.get(),
        },
    )?;
    fix_links(pager, child)?;

    reload_node(pager, root, false, &[], (0, 0), u64::from(child.get()))?;
    trace!(root = %root, child = %child, "root split");
    Ok(child)
}

fn split_nonroot(
    pager: &mut Pager,
    tree: &mut Tree,
    path: &[(PageId, usize)],
    level: usize,
    index: usize,
    cell: &[u8],
) -> Result<()> {
    let (id, _) = path[level];
    let (parent_id, child_slot) = path[level - 1];
    let base = node_base(id);

    let mut cells = take_all_cells(pager, id)?;
    cells.insert(index, cell.to_vec());
    let page = pager.acquire(id)?;
    let (external, right_child, prev, next) = {
        let data = pager.data(page);
        let external = node::is_external(data, base)?;
        (
            external,
            if external { 0 } else { node::right_child(data, base) },
            if external { node::prev_sibling(data, base) } else { 0 },
            if external { node::next_sibling(data, base) } else { 0 },
        )
    };
    pager.release(page);

    let sibling_page = pager.allocate()?;
    let sibling = sibling_page.page_id();
    pager.release(sibling_page);

    let split = split_point(&cells, !external);
    let promoted = if external {
        let right = cells.split_off(split);
        // Suffix truncation keeps internal keys short.
        let left_last = cell_key(pager, cells.last().expect("left half nonempty"), true)?;
        let right_first = cell_key(pager, right.first().expect("right half nonempty"), true)?;
        let separator = truncated_separator(&left_last, &right_first);

        reload_node(pager, id, true, &cells, (prev, sibling.get()), 0)?;
        reload_node(pager, sibling, true, &right, (id.get(), next), 0)?;
        if let Some(after) = PageId::new(next) {
            let page = pager.acquire(after)?;
            pager.mark_dirty(page);
            node::set_prev_sibling(pager.data_mut(page), node_base(after), sibling.get());
            pager.release(page);
        }
        build_internal_cell(pager, id, &separator, parent_id)?
    } else {
        // The middle key moves up verbatim; its left child becomes the
        // left node's rightmost subtree.
        let right = cells.split_off(split + 1);
        let middle = cells.pop().expect("middle cell exists");
        let middle_cell = cell::parse_cell(&middle, 0, false, pager.page_size() as usize)?;

        reload_node(pager, id, false, &cells, (0, 0), middle_cell.child)?;
        reload_node(pager, sibling, false, &right, (0, 0), right_child)?;

        if middle_cell.overflow != 0 {
            set_chain_owner(pager, middle_cell.overflow, parent_id)?;
        }
        let mut promoted = middle;
        patch_child(&mut promoted, u64::from(id.get()));
        promoted
    };

    pointer_map::write_entry(
        pager,
        sibling,
        PtrEntry {
            kind: PageKind::TreeNode,
            back: parent_id.get(),
        },
    )?;
    fix_links(pager, sibling)?;

    // The slot that referenced this node now belongs to the new right
    // sibling; the promoted separator re-attaches this node on its
    // left.
    let parent = pager.acquire(parent_id)?;
    pager.mark_dirty(parent);
    let parent_base = node_base(parent_id);
    {
        let data = pager.data_mut(parent);
        if child_slot == node::cell_count(data, parent_base) {
            node::set_right_child(data, parent_base, u64::from(sibling.get()));
        } else {
            node::set_cell_child(data, parent_base, child_slot, u64::from(sibling.get()))?;
        }
    }
    pager.release(parent);
    trace!(node = %id, sibling = %sibling, external, "node split");
    overflow_insert(pager, tree, path, level - 1, child_slot, &promoted)
}

// --- erase / rebalance ----------------------------------------------------

fn underflowing(pager: &Pager, page: PageRef, base: usize) -> Result<bool> {
    let data = pager.data(page);
    let occupied = node::occupied(data, base)?;
    let usable = node::usable_space(data, base);
    Ok(occupied * 4 < usable || node::cell_count(data, base) == 0)
}

fn rebalance(
    pager: &mut Pager,
    tree: &mut Tree,
    path: &[(PageId, usize)],
    level: usize,
) -> Result<()> {
    let (id, _) = path[level];

    if id == tree.root {
        return collapse_root(pager, tree);
    }

    let page = pager.acquire(id)?;
    let shrunk = underflowing(pager, page, node_base(id))?;
    pager.release(page);
    if !shrunk {
        return Ok(());
    }

    let (parent_id, child_slot) = path[level - 1];
    let parent = pager.acquire(parent_id)?;
    let parent_base = node_base(parent_id);
    let parent_count = node::cell_count(pager.data(parent), parent_base);
    // Prefer the right sibling, fall back to the left.
    let (left_slot, left_id, right_id) = if child_slot < parent_count {
        (
            child_slot,
            id,
            child_at(pager, parent, parent_base, child_slot + 1)?,
        )
    } else {
        (
            child_slot - 1,
            child_at(pager, parent, parent_base, child_slot - 1)?,
            id,
        )
    };
    pager.release(parent);

    let external = {
        let page = pager.acquire(left_id)?;
        let external = node::is_external(pager.data(page), node_base(left_id))?;
        pager.release(page);
        external
    };

    if try_merge(pager, parent_id, left_slot, left_id, right_id, external)? {
        rebalance(pager, tree, path, level - 1)
    } else {
        rotate(pager, tree, path, level, left_slot, left_id, right_id, external)
    }
}

/// If the root is an internal node left with no separators, pull its
/// single child's content up (the root page id never changes).
fn collapse_root(pager: &mut Pager, tree: &mut Tree) -> Result<()> {
    let root = tree.root;
    let base = node_base(root);
    let page = pager.acquire(root)?;
    let (external, count, right_child) = {
        let data = pager.data(page);
        (
            node::is_external(data, base)?,
            node::cell_count(data, base),
            node::right_child(data, base),
        )
    };
    pager.release(page);
    if external || count > 0 {
        return Ok(());
    }
    let child = u32::try_from(right_child)
        .ok()
        .and_then(PageId::new)
        .ok_or_else(|| CalicoError::corruption("root child pointer invalid"))?;

    let root_usable = pager.page_size() as usize - base - 16;
    let child_base = node_base(child);
    let child_page = pager.acquire(child)?;
    let (child_occ, child_external, child_right) = {
        let data = pager.data(child_page);
        let external = node::is_external(data, child_base)?;
        (
            node::occupied(data, child_base)?,
            external,
            if external { 0 } else { node::right_child(data, child_base) },
        )
    };
    pager.release(child_page);
    if child_occ > root_usable {
        // Page 1 has less room than a full child; leave the extra
        // level in place.
        return Ok(());
    }

    let cells = take_all_cells(pager, child)?;
    reload_node(pager, root, child_external, &cells, (0, 0), child_right)?;
    fix_links(pager, root)?;
    let child_page = pager.acquire(child)?;
    pager.mark_dirty(child_page);
    pager.free(child_page)?;
    trace!(root = %root, "root collapsed");
    Ok(())
}

/// Merge the right sibling into the left when both fit one node.
fn try_merge(
    pager: &mut Pager,
    parent_id: PageId,
    left_slot: usize,
    left_id: PageId,
    right_id: PageId,
    external: bool,
) -> Result<bool> {
    let parent_base = node_base(parent_id);
    let (left_occ, left_prev, left_rc) = {
        let page = pager.acquire(left_id)?;
        let data = pager.data(page);
        let base = node_base(left_id);
        let occ = node::occupied(data, base)?;
        let prev = if external { node::prev_sibling(data, base) } else { 0 };
        let rc = if external { 0 } else { node::right_child(data, base) };
        pager.release(page);
        (occ, prev, rc)
    };
    let (right_occ, right_next, right_rc) = {
        let page = pager.acquire(right_id)?;
        let data = pager.data(page);
        let base = node_base(right_id);
        let occ = node::occupied(data, base)?;
        let next = if external { node::next_sibling(data, base) } else { 0 };
        let rc = if external { 0 } else { node::right_child(data, base) };
        pager.release(page);
        (occ, next, rc)
    };

    let sep_bytes = {
        let parent = pager.acquire(parent_id)?;
        let bytes = node::cell_bytes(pager.data(parent), parent_base, left_slot)?.to_vec();
        pager.release(parent);
        bytes
    };
    // The separator cell joins an internal merge.
    let sep_cost = if external { 0 } else { sep_bytes.len() + 2 };
    let usable = pager.page_size() as usize - node_base(left_id) - 16;
    if left_occ + right_occ + sep_cost > usable {
        return Ok(false);
    }

    let mut cells = take_all_cells(pager, left_id)?;
    if !external {
        let mut sep = sep_bytes.clone();
        patch_child(&mut sep, left_rc);
        cells.push(sep);
    }
    cells.extend(take_all_cells(pager, right_id)?);
    reload_node(
        pager,
        left_id,
        external,
        &cells,
        (left_prev, right_next),
        right_rc,
    )?;
    fix_links(pager, left_id)?;
    if external {
        if let Some(after) = PageId::new(right_next) {
            let page = pager.acquire(after)?;
            pager.mark_dirty(page);
            node::set_prev_sibling(pager.data_mut(page), node_base(after), left_id.get());
            pager.release(page);
        }
        // An external merge retires the separator for good; release
        // its chain.
        let sep_cell = cell::parse_cell(&sep_bytes, 0, false, pager.page_size() as usize)?;
        if sep_cell.overflow != 0 {
            overflow::free_chain(pager, sep_cell.overflow)?;
        }
    }

    // Parent loses the separator; the slot after it re-attaches to the
    // merged node.
    let parent = pager.acquire(parent_id)?;
    pager.mark_dirty(parent);
    {
        let data = pager.data_mut(parent);
        node::remove_cell(data, parent_base, left_slot)?;
        let count = node::cell_count(data, parent_base);
        if left_slot == count {
            node::set_right_child(data, parent_base, u64::from(left_id.get()));
        } else {
            node::set_cell_child(data, parent_base, left_slot, u64::from(left_id.get()))?;
        }
    }
    pager.release(parent);

    let right_page = pager.acquire(right_id)?;
    pager.mark_dirty(right_page);
    pager.free(right_page)?;
    trace!(left = %left_id, right = %right_id, "nodes merged");
    Ok(true)
}

/// Shift cells between siblings through the parent until the smaller
/// side is healthy again, then refresh the separator.
#[allow(clippy::too_many_arguments)]
fn rotate(
    pager: &mut Pager,
    tree: &mut Tree,
    path: &[(PageId, usize)],
    level: usize,
    left_slot: usize,
    left_id: PageId,
    right_id: PageId,
    external: bool,
) -> Result<()> {
    let parent_id = path[level - 1].0;
    let page_size = pager.page_size() as usize;
    let mut left = take_all_cells(pager, left_id)?;
    let mut right = take_all_cells(pager, right_id)?;

    let sep_bytes = {
        let parent = pager.acquire(parent_id)?;
        let bytes = node::cell_bytes(pager.data(parent), node_base(parent_id), left_slot)?.to_vec();
        pager.release(parent);
        bytes
    };

    let occ = |cells: &[Vec<u8>]| cells.iter().map(|c| c.len() + 2).sum::<usize>();
    let threshold = (page_size - 16) / 4;

    let promoted = if external {
        // Move leaf cells across the boundary, then re-derive the
        // separator with suffix truncation.
        while occ(&left) < threshold && right.len() > 1 {
            left.push(right.remove(0));
        }
        while occ(&right) < threshold && left.len() > 1 {
            right.insert(0, left.pop().expect("left nonempty"));
        }
        let left_last = cell_key(pager, left.last().expect("left nonempty"), true)?;
        let right_first = cell_key(pager, right.first().expect("right nonempty"), true)?;
        let (left_prev, right_next) = sibling_bounds(pager, left_id, right_id)?;
        reload_node(pager, left_id, true, &left, (left_prev, right_id.get()), 0)?;
        reload_node(pager, right_id, true, &right, (left_id.get(), right_next), 0)?;
        fix_links(pager, left_id)?;
        fix_links(pager, right_id)?;
        let sep_cell = cell::parse_cell(&sep_bytes, 0, false, page_size)?;
        if sep_cell.overflow != 0 {
            overflow::free_chain(pager, sep_cell.overflow)?;
        }
        let separator = truncated_separator(&left_last, &right_first);
        build_internal_cell(pager, left_id, &separator, parent_id)?
    } else {
        // One internal rotation: the separator comes down on one side
        // and the boundary cell's key goes up verbatim.
        let left_rc = {
            let page = pager.acquire(left_id)?;
            let rc = node::right_child(pager.data(page), node_base(left_id));
            pager.release(page);
            rc
        };
        let right_rc = {
            let page = pager.acquire(right_id)?;
            let rc = node::right_child(pager.data(page), node_base(right_id));
            pager.release(page);
            rc
        };
        let mut down = sep_bytes.clone();
        let up = if occ(&left) < occ(&right) {
            patch_child(&mut down, left_rc);
            left.push(down);
            let up = right.remove(0);
            let up_cell = cell::parse_cell(&up, 0, false, page_size)?;
            reload_node(pager, left_id, false, &left, (0, 0), up_cell.child)?;
            reload_node(pager, right_id, false, &right, (0, 0), right_rc)?;
            up
        } else {
            patch_child(&mut down, left_rc);
            right.insert(0, down);
            let up = left.pop().expect("left nonempty");
            let up_cell = cell::parse_cell(&up, 0, false, page_size)?;
            reload_node(pager, left_id, false, &left, (0, 0), up_cell.child)?;
            reload_node(pager, right_id, false, &right, (0, 0), right_rc)?;
            up
        };
        fix_links(pager, left_id)?;
        fix_links(pager, right_id)?;
        let up_cell = cell::parse_cell(&up, 0, false, page_size)?;
        if up_cell.overflow != 0 {
            // The promoted key's chain now answers to the parent.
            set_chain_owner(pager, up_cell.overflow, parent_id)?;
        }
        let mut promoted = up;
        patch_child(&mut promoted, u64::from(left_id.get()));
        promoted
    };

    // Swap the parent's separator. The replacement may be longer than
    // the old one, so it goes back in through the split machinery.
    let parent = pager.acquire(parent_id)?;
    pager.mark_dirty(parent);
    node::remove_cell(pager.data_mut(parent), node_base(parent_id), left_slot)?;
    pager.release(parent);
    overflow_insert(pager, tree, path, level - 1, left_slot, &promoted)
}

fn sibling_bounds(pager: &mut Pager, left_id: PageId, right_id: PageId) -> Result<(u32, u32)> {
    let left = pager.acquire(left_id)?;
    let prev = node::prev_sibling(pager.data(left), node_base(left_id));
    pager.release(left);
    let right = pager.acquire(right_id)?;
    let next = node::next_sibling(pager.data(right), node_base(right_id));
    pager.release(right);
    Ok((prev, next))
}

// --- drop / relocate ------------------------------------------------------

fn free_subtree(pager: &mut Pager, id: PageId) -> Result<()> {
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let mut children: Vec<PageId> = Vec::new();
    let mut chains: Vec<u32> = Vec::new();
    {
        let data = pager.data(page);
        let external = node::is_external(data, base)?;
        for index in 0..node::cell_count(data, base) {
            let cell = node::read_cell(data, base, index)?;
            if cell.overflow != 0 {
                chains.push(cell.overflow);
            }
            if !external {
                let child = u32::try_from(cell.child)
                    .ok()
                    .and_then(PageId::new)
                    .ok_or_else(|| CalicoError::corruption("child pointer invalid"))?;
                children.push(child);
            }
        }
        if !external {
            let rc = u32::try_from(node::right_child(data, base))
                .ok()
                .and_then(PageId::new)
                .ok_or_else(|| CalicoError::corruption("right child invalid"))?;
            children.push(rc);
        }
    }
    pager.release(page);
    for chain in chains {
        overflow::free_chain(pager, chain)?;
    }
    for child in children {
        free_subtree(pager, child)?;
    }
    let page = pager.acquire(id)?;
    pager.mark_dirty(page);
    pager.free(page)?;
    Ok(())
}

/// Move the live page `src` to `dst` for vacuum: rewrite the one site
/// referencing `src`, relocate the content, and fix every back
/// reference. Returns the rerooting pair when `src` was a bucket root.
pub fn relocate_page(
    pager: &mut Pager,
    src: PageId,
    dst: PageId,
) -> Result<Option<(PageId, PageId)>> {
    let entry = pointer_map::read_entry(pager, src)?;
    match entry.kind {
        PageKind::TreeRoot => {
            relocate_node_page(pager, src, dst, entry)?;
            Ok(Some((src, dst)))
        }
        PageKind::TreeNode => {
            // Rewrite the parent's child pointer.
            let parent = PageId::new(entry.back)
                .ok_or_else(|| CalicoError::corruption("tree node without parent"))?;
            let page = pager.acquire(parent)?;
            pager.mark_dirty(page);
            let base = node_base(parent);
            {
                let data = pager.data_mut(page);
                let count = node::cell_count(data, base);
                let mut found = false;
                for index in 0..count {
                    if node::read_cell(data, base, index)?.child == u64::from(src.get()) {
                        node::set_cell_child(data, base, index, u64::from(dst.get()))?;
                        found = true;
                        break;
                    }
                }
                if !found {
                    if node::right_child(data, base) != u64::from(src.get()) {
                        return Err(CalicoError::corruption(format!(
                            "parent {parent} does not reference {src}"
                        )));
                    }
                    node::set_right_child(data, base, u64::from(dst.get()));
                }
            }
            pager.release(page);
            relocate_node_page(pager, src, dst, entry)?;
            Ok(None)
        }
        PageKind::OverflowHead => {
            // Rewrite the owning cell's overflow pointer.
            let owner = PageId::new(entry.back)
                .ok_or_else(|| CalicoError::corruption("overflow head without owner"))?;
            let page = pager.acquire(owner)?;
            pager.mark_dirty(page);
            let base = node_base(owner);
            {
                let data = pager.data_mut(page);
                let count = node::cell_count(data, base);
                let mut found = false;
                for index in 0..count {
                    let cell = node::read_cell(data, base, index)?;
                    if cell.overflow == src.get() {
                        let off = node::cell_offset(data, base, index)? + cell.size - 4;
                        put_u32(data, off, dst.get());
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(CalicoError::corruption(format!(
                        "node {owner} does not own chain head {src}"
                    )));
                }
            }
            pager.release(page);
            relocate_chain_page(pager, src, dst, entry)
        }
        PageKind::OverflowLink => {
            // Rewrite the predecessor's next pointer.
            let pred = PageId::new(entry.back)
                .ok_or_else(|| CalicoError::corruption("overflow link without predecessor"))?;
            let page = pager.acquire(pred)?;
            pager.mark_dirty(page);
            put_u32(pager.data_mut(page), 0, dst.get());
            pager.release(page);
            relocate_chain_page(pager, src, dst, entry)
        }
        PageKind::FreelistTrunk | PageKind::FreelistLeaf => Err(CalicoError::corruption(format!(
            "page {src} is free and cannot be relocated"
        ))),
    }
}

/// Copy a tree node to its new id and re-point everything that
/// referenced it: pointer-map entries of children and chains, and the
/// sibling links of an external node.
fn relocate_node_page(pager: &mut Pager, src: PageId, dst: PageId, entry: PtrEntry) -> Result<()> {
    let page = pager.acquire(src)?;
    pager.mark_dirty(page);
    let moved = pager.move_page(page, dst)?;
    let base = node_base(dst);
    debug_assert_eq!(node_base(src), base);
    let (external, prev, next) = {
        let data = pager.data(moved);
        let external = node::is_external(data, base)?;
        (
            external,
            if external { node::prev_sibling(data, base) } else { 0 },
            if external { node::next_sibling(data, base) } else { 0 },
        )
    };
    pager.release(moved);
    pointer_map::write_entry(pager, dst, entry)?;
    fix_links(pager, dst)?;
    if external {
        if let Some(prev) = PageId::new(prev) {
            let page = pager.acquire(prev)?;
            pager.mark_dirty(page);
            node::set_next_sibling(pager.data_mut(page), node_base(prev), dst.get());
            pager.release(page);
        }
        if let Some(next) = PageId::new(next) {
            let page = pager.acquire(next)?;
            pager.mark_dirty(page);
            node::set_prev_sibling(pager.data_mut(page), node_base(next), dst.get());
            pager.release(page);
        }
    }
    Ok(())
}

/// Copy an overflow page to its new id and fix its successor's back
/// pointer.
fn relocate_chain_page(
    pager: &mut Pager,
    src: PageId,
    dst: PageId,
    entry: PtrEntry,
) -> Result<Option<(PageId, PageId)>> {
    let page = pager.acquire(src)?;
    pager.mark_dirty(page);
    let moved = pager.move_page(page, dst)?;
    let next = get_u32(pager.data(moved), 0);
    pager.release(moved);
    pointer_map::write_entry(pager, dst, entry)?;
    if let Some(next) = PageId::new(next) {
        pointer_map::write_entry(
            pager,
            next,
            PtrEntry {
                kind: PageKind::OverflowLink,
                back: dst.get(),
            },
        )?;
    }
    Ok(None)
}

// --- validation -----------------------------------------------------------

fn check_node(
    pager: &mut Pager,
    id: PageId,
    root: PageId,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    leaves: &mut Vec<(PageId, Option<Vec<u8>>)>,
) -> Result<()> {
    if depth > 32 {
        return Err(CalicoError::corruption("tree deeper than supported"));
    }
    let page = pager.acquire(id)?;
    let base = node_base(id);
    let external = node::is_external(pager.data(page), base)?;
    let count = node::cell_count(pager.data(page), base);
    pager.release(page);

    if id != root && count == 0 {
        return Err(CalicoError::corruption(format!("node {id} is empty")));
    }

    let mut prev_key: Option<Vec<u8>> = None;
    for index in 0..count {
        let key = read_key_at(pager, id, index)?;
        if let Some(prev) = &prev_key {
            if *prev >= key {
                return Err(CalicoError::corruption(format!(
                    "node {id} keys out of order"
                )));
            }
        }
        prev_key = Some(key);
    }

    if external {
        match leaf_depth {
            Some(expected) if *expected != depth => {
                return Err(CalicoError::corruption("leaves at unequal depth"));
            }
            None => *leaf_depth = Some(depth),
            _ => {}
        }
        let first_key = if count > 0 {
            Some(read_key_at(pager, id, 0)?)
        } else {
            None
        };
        leaves.push((id, first_key));
        return Ok(());
    }

    for slot in 0..=count {
        let page = pager.acquire(id)?;
        let child = child_at(pager, page, base, slot)?;
        pager.release(page);
        let entry = pointer_map::read_entry(pager, child)?;
        if entry.kind != PageKind::TreeNode || entry.back != id.get() {
            return Err(CalicoError::corruption(format!(
                "child {child} pointer map entry does not name {id}"
            )));
        }
        check_node(pager, child, root, depth + 1, leaf_depth, leaves)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_truncation() {
        assert_eq!(truncated_separator(b"apple", b"banana"), b"b".to_vec());
        assert_eq!(truncated_separator(b"abcX", b"abcZ"), b"abcZ".to_vec());
        assert_eq!(truncated_separator(b"ab", b"abc"), b"abc".to_vec());
        assert_eq!(truncated_separator(b"abc123", b"abd"), b"abd".to_vec());
        // The separator must sit in (left, right].
        for (l, r) in [
            (b"apple".as_slice(), b"banana".as_slice()),
            (b"aaa", b"aab"),
            (b"a", b"aa"),
        ] {
            let sep = truncated_separator(l, r);
            assert!(l < sep.as_slice() && sep.as_slice() <= r);
        }
    }

    #[test]
    fn split_point_balances_bytes() {
        let cells: Vec<Vec<u8>> = (0..10).map(|_| vec![0_u8; 40]).collect();
        let s = split_point(&cells, false);
        assert!((4..=6).contains(&s));

        // One giant cell pulls the split toward itself.
        let mut lopsided: Vec<Vec<u8>> = vec![vec![0_u8; 200]];
        lopsided.extend((0..8).map(|_| vec![0_u8; 20]));
        let s = split_point(&lopsided, false);
        assert_eq!(s, 1);
    }
}
