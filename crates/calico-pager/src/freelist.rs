//! The freelist: unused pages threaded through trunk pages.
//!
//! A trunk page stores `next_trunk: u32`, `leaf_count: u32`, then a
//! packed array of leaf page ids. Allocation pops the newest leaf, or
//! consumes the trunk itself when it runs dry; freeing pushes a leaf,
//! or turns the freed page into a new head trunk when the current one
//! is full. `freelist_len` counts trunks and leaves together and is
//! kept exact.

use calico_error::{CalicoError, Result};
use calico_types::{PageId, get_u32, put_u32};

use crate::page_cache::PageRef;
use crate::pager::Pager;
use crate::pointer_map::{self, PageKind, PtrEntry};

const TRUNK_NEXT: usize = 0;
const TRUNK_COUNT: usize = 4;
const TRUNK_HDR: usize = 8;

fn capacity(page_size: u32) -> u32 {
    (page_size - TRUNK_HDR as u32) / 4
}

fn check_usable(pager: &Pager, raw: u32) -> Result<PageId> {
    let id = PageId::new(raw)
        .filter(|id| id.get() >= 3 && id.get() <= pager.page_count())
        .ok_or_else(|| CalicoError::corruption(format!("freelist references page {raw}")))?;
    if pointer_map::is_map_page(id, pager.page_size()) {
        return Err(CalicoError::corruption(format!(
            "freelist references pointer map page {id}"
        )));
    }
    Ok(id)
}

/// Take one page off the freelist, preferring leaves.
pub(crate) fn pop(pager: &mut Pager) -> Result<Option<PageId>> {
    if pager.freelist_head == 0 {
        return Ok(None);
    }
    if pager.freelist_len == 0 {
        return Err(CalicoError::corruption(
            "freelist head set but recorded length is zero",
        ));
    }
    let head = check_usable(pager, pager.freelist_head)?;
    let trunk = pager.acquire_internal(head)?;
    let data = pager.data(trunk);
    let count = get_u32(data, TRUNK_COUNT);
    if count > capacity(pager.page_size()) {
        pager.release(trunk);
        return Err(CalicoError::corruption("freelist trunk overfull"));
    }
    if count > 0 {
        let leaf_raw = get_u32(data, TRUNK_HDR + 4 * (count as usize - 1));
        pager.mark_dirty(trunk);
        put_u32(pager.data_mut(trunk), TRUNK_COUNT, count - 1);
        pager.release(trunk);
        let leaf = check_usable(pager, leaf_raw)?;
        pager.freelist_len -= 1;
        Ok(Some(leaf))
    } else {
        // Drained trunk: hand the trunk page itself out.
        let next = get_u32(data, TRUNK_NEXT);
        pager.release(trunk);
        if next != 0 {
            let next_id = check_usable(pager, next)?;
            // The successor becomes the head and now answers to the
            // file header.
            pointer_map::write_entry(
                pager,
                next_id,
                PtrEntry {
                    kind: PageKind::FreelistTrunk,
                    back: 0,
                },
            )?;
        }
        pager.freelist_head = next;
        pager.freelist_len -= 1;
        Ok(Some(head))
    }
}

/// Put `page` on the freelist. Consumes the reference.
pub(crate) fn push(pager: &mut Pager, page: PageRef) -> Result<()> {
    let id = page.page_id();
    debug_assert!(id != PageId::ROOT);
    debug_assert!(!pointer_map::is_map_page(id, pager.page_size()));

    if pager.freelist_head != 0 {
        let head = check_usable(pager, pager.freelist_head)?;
        let trunk = pager.acquire_internal(head)?;
        let count = get_u32(pager.data(trunk), TRUNK_COUNT);
        if count < capacity(pager.page_size()) {
            pager.mark_dirty(trunk);
            let data = pager.data_mut(trunk);
            put_u32(data, TRUNK_HDR + 4 * count as usize, id.get());
            put_u32(data, TRUNK_COUNT, count + 1);
            pager.release(trunk);
            pointer_map::write_entry(
                pager,
                id,
                PtrEntry {
                    kind: PageKind::FreelistLeaf,
                    back: head.get(),
                },
            )?;
            pager.freelist_len += 1;
            pager.release(page);
            return Ok(());
        }
        pager.release(trunk);
    }

    // Freed page becomes the new head trunk.
    let old_head = pager.freelist_head;
    pager.mark_dirty(page);
    let data = pager.data_mut(page);
    put_u32(data, TRUNK_NEXT, old_head);
    put_u32(data, TRUNK_COUNT, 0);
    pointer_map::write_entry(
        pager,
        id,
        PtrEntry {
            kind: PageKind::FreelistTrunk,
            back: 0,
        },
    )?;
    if old_head != 0 {
        let old_id = check_usable(pager, old_head)?;
        pointer_map::write_entry(
            pager,
            old_id,
            PtrEntry {
                kind: PageKind::FreelistTrunk,
                back: id.get(),
            },
        )?;
    }
    pager.freelist_head = id.get();
    pager.freelist_len += 1;
    pager.release(page);
    Ok(())
}

/// Unthread a specific page from the freelist (vacuum is about to
/// truncate it). The pointer map tells us whether it is a trunk or a
/// leaf.
pub(crate) fn remove_page(pager: &mut Pager, id: PageId) -> Result<()> {
    let entry = pointer_map::read_entry(pager, id)?;
    match entry.kind {
        PageKind::FreelistLeaf => {
            let trunk_id = check_usable(pager, entry.back)?;
            let trunk = pager.acquire_internal(trunk_id)?;
            let count = get_u32(pager.data(trunk), TRUNK_COUNT);
            let slot = (0..count).find(|i| {
                get_u32(pager.data(trunk), TRUNK_HDR + 4 * *i as usize) == id.get()
            });
            let Some(slot) = slot else {
                pager.release(trunk);
                return Err(CalicoError::corruption(format!(
                    "freelist leaf {id} missing from trunk {trunk_id}"
                )));
            };
            pager.mark_dirty(trunk);
            let data = pager.data_mut(trunk);
            let last = get_u32(data, TRUNK_HDR + 4 * (count as usize - 1));
            put_u32(data, TRUNK_HDR + 4 * slot as usize, last);
            put_u32(data, TRUNK_COUNT, count - 1);
            pager.release(trunk);
            pager.freelist_len -= 1;
            Ok(())
        }
        PageKind::FreelistTrunk => {
            // Unlink the trunk, then put its leaves back.
            let trunk = pager.acquire_internal(id)?;
            let data = pager.data(trunk);
            let next = get_u32(data, TRUNK_NEXT);
            let count = get_u32(data, TRUNK_COUNT);
            let leaves: Vec<u32> = (0..count)
                .map(|i| get_u32(data, TRUNK_HDR + 4 * i as usize))
                .collect();
            pager.release(trunk);
            if next != 0 {
                let next_id = check_usable(pager, next)?;
                pointer_map::write_entry(
                    pager,
                    next_id,
                    PtrEntry {
                        kind: PageKind::FreelistTrunk,
                        back: entry.back,
                    },
                )?;
            }
            if entry.back == 0 {
                pager.freelist_head = next;
            } else {
                let prev = check_usable(pager, entry.back)?;
                let prev_page = pager.acquire_internal(prev)?;
                pager.mark_dirty(prev_page);
                put_u32(pager.data_mut(prev_page), TRUNK_NEXT, next);
                pager.release(prev_page);
            }
            pager.freelist_len -= 1 + count;
            for leaf_raw in leaves {
                let leaf = check_usable(pager, leaf_raw)?;
                let page = pager.acquire_internal(leaf)?;
                pager.mark_dirty(page);
                push(pager, page)?;
            }
            Ok(())
        }
        _ => Err(CalicoError::corruption(format!(
            "page {id} is not on the freelist"
        ))),
    }
}

/// Walk the whole structure and confirm it matches `freelist_len` and
/// the pointer map.
pub(crate) fn validate(pager: &mut Pager) -> Result<()> {
    let mut reachable = 0_u32;
    let mut prev = 0_u32;
    let mut trunk_raw = pager.freelist_head;
    while trunk_raw != 0 {
        if reachable > pager.freelist_len() {
            return Err(CalicoError::corruption("freelist trunk chain cycles"));
        }
        let trunk_id = check_usable(pager, trunk_raw)?;
        let entry = pointer_map::read_entry(pager, trunk_id)?;
        if entry.kind != PageKind::FreelistTrunk || entry.back != prev {
            return Err(CalicoError::corruption(format!(
                "trunk {trunk_id} pointer map entry mismatch"
            )));
        }
        let trunk = pager.acquire_internal(trunk_id)?;
        let data = pager.data(trunk);
        let next = get_u32(data, TRUNK_NEXT);
        let count = get_u32(data, TRUNK_COUNT);
        if count > capacity(pager.page_size()) {
            pager.release(trunk);
            return Err(CalicoError::corruption("freelist trunk overfull"));
        }
        let leaves: Vec<u32> = (0..count)
            .map(|i| get_u32(data, TRUNK_HDR + 4 * i as usize))
            .collect();
        pager.release(trunk);
        for leaf_raw in leaves {
            let leaf = check_usable(pager, leaf_raw)?;
            let entry = pointer_map::read_entry(pager, leaf)?;
            if entry.kind != PageKind::FreelistLeaf || entry.back != trunk_id.get() {
                return Err(CalicoError::corruption(format!(
                    "leaf {leaf} pointer map entry mismatch"
                )));
            }
            reachable += 1;
        }
        reachable += 1;
        prev = trunk_raw;
        trunk_raw = next;
    }
    if reachable != pager.freelist_len() {
        return Err(CalicoError::corruption(format!(
            "freelist length {} but {reachable} pages reachable",
            pager.freelist_len()
        )));
    }
    Ok(())
}
