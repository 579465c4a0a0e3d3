//! Overflow chains: singly linked pages holding the spilled tail of a
//! payload.
//!
//! Each page is `[next: u32][payload bytes]`. The chain stores the key
//! remainder followed by the value remainder. Pointer-map entries link
//! every page back to its predecessor, with the head answering to its
//! owning tree node (written by the cell's owner, not here).

use std::cmp::Ordering;

use calico_error::{CalicoError, Result};
use calico_pager::{PageKind, Pager, PtrEntry, pointer_map};
use calico_types::{PageId, get_u32, put_u32};

const NEXT_SIZE: usize = 4;

fn page_capacity(pager: &Pager) -> usize {
    pager.page_size() as usize - NEXT_SIZE
}

fn chain_page(raw: u32) -> Result<PageId> {
    PageId::new(raw).ok_or_else(|| CalicoError::corruption("overflow chain truncated"))
}

/// Append chain bytes `[skip, skip + len)` to `out`.
pub(crate) fn read_chain(
    pager: &mut Pager,
    head: u32,
    mut skip: usize,
    mut len: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let cap = page_capacity(pager);
    let mut cur = head;
    let mut hops = 0_u32;
    while len > 0 {
        hops += 1;
        if hops > pager.page_count() {
            return Err(CalicoError::corruption("overflow chain cycles"));
        }
        let page = pager.acquire(chain_page(cur)?)?;
        let data = pager.data(page);
        let next = get_u32(data, 0);
        if skip < cap {
            let take = (cap - skip).min(len);
            out.extend_from_slice(&data[NEXT_SIZE + skip..NEXT_SIZE + skip + take]);
            len -= take;
            skip = 0;
        } else {
            skip -= cap;
        }
        pager.release(page);
        cur = next;
    }
    Ok(())
}

/// Compare the first `suffix_len` chain bytes against `needle`,
/// reading only as many pages as the comparison needs.
pub(crate) fn compare_suffix(
    pager: &mut Pager,
    head: u32,
    needle: &[u8],
    suffix_len: usize,
) -> Result<Ordering> {
    let cap = page_capacity(pager);
    let mut cur = head;
    let mut remaining = suffix_len;
    let mut pos = 0_usize;
    let mut hops = 0_u32;
    while remaining > 0 && pos < needle.len() {
        hops += 1;
        if hops > pager.page_count() {
            return Err(CalicoError::corruption("overflow chain cycles"));
        }
        let page = pager.acquire(chain_page(cur)?)?;
        let data = pager.data(page);
        let take = cap.min(remaining).min(needle.len() - pos);
        let order = data[NEXT_SIZE..NEXT_SIZE + take].cmp(&needle[pos..pos + take]);
        let next = get_u32(data, 0);
        pager.release(page);
        if order != Ordering::Equal {
            return Ok(order);
        }
        remaining -= take;
        pos += take;
        cur = next;
    }
    // All compared bytes were equal; the longer side wins.
    Ok(suffix_len.cmp(&needle.len()))
}

/// Write `data` into a chain, reusing the pages of the existing chain
/// at `old_head` (0 for none): shared prefix pages are overwritten in
/// place, surplus pages are freed, and extra pages are allocated.
/// Returns the head page id. `data` must not be empty.
pub(crate) fn write_chain(pager: &mut Pager, old_head: u32, data: &[u8]) -> Result<u32> {
    debug_assert!(!data.is_empty());
    let cap = page_capacity(pager);
    let mut reuse = old_head;
    let mut prev: Option<calico_pager::PageRef> = None;
    let mut head = 0_u32;
    for chunk in data.chunks(cap) {
        let (page, next_reuse, fresh) = if reuse != 0 {
            let page = pager.acquire(chain_page(reuse)?)?;
            pager.mark_dirty(page);
            let next = get_u32(pager.data(page), 0);
            (page, next, false)
        } else {
            (pager.allocate()?, 0, true)
        };
        {
            let buf = pager.data_mut(page);
            buf[NEXT_SIZE..NEXT_SIZE + chunk.len()].copy_from_slice(chunk);
        }
        match prev {
            Some(prev_page) => {
                put_u32(pager.data_mut(prev_page), 0, page.page_id().get());
                if fresh {
                    pointer_map::write_entry(
                        pager,
                        page.page_id(),
                        PtrEntry {
                            kind: PageKind::OverflowLink,
                            back: prev_page.page_id().get(),
                        },
                    )?;
                }
                pager.release(prev_page);
            }
            None => head = page.page_id().get(),
        }
        prev = Some(page);
        reuse = next_reuse;
    }
    if let Some(last) = prev {
        put_u32(pager.data_mut(last), 0, 0);
        pager.release(last);
    }
    if reuse != 0 {
        free_chain(pager, reuse)?;
    }
    Ok(head)
}

/// Return every page of the chain to the freelist. Returns the number
/// of pages freed.
pub(crate) fn free_chain(pager: &mut Pager, head: u32) -> Result<u32> {
    let mut cur = head;
    let mut freed = 0_u32;
    while cur != 0 {
        freed += 1;
        if freed > pager.page_count() {
            return Err(CalicoError::corruption("overflow chain cycles"));
        }
        let page = pager.acquire(chain_page(cur)?)?;
        let next = get_u32(pager.data(page), 0);
        pager.mark_dirty(page);
        pager.free(page)?;
        cur = next;
    }
    Ok(freed)
}
