//! The pointer map: sparse per-page back-references enabling safe page
//! relocation during vacuum.
//!
//! Map pages appear at fixed intervals, one for every run of
//! `page_size / 5` data pages; page 2 is always the first. Each 5-byte
//! entry records what kind of page the covered slot holds and the page
//! that points at it (tree parent, overflow predecessor, or freelist
//! trunk). Map pages are bookkeeping only and are never handed to tree
//! code.

use calico_error::{CalicoError, Result};
use calico_types::{PageId, get_u32, put_u32};

use crate::pager::Pager;

const ENTRY_SIZE: u32 = 5;

/// What a mapped page is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Root of a bucket tree; no parent reference.
    TreeRoot = 1,
    /// Non-root tree node; back-pointer is the parent node.
    TreeNode = 2,
    /// First page of an overflow chain; back-pointer is the owning
    /// tree node.
    OverflowHead = 3,
    /// Later page of an overflow chain; back-pointer is the
    /// predecessor.
    OverflowLink = 4,
    /// Freelist trunk; back-pointer is the previous trunk (0 at the
    /// head).
    FreelistTrunk = 5,
    /// Freelist leaf; back-pointer is the trunk holding it.
    FreelistLeaf = 6,
}

impl PageKind {
    fn from_raw(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => Self::TreeRoot,
            2 => Self::TreeNode,
            3 => Self::OverflowHead,
            4 => Self::OverflowLink,
            5 => Self::FreelistTrunk,
            6 => Self::FreelistLeaf,
            _ => {
                return Err(CalicoError::corruption(format!(
                    "unknown pointer map kind {raw}"
                )));
            }
        })
    }
}

/// One pointer-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrEntry {
    pub kind: PageKind,
    /// Referencing page id, 0 when the kind implies no parent.
    pub back: u32,
}

/// Pages covered by each map page.
const fn group_size(page_size: u32) -> u32 {
    page_size / ENTRY_SIZE
}

/// Whether `page_id` is a pointer-map page.
#[must_use]
pub fn is_map_page(page_id: PageId, page_size: u32) -> bool {
    let raw = page_id.get();
    raw >= 2 && (raw - 2) % (group_size(page_size) + 1) == 0
}

/// The map page covering data page `page_id`.
#[must_use]
pub fn map_page_for(page_id: PageId, page_size: u32) -> PageId {
    debug_assert!(page_id.get() >= 3);
    debug_assert!(!is_map_page(page_id, page_size));
    let span = group_size(page_size) + 1;
    let group = (page_id.get() - 3) / span;
    PageId::new(2 + group * span).expect("map page ids start at 2")
}

fn entry_offset(page_id: PageId, map_page: PageId) -> usize {
    ((page_id.get() - map_page.get() - 1) * ENTRY_SIZE) as usize
}

fn check_mapped(pager: &Pager, page_id: PageId) -> Result<()> {
    if page_id.get() < 3 || is_map_page(page_id, pager.page_size()) {
        return Err(CalicoError::corruption(format!(
            "page {page_id} has no pointer map entry"
        )));
    }
    Ok(())
}

/// Read the entry for `page_id`.
pub fn read_entry(pager: &mut Pager, page_id: PageId) -> Result<PtrEntry> {
    check_mapped(pager, page_id)?;
    let map_id = map_page_for(page_id, pager.page_size());
    let map = pager.acquire_internal(map_id)?;
    let offset = entry_offset(page_id, map_id);
    let data = pager.data(map);
    let entry = PtrEntry {
        kind: PageKind::from_raw(data[offset])?,
        back: get_u32(data, offset + 1),
    };
    pager.release(map);
    entry.kind.validate_back(entry.back).map(|()| entry)
}

impl PageKind {
    fn validate_back(self, back: u32) -> Result<()> {
        let wants_parent = !matches!(self, Self::TreeRoot);
        if back == 0 && wants_parent && !matches!(self, Self::FreelistTrunk) {
            return Err(CalicoError::corruption("pointer map entry missing parent"));
        }
        Ok(())
    }
}

/// Write the entry for `page_id`.
pub fn write_entry(pager: &mut Pager, page_id: PageId, entry: PtrEntry) -> Result<()> {
    check_mapped(pager, page_id)?;
    let map_id = map_page_for(page_id, pager.page_size());
    let map = pager.acquire_internal(map_id)?;
    pager.mark_dirty(map);
    let offset = entry_offset(page_id, map_id);
    let data = pager.data_mut(map);
    data[offset] = entry.kind as u8;
    put_u32(data, offset + 1, entry.back);
    pager.release(map);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> PageId {
        PageId::new(raw).unwrap()
    }

    #[test]
    fn map_page_positions() {
        // With 512-byte pages a map page covers 102 data pages.
        let ps = 512;
        assert!(is_map_page(id(2), ps));
        assert!(!is_map_page(id(1), ps));
        assert!(!is_map_page(id(3), ps));
        assert!(!is_map_page(id(104), ps));
        assert!(is_map_page(id(105), ps));
        assert!(is_map_page(id(208), ps));
    }

    #[test]
    fn covering_map_page() {
        let ps = 512;
        for raw in 3..=104 {
            assert_eq!(map_page_for(id(raw), ps), id(2), "page {raw}");
        }
        for raw in 106..=207 {
            assert_eq!(map_page_for(id(raw), ps), id(105), "page {raw}");
        }
    }

    #[test]
    fn entry_offsets_pack_five_bytes() {
        assert_eq!(entry_offset(id(3), id(2)), 0);
        assert_eq!(entry_offset(id(4), id(2)), 5);
        assert_eq!(entry_offset(id(104), id(2)), 505);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            PageKind::TreeRoot,
            PageKind::TreeNode,
            PageKind::OverflowHead,
            PageKind::OverflowLink,
            PageKind::FreelistTrunk,
            PageKind::FreelistLeaf,
        ] {
            assert_eq!(PageKind::from_raw(kind as u8).unwrap(), kind);
        }
        assert!(PageKind::from_raw(0).unwrap_err().is_corruption());
        assert!(PageKind::from_raw(7).unwrap_err().is_corruption());
    }
}
