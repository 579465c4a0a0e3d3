//! Cell encoding.
//!
//! An external cell is `[key_len][value_len][inline payload][overflow
//! id]`, an internal cell is `[child id: 8 bytes][key_len][inline
//! key][overflow id]`, with varint lengths and the 4-byte overflow id
//! present only when the payload spills. The inline budget is derived
//! from the page size alone, so cells move freely between nodes.

use calico_error::{CalicoError, Result};
use calico_types::{decode_varint, encode_varint, get_u32, get_u64, varint_len};

/// Node header size; cells never overlap it.
pub(crate) const NODE_HDR_SIZE: usize = 16;

/// Size of the left-child field in internal cells.
pub(crate) const CHILD_SIZE: usize = 8;

/// Size of the overflow page id trailer.
pub(crate) const OVERFLOW_PTR_SIZE: usize = 4;

/// Largest inline payload. Sized so four worst-case cells plus their
/// indirection slots always fit on a non-root node.
pub(crate) fn max_local(page_size: usize) -> usize {
    (page_size - NODE_HDR_SIZE) / 4 - 24
}

/// Smallest inline payload for a spilled cell.
pub(crate) fn min_local(page_size: usize) -> usize {
    (page_size - NODE_HDR_SIZE) / 8 - 24
}

/// Inline byte count for a payload of `total` bytes.
///
/// Spilled payloads keep an inline remainder aligned to whole overflow
/// pages where possible, which minimizes chain length.
pub(crate) fn local_size(total: usize, page_size: usize) -> usize {
    let maxl = max_local(page_size);
    if total <= maxl {
        return total;
    }
    let minl = min_local(page_size);
    let local = minl + (total - minl) % (page_size - OVERFLOW_PTR_SIZE);
    if local > maxl { minl } else { local }
}

/// Parsed view of one cell within a node page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CellRef {
    pub key_len: usize,
    /// Always 0 for internal cells.
    pub value_len: usize,
    /// Left child id; 0 for external cells.
    pub child: u64,
    /// Absolute offset of the inline payload within the page.
    pub local_off: usize,
    pub local_len: usize,
    /// First overflow page, 0 when fully inline.
    pub overflow: u32,
    /// Total bytes the cell occupies in the cell area.
    pub size: usize,
}

impl CellRef {
    /// Full payload length (key plus value).
    pub(crate) fn total_len(&self) -> usize {
        self.key_len + self.value_len
    }

    /// Inline bytes belonging to the key.
    pub(crate) fn local_key_len(&self) -> usize {
        self.key_len.min(self.local_len)
    }
}

/// Parse the cell at absolute `offset`.
pub(crate) fn parse_cell(
    data: &[u8],
    offset: usize,
    external: bool,
    page_size: usize,
) -> Result<CellRef> {
    let corrupt = || CalicoError::corruption("malformed cell");
    let mut pos = offset;
    let child = if external {
        0
    } else {
        if pos + CHILD_SIZE > data.len() {
            return Err(corrupt());
        }
        let child = get_u64(data, pos);
        pos += CHILD_SIZE;
        child
    };
    let (key_len, n) = decode_varint(data.get(pos..).unwrap_or(&[])).ok_or_else(corrupt)?;
    pos += n;
    let value_len = if external {
        let (value_len, n) = decode_varint(data.get(pos..).unwrap_or(&[])).ok_or_else(corrupt)?;
        pos += n;
        value_len as usize
    } else {
        0
    };
    let key_len = key_len as usize;
    let total = key_len + value_len;
    let local_len = local_size(total, page_size);
    if pos + local_len > data.len() {
        return Err(corrupt());
    }
    let local_off = pos;
    pos += local_len;
    let overflow = if local_len < total {
        if pos + OVERFLOW_PTR_SIZE > data.len() {
            return Err(corrupt());
        }
        let overflow = get_u32(data, pos);
        pos += OVERFLOW_PTR_SIZE;
        if overflow == 0 {
            return Err(corrupt());
        }
        overflow
    } else {
        0
    };
    Ok(CellRef {
        key_len,
        value_len,
        child,
        local_off,
        local_len,
        overflow,
        size: pos - offset,
    })
}

/// Build cell bytes from its parts. `local` must already be the
/// [`local_size`] prefix of the payload; `overflow` points at the rest.
pub(crate) fn compose_cell(
    external: bool,
    child: u64,
    key_len: usize,
    value_len: usize,
    local: &[u8],
    overflow: u32,
) -> Vec<u8> {
    debug_assert!(external || value_len == 0);
    let mut out = Vec::with_capacity(CHILD_SIZE + 2 * varint_len(key_len as u32) + local.len() + 4);
    if !external {
        out.extend_from_slice(&child.to_be_bytes());
    }
    let mut varint = [0_u8; 5];
    let n = encode_varint(&mut varint, key_len as u32);
    out.extend_from_slice(&varint[..n]);
    if external {
        let n = encode_varint(&mut varint, value_len as u32);
        out.extend_from_slice(&varint[..n]);
    }
    out.extend_from_slice(local);
    if overflow != 0 {
        out.extend_from_slice(&overflow.to_be_bytes());
    }
    out
}

/// Worst-case encoded cell size for this page size; splits use it to
/// decide whether a pending cell can ever fit.
pub(crate) fn max_cell_size(page_size: usize) -> usize {
    CHILD_SIZE + 2 * 5 + max_local(page_size) + OVERFLOW_PTR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn local_size_keeps_small_payloads_inline() {
        for ps in [512_usize, 4096, 65_536] {
            assert_eq!(local_size(10, ps), 10);
            assert_eq!(local_size(max_local(ps), ps), max_local(ps));
            let spilled = local_size(max_local(ps) + 1, ps);
            assert!(spilled >= min_local(ps) && spilled <= max_local(ps));
        }
    }

    #[test]
    fn four_worst_case_cells_fit_a_page() {
        for ps in [512_usize, 1024, 4096, 65_536] {
            let per_cell = max_cell_size(ps) + 2;
            assert!(4 * per_cell <= ps - NODE_HDR_SIZE, "page size {ps}");
        }
    }

    #[test]
    fn external_cell_round_trip() {
        let payload = b"keyvaluebytes";
        let raw = compose_cell(true, 0, 3, 10, payload, 0);
        let cell = parse_cell(&raw, 0, true, 512).unwrap();
        assert_eq!(cell.key_len, 3);
        assert_eq!(cell.value_len, 10);
        assert_eq!(cell.child, 0);
        assert_eq!(cell.overflow, 0);
        assert_eq!(&raw[cell.local_off..cell.local_off + cell.local_len], payload);
        assert_eq!(cell.size, raw.len());
        assert_eq!(cell.local_key_len(), 3);
    }

    #[test]
    fn internal_cell_round_trip() {
        let key = b"separator";
        let raw = compose_cell(false, 42, key.len(), 0, key, 0);
        let cell = parse_cell(&raw, 0, false, 512).unwrap();
        assert_eq!(cell.child, 42);
        assert_eq!(cell.key_len, key.len());
        assert_eq!(cell.value_len, 0);
        assert_eq!(&raw[cell.local_off..cell.local_off + cell.local_len], key);
    }

    #[test]
    fn spilled_cell_carries_overflow_id() {
        let ps = 512;
        let total = max_local(ps) + 100;
        let local_len = local_size(total, ps);
        let local = vec![7_u8; local_len];
        let raw = compose_cell(true, 0, 20, total - 20, &local, 99);
        let cell = parse_cell(&raw, 0, true, ps).unwrap();
        assert_eq!(cell.overflow, 99);
        assert_eq!(cell.local_len, local_len);
        assert_eq!(cell.local_key_len(), 20);
    }

    proptest! {
        #[test]
        fn any_cell_round_trips(
            external: bool,
            child in 1_u64..u32::MAX as u64,
            key in proptest::collection::vec(any::<u8>(), 1..80),
            value in proptest::collection::vec(any::<u8>(), 0..80),
        ) {
            let ps = 1024;
            let value_len = if external { value.len() } else { 0 };
            let total = key.len() + value_len;
            prop_assume!(total <= max_local(ps));
            let mut payload = key.clone();
            if external {
                payload.extend_from_slice(&value);
            }
            let raw = compose_cell(external, child, key.len(), value_len, &payload, 0);
            let cell = parse_cell(&raw, 0, external, ps).unwrap();
            prop_assert_eq!(cell.key_len, key.len());
            prop_assert_eq!(cell.value_len, value_len);
            prop_assert_eq!(cell.child, if external { 0 } else { child });
            prop_assert_eq!(&raw[cell.local_off..cell.local_off + cell.local_len], &payload[..]);
            prop_assert_eq!(cell.size, raw.len());
        }

        #[test]
        fn local_size_is_bounded(total in 0_usize..200_000, shift in 9_u32..=16) {
            let ps = 1_usize << shift;
            let local = local_size(total, ps);
            prop_assert!(local <= total);
            prop_assert!(local <= max_local(ps));
            if total > max_local(ps) {
                prop_assert!(local >= min_local(ps));
            } else {
                prop_assert_eq!(local, total);
            }
        }
    }

    #[test]
    fn truncated_cell_is_corruption() {
        let raw = compose_cell(true, 0, 3, 10, b"keyvaluebytes", 0);
        assert!(parse_cell(&raw[..4], 0, true, 512).is_err());
        // A spilled cell with a zero overflow id is invalid.
        let ps = 512;
        let total = max_local(ps) + 1;
        let local = vec![0_u8; local_size(total, ps)];
        let mut raw = compose_cell(true, 0, total, 0, &local, 17);
        let len = raw.len();
        raw[len - 4..].fill(0);
        assert!(parse_cell(&raw, 0, true, ps).is_err());
    }
}
