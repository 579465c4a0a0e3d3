//! The rolling two-word checksum protecting WAL headers and frames.
//!
//! State is a pair of 32-bit accumulators mixed with each 8-byte chunk
//! of input. Frame checksums chain: each frame's input starts from the
//! previous frame's output, so a valid checksum at frame `n` vouches
//! for the entire prefix.

/// Fold `data` into the running checksum `state`.
///
/// `data.len()` must be a multiple of 8; every checksummed structure in
/// the WAL (header prefix, frame-header prefix, page payload) is sized
/// accordingly.
#[must_use]
pub fn checksum(state: (u32, u32), data: &[u8]) -> (u32, u32) {
    debug_assert_eq!(data.len() % 8, 0);
    let (mut s1, mut s2) = state;
    for chunk in data.chunks_exact(8) {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&chunk[..4]);
        let x0 = u32::from_le_bytes(word);
        word.copy_from_slice(&chunk[4..]);
        let x1 = u32::from_le_bytes(word);
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
    }
    (s1, s2)
}
