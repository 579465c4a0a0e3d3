//! The B+-tree: on-disk ordered index over the pager.
//!
//! [`Tree`] owns the algorithms (search, split with suffix-truncated
//! separators, merge/rotate rebalance, overflow chains, vacuum
//! relocation); [`Cursor`] provides ordered traversal with the
//! save/restore protocol that keeps cursors usable across mutations.

mod cell;
mod cursor;
mod node;
mod overflow;
mod tree;

pub use cursor::Cursor;
pub use tree::{MAX_KEY_LEN, MAX_VALUE_LEN, Tree, relocate_page};
