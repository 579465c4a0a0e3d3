//! The pager: page cache, WAL coordination, and transaction
//! arbitration.
//!
//! Everything persistent flows through here. Tree code sees pages as
//! pinned [`PageRef`] tokens handed out by [`Pager::acquire`]; the
//! freelist and pointer map are maintained behind [`Pager::allocate`],
//! [`Pager::free`], and the vacuum helpers.

mod freelist;
mod header;
mod page_cache;
mod pager;
pub mod pointer_map;

pub use header::{FILE_HDR_SIZE, FILE_MAGIC, FORMAT_VERSION, FileHeader};
pub use page_cache::{PageCache, PageRef};
pub use pager::{Pager, PagerOptions, PagerState, PagerStats, ReleaseAction, SyncMode};
pub use pointer_map::{PageKind, PtrEntry};
