//! Pager transaction tests over the in-memory environment: the state
//! machine, allocation and the freelist, rollback, relocation, and
//! persistence across connections.

use std::sync::Arc;

use calico_env::MemEnv;
use calico_pager::{Pager, PagerOptions, PagerState, ReleaseAction};
use calico_types::{PageId, PageSize};

fn options() -> PagerOptions {
    PagerOptions {
        page_size: PageSize::new(512).unwrap(),
        cache_size: 64,
        ..PagerOptions::default()
    }
}

fn open(env: &MemEnv) -> Pager {
    Pager::open(Arc::new(env.clone()), "test.db", &options()).unwrap()
}

/// Begin a write transaction, creating page 1 on a fresh database.
fn begin_write(pager: &mut Pager) {
    pager.lock_reader().unwrap();
    pager.begin_writer().unwrap();
    if pager.page_count() == 0 {
        let root = pager.acquire(PageId::ROOT).unwrap();
        pager.mark_dirty(root);
        pager.release(root);
    }
}

#[test]
fn state_machine_walk() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    assert_eq!(pager.state(), PagerState::Open);

    pager.lock_reader().unwrap();
    assert_eq!(pager.state(), PagerState::Read);
    pager.begin_writer().unwrap();
    assert_eq!(pager.state(), PagerState::Write);

    // Commit with nothing dirty drops back to reader.
    pager.commit().unwrap();
    assert_eq!(pager.state(), PagerState::Read);
    pager.finish();
    assert_eq!(pager.state(), PagerState::Open);

    begin_write(&mut pager);
    assert_eq!(pager.state(), PagerState::Dirty);
    pager.commit().unwrap();
    assert_eq!(pager.state(), PagerState::Write);
    pager.finish();
    assert_eq!(pager.state(), PagerState::Open);
}

#[test]
fn committed_pages_survive_reopen() {
    let env = MemEnv::new();
    {
        let mut pager = open(&env);
        begin_write(&mut pager);
        let page = pager.allocate().unwrap();
        pager.data_mut(page)[128] = 0x5E;
        let id = page.page_id();
        pager.release(page);
        pager.commit().unwrap();
        pager.finish();
        pager.close();
        assert!(id.get() >= 3, "page 2 is the first pointer map page");
    }

    let mut pager = open(&env);
    pager.lock_reader().unwrap();
    assert_eq!(pager.page_count(), 3);
    let page = pager.acquire(PageId::new(3).unwrap()).unwrap();
    assert_eq!(pager.data(page)[128], 0x5E);
    pager.release(page);
    pager.finish();
    pager.close();
}

#[test]
fn rollback_discards_everything_since_last_commit() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    let page = pager.allocate().unwrap();
    let id = page.page_id();
    pager.data_mut(page)[0] = 0x11;
    pager.release(page);
    pager.commit().unwrap();
    pager.finish();

    // Modify the page and walk away without committing.
    pager.lock_reader().unwrap();
    pager.begin_writer().unwrap();
    let page = pager.acquire(id).unwrap();
    pager.mark_dirty(page);
    pager.data_mut(page)[0] = 0x99;
    pager.release(page);
    let count_before = pager.page_count();
    let extra = pager.allocate().unwrap();
    pager.release(extra);
    pager.finish();

    pager.lock_reader().unwrap();
    assert_eq!(pager.page_count(), count_before);
    let page = pager.acquire(id).unwrap();
    assert_eq!(pager.data(page)[0], 0x11, "rollback must restore content");
    pager.release(page);
    pager.finish();
    pager.close();
}

#[test]
fn freed_pages_are_reused_before_extending() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    let a = pager.allocate().unwrap();
    let a_id = a.page_id();
    pager.release(a);
    let b = pager.allocate().unwrap();
    pager.release(b);
    pager.commit().unwrap();

    let a = pager.acquire(a_id).unwrap();
    pager.mark_dirty(a);
    pager.free(a).unwrap();
    assert_eq!(pager.freelist_len(), 1);
    pager.validate_freelist().unwrap();
    pager.commit().unwrap();

    let again = pager.allocate().unwrap();
    assert_eq!(again.page_id(), a_id, "freelist allocation must win");
    assert_eq!(pager.freelist_len(), 0);
    pager.release(again);
    pager.commit().unwrap();
    pager.finish();
    pager.close();
}

#[test]
fn freelist_grows_past_one_trunk() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    let ids: Vec<PageId> = (0..140)
        .map(|_| {
            let page = pager.allocate().unwrap();
            let id = page.page_id();
            pager.release(page);
            id
        })
        .collect();
    pager.commit().unwrap();

    for id in &ids {
        let page = pager.acquire(*id).unwrap();
        pager.mark_dirty(page);
        pager.free(page).unwrap();
    }
    assert_eq!(pager.freelist_len(), 140);
    pager.validate_freelist().unwrap();
    pager.commit().unwrap();

    // Everything comes back out before the file grows again.
    let before = pager.page_count();
    for _ in 0..140 {
        let page = pager.allocate().unwrap();
        pager.release(page);
    }
    assert_eq!(pager.page_count(), before);
    assert_eq!(pager.freelist_len(), 0);
    pager.finish();
    pager.close();
}

#[test]
fn allocation_skips_pointer_map_slots() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    // With 512-byte pages, map pages sit at 2, 105, 208, ...
    let mut allocated = Vec::new();
    while pager.page_count() < 220 {
        let page = pager.allocate().unwrap();
        allocated.push(page.page_id().get());
        pager.release(page);
    }
    assert!(!allocated.contains(&2));
    assert!(!allocated.contains(&105));
    assert!(!allocated.contains(&208));
    pager.commit().unwrap();

    let err = pager.acquire(PageId::new(105).unwrap()).unwrap_err();
    assert!(err.is_corruption(), "map pages are off limits to tree code");
    pager.finish();
    pager.close();
}

#[test]
fn acquire_beyond_end_is_corruption() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    pager.commit().unwrap();
    let end = pager.page_count();
    // One past the end extends (writer), two past is corruption.
    let err = pager.acquire(PageId::new(end + 2).unwrap()).unwrap_err();
    assert!(err.is_corruption());
    // The status is latched until finish.
    assert!(pager.commit().unwrap_err().is_corruption());
    pager.finish();
    pager.close();
}

#[test]
fn move_page_relocates_content() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    let src = pager.allocate().unwrap();
    let src_id = src.page_id();
    pager.data_mut(src)[9] = 0x42;
    pager.release(src);
    let dst = pager.allocate().unwrap();
    let dst_id = dst.page_id();
    pager.release(dst);
    pager.commit().unwrap();

    let src = pager.acquire(src_id).unwrap();
    pager.mark_dirty(src);
    let moved = pager.move_page(src, dst_id).unwrap();
    assert_eq!(moved.page_id(), dst_id);
    assert_eq!(pager.data(moved)[9], 0x42);
    pager.release(moved);
    pager.commit().unwrap();

    let check = pager.acquire(dst_id).unwrap();
    assert_eq!(pager.data(check)[9], 0x42);
    pager.release(check);
    pager.finish();
    pager.close();
}

#[test]
fn set_page_count_shrinks_the_snapshot() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    for _ in 0..5 {
        let page = pager.allocate().unwrap();
        pager.release(page);
    }
    let full = pager.page_count();
    pager.set_page_count(full - 2);
    assert_eq!(pager.page_count(), full - 2);
    let err = pager.acquire(PageId::new(full).unwrap()).unwrap_err();
    assert!(err.is_corruption());
    pager.finish();
    pager.close();
}

#[test]
fn release_policies_control_residency() {
    let env = MemEnv::new();
    let mut pager = open(&env);
    begin_write(&mut pager);
    let page = pager.allocate().unwrap();
    let id = page.page_id();
    pager.release(page);
    pager.commit().unwrap();
    pager.finish();

    pager.lock_reader().unwrap();
    let before = pager.stats();
    // Still cached from the write transaction: a hit, then evicted by
    // NoCache, so the next acquire misses and the one after hits.
    let page = pager.acquire(id).unwrap();
    pager.release_with(page, ReleaseAction::NoCache);
    let page = pager.acquire(id).unwrap();
    pager.release(page);
    let page = pager.acquire(id).unwrap();
    pager.release(page);
    let stats = pager.stats();
    assert_eq!(stats.cache_misses, before.cache_misses + 1);
    assert_eq!(stats.cache_hits, before.cache_hits + 2);
    pager.finish();

    // Discard drops even dirty frames; the modification never lands.
    pager.lock_reader().unwrap();
    pager.begin_writer().unwrap();
    let page = pager.acquire(id).unwrap();
    pager.mark_dirty(page);
    pager.data_mut(page)[0] = 0x77;
    pager.release_with(page, ReleaseAction::Discard);
    pager.commit().unwrap();
    pager.finish();

    pager.lock_reader().unwrap();
    let page = pager.acquire(id).unwrap();
    assert_ne!(pager.data(page)[0], 0x77, "discarded write must vanish");
    pager.release(page);
    pager.finish();
    pager.close();
}

#[test]
fn second_connection_sees_committed_state() {
    let env = MemEnv::new();
    let mut a = open(&env);
    begin_write(&mut a);
    let page = a.allocate().unwrap();
    let id = page.page_id();
    a.data_mut(page)[33] = 0xCD;
    a.release(page);
    a.commit().unwrap();
    a.finish();

    let mut b = open(&env);
    b.lock_reader().unwrap();
    let page = b.acquire(id).unwrap();
    assert_eq!(b.data(page)[33], 0xCD);
    b.release(page);
    b.finish();

    // Writer exclusion across connections.
    a.lock_reader().unwrap();
    a.begin_writer().unwrap();
    b.lock_reader().unwrap();
    assert!(b.begin_writer().unwrap_err().is_busy());
    b.finish();
    a.finish();
    a.close();
    b.close();
}
