//! Multi-connection WAL protocol tests: snapshot isolation, rollback,
//! tail recovery, and checkpointing, all over the in-memory
//! environment.

use std::sync::Arc;

use calico_env::{Env, File, MemEnv, OpenMode};
use calico_wal::{CheckpointMode, Wal};

const PAGE_SIZE: u32 = 512;

struct Conn {
    wal: Wal,
    db_file: Arc<dyn File>,
}

fn connect(env: &MemEnv) -> Conn {
    let mode = OpenMode::CREATE | OpenMode::READ_WRITE;
    let db_file = env.new_file("test.db", mode).unwrap();
    let wal_file = env.new_file("test.db-wal", mode).unwrap();
    let wal = Wal::new(
        Arc::new(env.clone()),
        Arc::clone(&db_file),
        wal_file,
        PAGE_SIZE,
    );
    Conn { wal, db_file }
}

fn page(fill: u8) -> Vec<u8> {
    vec![fill; PAGE_SIZE as usize]
}

fn no_busy() -> impl FnMut() -> bool {
    || false
}

/// Commit `pages` as one group through a fresh writer lock.
fn commit(conn: &mut Conn, pages: &[(u32, Vec<u8>)], db_size: u32) {
    conn.wal.start_read().unwrap();
    conn.wal.start_write().unwrap();
    let refs: Vec<(u32, &[u8])> = pages.iter().map(|(id, data)| (*id, data.as_slice())).collect();
    conn.wal.write_frames(&refs, db_size, true).unwrap();
    conn.wal.finish_read();
}

#[test]
fn committed_pages_are_visible_to_other_connections() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x11)), (2, page(0x22))], 2);

    let mut b = connect(&env);
    b.wal.start_read().unwrap();
    let mut out = page(0);
    assert!(b.wal.read_page(1, &mut out).unwrap());
    assert_eq!(out, page(0x11));
    assert!(b.wal.read_page(2, &mut out).unwrap());
    assert_eq!(out, page(0x22));
    assert!(!b.wal.read_page(3, &mut out).unwrap());
    b.wal.finish_read();
}

#[test]
fn reader_snapshot_is_stable_across_commits() {
    let env = MemEnv::new();
    let mut writer = connect(&env);
    commit(&mut writer, &[(1, page(0xAA))], 1);

    let mut reader = connect(&env);
    reader.wal.start_read().unwrap();

    // The writer moves on while the reader's snapshot is pinned.
    commit(&mut writer, &[(1, page(0xBB)), (2, page(0xCC))], 2);

    let mut out = page(0);
    assert!(reader.wal.read_page(1, &mut out).unwrap());
    assert_eq!(out, page(0xAA), "snapshot must not see the later commit");
    assert!(!reader.wal.read_page(2, &mut out).unwrap());
    reader.wal.finish_read();

    // A new snapshot sees everything.
    let changed = reader.wal.start_read().unwrap();
    assert!(changed);
    assert!(reader.wal.read_page(2, &mut out).unwrap());
    assert_eq!(out, page(0xCC));
    reader.wal.finish_read();
}

#[test]
fn second_writer_is_refused() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(1))], 1);

    let mut b = connect(&env);
    a.wal.start_read().unwrap();
    a.wal.start_write().unwrap();
    b.wal.start_read().unwrap();
    assert!(b.wal.start_write().unwrap_err().is_busy());
    a.wal.finish_read();
    b.wal.start_write().unwrap();
    b.wal.finish_read();
}

#[test]
fn stale_snapshot_cannot_become_writer() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(1))], 1);

    let mut b = connect(&env);
    b.wal.start_read().unwrap();
    commit(&mut a, &[(1, page(2))], 1);

    let err = b.wal.start_write().unwrap_err();
    assert!(err.is_retry(), "stale writer must be told to re-read");
    b.wal.finish_read();
}

#[test]
fn rollback_after_publication_is_a_noop() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x0A))], 1);

    a.wal.start_read().unwrap();
    a.wal.start_write().unwrap();
    let p2 = page(0x0B);
    let p3 = page(0x0C);
    // Append without the final commit marker reaching publication by
    // rolling back immediately after.
    a.wal
        .write_frames(&[(2, p2.as_slice()), (3, p3.as_slice())], 3, false)
        .unwrap();
    // The group was published; a rollback after publication is a no-op.
    let mut undone = Vec::new();
    a.wal
        .undo(|page_id| {
            undone.push(page_id);
            Ok(())
        })
        .unwrap();
    assert!(undone.is_empty());
    a.wal.finish_read();
}

#[test]
fn recovery_replays_only_the_valid_commit_prefix() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x5A)), (2, page(0x5B))], 2);
    commit(&mut a, &[(2, page(0x5C))], 2);

    // Crash: copy the durable files into a brand-new environment,
    // leaving the shm index behind.
    let crashed = MemEnv::new();
    for name in ["test.db", "test.db-wal"] {
        let src = env.new_file(name, OpenMode::READ_WRITE).unwrap();
        let mut data = vec![0_u8; src.size().unwrap() as usize];
        src.read_exact(0, &mut data).unwrap();
        let dst = crashed
            .new_file(name, OpenMode::CREATE | OpenMode::READ_WRITE)
            .unwrap();
        dst.write(0, &data).unwrap();
    }

    // Tear the tail: a torn frame append must be ignored.
    let wal_file = crashed.new_file("test.db-wal", OpenMode::READ_WRITE).unwrap();
    let end = wal_file.size().unwrap();
    wal_file.write(end, &[0xFF; 100]).unwrap();

    let mut b = connect(&crashed);
    b.wal.start_read().unwrap();
    let mut out = page(0);
    assert!(b.wal.read_page(1, &mut out).unwrap());
    assert_eq!(out, page(0x5A));
    assert!(b.wal.read_page(2, &mut out).unwrap());
    assert_eq!(out, page(0x5C), "second commit must survive recovery");
    assert_eq!(b.wal.db_size(), 2);
    b.wal.finish_read();
}

#[test]
fn passive_checkpoint_backfills_the_database_file() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x77)), (2, page(0x88))], 2);

    a.wal.checkpoint(CheckpointMode::Passive, &mut no_busy()).unwrap();

    let mut out = page(0);
    a.db_file.read_exact(0, &mut out).unwrap();
    assert_eq!(out, page(0x77));
    a.db_file.read_exact(u64::from(PAGE_SIZE), &mut out).unwrap();
    assert_eq!(out, page(0x88));
    assert_eq!(a.db_file.size().unwrap(), u64::from(2 * PAGE_SIZE));
}

#[test]
fn checkpoint_stops_at_a_live_reader_mark() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x01))], 1);

    let mut reader = connect(&env);
    reader.wal.start_read().unwrap();

    commit(&mut a, &[(1, page(0x02))], 1);
    // Passive checkpoint cannot evict the reader; the newer frame
    // stays WAL-only.
    let _ = a.wal.checkpoint(CheckpointMode::Passive, &mut no_busy());

    let mut out = page(0);
    a.db_file.read_exact(0, &mut out).unwrap();
    assert_eq!(out, page(0x01), "backfill must stop at the reader mark");

    let mut check = page(0);
    assert!(reader.wal.read_page(1, &mut check).unwrap());
    assert_eq!(check, page(0x01));
    reader.wal.finish_read();
}

#[test]
fn restart_checkpoint_recycles_the_log() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x31)), (2, page(0x32))], 2);

    a.wal.checkpoint(CheckpointMode::Restart, &mut no_busy()).unwrap();
    let wal_file = env.new_file("test.db-wal", OpenMode::READ_WRITE).unwrap();
    assert_eq!(wal_file.size().unwrap(), 0, "restart truncates the log");

    // The next commit starts a fresh frame chain and stays readable.
    commit(&mut a, &[(2, page(0x33))], 2);
    let mut b = connect(&env);
    b.wal.start_read().unwrap();
    let mut out = page(0);
    assert!(b.wal.read_page(2, &mut out).unwrap());
    assert_eq!(out, page(0x33));
    assert!(
        !b.wal.read_page(1, &mut out).unwrap(),
        "page 1 now lives only in the database file"
    );
    b.wal.finish_read();
}

#[test]
fn full_checkpoint_reports_busy_when_a_reader_pins_frames() {
    let env = MemEnv::new();
    let mut a = connect(&env);
    commit(&mut a, &[(1, page(0x41))], 1);

    let mut reader = connect(&env);
    reader.wal.start_read().unwrap();
    commit(&mut a, &[(1, page(0x42))], 1);

    let err = a
        .wal
        .checkpoint(CheckpointMode::Full, &mut no_busy())
        .unwrap_err();
    assert!(err.is_busy());
    reader.wal.finish_read();

    a.wal.checkpoint(CheckpointMode::Full, &mut no_busy()).unwrap();
    let mut out = page(0);
    a.db_file.read_exact(0, &mut out).unwrap();
    assert_eq!(out, page(0x42));
}
