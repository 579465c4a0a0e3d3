//! The schema: bucket records and the vacuum driver.
//!
//! A bucket is a B+-tree whose root page id is stored as the value of
//! its name, either in the schema tree on page 1 (top-level buckets)
//! or in the parent bucket's key space (nested buckets). Bucket
//! records are tagged so they cannot be confused with plain values:
//! `[0x01][varint root id]`, cross-checked against the pointer map
//! before a root is ever trusted.

use calico_error::{CalicoError, Result};
use calico_pager::{PageKind, Pager, pointer_map};
use calico_tree::{Cursor, Tree, relocate_page};
use calico_types::{MAX_VARINT_LEN, PageId, decode_varint, encode_varint};
use hashbrown::HashMap;
use tracing::{debug, trace};

const BUCKET_TAG: u8 = 0x01;

/// Encode a bucket record value.
pub(crate) fn encode_root(root: PageId) -> Vec<u8> {
    let mut out = vec![BUCKET_TAG; 1];
    let mut varint = [0_u8; MAX_VARINT_LEN];
    let n = encode_varint(&mut varint, root.get());
    out.extend_from_slice(&varint[..n]);
    out
}

/// Decode a candidate bucket record without consulting the pager.
fn decode_root(value: &[u8]) -> Option<PageId> {
    if value.first() != Some(&BUCKET_TAG) {
        return None;
    }
    let (raw, n) = decode_varint(&value[1..])?;
    if 1 + n != value.len() {
        return None;
    }
    PageId::new(raw)
}

/// Decode and verify a bucket record: the root must be a live page the
/// pointer map knows as a tree root.
pub(crate) fn verify_root(pager: &mut Pager, value: &[u8]) -> Result<Option<PageId>> {
    let Some(root) = decode_root(value) else {
        return Ok(None);
    };
    if root.get() < 3
        || root.get() > pager.page_count()
        || pointer_map::is_map_page(root, pager.page_size())
    {
        return Ok(None);
    }
    match pointer_map::read_entry(pager, root) {
        Ok(entry) if entry.kind == PageKind::TreeRoot => Ok(Some(root)),
        Ok(_) | Err(_) => Ok(None),
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(CalicoError::invalid_argument("bucket names must not be empty"));
    }
    Ok(())
}

/// Open the bucket `name` inside `parent`.
pub(crate) fn open_bucket(pager: &mut Pager, parent: &Tree, name: &[u8]) -> Result<Tree> {
    validate_name(name)?;
    let Some(value) = parent.get(pager, name)? else {
        return Err(CalicoError::NotFound);
    };
    match verify_root(pager, &value)? {
        Some(root) => Ok(Tree::open(root)),
        None => Err(CalicoError::invalid_argument(format!(
            "record {:?} is not a bucket",
            String::from_utf8_lossy(name)
        ))),
    }
}

/// Open the bucket `name` inside `parent`, creating it if missing.
pub(crate) fn create_bucket(pager: &mut Pager, parent: &mut Tree, name: &[u8]) -> Result<Tree> {
    validate_name(name)?;
    match open_bucket(pager, parent, name) {
        Ok(tree) => Ok(tree),
        Err(err) if err.is_not_found() => {
            let tree = Tree::create(pager)?;
            parent.put(pager, name, &encode_root(tree.root))?;
            debug!(name = %String::from_utf8_lossy(name), root = %tree.root, "bucket created");
            Ok(tree)
        }
        Err(err) => Err(err),
    }
}

/// Drop the bucket `name` inside `parent`: free its tree (and every
/// nested bucket) and remove the record.
pub(crate) fn drop_bucket(pager: &mut Pager, parent: &mut Tree, name: &[u8]) -> Result<PageId> {
    let tree = open_bucket(pager, parent, name)?;
    free_bucket_tree(pager, tree.root)?;
    parent.erase(pager, name)?;
    debug!(name = %String::from_utf8_lossy(name), root = %tree.root, "bucket dropped");
    Ok(tree.root)
}

/// Free a bucket tree and, recursively, every nested bucket found in
/// its records.
fn free_bucket_tree(pager: &mut Pager, root: PageId) -> Result<()> {
    let tree = Tree::open(root);
    let mut nested = Vec::new();
    let mut cursor = Cursor::new();
    cursor.seek_first(pager, &tree)?;
    while cursor.is_valid() {
        if let Some(child) = verify_root(pager, cursor.value())? {
            nested.push(child);
        }
        cursor.next(pager, &tree)?;
    }
    for child in nested {
        free_bucket_tree(pager, child)?;
    }
    Tree::open(root).free_all(pager)
}

/// Validate `parent` and, recursively, every bucket recorded in it.
pub(crate) fn check_all(pager: &mut Pager, parent: &Tree) -> Result<()> {
    parent.check(pager)?;
    let mut roots = Vec::new();
    let mut cursor = Cursor::new();
    cursor.seek_first(pager, parent)?;
    while cursor.is_valid() {
        if let Some(root) = verify_root(pager, cursor.value())? {
            roots.push(root);
        }
        cursor.next(pager, parent)?;
    }
    for root in roots {
        check_all(pager, &Tree::open(root))?;
    }
    Ok(())
}

/// List the bucket names recorded in `parent`, in key order.
pub(crate) fn list_buckets(pager: &mut Pager, parent: &Tree) -> Result<Vec<Vec<u8>>> {
    let mut names = Vec::new();
    let mut cursor = Cursor::new();
    cursor.seek_first(pager, parent)?;
    while cursor.is_valid() {
        if verify_root(pager, cursor.value())?.is_some() {
            names.push(cursor.key().to_vec());
        }
        cursor.next(pager, parent)?;
    }
    Ok(names)
}

/// Compact the database: relocate every live page below the boundary
/// the freelist pays for, then shrink the page count. The file itself
/// shrinks at the next checkpoint.
///
/// Returns the rerooting map for bucket roots that moved; the caller
/// rewrites their records (the observable schema never changes).
pub(crate) fn vacuum(pager: &mut Pager) -> Result<HashMap<u32, PageId>> {
    let mut reroots: HashMap<u32, PageId> = HashMap::new();
    let before = (pager.page_count(), pager.freelist_len());
    while pager.freelist_len() > 0 {
        let end = pager.page_count();
        let Some(page) = PageId::new(end) else {
            break;
        };
        if page == PageId::ROOT {
            break;
        }
        if pointer_map::is_map_page(page, pager.page_size()) {
            pager.set_page_count(end - 1);
            continue;
        }
        let entry = pointer_map::read_entry(pager, page)?;
        if matches!(entry.kind, PageKind::FreelistTrunk | PageKind::FreelistLeaf) {
            pager.remove_from_freelist(page)?;
            pager.set_page_count(end - 1);
            continue;
        }
        let dest = pager
            .pop_freelist()?
            .ok_or_else(|| CalicoError::corruption("freelist drained during vacuum"))?;
        trace!(from = %page, to = %dest, "vacuum relocation");
        if let Some((old, new)) = relocate_page(pager, page, dest)? {
            // A rerooted root may itself be rerooted again later; the
            // map always tracks the latest position.
            let original = reroots
                .iter()
                .find_map(|(k, v)| (*v == old).then_some(*k));
            match original {
                Some(key) => {
                    reroots.insert(key, new);
                }
                None => {
                    reroots.insert(old.get(), new);
                }
            }
        }
        pager.set_page_count(end - 1);
    }
    debug!(
        pages_before = before.0,
        free_before = before.1,
        pages_after = pager.page_count(),
        "vacuum complete"
    );
    Ok(reroots)
}

/// Rewrite every bucket record whose root was moved by [`vacuum`],
/// walking the schema tree and nested buckets.
///
/// Stale records decode against the map directly: their old root is
/// past the shrunken page count, so pointer-map verification only
/// applies once the record points at its new home.
pub(crate) fn apply_reroots(
    pager: &mut Pager,
    parent: &mut Tree,
    reroots: &HashMap<u32, PageId>,
) -> Result<()> {
    if reroots.is_empty() {
        return Ok(());
    }
    let mut records: Vec<(Vec<u8>, PageId)> = Vec::new();
    let mut cursor = Cursor::new();
    cursor.seek_first(pager, parent)?;
    while cursor.is_valid() {
        if let Some(root) = decode_root(cursor.value()) {
            records.push((cursor.key().to_vec(), root));
        }
        cursor.next(pager, parent)?;
    }
    for (name, root) in records {
        let effective = if let Some(new_root) = reroots.get(&root.get()).copied() {
            parent.put(pager, &name, &encode_root(new_root))?;
            trace!(name = %String::from_utf8_lossy(&name), old = %root, new = %new_root, "bucket rerooted");
            new_root
        } else if verify_root(pager, &encode_root(root))?.is_some() {
            root
        } else {
            // Plain value that happened to decode; leave it alone.
            continue;
        };
        let mut child = Tree::open(effective);
        apply_reroots(pager, &mut child, reroots)?;
    }
    Ok(())
}
