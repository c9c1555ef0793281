use btrfs_kit::btree::iter;
use btrfs_kit::codec::Key;
use btrfs_kit::device::{BlockDevice, MemDevice};
use btrfs_kit::snapshot::{drop_snapshot_step, snapshot, DropProgress};
use btrfs_kit::structures::{item_type, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use btrfs_kit::{mkfs, open_ctree};
use std::sync::Arc;

const SUBVOL: u64 = 5; // BTRFS_FS_TREE_OBJECTID

fn fresh_device(mib: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemDevice::new(mib * 1024 * 1024))
}

fn count_items(tree: &btrfs_kit::btree::Tree) -> usize {
    let mut n = 0;
    let mut next = Some(Key::MIN);
    while let Some(key) = next {
        match iter::seek(tree, key).unwrap() {
            Some((found, _)) => {
                n += 1;
                next = iter::successor(found);
            }
            None => break,
        }
    }
    n
}

#[test]
fn leaf_fill_and_split_keeps_items_in_order() {
    let device = fresh_device(64);
    let fs = mkfs(device, 4096, 4096).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();

    for offset in 0..200u64 {
        let key = Key::new(1, 0x10, offset);
        let payload = vec![0xAB_u8; 20];
        root.insert_item(key, &payload).unwrap();
    }

    assert!(root.root_buffer().level() > 0, "200 items must split a 4K leaf");
    assert_eq!(count_items(&root), 200);

    let mut last = None;
    let mut next = Some(Key::MIN);
    while let Some(key) = next {
        match iter::seek(&root, key).unwrap() {
            Some((found, _)) => {
                if let Some(prev) = last {
                    assert!(prev < found);
                }
                last = Some(found);
                next = iter::successor(found);
            }
            None => break,
        }
    }
}

#[test]
fn cow_preserves_a_snapshot_taken_before_the_mutation() {
    let device = fresh_device(64);
    let key = Key::new(1, 0x10, 5);

    let fs = mkfs(device.clone(), 4096, 4096).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    root.insert_item(key, b"before").unwrap();
    fs.close_ctree().unwrap();

    // Reopen so the tree handle starts life synced to the post-commit generation —
    // reusing a handle across a commit without rejoining a transaction is a caller
    // error (the same one a fresh open on every session structurally avoids).
    let fs = open_ctree(device.clone()).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    let preserved = snapshot(&root, &fs.alloc, 100).unwrap();
    while fs.alloc.finish_pending().unwrap() {}

    root.del_item(key).unwrap();
    root.insert_item(key, b"after").unwrap();
    fs.close_ctree().unwrap();

    assert_eq!(
        preserved.lookup(key).unwrap().as_deref(),
        Some(&b"before"[..])
    );

    let fs = open_ctree(device).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    assert_eq!(root.lookup(key).unwrap().as_deref(), Some(&b"after"[..]));
}

#[test]
fn resumable_drop_snapshot_eventually_finishes() {
    let device = fresh_device(64);
    let fs = mkfs(device, 4096, 4096).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();

    for offset in 0..400u64 {
        root.insert_item(Key::new(1, 0x10, offset), &[0xCD_u8; 24])
            .unwrap();
    }
    while fs.alloc.finish_pending().unwrap() {}

    let snap = snapshot(&root, &fs.alloc, 100).unwrap();
    while fs.alloc.finish_pending().unwrap() {}
    fs.register_root(100, &snap).unwrap();

    let mut progress = DropProgress::default();
    let mut steps = 0;
    loop {
        match drop_snapshot_step(&snap, &fs.alloc, progress, 1).unwrap() {
            Some(next) => {
                progress = next;
                steps += 1;
                assert!(steps < 10_000, "drop never converged");
            }
            None => break,
        }
        while fs.alloc.finish_pending().unwrap() {}
    }
    fs.unregister_root(100).unwrap();

    // the source subvolume is untouched by dropping the snapshot sharing its blocks.
    assert_eq!(count_items(&root), 400);
}

#[test]
fn simulated_crash_before_super_write_hides_the_uncommitted_mutation() {
    let device = fresh_device(64);
    let fs = mkfs(device.clone(), 4096, 4096).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    root.insert_item(Key::new(1, 0x10, 0), b"committed").unwrap();
    fs.close_ctree().unwrap();

    let mut old_super = [0_u8; BTRFS_SUPER_INFO_SIZE];
    device
        .read_at(BTRFS_SUPER_INFO_OFFSET as u64, &mut old_super)
        .unwrap();

    let fs = open_ctree(device.clone()).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    root.insert_item(Key::new(1, 0x10, 1), b"lost").unwrap();
    fs.close_ctree().unwrap(); // writes new blocks and a new super

    // simulate the crash: the new dirty blocks made it to disk, the super update didn't.
    device
        .write_at(BTRFS_SUPER_INFO_OFFSET as u64, &old_super)
        .unwrap();

    let fs = open_ctree(device).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    assert_eq!(
        root.lookup(Key::new(1, 0x10, 0)).unwrap().as_deref(),
        Some(&b"committed"[..])
    );
    assert_eq!(root.lookup(Key::new(1, 0x10, 1)).unwrap(), None);
}

#[test]
fn commit_root_stays_fixed_across_a_mutation_in_the_next_transaction() {
    // Exercises the in-memory `commit_root` pointer itself, rather than a close/reopen
    // round trip: a single `Filesystem` handle joins a second transaction and mutates,
    // and `commit_root` must still point at the block the first transaction left behind.
    let device = fresh_device(64);
    let fs = mkfs(device, 4096, 4096).unwrap();
    let root = fs.fs_tree(SUBVOL).unwrap();
    root.insert_item(Key::new(1, 0x10, 0), b"one").unwrap();
    fs.close_ctree().unwrap();

    // Re-fetching the same objectid on the same handle is a cache hit, which is what
    // rejoins the now-bumped generation and snapshots `commit_root`.
    let root = fs.fs_tree(SUBVOL).unwrap();
    let committed_bytenr = root.commit_root().bytenr();
    assert_eq!(root.root_buffer().bytenr(), committed_bytenr);

    root.insert_item(Key::new(1, 0x10, 1), b"two").unwrap();

    assert_eq!(root.commit_root().bytenr(), committed_bytenr);
    assert_ne!(root.root_buffer().bytenr(), committed_bytenr);
}
