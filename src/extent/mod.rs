//! The extent allocator (§4.D): owns every block group's free space, and persists
//! `EXTENT_ITEM`/`EXTENT_REF`/`BLOCK_GROUP_ITEM` bookkeeping in its own B+-tree (the
//! `extent_tree` field) — which is, itself, just another `btree::Tree`, allocated from
//! the very same free space it manages.
//!
//! That self-reference is the whole difficulty here. Writing a bookkeeping item for a
//! freshly allocated block may itself require COWing the extent tree's own nodes,
//! which calls back into `alloc_tree_block` before the first call has returned. Real
//! btrfs breaks the cycle by never synchronously inserting during allocation: it only
//! updates the in-memory free-space index and records what *should* be written, then
//! drains that record in a separate pass once the allocation that triggered it has
//! unwound. `finish_pending` is that drain, and the transaction manager calls it in a
//! loop until a pass produces nothing new (§4.F's fixed-point commit step) — because
//! draining can itself allocate, which can itself produce more to drain.

pub mod backref;
pub mod block_group;

pub use block_group::BlockGroup;

use crate::btree::{BlockAllocator, Tree};
use crate::codec::Key;
use crate::error::{BtrfsError, Result};
use crate::interval::IntervalSet;
use crate::structures::{btrfs_block_group_item, btrfs_extent_item, btrfs_extent_ref, item_type, BtrfsBlockGroupFlags};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug)]
enum PendingOp {
    Alloc {
        bytenr: u64,
        len: u64,
        owner: u64,
        generation: u64,
    },
    Dec {
        bytenr: u64,
        len: u64,
        owner: u64,
    },
    IncRef {
        bytenr: u64,
        len: u64,
        owner: u64,
        generation: u64,
    },
}

pub struct ExtentAllocator {
    nodesize: u32,
    block_groups: RefCell<Vec<BlockGroup>>,
    pinned: RefCell<IntervalSet>,
    pending: RefCell<Vec<PendingOp>>,
    alloc_hint: RefCell<u64>,
    tree: RefCell<Option<Rc<Tree>>>,
}

impl ExtentAllocator {
    pub fn new(nodesize: u32) -> Rc<ExtentAllocator> {
        Rc::new(ExtentAllocator {
            nodesize,
            block_groups: RefCell::new(Vec::new()),
            pinned: RefCell::new(IntervalSet::new()),
            pending: RefCell::new(Vec::new()),
            alloc_hint: RefCell::new(0),
            tree: RefCell::new(None),
        })
    }

    /// Two-phase init: the extent tree needs `Rc<dyn BlockAllocator>` pointing back at
    /// this allocator before it can exist, so callers build the allocator, construct
    /// the tree from it, then hand the tree back here.
    pub fn attach_tree(&self, tree: Rc<Tree>) {
        *self.tree.borrow_mut() = Some(tree);
    }

    pub fn add_block_group(&self, bytenr: u64, length: u64, flags: BtrfsBlockGroupFlags) {
        self.block_groups
            .borrow_mut()
            .push(BlockGroup::new(bytenr, length, flags));
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.block_groups.borrow().iter().map(|bg| bg.free_bytes()).sum()
    }

    fn alloc_bytes(&self, flags: BtrfsBlockGroupFlags, len: u64) -> Result<u64> {
        let hint = *self.alloc_hint.borrow();
        let found = {
            let mut groups = self.block_groups.borrow_mut();
            let mut found = None;
            for bg in groups.iter_mut() {
                if bg.matches(flags) {
                    if let Some(bytenr) = bg.alloc(hint, len) {
                        found = Some(bytenr);
                        break;
                    }
                }
            }
            found
        };
        match found {
            Some(bytenr) => {
                *self.alloc_hint.borrow_mut() = bytenr + len;
                Ok(bytenr)
            }
            None => Err(BtrfsError::NoSpace),
        }
    }

    /// Moves a freed range into the pinned set, where it stays unusable until the
    /// transaction that freed it commits (§4.D.5) — a reader still walking the old
    /// commit root after a crash must find it intact.
    fn pin(&self, bytenr: u64, len: u64) {
        self.pinned.borrow_mut().add(bytenr, len);
    }

    /// Called once per transaction commit, after the new super block is durable:
    /// returns pinned space to its block group's free-space index.
    pub fn unpin_all(&self) {
        let mut pinned = self.pinned.borrow_mut();
        let ranges: Vec<(u64, u64)> = pinned.iter().collect();
        let mut groups = self.block_groups.borrow_mut();
        for (start, len) in ranges {
            if let Some(bg) = groups.iter_mut().find(|bg| bg.contains(start)) {
                bg.free(start, len);
            }
        }
        *pinned = IntervalSet::new();
    }

    pub fn is_pinned(&self, bytenr: u64, len: u64) -> bool {
        self.pinned.borrow().intersects(bytenr, len)
    }

    /// Drops one reference to an existing tree block, same bookkeeping path as a COW
    /// superseding it — used by `crate::snapshot::drop_snapshot` to walk a doomed root's
    /// blocks without going through `BlockAllocator` (there is no COW happening here).
    pub fn dec_tree_block_ref(&self, bytenr: u64, owner: u64) {
        self.pending.borrow_mut().push(PendingOp::Dec {
            bytenr,
            len: self.nodesize as u64,
            owner,
        });
    }

    /// Rebuild hook for `open_ctree`: marks `[bytenr, bytenr+len)` used in whichever
    /// block group contains it, without going through `alloc_tree_block`'s pending
    /// bookkeeping (the `EXTENT_ITEM` this range belongs to is already on disk).
    pub fn mark_used(&self, bytenr: u64, len: u64) {
        if let Some(bg) = self
            .block_groups
            .borrow_mut()
            .iter_mut()
            .find(|bg| bg.contains(bytenr))
        {
            bg.mark_used(bytenr, len);
        }
    }

    /// Drains the deferred bookkeeping queue into the extent tree. Returns `true` if
    /// it did anything — the caller loops until this returns `false` (fixed point).
    pub fn finish_pending(&self) -> Result<bool> {
        let tree = match self.tree.borrow().clone() {
            Some(t) => t,
            // still bootstrapping (mkfs): leave the queue alone, there is nowhere to
            // persist it yet and draining it here would lose it for good.
            None => return Ok(false),
        };
        let ops: Vec<PendingOp> = self.pending.borrow_mut().drain(..).collect();
        if ops.is_empty() {
            return Ok(false);
        }

        for op in ops {
            match op {
                PendingOp::Alloc {
                    bytenr,
                    len,
                    owner: _,
                    generation,
                } => {
                    let key = Key::new(bytenr, item_type::EXTENT_ITEM, len);
                    let item = btrfs_extent_item {
                        refs: 1,
                        generation,
                        flags: 0,
                    };
                    let bytes = encode_extent_item(&item);
                    match tree.lookup(key)? {
                        Some(_) => tree.update_item(key, &bytes)?,
                        None => tree.insert_item(key, &bytes)?,
                    }
                }
                PendingOp::Dec { bytenr, len, owner: _ } => {
                    let key = Key::new(bytenr, item_type::EXTENT_ITEM, len);
                    match tree.lookup(key)? {
                        Some(bytes) => {
                            let mut item = decode_extent_item(&bytes);
                            item.refs = item.refs.saturating_sub(1);
                            if item.refs == 0 {
                                tree.del_item(key)?;
                                self.pin(bytenr, len);
                            } else {
                                tree.update_item(key, &encode_extent_item(&item))?;
                            }
                        }
                        // the block was never bookkept (still bootstrapping when it was
                        // allocated) — treat as an unconditional free.
                        None => self.pin(bytenr, len),
                    }
                }
                PendingOp::IncRef {
                    bytenr,
                    len,
                    owner,
                    generation,
                } => {
                    let key = Key::new(bytenr, item_type::EXTENT_ITEM, len);
                    if let Some(bytes) = tree.lookup(key)? {
                        let mut item = decode_extent_item(&bytes);
                        item.refs += 1;
                        tree.update_item(key, &encode_extent_item(&item))?;
                    }
                    insert_backref(&tree, bytenr, owner, generation)?;
                }
            }
        }
        Ok(true)
    }
}

fn insert_backref(tree: &Tree, bytenr: u64, owner: u64, generation: u64) -> Result<()> {
    let r = btrfs_extent_ref {
        root_objectid: owner,
        generation,
        owner_objectid: owner,
        owner_offset: 0,
    };
    let mut offset = backref::backref_hash(r.root_objectid, r.owner_objectid, r.owner_offset);
    loop {
        let key = Key::new(bytenr, item_type::EXTENT_REF_V0, offset);
        match tree.lookup(key)? {
            None => return tree.insert_item(key, &backref::encode_ref(&r)),
            Some(existing) => {
                let existing_ref = backref::decode_ref(&existing);
                if backref::same_holder(&existing_ref, &r) {
                    return Ok(()); // already recorded
                }
                offset = offset.wrapping_add(1); // linear probe past the collision
            }
        }
    }
}

pub(crate) fn encode_extent_item(item: &btrfs_extent_item) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&item.refs.to_le_bytes());
    out.extend_from_slice(&item.generation.to_le_bytes());
    out.extend_from_slice(&item.flags.to_le_bytes());
    out
}

pub(crate) fn decode_extent_item(buf: &[u8]) -> btrfs_extent_item {
    btrfs_extent_item {
        refs: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        generation: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        flags: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
    }
}

pub fn encode_block_group_item(item: &btrfs_block_group_item) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&item.used.to_le_bytes());
    out.extend_from_slice(&item.flags.to_le_bytes());
    out
}

pub fn decode_block_group_item(buf: &[u8]) -> btrfs_block_group_item {
    btrfs_block_group_item {
        used: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        flags: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    }
}

pub fn block_group_flags_from_bits(bits: u64) -> BtrfsBlockGroupFlags {
    match bits {
        1 => BtrfsBlockGroupFlags::DATA,
        2 => BtrfsBlockGroupFlags::SYSTEM,
        _ => BtrfsBlockGroupFlags::METADATA,
    }
}

impl BlockAllocator for ExtentAllocator {
    fn alloc_tree_block(&self, owner: u64) -> Result<u64> {
        let bytenr = self.alloc_bytes(BtrfsBlockGroupFlags::METADATA, self.nodesize as u64)?;
        self.pending.borrow_mut().push(PendingOp::Alloc {
            bytenr,
            len: self.nodesize as u64,
            owner,
            generation: 0,
        });
        Ok(bytenr)
    }

    /// A COW supersedes a block but does not assume it is now unreferenced — it may
    /// still be shared with a snapshot. The pin/free decision is made in
    /// `finish_pending` once the extent tree's own refcount can be consulted.
    fn free_tree_block(&self, bytenr: u64, owner: u64, _generation: u64) -> Result<()> {
        self.pending.borrow_mut().push(PendingOp::Dec {
            bytenr,
            len: self.nodesize as u64,
            owner,
        });
        Ok(())
    }

    fn inc_tree_block_ref(&self, bytenr: u64, owner: u64) -> Result<()> {
        self.pending.borrow_mut().push(PendingOp::IncRef {
            bytenr,
            len: self.nodesize as u64,
            owner,
            generation: 0,
        });
        Ok(())
    }

    /// Drains the pending queue first so a freshly queued `inc_tree_block_ref` or
    /// `dec_tree_block_ref` is already reflected; safe to call here since nothing on
    /// this path, unlike `alloc_tree_block`, is itself reached from inside
    /// `finish_pending`.
    fn tree_block_refs(&self, bytenr: u64) -> Result<u64> {
        self.finish_pending()?;
        let tree = match self.tree.borrow().clone() {
            Some(t) => t,
            None => return Ok(1),
        };
        let key = Key::new(bytenr, item_type::EXTENT_ITEM, self.nodesize as u64);
        match tree.lookup(key)? {
            Some(bytes) => Ok(decode_extent_item(&bytes).refs),
            None => Ok(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_excludes_pinned_and_full_groups() {
        let alloc = ExtentAllocator::new(4096);
        alloc.add_block_group(0, 4096 * 4, BtrfsBlockGroupFlags::METADATA);
        let a = alloc.alloc_tree_block(5).unwrap();
        let b = alloc.alloc_tree_block(5).unwrap();
        assert_ne!(a, b);
    }

    fn attached_test_tree(alloc: &Rc<ExtentAllocator>) -> Rc<Tree> {
        let device = std::sync::Arc::new(crate::device::MemDevice::new(4096 * 16));
        let cache = Rc::new(crate::cache::Cache::new(device, 4096));
        let root = cache.create_empty();
        root.header().set_bytenr(4096 * 9);
        root.header().set_generation(1);
        root.header().set_level(0);
        cache.insert(root.clone());
        let tree = Rc::new(Tree::new(
            crate::structures::BTRFS_EXTENT_TREE_OBJECTID,
            cache,
            alloc.clone() as Rc<dyn BlockAllocator>,
            root,
            false,
        ));
        tree.set_transaction(1);
        alloc.attach_tree(tree.clone());
        tree
    }

    #[test]
    fn finish_pending_reclaims_space_once_refs_reach_zero() {
        let alloc = ExtentAllocator::new(4096);
        alloc.add_block_group(4096, 4096 * 8, BtrfsBlockGroupFlags::METADATA);
        let tree = attached_test_tree(&alloc);

        let bytenr = alloc.alloc_tree_block(5).unwrap();
        while alloc.finish_pending().unwrap() {}
        let key = Key::new(bytenr, item_type::EXTENT_ITEM, 4096);
        assert!(tree.lookup(key).unwrap().is_some());

        alloc.free_tree_block(bytenr, 5, 1).unwrap();
        while alloc.finish_pending().unwrap() {}
        assert!(tree.lookup(key).unwrap().is_none());
        assert!(alloc.is_pinned(bytenr, 4096));
        alloc.unpin_all();
        assert!(!alloc.is_pinned(bytenr, 4096));
    }

    #[test]
    fn inc_ref_keeps_extent_alive_after_one_drop() {
        let alloc = ExtentAllocator::new(4096);
        alloc.add_block_group(4096, 4096 * 8, BtrfsBlockGroupFlags::METADATA);
        let tree = attached_test_tree(&alloc);

        let bytenr = alloc.alloc_tree_block(5).unwrap();
        while alloc.finish_pending().unwrap() {}
        alloc.inc_tree_block_ref(bytenr, 9).unwrap();
        while alloc.finish_pending().unwrap() {}

        let key = Key::new(bytenr, item_type::EXTENT_ITEM, 4096);
        alloc.dec_tree_block_ref(bytenr, 5);
        while alloc.finish_pending().unwrap() {}
        assert!(tree.lookup(key).unwrap().is_some());
        assert!(!alloc.is_pinned(bytenr, 4096));

        alloc.dec_tree_block_ref(bytenr, 9);
        while alloc.finish_pending().unwrap() {}
        assert!(tree.lookup(key).unwrap().is_none());
        assert!(alloc.is_pinned(bytenr, 4096));
    }
}
