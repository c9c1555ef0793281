//! Persistent COW B+-tree core (§4.C). A `Tree` is one root: the extent tree, a
//! filesystem tree, the root tree, etc. — each owns its own `Tree` instance sharing the
//! filesystem-wide block cache, distinguished by `owner` (the tree's objectid, stamped
//! into every block header and used as the extent back-reference owner).

pub mod cow;
pub mod delete;
pub mod insert;
pub mod iter;
pub mod leaf;
pub mod node;
pub mod search;

use crate::cache::{Buffer, Cache};
use crate::codec::Key;
use crate::error::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Matches the teacher's own `btrfs_path`-equivalent bound: no real btrfs tree has ever
/// needed more than 8 levels between a leaf and the root.
pub const MAX_LEVEL: usize = 8;

/// Supplies tree-block storage to a `Tree`, decoupling the B+-tree core from the extent
/// allocator (which is itself implemented as a `Tree`, and must not recursively call
/// back into its own allocation path — see `crate::extent::deferred`).
pub trait BlockAllocator {
    fn alloc_tree_block(&self, owner: u64) -> Result<u64>;
    fn free_tree_block(&self, bytenr: u64, owner: u64, generation: u64) -> Result<()>;
    /// Records an additional reference to an existing tree block (a snapshot sharing a
    /// subtree with its source root).
    fn inc_tree_block_ref(&self, bytenr: u64, owner: u64) -> Result<()>;
    /// Current reference count of an existing tree block, read through to the extent
    /// tree. Used by `cow::cow_block` to tell an ordinary COW (old block held exactly
    /// one reference) from a COW of a block still shared with a snapshot.
    fn tree_block_refs(&self, bytenr: u64) -> Result<u64>;
}

/// A root-to-leaf walk: `nodes[0]`/`slots[0]` is the leaf, increasing index walks
/// toward the root.
#[derive(Clone, Default)]
pub struct Path {
    pub nodes: Vec<Buffer>,
    pub slots: Vec<u32>,
}

impl Path {
    pub fn leaf(&self) -> &Buffer {
        &self.nodes[0]
    }
    pub fn leaf_slot(&self) -> u32 {
        self.slots[0]
    }
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }
}

pub struct Tree {
    pub owner: u64,
    pub(crate) cache: Rc<Cache>,
    pub(crate) alloc: Rc<dyn BlockAllocator>,
    root: RefCell<Buffer>,
    trans_id: RefCell<u64>,
    /// Whether a COW of a block owned by this tree splits ownership of the block's
    /// children (§4.C.5 step 3) and whether this tree's root gets tagged dirty and
    /// persisted at commit (§4.F). Set for subvolume/fs trees and the tree-of-roots;
    /// clear for the extent tree, which commits through its own dedicated path.
    ref_cows: bool,
    last_trans: Cell<u64>,
    dirty: Cell<bool>,
    commit_root: RefCell<Buffer>,
}

impl Tree {
    pub fn new(
        owner: u64,
        cache: Rc<Cache>,
        alloc: Rc<dyn BlockAllocator>,
        root: Buffer,
        ref_cows: bool,
    ) -> Tree {
        let trans_id = root_generation(&root);
        Tree {
            owner,
            cache,
            alloc,
            root: RefCell::new(root.clone()),
            trans_id: RefCell::new(trans_id),
            ref_cows,
            last_trans: Cell::new(trans_id),
            dirty: Cell::new(false),
            commit_root: RefCell::new(root),
        }
    }

    pub fn root_buffer(&self) -> Buffer {
        self.root.borrow().clone()
    }

    pub fn root_bytenr(&self) -> u64 {
        self.root.borrow().bytenr()
    }

    pub fn set_root(&self, buf: Buffer) {
        *self.root.borrow_mut() = buf;
    }

    pub fn ref_cows(&self) -> bool {
        self.ref_cows
    }

    /// The tree's root as of the last commit (§3, I7): stable to read without racing a
    /// writer, since a writer only ever replaces `root` via COW and never mutates a
    /// block already superseded here.
    pub fn commit_root(&self) -> Buffer {
        self.commit_root.borrow().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Called once the tree's `ROOT_ITEM` has been persisted for the generation that
    /// made it dirty.
    pub fn clear_dirty(&self) {
        self.dirty.set(false);
    }

    /// Called by the transaction manager at `start_transaction` — blocks whose header
    /// generation is older than `trans_id` are COW'd on next write; blocks already
    /// stamped with `trans_id` are this transaction's own and may be edited in place.
    /// The first join of a new transaction also snapshots `commit_root` and tags the
    /// tree dirty, mirroring `btrfs_start_transaction`'s `root->last_trans` check.
    pub fn set_transaction(&self, trans_id: u64) {
        if self.ref_cows && self.last_trans.get() < trans_id {
            *self.commit_root.borrow_mut() = self.root_buffer();
            self.dirty.set(true);
        }
        self.last_trans.set(trans_id);
        *self.trans_id.borrow_mut() = trans_id;
    }

    pub fn transaction_id(&self) -> u64 {
        *self.trans_id.borrow()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root.borrow().nritems() == 0 && self.root.borrow().is_leaf())
    }

    pub fn lookup(&self, key: Key) -> Result<Option<Vec<u8>>> {
        let (path, found) = search::search_slot(self, key)?;
        if !found {
            return Ok(None);
        }
        let leaf = path.leaf();
        let (off, size) = crate::codec::item_ptr(&leaf.data(), path.leaf_slot());
        Ok(Some(leaf.data()[off..off + size].to_vec()))
    }

    pub fn insert_item(&self, key: Key, data: &[u8]) -> Result<()> {
        insert::insert_item(self, key, data)
    }

    pub fn del_item(&self, key: Key) -> Result<()> {
        delete::del_item(self, key)
    }

    /// No in-place field update exists at the tree level — every mutation goes
    /// through COW, so "update" is a delete followed by a re-insert of the same key.
    pub fn update_item(&self, key: Key, data: &[u8]) -> Result<()> {
        self.del_item(key)?;
        self.insert_item(key, data)
    }
}

fn root_generation(buf: &Buffer) -> u64 {
    buf.generation()
}

/// Re-stamps each ancestor's stored key for its child with the child's current first
/// key, starting at `start_level`. Unconditional and idempotent — cheap insurance
/// against drift from whichever branch above actually touched slot 0, instead of
/// tracking that precisely.
pub(crate) fn fix_up_keys(path: &Path, start_level: usize) {
    for level in start_level..path.depth().saturating_sub(1) {
        let child = &path.nodes[level];
        if child.nritems() == 0 {
            continue;
        }
        let first_key = if level == 0 {
            crate::codec::item_key(&child.data(), 0)
        } else {
            crate::codec::key_ptr_key(&child.data(), 0)
        };
        let parent = &path.nodes[level + 1];
        let parent_slot = path.slots[level + 1];
        node::update_key(&mut parent.data_mut(), parent_slot, first_key);
    }
}
