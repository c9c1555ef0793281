//! Filesystem lifecycle (§4.G): `mkfs`, `open_ctree`, `close_ctree`. Ties the block
//! cache, extent allocator, root-tree registry and transaction manager into one handle
//! and (de)serializes the super block the way the teacher's `load_sb` does — a raw byte
//! buffer reinterpreted as `btrfs_super_block`, magic-then-checksum verified on read.
//!
//! The tree-of-roots holds a `ROOT_ITEM` for every tree except itself (its own root
//! bytenr lives in the super block's `root` field) — including the extent tree, which
//! is how `open_ctree` finds it before the allocator it depends on can be rebuilt.

use crate::btree::{BlockAllocator, Tree};
use crate::cache::{checksum_block, Cache};
use crate::codec::Key;
use crate::device::BlockDevice;
use crate::error::{BtrfsError, Result};
use crate::extent::{
    block_group_flags_from_bits, decode_block_group_item, encode_block_group_item,
    encode_extent_item, ExtentAllocator,
};
use crate::structures::{
    btrfs_extent_item, btrfs_root_item, btrfs_super_block, item_type, BtrfsBlockGroupFlags,
    BtrfsCsumType, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_MAGIC,
    BTRFS_ROOT_TREE_OBJECTID, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE,
};
use crate::transaction::TransactionManager;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Where the first metadata block group begins — leaves room below it for the super
/// block and its mirrors, same idea as real btrfs reserving the low addresses for the
/// first chunk.
const BOOTSTRAP_START: u64 = 1024 * 1024;

/// Additional super-block mirror offsets, mirroring real btrfs's well-known set; a
/// mirror is only written if the device is large enough to hold it (§4.G, "the super
/// must be bit-identical across mirrors after commit").
const SUPER_MIRROR_OFFSETS: [u64; 2] = [64 * 1024 * 1024, 256 * 1024 * 1024 * 1024];

pub struct Filesystem {
    pub device: Arc<dyn BlockDevice>,
    pub cache: Rc<Cache>,
    pub alloc: Rc<ExtentAllocator>,
    pub root_tree: Rc<Tree>,
    pub extent_tree: Rc<Tree>,
    fs_trees: RefCell<HashMap<u64, Rc<Tree>>>,
    pub trans: TransactionManager,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub fsid: [u8; 16],
}

impl Filesystem {
    /// Returns the already-open default subvolume, opening it from the tree-of-roots on
    /// first use.
    pub fn fs_tree(&self, objectid: u64) -> Result<Rc<Tree>> {
        if let Some(tree) = self.fs_trees.borrow().get(&objectid) {
            // Re-sync on every fetch, not just first open: a handle held across a
            // commit still has the transaction id it joined last, and a caller that
            // mutates through it again without rejoining would otherwise look like
            // it's still writing the transaction that already hit disk.
            tree.set_transaction(self.trans.generation());
            return Ok(tree.clone());
        }
        let item = self.read_root_item(objectid)?;
        let root_buf = self.cache.read(item.bytenr)?;
        let tree = Rc::new(Tree::new(
            objectid,
            Rc::clone(&self.cache),
            Rc::clone(&self.alloc) as Rc<dyn BlockAllocator>,
            root_buf,
            true,
        ));
        tree.set_transaction(self.trans.generation());
        self.fs_trees.borrow_mut().insert(objectid, tree.clone());
        Ok(tree)
    }

    fn read_root_item(&self, objectid: u64) -> Result<btrfs_root_item> {
        read_latest_root_item(&self.root_tree, objectid)
    }

    /// Inserts or overwrites the `ROOT_ITEM` for `objectid` at this generation, used by
    /// both `register_root` and commit's dirty-root rewrite (§4.F step 3) so a second
    /// rewrite within the same generation updates in place instead of colliding with
    /// the first.
    fn write_root_item(&self, objectid: u64, item: &btrfs_root_item) -> Result<()> {
        let key = Key::new(objectid, item_type::ROOT_ITEM, self.trans.generation());
        let bytes = encode_root_item(item);
        match self.root_tree.lookup(key)? {
            Some(_) => self.root_tree.update_item(key, &bytes),
            None => self.root_tree.insert_item(key, &bytes),
        }
    }

    /// Records a tree's root in the tree-of-roots so `fs_tree` can find it after a
    /// reopen — the step `snapshot()` itself leaves to the caller (it only produces the
    /// shared `Tree` handle, not its durable registration).
    pub fn register_root(&self, objectid: u64, root: &Tree) -> Result<()> {
        let generation = self.trans.generation();
        let item = new_root_item(root.root_bytenr(), generation, root.root_buffer().level());
        self.write_root_item(objectid, &item)?;
        self.fs_trees.borrow_mut().insert(
            objectid,
            Rc::new(Tree::new(
                objectid,
                Rc::clone(&self.cache),
                Rc::clone(&self.alloc) as Rc<dyn BlockAllocator>,
                root.root_buffer(),
                true,
            )),
        );
        Ok(())
    }

    /// Removes a tree's entry from the tree-of-roots once its blocks have all been
    /// dropped (§4.E) — callers still own freeing the blocks themselves via
    /// `drop_snapshot_step`.
    pub fn unregister_root(&self, objectid: u64) -> Result<()> {
        if let Some(key) = latest_root_item_key(&self.root_tree, objectid)? {
            self.root_tree.del_item(key)?;
        }
        self.fs_trees.borrow_mut().remove(&objectid);
        Ok(())
    }

    /// Rewrites the `ROOT_ITEM` of every tree tagged dirty since the last commit
    /// (§4.F step 3), plus the extent tree's own entry if its root moved — a separate,
    /// unconditional check since the extent tree is not `ref_cows` and so never gets
    /// dirty-tagged by `Tree::set_transaction` the way an `fs_tree` is. Returns whether
    /// anything was rewritten, so the caller's commit loop can keep draining until both
    /// this and `finish_pending` go quiet.
    fn persist_dirty_roots(&self) -> Result<bool> {
        let mut wrote = false;
        for (objectid, tree) in self.fs_trees.borrow().iter() {
            if !tree.is_dirty() {
                continue;
            }
            let item = new_root_item(
                tree.root_bytenr(),
                self.trans.generation(),
                tree.root_buffer().level(),
            );
            self.write_root_item(*objectid, &item)?;
            tree.clear_dirty();
            wrote = true;
        }

        let current = self.read_root_item(BTRFS_EXTENT_TREE_OBJECTID)?;
        if current.bytenr != self.extent_tree.root_bytenr() {
            let item = new_root_item(
                self.extent_tree.root_bytenr(),
                self.trans.generation(),
                self.extent_tree.root_buffer().level(),
            );
            self.write_root_item(BTRFS_EXTENT_TREE_OBJECTID, &item)?;
            wrote = true;
        }
        Ok(wrote)
    }

    /// Commits the running transaction and fsyncs; does not drop the handle — callers
    /// decide when to actually let go of the device.
    pub fn close_ctree(&self) -> Result<()> {
        let fsid = self.fsid;
        let nodesize = self.nodesize;
        let sectorsize = self.sectorsize;
        let total_bytes = self.device.len();
        // `root_tree`/`extent_tree` are held directly rather than re-fetched through a
        // syncing accessor like `fs_tree`, so `persist_dirty_roots` below needs them
        // joined to the current generation itself before it mutates either.
        let generation = self.trans.generation();
        self.root_tree.set_transaction(generation);
        self.extent_tree.set_transaction(generation);
        self.trans.commit_transaction(
            &self.cache,
            &self.alloc,
            self.device.as_ref(),
            || self.persist_dirty_roots(),
            |generation| {
                let sb = build_super_block(
                    fsid,
                    generation,
                    self.root_tree.root_bytenr(),
                    nodesize,
                    sectorsize,
                    total_bytes,
                );
                write_super(self.device.as_ref(), &sb)
            },
        )?;
        Ok(())
    }
}

/// The tree-of-roots keys every version of a tree's `ROOT_ITEM` by the generation that
/// wrote it (§4.F), so the live one is whichever sorts last for this objectid — the
/// item immediately before the first key of the next item type.
fn latest_root_item_key(root_tree: &Tree, objectid: u64) -> Result<Option<Key>> {
    let upper = Key::new(objectid, item_type::ROOT_ITEM + 1, 0);
    match crate::btree::iter::previous_item(root_tree, upper)? {
        Some((key, _)) if key.objectid == objectid && key.item_type == item_type::ROOT_ITEM => {
            Ok(Some(key))
        }
        _ => Ok(None),
    }
}

fn read_latest_root_item(root_tree: &Tree, objectid: u64) -> Result<btrfs_root_item> {
    let upper = Key::new(objectid, item_type::ROOT_ITEM + 1, 0);
    let (key, bytes) = crate::btree::iter::previous_item(root_tree, upper)?.ok_or(BtrfsError::NotFound)?;
    if key.objectid != objectid || key.item_type != item_type::ROOT_ITEM {
        return Err(BtrfsError::NotFound);
    }
    Ok(decode_root_item(&bytes))
}

/// Initializes a fresh filesystem on `device` and returns it open for writing.
///
/// The extent tree cannot record its own bootstrap blocks through the ordinary
/// `alloc_tree_block` path — that path defers its bookkeeping to `finish_pending`,
/// which needs the extent tree to already exist. So the first two blocks (the extent
/// tree's root and the tree-of-roots' root) are hand-placed at fixed offsets below the
/// first block group, stamped with the bootstrap transaction's id (so `cow_block`'s
/// in-place branch applies to them immediately), and their `EXTENT_ITEM` bookkeeping is
/// inserted directly. Every allocation after that goes through the normal allocator.
pub fn mkfs(device: Arc<dyn BlockDevice>, nodesize: u32, sectorsize: u32) -> Result<Filesystem> {
    let total_bytes = device.len();
    if total_bytes < BOOTSTRAP_START + nodesize as u64 * 4 {
        return Err(BtrfsError::invalid("device too small"));
    }

    let extent_root_bytenr = BOOTSTRAP_START;
    let root_tree_bytenr = BOOTSTRAP_START + nodesize as u64;
    let group_start = BOOTSTRAP_START + nodesize as u64 * 2;
    let group_len = total_bytes - group_start;

    let cache = Rc::new(Cache::new(Arc::clone(&device), nodesize));
    let alloc = ExtentAllocator::new(nodesize);
    alloc.add_block_group(group_start, group_len, BtrfsBlockGroupFlags::METADATA);

    let extent_root_buf = new_leaf(&cache, extent_root_bytenr, BTRFS_EXTENT_TREE_OBJECTID, 1);
    let extent_tree = Rc::new(Tree::new(
        BTRFS_EXTENT_TREE_OBJECTID,
        Rc::clone(&cache),
        Rc::clone(&alloc) as Rc<dyn BlockAllocator>,
        extent_root_buf,
        false,
    ));
    extent_tree.set_transaction(1);
    alloc.attach_tree(Rc::clone(&extent_tree));

    for (bytenr, _owner) in [
        (extent_root_bytenr, BTRFS_EXTENT_TREE_OBJECTID),
        (root_tree_bytenr, BTRFS_ROOT_TREE_OBJECTID),
    ] {
        let key = Key::new(bytenr, item_type::EXTENT_ITEM, nodesize as u64);
        let item = btrfs_extent_item {
            refs: 1,
            generation: 1,
            flags: 0,
        };
        extent_tree.insert_item(key, &encode_extent_item(&item))?;
    }
    let bg_key = Key::new(group_start, item_type::BLOCK_GROUP_ITEM, group_len);
    let bg_item = crate::structures::btrfs_block_group_item {
        used: 0,
        flags: BtrfsBlockGroupFlags::METADATA as u64,
    };
    extent_tree.insert_item(bg_key, &encode_block_group_item(&bg_item))?;

    let root_tree_buf = new_leaf(&cache, root_tree_bytenr, BTRFS_ROOT_TREE_OBJECTID, 1);
    let root_tree = Rc::new(Tree::new(
        BTRFS_ROOT_TREE_OBJECTID,
        Rc::clone(&cache),
        Rc::clone(&alloc) as Rc<dyn BlockAllocator>,
        root_tree_buf,
        false,
    ));
    root_tree.set_transaction(1);

    root_tree.insert_item(
        Key::new(BTRFS_EXTENT_TREE_OBJECTID, item_type::ROOT_ITEM, 1),
        &encode_root_item(&new_root_item(extent_root_bytenr, 1, 0)),
    )?;

    // Now that the extent tree is fully functional, allocate the default subvolume
    // through the ordinary path.
    let fs_root_bytenr = alloc.alloc_tree_block(BTRFS_FS_TREE_OBJECTID)?;
    while alloc.finish_pending()? {}
    new_leaf(&cache, fs_root_bytenr, BTRFS_FS_TREE_OBJECTID, 1);

    root_tree.insert_item(
        Key::new(BTRFS_FS_TREE_OBJECTID, item_type::ROOT_ITEM, 1),
        &encode_root_item(&new_root_item(fs_root_bytenr, 1, 0)),
    )?;

    while alloc.finish_pending()? {}

    let trans = TransactionManager::new(1);
    let fsid = [0_u8; 16];
    let fs = Filesystem {
        device,
        cache,
        alloc,
        root_tree,
        extent_tree,
        fs_trees: RefCell::new(HashMap::new()),
        trans,
        nodesize,
        sectorsize,
        fsid,
    };
    fs.close_ctree()?;
    Ok(fs)
}

/// Opens an existing filesystem, verifying the super block and rebuilding the extent
/// allocator's free-space index from the on-disk `BLOCK_GROUP_ITEM`/`EXTENT_ITEM`
/// entries (§4.D.2's lazy per-group population, done eagerly here since there is only
/// ever one block group in this engine).
pub fn open_ctree(device: Arc<dyn BlockDevice>) -> Result<Filesystem> {
    let sb = read_super(device.as_ref())?;
    let nodesize = sb.nodesize;
    // every block on disk carries the generation of the transaction that last wrote
    // it; the first transaction this session runs must be strictly greater, or
    // `cow_block` would treat an already-committed block as "written this
    // transaction" and mutate it in place instead of copying it.
    let next_generation = sb.generation + 1;
    let cache = Rc::new(Cache::new(Arc::clone(&device), nodesize));
    let alloc = ExtentAllocator::new(nodesize);

    let root_tree_buf = cache.read(sb.root)?;
    let root_tree = Rc::new(Tree::new(
        BTRFS_ROOT_TREE_OBJECTID,
        Rc::clone(&cache),
        Rc::clone(&alloc) as Rc<dyn BlockAllocator>,
        root_tree_buf,
        false,
    ));
    root_tree.set_transaction(next_generation);

    let extent_item = read_latest_root_item(&root_tree, BTRFS_EXTENT_TREE_OBJECTID)?;
    let extent_root_buf = cache.read(extent_item.bytenr)?;
    let extent_tree = Rc::new(Tree::new(
        BTRFS_EXTENT_TREE_OBJECTID,
        Rc::clone(&cache),
        Rc::clone(&alloc) as Rc<dyn BlockAllocator>,
        extent_root_buf,
        false,
    ));
    extent_tree.set_transaction(next_generation);
    alloc.attach_tree(Rc::clone(&extent_tree));

    rebuild_free_space_index(&extent_tree, &alloc)?;

    let trans = TransactionManager::new(next_generation);
    Ok(Filesystem {
        device,
        cache,
        alloc,
        root_tree,
        extent_tree,
        fs_trees: RefCell::new(HashMap::new()),
        trans,
        nodesize: sb.nodesize,
        sectorsize: sb.sectorsize,
        fsid: sb.fsid,
    })
}

/// A single ascending pass over the whole extent tree, in key order (not grouped by
/// type — `BLOCK_GROUP_ITEM`/`EXTENT_ITEM` entries interleave by bytenr). Relies on a
/// block group's own `BLOCK_GROUP_ITEM` key (objectid = its start) always sorting
/// before any `EXTENT_ITEM` carved out of it, so `add_block_group` always runs before
/// the `mark_used` calls that land inside it.
fn rebuild_free_space_index(extent_tree: &Tree, alloc: &ExtentAllocator) -> Result<()> {
    let mut next = Some(Key::new(0, item_type::MIN, 0));
    while let Some(key) = next {
        let found_item = crate::btree::iter::seek(extent_tree, key)?;
        let (found, data) = match found_item {
            Some(pair) => pair,
            None => break,
        };
        match found.item_type {
            item_type::BLOCK_GROUP_ITEM => {
                let item = decode_block_group_item(&data);
                alloc.add_block_group(
                    found.objectid,
                    found.offset,
                    block_group_flags_from_bits(item.flags),
                );
            }
            item_type::EXTENT_ITEM => {
                let _ = data;
                alloc.mark_used(found.objectid, found.offset);
            }
            _ => {}
        }
        next = crate::btree::iter::successor(found);
    }
    Ok(())
}

fn new_leaf(cache: &Cache, bytenr: u64, owner: u64, generation: u64) -> crate::cache::Buffer {
    let buf = cache.create_empty();
    buf.header().set_bytenr(bytenr);
    buf.header().set_owner(owner);
    buf.header().set_generation(generation);
    buf.header().set_level(0);
    buf.header().set_nritems(0);
    cache.insert(buf.clone());
    buf
}

fn new_root_item(bytenr: u64, generation: u64, level: u8) -> btrfs_root_item {
    // `btrfs_root_item` is a plain, pointer-free `repr(C, packed)` struct; the
    // all-zeros bit pattern is a valid value for every field in it.
    let mut item: btrfs_root_item = unsafe { std::mem::zeroed() };
    item.generation = generation;
    item.generation_v2 = generation;
    item.bytenr = bytenr;
    item.refs = 1;
    item.level = level;
    item
}

/// Generalizes the super block's union-transmute pattern to any plain `repr(C, packed)`
/// struct: `read_unaligned` is sound regardless of the source buffer's alignment, which
/// a `Vec<u8>`-backed byte slice does not otherwise guarantee.
fn encode_root_item(item: &btrfs_root_item) -> Vec<u8> {
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (item as *const btrfs_root_item) as *const u8,
            std::mem::size_of::<btrfs_root_item>(),
        )
    };
    bytes.to_vec()
}

fn decode_root_item(buf: &[u8]) -> btrfs_root_item {
    assert_eq!(buf.len(), std::mem::size_of::<btrfs_root_item>());
    unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const btrfs_root_item) }
}

fn build_super_block(
    fsid: [u8; 16],
    generation: u64,
    root: u64,
    nodesize: u32,
    sectorsize: u32,
    total_bytes: u64,
) -> btrfs_super_block {
    let mut sb: btrfs_super_block = unsafe { std::mem::zeroed() };
    sb.fsid = fsid;
    sb.magic = BTRFS_MAGIC;
    sb.generation = generation;
    sb.root = root;
    sb.total_bytes = total_bytes;
    sb.sectorsize = sectorsize;
    sb.nodesize = nodesize;
    sb.stripesize = sectorsize;
    sb.csum_type = BtrfsCsumType::CRC32;
    sb
}

/// Grounded on `wtfrank-dump_btrfs/src/btrfs.rs::load_sb`'s union-based transmute,
/// checksum-then-magic verification.
fn read_super(device: &dyn BlockDevice) -> Result<btrfs_super_block> {
    union SbBuf {
        buf: [u8; BTRFS_SUPER_INFO_SIZE],
        block: btrfs_super_block,
    }
    let mut sb = SbBuf {
        buf: [0_u8; BTRFS_SUPER_INFO_SIZE],
    };
    unsafe {
        device.read_at(BTRFS_SUPER_INFO_OFFSET as u64, &mut sb.buf)?;
        if sb.block.magic != BTRFS_MAGIC {
            return Err(BtrfsError::invalid("invalid magic in super block"));
        }
        let want = checksum_block(&sb.buf);
        if sb.block.csum != want {
            return Err(BtrfsError::bad_block(
                BTRFS_SUPER_INFO_OFFSET as u64,
                "super block checksum mismatch",
            ));
        }
        Ok(sb.block)
    }
}

fn write_super(device: &dyn BlockDevice, sb: &btrfs_super_block) -> Result<()> {
    union SbBuf {
        block: btrfs_super_block,
        buf: [u8; BTRFS_SUPER_INFO_SIZE],
    }
    let mut u = SbBuf { block: *sb };
    unsafe {
        let csum = checksum_block(&u.buf);
        u.block.csum = csum;
        device.write_at(BTRFS_SUPER_INFO_OFFSET as u64, &u.buf)?;
        for &mirror in &SUPER_MIRROR_OFFSETS {
            if mirror + BTRFS_SUPER_INFO_SIZE as u64 <= device.len() {
                device.write_at(mirror, &u.buf)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn fresh_device() -> Arc<dyn BlockDevice> {
        Arc::new(MemDevice::new(64 * 1024 * 1024))
    }

    #[test]
    fn mkfs_then_open_round_trips_the_default_subvolume() {
        let device = fresh_device();
        {
            let fs = mkfs(Arc::clone(&device), 4096, 4096).unwrap();
            let root = fs.fs_tree(BTRFS_FS_TREE_OBJECTID).unwrap();
            root.insert_item(Key::new(1, item_type::INODE_ITEM, 0), b"hello")
                .unwrap();
            fs.close_ctree().unwrap();
        }

        let fs = open_ctree(device).unwrap();
        let root = fs.fs_tree(BTRFS_FS_TREE_OBJECTID).unwrap();
        let got = root.lookup(Key::new(1, item_type::INODE_ITEM, 0)).unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn open_ctree_rejects_a_blank_device() {
        let device = fresh_device();
        assert!(open_ctree(device).is_err());
    }
}
