//! Item insertion, including the leaf/node split path (§4.C.3). Split policy (§9 Q1):
//! an insertion at the tail of a leaf (a pure append) moves nothing — the new item
//! goes alone into a fresh right leaf; any other insertion falls back to an even
//! 50/50 split by item count. Sequential writers (the common case for a growing file
//! or directory) never pay for rebalancing; random insertions still get a tree that
//! stays reasonably balanced.

use super::{cow, node, leaf, Path, Tree};
use crate::codec::{self, Key};
use crate::error::{BtrfsError, Result};

pub fn insert_item(tree: &Tree, key: Key, data: &[u8]) -> Result<()> {
    let (path, found) = cow::search_slot_cow(tree, key)?;
    if found {
        return Err(BtrfsError::KeyExists);
    }

    let leaf_buf = path.leaf().clone();
    let slot = path.leaf_slot();
    let needed = leaf::space_needed(data.len());

    if needed > leaf_buf.data().len() - codec::HEADER_LEN {
        return Err(BtrfsError::invalid("item too large for a leaf"));
    }

    if leaf::free_space(&leaf_buf.data()) >= needed {
        leaf::insert_at(&mut leaf_buf.data_mut(), slot, key, data);
    } else {
        split_leaf_and_insert(tree, &path, slot, key, data)?;
    }

    super::fix_up_keys(&path, 0);
    Ok(())
}

fn split_leaf_and_insert(tree: &Tree, path: &Path, slot: u32, key: Key, data: &[u8]) -> Result<()> {
    let old_leaf = path.leaf().clone();
    let n = leaf::nritems(&old_leaf.data());

    let new_bytenr = tree.alloc.alloc_tree_block(tree.owner)?;
    let new_leaf = tree.cache.create_empty();
    new_leaf.header().set_bytenr(new_bytenr);
    new_leaf.header().set_generation(tree.transaction_id());
    new_leaf.header().set_owner(tree.owner);
    new_leaf.header().set_level(0);

    if slot == n {
        leaf::insert_at(&mut new_leaf.data_mut(), 0, key, data);
    } else {
        let mid = n / 2;
        {
            let src = old_leaf.data();
            let mut dst = new_leaf.data_mut();
            leaf::copy_range(&mut dst, &src, mid, n);
        }
        {
            let mut old = old_leaf.data_mut();
            for s in (mid..n).rev() {
                leaf::remove_at(&mut old, s);
            }
        }
        if slot < mid {
            leaf::insert_at(&mut old_leaf.data_mut(), slot, key, data);
        } else {
            leaf::insert_at(&mut new_leaf.data_mut(), slot - mid, key, data);
        }
    }
    tree.cache.insert(new_leaf.clone());

    let new_first_key = codec::item_key(&new_leaf.data(), 0);
    insert_ptr_into_parent(
        tree,
        path,
        1,
        new_first_key,
        new_bytenr,
        tree.transaction_id(),
    )
}

fn insert_ptr_into_parent(
    tree: &Tree,
    path: &Path,
    level: usize,
    key: Key,
    bytenr: u64,
    generation: u64,
) -> Result<()> {
    if level >= path.depth() {
        return grow_root(tree, path, key, bytenr, generation);
    }

    let parent = path.nodes[level].clone();
    let parent_slot = path.slots[level] + 1;
    let max = node::max_ptrs(parent.data().len());

    if node::nritems(&parent.data()) < max {
        let mut data = parent.data_mut();
        node::insert_at(&mut data, parent_slot, key, bytenr, generation);
        Ok(())
    } else {
        split_node_and_insert(tree, path, level, parent_slot, key, bytenr, generation)
    }
}

fn split_node_and_insert(
    tree: &Tree,
    path: &Path,
    level: usize,
    parent_slot: u32,
    key: Key,
    bytenr: u64,
    generation: u64,
) -> Result<()> {
    let old_node = path.nodes[level].clone();
    let n = node::nritems(&old_node.data());
    let node_level = old_node.level();

    let new_bytenr = tree.alloc.alloc_tree_block(tree.owner)?;
    let new_node = tree.cache.create_empty();
    new_node.header().set_bytenr(new_bytenr);
    new_node.header().set_generation(tree.transaction_id());
    new_node.header().set_owner(tree.owner);
    new_node.header().set_level(node_level);

    if parent_slot == n {
        node::insert_at(&mut new_node.data_mut(), 0, key, bytenr, generation);
    } else {
        let mid = n / 2;
        {
            let src = old_node.data();
            let mut dst = new_node.data_mut();
            node::copy_range(&mut dst, &src, mid, n);
        }
        {
            let mut old = old_node.data_mut();
            for s in (mid..n).rev() {
                node::remove_at(&mut old, s);
            }
        }
        if parent_slot < mid {
            node::insert_at(&mut old_node.data_mut(), parent_slot, key, bytenr, generation);
        } else {
            node::insert_at(&mut new_node.data_mut(), parent_slot - mid, key, bytenr, generation);
        }
    }
    tree.cache.insert(new_node.clone());

    let new_first_key = codec::key_ptr_key(&new_node.data(), 0);
    insert_ptr_into_parent(
        tree,
        path,
        level + 1,
        new_first_key,
        new_bytenr,
        tree.transaction_id(),
    )
}

/// The root split: a brand-new two-child root one level taller than the old root.
fn grow_root(tree: &Tree, path: &Path, key: Key, bytenr: u64, generation: u64) -> Result<()> {
    let old_root = path.nodes[path.depth() - 1].clone();
    let old_root_level = old_root.level();
    let old_first_key = if old_root.is_leaf() {
        codec::item_key(&old_root.data(), 0)
    } else {
        codec::key_ptr_key(&old_root.data(), 0)
    };

    let new_root_bytenr = tree.alloc.alloc_tree_block(tree.owner)?;
    let new_root = tree.cache.create_empty();
    new_root.header().set_bytenr(new_root_bytenr);
    new_root.header().set_generation(tree.transaction_id());
    new_root.header().set_owner(tree.owner);
    new_root.header().set_level(old_root_level + 1);

    {
        let mut data = new_root.data_mut();
        node::insert_at(
            &mut data,
            0,
            old_first_key,
            old_root.bytenr(),
            old_root.generation(),
        );
        node::insert_at(&mut data, 1, key, bytenr, generation);
    }
    tree.cache.insert(new_root.clone());
    tree.set_root(new_root);
    Ok(())
}

