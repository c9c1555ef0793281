//! Item deletion, node collapse, and root shrink (§4.C.4). An emptied leaf or internal
//! node is unlinked from its parent and freed rather than left in the tree; an emptied
//! parent cascades the same collapse upward. A root that ends up with a single child
//! is replaced by that child, shrinking the tree's height. A leaf that survives the
//! removal but falls under a third full is rebalanced against one sibling: topped back
//! up by stealing items across the shared parent slot, or folded entirely into the
//! sibling and freed if the two now fit in one block.

use super::{cow, leaf, node, Path, Tree};
use crate::cache::Buffer;
use crate::codec::{item_key, item_ptr, Key, HEADER_LEN};
use crate::error::{BtrfsError, Result};

pub fn del_item(tree: &Tree, key: Key) -> Result<()> {
    let (path, found) = cow::search_slot_cow(tree, key)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }

    let leaf_buf = path.leaf().clone();
    let slot = path.leaf_slot();
    leaf::remove_at(&mut leaf_buf.data_mut(), slot);

    if leaf::nritems(&leaf_buf.data()) == 0 && path.depth() > 1 {
        collapse_empty_node(tree, &path, 0)?;
    } else {
        super::fix_up_keys(&path, 0);
        if path.depth() > 1 && below_one_third(&leaf_buf) {
            rebalance_leaf(tree, &path)?;
        }
    }
    shrink_root(tree)?;
    Ok(())
}

/// Unlinks the now-empty node at `level` from its parent and frees it, cascading to
/// the parent if that empties it too.
fn collapse_empty_node(tree: &Tree, path: &Path, level: usize) -> Result<()> {
    let node_buf = path.nodes[level].clone();
    let parent = path.nodes[level + 1].clone();
    let parent_slot = path.slots[level + 1];

    tree.alloc
        .free_tree_block(node_buf.bytenr(), tree.owner, node_buf.generation())?;
    node::remove_at(&mut parent.data_mut(), parent_slot);

    let parent_is_root = level + 2 >= path.depth();
    if node::nritems(&parent.data()) == 0 && !parent_is_root {
        collapse_empty_node(tree, path, level + 1)?;
    } else if node::nritems(&parent.data()) > 0 {
        super::fix_up_keys(path, level + 1);
    }
    Ok(())
}

/// Replaces the root with its only child, repeatedly, if collapsing left the root an
/// internal node with a single entry.
fn shrink_root(tree: &Tree) -> Result<()> {
    loop {
        let root = tree.root_buffer();
        if root.is_leaf() || node::nritems(&root.data()) != 1 {
            return Ok(());
        }
        let (child_bytenr, _generation) = node::child_ptr(&root.data(), 0);
        let child = tree.cache.read(child_bytenr)?;
        tree.alloc
            .free_tree_block(root.bytenr(), tree.owner, root.generation())?;
        tree.set_root(child);
    }
}

fn leaf_capacity(buf: &Buffer) -> usize {
    buf.data().len() - HEADER_LEN
}

fn below_one_third(buf: &Buffer) -> bool {
    leaf::total_used_bytes(&buf.data()) * 3 < leaf_capacity(buf)
}

/// Whether `a`'s and `b`'s items together still fit in one leaf of `a`'s size.
fn fits_together(a: &Buffer, b: &Buffer) -> bool {
    leaf::total_used_bytes(&a.data()) + leaf::total_used_bytes(&b.data()) <= leaf_capacity(a)
}

/// Brings `dst` back up to a third full by moving items off `left`'s tail (the
/// sibling's highest keys), stopping short of pushing `left` itself under a third.
fn steal_from_left(left: &Buffer, dst: &Buffer) {
    while below_one_third(dst) {
        let n = leaf::nritems(&left.data());
        if n <= 1 {
            break;
        }
        let moved_size = {
            let data = left.data();
            let (_, size) = item_ptr(&data, n - 1);
            leaf::space_needed(size)
        };
        let left_after = leaf::total_used_bytes(&left.data()).saturating_sub(moved_size);
        if left_after * 3 < leaf_capacity(left) {
            break;
        }
        let (key, data) = {
            let src = left.data();
            let (off, size) = item_ptr(&src, n - 1);
            (item_key(&src, n - 1), src[off..off + size].to_vec())
        };
        leaf::remove_at(&mut left.data_mut(), n - 1);
        leaf::insert_at(&mut dst.data_mut(), 0, key, &data);
    }
}

/// Mirror of `steal_from_left`: tops `dst` up from `right`'s head. Returns whether
/// anything actually moved, since a move changes `right`'s first key and the caller
/// must re-stamp the parent's entry for it.
fn steal_from_right(dst: &Buffer, right: &Buffer) -> bool {
    let mut moved = false;
    while below_one_third(dst) {
        let n = leaf::nritems(&right.data());
        if n <= 1 {
            break;
        }
        let moved_size = {
            let data = right.data();
            let (_, size) = item_ptr(&data, 0);
            leaf::space_needed(size)
        };
        let right_after = leaf::total_used_bytes(&right.data()).saturating_sub(moved_size);
        if right_after * 3 < leaf_capacity(right) {
            break;
        }
        let (key, data) = {
            let src = right.data();
            let (off, size) = item_ptr(&src, 0);
            (item_key(&src, 0), src[off..off + size].to_vec())
        };
        leaf::remove_at(&mut right.data_mut(), 0);
        let slot = leaf::nritems(&dst.data());
        leaf::insert_at(&mut dst.data_mut(), slot, key, &data);
        moved = true;
    }
    moved
}

/// Folds the leaf at `path`'s items onto the end of `left` and frees the now-empty
/// leaf, cascading the parent-pointer removal upward.
fn merge_into_left(tree: &Tree, path: &Path, left: &Buffer) -> Result<()> {
    let leaf_buf = path.leaf().clone();
    let n = leaf::nritems(&leaf_buf.data());
    for slot in 0..n {
        let (key, data) = {
            let src = leaf_buf.data();
            let (off, size) = item_ptr(&src, slot);
            (item_key(&src, slot), src[off..off + size].to_vec())
        };
        let dst_slot = leaf::nritems(&left.data());
        leaf::insert_at(&mut left.data_mut(), dst_slot, key, &data);
    }
    collapse_empty_node(tree, path, 0)
}

/// Mirror of `merge_into_left`: prepends the leaf's items onto `right` (in order,
/// since every key here sorts below `right`'s own), then frees the leaf.
fn merge_into_right(
    tree: &Tree,
    path: &Path,
    parent: &Buffer,
    right_slot: u32,
    right: &Buffer,
) -> Result<()> {
    let leaf_buf = path.leaf().clone();
    let n = leaf::nritems(&leaf_buf.data());
    for slot in 0..n {
        let (key, data) = {
            let src = leaf_buf.data();
            let (off, size) = item_ptr(&src, slot);
            (item_key(&src, slot), src[off..off + size].to_vec())
        };
        leaf::insert_at(&mut right.data_mut(), slot, key, &data);
    }
    let new_first_key = item_key(&right.data(), 0);
    node::update_key(&mut parent.data_mut(), right_slot, new_first_key);
    collapse_empty_node(tree, path, 0)
}

/// Rebalances the leaf at `path` against whichever sibling shares its parent: steals
/// from the left sibling first, falling back to the right, merging outright into
/// whichever side has room for both (§4.C.4). Only ever touches one sibling at a
/// time; a three-way left+self+right merge is not attempted.
fn rebalance_leaf(tree: &Tree, path: &Path) -> Result<()> {
    let leaf_buf = path.leaf().clone();
    let parent = path.nodes[1].clone();
    let parent_slot = path.slots[1];

    if parent_slot > 0 {
        let left_slot = parent_slot - 1;
        let (sib_bytenr, _generation) = node::child_ptr(&parent.data(), left_slot);
        let sib = tree.cache.read(sib_bytenr)?;
        let left = cow::cow_block(tree, &sib, Some((&parent, left_slot)))?;

        if fits_together(&left, &leaf_buf) {
            return merge_into_left(tree, path, &left);
        }
        steal_from_left(&left, &leaf_buf);
        if !below_one_third(&leaf_buf) {
            super::fix_up_keys(path, 0);
            return Ok(());
        }
    }

    let n = node::nritems(&parent.data());
    if parent_slot + 1 < n {
        let right_slot = parent_slot + 1;
        let (sib_bytenr, _generation) = node::child_ptr(&parent.data(), right_slot);
        let sib = tree.cache.read(sib_bytenr)?;
        let right = cow::cow_block(tree, &sib, Some((&parent, right_slot)))?;

        if fits_together(&leaf_buf, &right) {
            return merge_into_right(tree, path, &parent, right_slot, &right);
        }
        if steal_from_right(&leaf_buf, &right) {
            let new_right_key = item_key(&right.data(), 0);
            node::update_key(&mut parent.data_mut(), right_slot, new_right_key);
        }
    }

    super::fix_up_keys(path, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    // exercised end-to-end via tests/btree.rs, which builds a real Tree with a
    // MemDevice-backed allocator; a fake allocator here would just re-implement that.
    use super::*;

    #[test]
    fn below_one_third_matches_total_used_bytes() {
        // a brand-new empty leaf has nothing used, so it always counts as below a
        // third; guards the arithmetic in `below_one_third` against an inverted
        // comparison.
        let device = std::sync::Arc::new(crate::device::MemDevice::new(4096 * 2));
        let cache = crate::cache::Cache::new(device, 4096);
        let buf = cache.create_empty();
        buf.header().set_level(0);
        assert!(below_one_third(&buf));
    }
}
