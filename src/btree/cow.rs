//! The copy-on-write rule at the heart of the tree (§4.C.5): a block stamped with the
//! running transaction's id is already this transaction's own and may be mutated in
//! place; anything older is copied first, and the copy replaces it in the parent (or
//! becomes the new root). The old block is *not* evicted — it stays valid as part of
//! the previous commit root until the transaction that superseded it actually commits,
//! which is what lets a crash before commit recover into the old, still-intact tree.

use super::{leaf, node, Path, Tree, MAX_LEVEL};
use crate::cache::Buffer;
use crate::codec::Key;
use crate::error::{BtrfsError, Result};

pub fn cow_block(tree: &Tree, buf: &Buffer, parent: Option<(&Buffer, u32)>) -> Result<Buffer> {
    if buf.generation() == tree.transaction_id() {
        return Ok(buf.clone());
    }

    // Only a block actually shared with another root needs its children's references
    // split; an unshared COW just carries the block's single reference over to
    // `new_buf`; `free_tree_block` below already accounts for that.
    let shared =
        tree.ref_cows() && !buf.is_leaf() && tree.alloc.tree_block_refs(buf.bytenr())? > 1;

    let new_bytenr = tree.alloc.alloc_tree_block(tree.owner)?;
    let new_buf = tree.cache.create_empty();
    new_buf.data_mut().copy_from_slice(&buf.data());
    new_buf.header().set_bytenr(new_bytenr);
    new_buf.header().set_generation(tree.transaction_id());
    tree.cache.insert(new_buf.clone());

    if shared {
        let data = buf.data();
        for slot in 0..node::nritems(&data) {
            let (child_bytenr, _generation) = node::child_ptr(&data, slot);
            tree.alloc.inc_tree_block_ref(child_bytenr, tree.owner)?;
        }
    }

    tree.alloc
        .free_tree_block(buf.bytenr(), tree.owner, buf.generation())?;

    match parent {
        Some((parent_buf, slot)) => {
            let mut data = parent_buf.data_mut();
            node::update_ptr(&mut data, slot, new_bytenr, tree.transaction_id());
        }
        None => tree.set_root(new_buf.clone()),
    }
    Ok(new_buf)
}

/// Write-aware descent: every buffer returned in `path` has already been COW'd for
/// this transaction, so the caller may mutate any of them in place.
pub fn search_slot_cow(tree: &Tree, key: Key) -> Result<(Path, bool)> {
    let mut path = Path::default();
    let root = tree.root_buffer();
    let mut buf = cow_block(tree, &root, None)?;

    loop {
        if buf.is_leaf() {
            let (slot, found) = match leaf::find_slot(&buf.data(), key) {
                Ok(s) => (s, true),
                Err(s) => (s, false),
            };
            path.nodes.insert(0, buf.clone());
            path.slots.insert(0, slot);
            return Ok((path, found));
        }

        if path.nodes.len() >= MAX_LEVEL {
            return Err(BtrfsError::invalid("tree exceeds MAX_LEVEL"));
        }

        let slot = {
            let data = buf.data();
            if node::nritems(&data) == 0 {
                return Err(BtrfsError::invalid("internal node with zero items"));
            }
            node::find_slot(&data, key)
        };
        let child_bytenr = node::child_ptr(&buf.data(), slot).0;
        let child = tree.cache.read(child_bytenr)?;
        let parent = buf.clone();
        path.nodes.insert(0, buf.clone());
        path.slots.insert(0, slot);
        buf = cow_block(tree, &child, Some((&parent, slot)))?;
    }
}
