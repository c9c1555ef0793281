//! Read-only root-to-leaf descent (§4.C.2). Used by lookups and by the write path's
//! first pass when only the resulting slot is needed; the write path's COW-aware
//! descent lives in `cow.rs` since it has to mutate as it goes.

use super::{leaf, node, Path, Tree, MAX_LEVEL};
use crate::cache::Buffer;
use crate::codec::Key;
use crate::error::{BtrfsError, Result};

pub fn search_slot(tree: &Tree, key: Key) -> Result<(Path, bool)> {
    let mut path = Path::default();
    let mut buf = tree.root_buffer();

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

        let (slot, child_bytenr) = {
            let data = buf.data();
            if node::nritems(&data) == 0 {
                return Err(BtrfsError::invalid("internal node with zero items"));
            }
            let slot = node::find_slot(&data, key);
            let (bytenr, _generation) = node::child_ptr(&data, slot);
            (slot, bytenr)
        };
        path.nodes.insert(0, buf.clone());
        path.slots.insert(0, slot);
        buf = tree.cache.read(child_bytenr)?;
    }
}

/// Lowest-level leaf immediately to the right of `path`'s leaf, or `None` if the leaf
/// is rightmost. Walks up until a node has a next sibling slot, then back down the
/// leftmost children — the standard B+-tree "next leaf" traversal (§4.C.6).
pub fn next_leaf(tree: &Tree, path: &Path) -> Result<Option<Buffer>> {
    let mut level = 1;
    while level < path.depth() {
        let parent = &path.nodes[level];
        let slot = path.slots[level];
        let n = node::nritems(&parent.data());
        if slot + 1 < n {
            let (mut bytenr, _) = node::child_ptr(&parent.data(), slot + 1);
            let mut buf = tree.cache.read(bytenr)?;
            for _ in 0..level - 1 {
                let data = buf.data();
                let (bp, _) = node::child_ptr(&data, 0);
                bytenr = bp;
                drop(data);
                buf = tree.cache.read(bytenr)?;
            }
            return Ok(Some(buf));
        }
        level += 1;
    }
    Ok(None)
}

/// Mirror of `next_leaf`: the leaf immediately to the left of `path`'s leaf.
pub fn previous_leaf(tree: &Tree, path: &Path) -> Result<Option<Buffer>> {
    let mut level = 1;
    while level < path.depth() {
        let parent = &path.nodes[level];
        let slot = path.slots[level];
        if slot > 0 {
            let (mut bytenr, _) = node::child_ptr(&parent.data(), slot - 1);
            let mut buf = tree.cache.read(bytenr)?;
            for _ in 0..level - 1 {
                let data = buf.data();
                let n = node::nritems(&data);
                let (bp, _) = node::child_ptr(&data, n - 1);
                bytenr = bp;
                drop(data);
                buf = tree.cache.read(bytenr)?;
            }
            return Ok(Some(buf));
        }
        level += 1;
    }
    Ok(None)
}
