//! Forward/backward item iteration (§4.C.6). Built on top of a fresh `search_slot` per
//! hop rather than threaded `Path` state: a `Path` only proves a block was writable
//! under the transaction active when it was built, and goes stale the moment another
//! insert or delete COWs one of its ancestors, so key-based re-entry is what every
//! caller outside a single insert/delete actually wants.

use super::search;
use crate::codec::{item_data, item_key, Key};
use crate::error::Result;

/// Smallest key that sorts strictly after `key` in tuple order, or `None` if `key` is
/// already `Key::MAX`.
pub fn successor(key: Key) -> Option<Key> {
    if key.offset < u64::MAX {
        return Some(Key::new(key.objectid, key.item_type, key.offset + 1));
    }
    if key.item_type < u8::MAX {
        return Some(Key::new(key.objectid, key.item_type + 1, 0));
    }
    if key.objectid < u64::MAX {
        return Some(Key::new(key.objectid + 1, 0, 0));
    }
    None
}

/// Largest key that sorts strictly before `key`, or `None` if `key` is already
/// `Key::MIN`.
pub fn predecessor(key: Key) -> Option<Key> {
    if key.offset > 0 {
        return Some(Key::new(key.objectid, key.item_type, key.offset - 1));
    }
    if key.item_type > 0 {
        return Some(Key::new(key.objectid, key.item_type - 1, u64::MAX));
    }
    if key.objectid > 0 {
        return Some(Key::new(key.objectid - 1, u8::MAX, u64::MAX));
    }
    None
}

/// The first item at or after `key`, if any.
pub fn seek(tree: &super::Tree, key: Key) -> Result<Option<(Key, Vec<u8>)>> {
    let (path, found) = search::search_slot(tree, key)?;
    let leaf = path.leaf();
    let slot = if found {
        path.leaf_slot()
    } else if path.leaf_slot() < leaf.nritems() {
        path.leaf_slot()
    } else {
        return match search::next_leaf(tree, &path)? {
            Some(next) if next.nritems() > 0 => {
                Ok(Some((item_key(&next.data(), 0), item_data(&next.data(), 0).to_vec())))
            }
            _ => Ok(None),
        };
    };
    let data = leaf.data();
    Ok(Some((item_key(&data, slot), item_data(&data, slot).to_vec())))
}

/// The item immediately after `key` in tree order (not necessarily present itself).
pub fn next_item(tree: &super::Tree, key: Key) -> Result<Option<(Key, Vec<u8>)>> {
    match successor(key) {
        Some(k) => seek(tree, k),
        None => Ok(None),
    }
}

/// The item immediately before `key` in tree order.
pub fn previous_item(tree: &super::Tree, key: Key) -> Result<Option<(Key, Vec<u8>)>> {
    let before = match predecessor(key) {
        Some(k) => k,
        None => return Ok(None),
    };
    let (path, found) = search::search_slot(tree, before)?;
    let leaf = path.leaf();
    if found {
        let data = leaf.data();
        let slot = path.leaf_slot();
        return Ok(Some((item_key(&data, slot), item_data(&data, slot).to_vec())));
    }
    if path.leaf_slot() > 0 {
        let data = leaf.data();
        let slot = path.leaf_slot() - 1;
        return Ok(Some((item_key(&data, slot), item_data(&data, slot).to_vec())));
    }
    match search::previous_leaf(tree, &path)? {
        Some(prev) if prev.nritems() > 0 => {
            let data = prev.data();
            let slot = prev.nritems() - 1;
            Ok(Some((item_key(&data, slot), item_data(&data, slot).to_vec())))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::item_type;

    #[test]
    fn successor_and_predecessor_roll_over_fields() {
        let k = Key::new(1, item_type::MAX, u64::MAX);
        assert_eq!(successor(k), Some(Key::new(2, 0, 0)));
        assert_eq!(predecessor(successor(k).unwrap()), Some(k));
        assert_eq!(predecessor(Key::MIN), None);
        assert_eq!(successor(Key::MAX), None);
    }
}
