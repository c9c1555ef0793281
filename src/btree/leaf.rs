//! Leaf item packing: descriptors grow forward from the header, item data grows
//! backward from the end of the block, and the gap between them is free space
//! (§4.C.1). Item 0 (lowest key) sits against the end of the block; item `nritems-1`
//! (highest key) sits against the descriptor table — so item data stays one
//! contiguous region with no holes, and `free_space` is just the gap's width.

use crate::codec::{
    item_data_offset, item_data_size, item_desc_offset, item_key, item_ptr, set_item_data_offset,
    set_item_data_size, set_item_key, HeaderView, HeaderViewMut, HEADER_LEN, ITEM_DESC_LEN,
};
use crate::codec::Key;

pub fn nritems(buf: &[u8]) -> u32 {
    HeaderView(buf).nritems()
}

fn desc_table_end(buf: &[u8]) -> usize {
    item_desc_offset(nritems(buf))
}

/// Absolute offset of the lowest-addressed byte currently used by item data, i.e. the
/// start of the data region (= end of free space).
fn data_region_start(buf: &[u8]) -> usize {
    let n = nritems(buf);
    if n == 0 {
        buf.len()
    } else {
        item_ptr(buf, n - 1).0
    }
}

pub fn free_space(buf: &[u8]) -> usize {
    data_region_start(buf).saturating_sub(desc_table_end(buf))
}

pub fn space_needed(data_len: usize) -> usize {
    ITEM_DESC_LEN + data_len
}

/// Binary search for `key` among the leaf's items. `Ok(slot)` on exact match,
/// `Err(slot)` for the insertion point that keeps keys ascending.
pub fn find_slot(buf: &[u8], key: Key) -> Result<u32, u32> {
    let n = nritems(buf);
    let mut lo = 0_u32;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let mid_key = item_key(buf, mid);
        match mid_key.cmp(&key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Inserts `data` under `key` at `slot`. Caller must have confirmed
/// `free_space(buf) >= space_needed(data.len())` and that `slot` is the correct
/// insertion point (from `find_slot`).
pub fn insert_at(buf: &mut [u8], slot: u32, key: Key, data: &[u8]) {
    let n = nritems(buf);
    more_asserts::debug_assert_ge!(free_space(buf), space_needed(data.len()));

    // shift descriptors [slot..n) right by one slot
    let src = item_desc_offset(slot);
    let dst = item_desc_offset(slot + 1);
    let len = item_desc_offset(n) - src;
    buf.copy_within(src..src + len, dst);

    let new_data_start = data_region_start(buf) - data.len();
    buf[new_data_start..new_data_start + data.len()].copy_from_slice(data);

    set_item_key(buf, slot, key);
    set_item_data_offset(buf, slot, (new_data_start - HEADER_LEN) as u32);
    set_item_data_size(buf, slot, data.len() as u32);

    HeaderViewMut(&mut buf[..HEADER_LEN]).set_nritems(n + 1);
}

/// Removes the item at `slot`, compacting its data hole out of the data region.
pub fn remove_at(buf: &mut [u8], slot: u32) {
    let n = nritems(buf);
    let (removed_off, removed_size) = item_ptr(buf, slot);

    // close the hole: slide everything *above* the removed item (closer to the end of
    // the block, i.e. items 0..slot) down by removed_size.
    if removed_size > 0 {
        buf.copy_within(removed_off + removed_size..buf.len(), removed_off);
    }
    for i in 0..slot {
        let off = item_data_offset(buf, i);
        set_item_data_offset(buf, i, off - removed_size as u32);
    }

    // close the descriptor gap: shift descriptors (slot+1..n) left by one slot.
    let src = item_desc_offset(slot + 1);
    let dst = item_desc_offset(slot);
    let len = item_desc_offset(n) - src;
    buf.copy_within(src..src + len, dst);

    HeaderViewMut(&mut buf[..HEADER_LEN]).set_nritems(n - 1);
}

/// Copies items `[from, to)` of `src` into `dst` (which must be empty), preserving key
/// order. Used by split and merge.
pub fn copy_range(dst: &mut [u8], src: &[u8], from: u32, to: u32) {
    debug_assert_eq!(nritems(dst), 0);
    for (i, slot) in (from..to).enumerate() {
        let key = item_key(src, slot);
        let (off, size) = item_ptr(src, slot);
        insert_at(dst, i as u32, key, &src[off..off + size]);
    }
}

pub fn total_used_bytes(buf: &[u8]) -> usize {
    let n = nritems(buf);
    (item_desc_offset(n) - HEADER_LEN) + (buf.len() - data_region_start(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::item_type;

    fn new_leaf(nodesize: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; nodesize];
        HeaderViewMut(&mut buf[..HEADER_LEN]).set_level(0);
        buf
    }

    #[test]
    fn insert_and_find_round_trip() {
        let mut buf = new_leaf(4096);
        insert_at(&mut buf, 0, Key::new(5, item_type::INODE_ITEM, 0), b"hello");
        assert_eq!(find_slot(&buf, Key::new(5, item_type::INODE_ITEM, 0)), Ok(0));
        assert_eq!(find_slot(&buf, Key::new(6, item_type::MIN, 0)), Err(1));
        let (off, size) = item_ptr(&buf, 0);
        assert_eq!(&buf[off..off + size], b"hello");
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut buf = new_leaf(4096);
        insert_at(&mut buf, 0, Key::new(10, item_type::MIN, 0), b"a");
        let slot = find_slot(&buf, Key::new(5, item_type::MIN, 0)).unwrap_err();
        insert_at(&mut buf, slot, Key::new(5, item_type::MIN, 0), b"b");
        assert_eq!(item_key(&buf, 0), Key::new(5, item_type::MIN, 0));
        assert_eq!(item_key(&buf, 1), Key::new(10, item_type::MIN, 0));
    }

    #[test]
    fn remove_compacts_data_region() {
        let mut buf = new_leaf(4096);
        insert_at(&mut buf, 0, Key::new(1, item_type::MIN, 0), b"aaaa");
        insert_at(&mut buf, 1, Key::new(2, item_type::MIN, 0), b"bb");
        insert_at(&mut buf, 2, Key::new(3, item_type::MIN, 0), b"cccccc");
        let free_before = free_space(&buf);
        remove_at(&mut buf, 1);
        assert_eq!(nritems(&buf), 2);
        assert_eq!(item_key(&buf, 0), Key::new(1, item_type::MIN, 0));
        assert_eq!(item_key(&buf, 1), Key::new(3, item_type::MIN, 0));
        let (off0, size0) = item_ptr(&buf, 0);
        assert_eq!(&buf[off0..off0 + size0], b"aaaa");
        let (off1, size1) = item_ptr(&buf, 1);
        assert_eq!(&buf[off1..off1 + size1], b"cccccc");
        assert_eq!(free_space(&buf), free_before + space_needed(2));
    }

    #[test]
    fn copy_range_preserves_order() {
        let mut src = new_leaf(4096);
        for i in 0..6 {
            insert_at(&mut src, i, Key::new(i as u64, item_type::MIN, 0), b"x");
        }
        let mut dst = new_leaf(4096);
        copy_range(&mut dst, &src, 2, 5);
        assert_eq!(nritems(&dst), 3);
        assert_eq!(item_key(&dst, 0), Key::new(2, item_type::MIN, 0));
        assert_eq!(item_key(&dst, 2), Key::new(4, item_type::MIN, 0));
    }
}
