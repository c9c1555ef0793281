//! Internal node key-ptr packing. Unlike leaves, every entry is the same fixed size,
//! so there is no data region to compact — insert/remove is a plain array shift.

use crate::codec::{
    key_ptr_blockptr, key_ptr_generation, key_ptr_key, key_ptr_offset, set_key_ptr_blockptr,
    set_key_ptr_generation, set_key_ptr_key, HeaderView, HeaderViewMut, HEADER_LEN, KEY_PTR_LEN,
};
use crate::codec::Key;

pub fn nritems(buf: &[u8]) -> u32 {
    HeaderView(buf).nritems()
}

pub fn max_ptrs(nodesize: usize) -> u32 {
    ((nodesize - HEADER_LEN) / KEY_PTR_LEN) as u32
}

/// Binary search among this node's key-ptrs for the slot whose key is the greatest key
/// <= `key` — the child to descend into for `key`. Returns `nritems - 1` if `key` is
/// greater than every key present (descend into the last child, as any leaf under it
/// may still need to grow to cover `key`).
pub fn find_slot(buf: &[u8], key: Key) -> u32 {
    let n = nritems(buf);
    debug_assert!(n > 0);
    let mut lo = 0_u32;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_ptr_key(buf, mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.saturating_sub(1).min(n - 1)
}

pub fn insert_at(buf: &mut [u8], slot: u32, key: Key, blockptr: u64, generation: u64) {
    let n = nritems(buf);
    more_asserts::debug_assert_lt!(n, max_ptrs(buf.len()));
    let src = key_ptr_offset(slot);
    let dst = key_ptr_offset(slot + 1);
    let len = key_ptr_offset(n) - src;
    buf.copy_within(src..src + len, dst);
    set_key_ptr_key(buf, slot, key);
    set_key_ptr_blockptr(buf, slot, blockptr);
    set_key_ptr_generation(buf, slot, generation);
    HeaderViewMut(&mut buf[..HEADER_LEN]).set_nritems(n + 1);
}

pub fn remove_at(buf: &mut [u8], slot: u32) {
    let n = nritems(buf);
    let src = key_ptr_offset(slot + 1);
    let dst = key_ptr_offset(slot);
    let len = key_ptr_offset(n) - src;
    buf.copy_within(src..src + len, dst);
    HeaderViewMut(&mut buf[..HEADER_LEN]).set_nritems(n - 1);
}

pub fn update_key(buf: &mut [u8], slot: u32, key: Key) {
    set_key_ptr_key(buf, slot, key);
}

pub fn update_ptr(buf: &mut [u8], slot: u32, blockptr: u64, generation: u64) {
    set_key_ptr_blockptr(buf, slot, blockptr);
    set_key_ptr_generation(buf, slot, generation);
}

pub fn child_ptr(buf: &[u8], slot: u32) -> (u64, u64) {
    (key_ptr_blockptr(buf, slot), key_ptr_generation(buf, slot))
}

pub fn copy_range(dst: &mut [u8], src: &[u8], from: u32, to: u32) {
    debug_assert_eq!(nritems(dst), 0);
    for (i, slot) in (from..to).enumerate() {
        let (bp, gen) = child_ptr(src, slot);
        insert_at(dst, i as u32, key_ptr_key(src, slot), bp, gen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::item_type;

    fn new_node(nodesize: usize, level: u8) -> Vec<u8> {
        let mut buf = vec![0_u8; nodesize];
        HeaderViewMut(&mut buf[..HEADER_LEN]).set_level(level);
        buf
    }

    #[test]
    fn find_slot_picks_greatest_le() {
        let mut buf = new_node(4096, 1);
        insert_at(&mut buf, 0, Key::new(10, item_type::MIN, 0), 100, 1);
        insert_at(&mut buf, 1, Key::new(20, item_type::MIN, 0), 200, 1);
        insert_at(&mut buf, 2, Key::new(30, item_type::MIN, 0), 300, 1);
        assert_eq!(find_slot(&buf, Key::new(5, item_type::MIN, 0)), 0);
        assert_eq!(find_slot(&buf, Key::new(20, item_type::MIN, 0)), 1);
        assert_eq!(find_slot(&buf, Key::new(25, item_type::MIN, 0)), 1);
        assert_eq!(find_slot(&buf, Key::new(999, item_type::MIN, 0)), 2);
    }

    #[test]
    fn remove_shifts_tail_left() {
        let mut buf = new_node(4096, 1);
        insert_at(&mut buf, 0, Key::new(1, item_type::MIN, 0), 10, 1);
        insert_at(&mut buf, 1, Key::new(2, item_type::MIN, 0), 20, 1);
        insert_at(&mut buf, 2, Key::new(3, item_type::MIN, 0), 30, 1);
        remove_at(&mut buf, 1);
        assert_eq!(nritems(&buf), 2);
        assert_eq!(child_ptr(&buf, 1).0, 30);
    }
}
