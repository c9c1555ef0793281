//! A block group: a contiguous span of the device tagged DATA, METADATA, or SYSTEM
//! (§4.D.2), with its own free-space index. The allocator never hands out space that
//! crosses a block-group boundary or mixes tags.

use crate::interval::IntervalSet;
use crate::structures::BtrfsBlockGroupFlags;

pub struct BlockGroup {
    pub bytenr: u64,
    pub length: u64,
    pub flags: BtrfsBlockGroupFlags,
    pub used: u64,
    free: IntervalSet,
}

impl BlockGroup {
    pub fn new(bytenr: u64, length: u64, flags: BtrfsBlockGroupFlags) -> BlockGroup {
        let mut free = IntervalSet::new();
        free.add(bytenr, length);
        BlockGroup {
            bytenr,
            length,
            flags,
            used: 0,
            free,
        }
    }

    pub fn matches(&self, flags: BtrfsBlockGroupFlags) -> bool {
        self.flags == flags
    }

    /// §9 Q2: a block group stops taking new allocations once 7/8 of it is used,
    /// regardless of tag — keeps a margin for COW amplification without needing a
    /// per-tag tuning knob.
    pub fn is_allocatable(&self) -> bool {
        self.used * 8 < self.length * 7
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.total_bytes()
    }

    pub fn alloc(&mut self, hint: u64, len: u64) -> Option<u64> {
        if !self.is_allocatable() {
            return None;
        }
        let (start, avail) = self.free.first_fit(hint.max(self.bytenr), len)?;
        let _ = avail;
        self.free.remove(start, len);
        self.used += len;
        Some(start)
    }

    pub fn free(&mut self, bytenr: u64, len: u64) {
        self.free.add(bytenr, len);
        self.used = self.used.saturating_sub(len);
    }

    pub fn contains(&self, bytenr: u64) -> bool {
        bytenr >= self.bytenr && bytenr < self.bytenr + self.length
    }

    /// Marks `[bytenr, bytenr+len)` as already allocated without handing it out —
    /// used when rebuilding the free-space index from on-disk `EXTENT_ITEM`s at
    /// `open_ctree` time, where the space is used but was never `alloc`'d this run.
    pub fn mark_used(&mut self, bytenr: u64, len: u64) {
        self.free.remove(bytenr, len);
        self.used += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_threshold() {
        let mut bg = BlockGroup::new(0, 800, BtrfsBlockGroupFlags::METADATA);
        assert!(bg.alloc(0, 700).is_some());
        assert!(!bg.is_allocatable());
        assert!(bg.alloc(0, 10).is_none());
    }

    #[test]
    fn free_returns_space_to_the_pool() {
        let mut bg = BlockGroup::new(0, 100, BtrfsBlockGroupFlags::DATA);
        let a = bg.alloc(0, 50).unwrap();
        bg.free(a, 50);
        assert_eq!(bg.free_bytes(), 100);
        assert_eq!(bg.used, 0);
    }
}
