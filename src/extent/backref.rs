//! Extent back-references (§4.D.3). An `EXTENT_REF` item's key offset is a hash of
//! its holder identity rather than the identity itself, so lookups are O(1) instead of
//! a reverse scan; the full `btrfs_extent_ref` payload is what disambiguates a
//! collision, via linear probing over the handful of offsets that hash alike.

use crate::structures::btrfs_extent_ref;
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn backref_hash(root_objectid: u64, owner_objectid: u64, owner_offset: u64) -> u64 {
    let mut buf = [0_u8; 24];
    buf[0..8].copy_from_slice(&root_objectid.to_le_bytes());
    buf[8..16].copy_from_slice(&owner_objectid.to_le_bytes());
    buf[16..24].copy_from_slice(&owner_offset.to_le_bytes());
    CASTAGNOLI.checksum(&buf) as u64
}

pub fn encode_ref(r: &btrfs_extent_ref) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&r.root_objectid.to_le_bytes());
    out.extend_from_slice(&r.generation.to_le_bytes());
    out.extend_from_slice(&r.owner_objectid.to_le_bytes());
    out.extend_from_slice(&r.owner_offset.to_le_bytes());
    out
}

pub fn decode_ref(buf: &[u8]) -> btrfs_extent_ref {
    btrfs_extent_ref {
        root_objectid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        generation: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        owner_objectid: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        owner_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
    }
}

/// Two back-references are the same holder if root/owner/offset match; `generation` is
/// informational only and does not participate in identity.
pub fn same_holder(a: &btrfs_extent_ref, b: &btrfs_extent_ref) -> bool {
    a.root_objectid == b.root_objectid
        && a.owner_objectid == b.owner_objectid
        && a.owner_offset == b.owner_offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_round_trips_through_bytes() {
        let r = btrfs_extent_ref {
            root_objectid: 5,
            generation: 7,
            owner_objectid: 42,
            owner_offset: 9,
        };
        let bytes = encode_ref(&r);
        let back = decode_ref(&bytes);
        assert!(same_holder(&r, &back));
        assert_eq!(back.generation, 7);
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(backref_hash(1, 2, 3), backref_hash(1, 2, 3));
    }
}
