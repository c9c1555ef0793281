pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SUPER_INFO_OFFSET: usize = 65536;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;
pub const BTRFS_SUPER_MIRROR_SHIFT: usize = 12;

pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;

pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;
pub const BTRFS_BLOCK_GROUP_TREE_OBJECTID: u64 = 11;

pub const BTRFS_DEV_STATS_OBJECTID: u64 = 0;
pub const BTRFS_BALANCE_OBJECTID: u64 = -4_i64 as u64;
pub const BTRFS_ORPHAN_OBJECTID: u64 = -5_i64 as u64;
pub const BTRFS_TREE_LOG_OBJECTID: u64 = -6_i64 as u64;
pub const BTRFS_TREE_LOG_FIXUP_OBJECTID: u64 = -7_i64 as u64;
pub const BTRFS_TREE_RELOC_OBJECTID: u64 = -8_i64 as u64;
pub const BTRFS_DATA_RELOC_TREE_OBJECTID: u64 = -9_i64 as u64;
pub const BTRFS_EXTENT_CSUM_OBJECTID: u64 = -10_i64 as u64;
pub const BTRFS_FREE_SPACE_OBJECTID: u64 = -11_i64 as u64;
pub const BTRFS_FREE_INO_OBJECTID: u64 = -12_i64 as u64;
pub const BTRFS_MULTIPLE_OBJECTIDS: u64 = -255_i64 as u64;

pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/*
  repr(u16) will not work on big-endian architectures. We could work around this with target_endian confg so that we declare these values with swapped bytes on big-endian systems. But I'm not going to write code I'm not going to test.
*/
#[repr(u16)]
#[derive(Clone, Copy)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsCsumType {
    CRC32 = 0,
    XXHASH = 1,
    SHA256 = 2,
    BLAKE2 = 3,
}

/// Named item-type byte values. The core only interprets a handful of these
/// (`EXTENT_ITEM`, `EXTENT_REF`, `BLOCK_GROUP_ITEM`, `ROOT_ITEM`); everything else is an
/// opaque payload the tree stores but never inspects, so the key's `item_type` field is a
/// plain `u8` rather than an exhaustive enum — a search or an opaque caller payload may
/// legitimately carry any byte value, including ones with no name below.
#[allow(dead_code, non_camel_case_types)]
pub mod item_type {
    pub const MIN: u8 = 0x00; // to facilitate searching through any possible byte value
    pub const INODE_ITEM: u8 = 0x01;
    pub const INODE_REF: u8 = 0x0c;
    pub const INODE_EXTREF: u8 = 0x0d;
    pub const XATTR_ITEM: u8 = 0x18;
    pub const VERITY_DESC_ITEM: u8 = 0x24;
    pub const VERITY_MERKLE_ITEM: u8 = 0x25;
    pub const ORPHAN_ITEM: u8 = 0x30;
    pub const DIR_LOG_ITEM: u8 = 0x3c;
    pub const DIR_LOG_INDEX: u8 = 0x48;
    pub const DIR_ITEM: u8 = 0x54;
    pub const DIR_INDEX: u8 = 0x60;
    pub const EXTENT_DATA: u8 = 0x6c;
    pub const CSUM_ITEM: u8 = 0x78;
    pub const EXTENT_CSUM: u8 = 0x80;
    pub const ROOT_ITEM: u8 = 0x84;
    pub const ROOT_BACKREF: u8 = 0x90;
    pub const ROOT_REF: u8 = 0x9c;
    pub const EXTENT_ITEM: u8 = 0xa8;
    pub const METADATA_ITEM: u8 = 0xa9;
    pub const TREE_BLOCK_REF: u8 = 0xb0;
    pub const EXTENT_DATA_REF: u8 = 0xb2;
    pub const EXTENT_REF_V0: u8 = 0xb4;
    pub const SHARED_BLOCK_REF: u8 = 0xb6;
    pub const SHARED_DATA_REF: u8 = 0xb8;
    pub const BLOCK_GROUP_ITEM: u8 = 0xc0;
    pub const FREE_SPACE_INFO: u8 = 0xc6;
    pub const FREE_SPACE_EXTENT: u8 = 0xc7;
    pub const FREE_SPACE_BITMAP: u8 = 0xc8;
    pub const DEV_EXTENT: u8 = 0xcc;
    pub const DEV_ITEM: u8 = 0xd8;
    pub const CHUNK_ITEM: u8 = 0xe4;
    pub const QGROUP_STATUS: u8 = 0xf0;
    pub const QGROUP_INFO: u8 = 0xf2;
    pub const QGROUP_LIMIT: u8 = 0xf4;
    pub const QGROUP_RELATION: u8 = 0xf6;
    pub const TEMPORARY_ITEM: u8 = 0xf8;
    pub const PERSISTENT_ITEM: u8 = 0xf9;
    pub const DEV_REPLACE: u8 = 0xfa;
    pub const UUID_KEY_SUBVOL: u8 = 0xfb;
    pub const UUID_KEY_RECEIVED_SUBVOL: u8 = 0xfc;
    pub const STRING_ITEM: u8 = 0xfd;
    pub const MAX: u8 = 0xff; // to facilitate searching through any possible byte value

    /// best-effort name for logging/dump output; unnamed bytes print as a hex literal.
    pub fn name(t: u8) -> &'static str {
        match t {
            MIN => "MIN",
            INODE_ITEM => "INODE_ITEM",
            INODE_REF => "INODE_REF",
            INODE_EXTREF => "INODE_EXTREF",
            XATTR_ITEM => "XATTR_ITEM",
            DIR_ITEM => "DIR_ITEM",
            DIR_INDEX => "DIR_INDEX",
            EXTENT_DATA => "EXTENT_DATA",
            CSUM_ITEM => "CSUM_ITEM",
            ROOT_ITEM => "ROOT_ITEM",
            ROOT_REF => "ROOT_REF",
            ROOT_BACKREF => "ROOT_BACKREF",
            EXTENT_ITEM => "EXTENT_ITEM",
            TREE_BLOCK_REF => "TREE_BLOCK_REF",
            EXTENT_DATA_REF => "EXTENT_DATA_REF",
            BLOCK_GROUP_ITEM => "BLOCK_GROUP_ITEM",
            DEV_EXTENT => "DEV_EXTENT",
            DEV_ITEM => "DEV_ITEM",
            CHUNK_ITEM => "CHUNK_ITEM",
            MAX => "MAX",
            _ => "UNKNOWN",
        }
    }
}

//type LE64 = endian_types::Endian<u64, endian_types::LittleEndian>;
/// on-disc format is little-endian
pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsCsum = [u8; BTRFS_CSUM_SIZE];
pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_super_block {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub magic: LE64,
    pub generation: LE64,
    pub root: LE64,
    pub chunk_root: LE64,
    pub log_root: LE64,
    pub __unused_log_root_transid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub root_dir_object_id: LE64,
    pub num_devices: LE64,
    pub sectorsize: LE32,
    pub nodesize: LE32,
    pub __unused_leafsize: LE32,
    pub stripesize: LE32,
    pub sys_chunk_array_size: LE32,
    pub chunk_root_generation: LE64,
    pub compat_flags: LE64,
    pub compat_ro_flags: LE64,
    pub incompat_flags: LE64,
    pub csum_type: BtrfsCsumType,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: btrfs_dev_item,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: LE64,
    pub uuid_tree_generation: LE64,
    pub metadata_uuid: BtrfsFsid, //fsid vs uuid as per ctree.h
    pub nr_global_roots: LE64,
    pub reserved: [LE64; 27],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [btrfs_root_backup; BTRFS_NUM_BACKUP_ROOTS],
    pub padding: [u8; 565],
}
static_assertions::assert_eq_size!([u8; BTRFS_SUPER_INFO_SIZE], btrfs_super_block);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_backup {
    pub tree_root: LE64,
    pub tree_root_gen: LE64,

    pub chunk_root: LE64,
    pub chunk_root_gen: LE64,

    pub extent_root: LE64,
    pub extent_root_gen: LE64,

    pub fs_root: LE64,
    pub fs_root_gen: LE64,

    pub dev_root: LE64,
    pub dev_root_gen: LE64,

    pub csum_root: LE64,
    pub csum_root_gen: LE64,

    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub num_devices: LE64,

    pub unused_64: [LE64; 4],

    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_item {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

/* header is stored at the start of every tree node */
#[repr(C, packed)]
pub struct btrfs_header {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,

    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: LE64,
    pub owner: LE64,
    pub nritems: LE32,
    pub level: u8,
}

/* leaf nodes are full of btrfs_items, and data */
#[repr(C, packed)]
pub struct btrfs_item {
    pub key: btrfs_disk_key,
    pub offset: LE32, //counting starts at end of btrfs_header
    pub size: LE32,
}

/* non-leaf nodes are full of btrfs_key_ptrs */
#[repr(C, packed)]
pub struct btrfs_key_ptr {
    pub key: btrfs_disk_key,
    pub blockptr: LE64,
    pub generation: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct btrfs_disk_key {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}
static_assertions::assert_eq_size!([u8; 17], btrfs_disk_key);

impl std::fmt::Debug for btrfs_disk_key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let objectid = self.objectid;
        let item_type = self.item_type;
        let offset = self.offset;
        write!(
            f,
            "{} {} {}",
            objectid,
            item_type::name(item_type),
            offset
        )
    }
}

#[repr(C, packed)]
pub struct btrfs_stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}

#[repr(C, packed)]
pub struct btrfs_chunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
}

#[repr(C, packed)]
pub struct btrfs_timespec {
    pub sec: LE64,
    pub nsec: LE32,
}

#[repr(C, packed)]
pub struct btrfs_inode_item {
    pub generation: LE64,
    pub transid: LE64,
    pub size: LE64,
    pub nbytes: LE64,
    pub block_group: LE64,
    pub nlink: LE32,
    pub uid: LE32,
    pub gid: LE32,
    pub mode: LE32,
    pub rdev: LE64,
    pub flags: LE64,

    pub sequence: LE64,
    pub __reserved: [LE64; 4],
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}

/* there was an older version of this structure which I'm ignoring */
#[repr(C, packed)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: LE64,
    pub root_dirid: LE64,
    pub bytenr: LE64,
    pub byte_limit: LE64,
    pub bytes_used: LE64,
    pub last_snapshot: LE64,
    pub flags: LE64,
    pub refs: LE32,
    pub drop_progress: btrfs_disk_key,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: LE64,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
    pub received_uuid: BtrfsUuid,
    pub ctransid: LE64,
    pub otransid: LE64,
    pub stransid: LE64,
    pub rtransid: LE64,
    pub ctime: btrfs_timespec,
    pub otime: btrfs_timespec,
    pub stime: btrfs_timespec,
    pub rtime: btrfs_timespec,
    pub global_tree_id: LE64,
    pub __reserved: [LE64; 7],
}

#[repr(C, packed)]
pub struct btrfs_root_ref {
    pub dirid: LE64,
    pub sequence: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
pub struct btrfs_extent_item {
	pub refs: LE64,
	pub generation: LE64,
	pub flags: LE64,
}

/// payload of an `EXTENT_REF` item: one back-reference to a holder of the extent.
/// the item's key offset is a hash of these four fields (see `crate::extent::backref`);
/// on hash collision, the full payload below is what disambiguates.
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct btrfs_extent_ref {
    pub root_objectid: LE64,
    pub generation: LE64,
    pub owner_objectid: LE64,
    pub owner_offset: LE64,
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum BtrfsBlockGroupFlags {
    DATA = 1,
    SYSTEM = 2,
    METADATA = 4,
}

/// payload of a `BLOCK_GROUP_ITEM`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_block_group_item {
    pub used: LE64,
    pub flags: LE64,
}
