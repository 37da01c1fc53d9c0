#![forbid(unsafe_code)]
//! On-disk format parsing for the btrfs structures qba consumes.
//!
//! Pure parsing crate — no I/O, no side effects. Every accessor reads
//! little-endian primitives at fixed byte offsets from an unaligned,
//! tightly packed slice, and validates lengths before each access.

pub mod csum;

use qba_types::{
    BTRFS_BLOCK_GROUP_DUP, BTRFS_BLOCK_GROUP_RAID0, BTRFS_BLOCK_GROUP_RAID1,
    BTRFS_BLOCK_GROUP_RAID1C3, BTRFS_BLOCK_GROUP_RAID1C4, BTRFS_BLOCK_GROUP_RAID5,
    BTRFS_BLOCK_GROUP_RAID6, BTRFS_BLOCK_GROUP_RAID10, BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
    BTRFS_ITEM_CHUNK_ITEM, BTRFS_MAGIC, BTRFS_MAX_STRIPES, BTRFS_SUPER_INFO_SIZE,
    BTRFS_SYS_CHUNK_ARRAY_MAX, ParseError, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    read_u8,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a btrfs tree-node header on disk.
pub const BTRFS_HEADER_SIZE: usize = 101;
/// Size of a leaf item descriptor (key:17 + offset:u32 + size:u32).
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Size of an internal key pointer (key:17 + blockptr:u64 + generation:u64).
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
/// Size of a btrfs_disk_key on disk (objectid:u64 + type:u8 + offset:u64).
pub const BTRFS_DISK_KEY_SIZE: usize = 17;
/// Chunk header fields before the stripe array.
pub const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
/// Size of one btrfs_stripe on disk (devid:u64 + offset:u64 + dev_uuid:16).
pub const BTRFS_STRIPE_SIZE: usize = 32;
/// Size of a btrfs_dev_extent payload (chunk_tree:u64 + chunk_objectid:u64 +
/// chunk_offset:u64 + length:u64 + chunk_tree_uuid:16).
pub const BTRFS_DEV_EXTENT_SIZE: usize = 48;
/// Minimum btrfs_root_item payload (inode:160 .. level at byte 238).
pub const BTRFS_ROOT_ITEM_MIN_SIZE: usize = 239;
/// Size of a btrfs_free_space_info payload.
pub const BTRFS_FREE_SPACE_INFO_SIZE: usize = 8;
/// `free_space_info.flags` bit: this block group is described by bitmaps.
pub const BTRFS_FREE_SPACE_USING_BITMAPS: u32 = 1 << 0;
/// Maximum tree depth in btrfs (kernel enforces 8 levels, 0-7).
pub const BTRFS_MAX_LEVEL: u8 = 7;

const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

// ── Keys ────────────────────────────────────────────────────────────────────

/// A btrfs key triple. The derived ordering is lexicographic over
/// (objectid, item_type, offset), which is the on-disk tree order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:x}, {:x}, {:x})",
            self.objectid, self.item_type, self.offset
        )
    }
}

fn parse_key(data: &[u8], offset: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, offset)?,
        item_type: read_u8(data, offset + 8)?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse one 4096-byte superblock region.
    ///
    /// Validates the magic, the sector/node geometry, and the embedded
    /// system chunk array bounds. Checksum verification is separate
    /// (`csum::verify_superblock`), so callers can distinguish a corrupt
    /// copy from a region that is not a superblock at all.
    #[allow(clippy::too_many_lines)]
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if sectorsize > 256 * 1024 || nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "geometry exceeds 256K upper bound",
            });
        }
        if nodesize < BTRFS_HEADER_SIZE as u32 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than a tree-node header",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = BTRFS_SYS_CHUNK_ARRAY_OFFSET + sys_array_len;
        let sys_chunk_array = region[BTRFS_SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            sys_chunk_array_size,
            chunk_root_generation: read_le_u64(region, 0xA4)?,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            sys_chunk_array,
        })
    }

    /// Whether the free-space tree read-only compat bit is set.
    #[must_use]
    pub fn has_free_space_tree(&self) -> bool {
        self.compat_ro_flags & BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE != 0
    }
}

// ── Tree node header ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTRFS_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Structural validation: level bound and item-table capacity.
    pub fn validate(&self, block_size: usize) -> Result<(), ParseError> {
        if self.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(BTRFS_HEADER_SIZE);
        let item_size = if self.level == 0 {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        if nritems > payload_space / item_size {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

// ── Leaf items and internal key pointers ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: Key,
    pub data_offset: u32,
    pub data_size: u32,
}

/// An internal (non-leaf) node entry: a key paired with a child pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// Parse a leaf node's item table. Does not touch the payloads; use
/// `leaf_payload` to slice one out with bounds checking.
pub fn parse_leaf_items(block: &[u8]) -> Result<(NodeHeader, Vec<LeafItem>), ParseError> {
    let header = NodeHeader::parse(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len())?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let key = parse_key(block, base)?;
        let data_offset = read_le_u32(block, base + 17)?;
        let data_size = read_le_u32(block, base + 21)?;
        items.push(LeafItem {
            key,
            data_offset,
            data_size,
        });
    }

    Ok((header, items))
}

/// Slice a leaf item's payload out of its node.
///
/// The payload lives at `BTRFS_HEADER_SIZE + item.data_offset`, i.e. item
/// offsets are relative to the end of the header.
pub fn leaf_payload<'a>(block: &'a [u8], item: &LeafItem) -> Result<&'a [u8], ParseError> {
    let off = usize::try_from(item.data_offset)
        .map_err(|_| ParseError::IntegerConversion { field: "data_offset" })?;
    let size = usize::try_from(item.data_size)
        .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
    let start = BTRFS_HEADER_SIZE
        .checked_add(off)
        .ok_or(ParseError::InvalidField {
            field: "data_offset",
            reason: "overflow",
        })?;
    let end = start.checked_add(size).ok_or(ParseError::InvalidField {
        field: "data_size",
        reason: "overflow",
    })?;
    if end > block.len() {
        return Err(ParseError::InvalidField {
            field: "data_offset",
            reason: "item payload extends past block",
        });
    }
    Ok(&block[start..end])
}

/// Parse an internal node's key-pointer table.
pub fn parse_internal_items(block: &[u8]) -> Result<(NodeHeader, Vec<KeyPtr>), ParseError> {
    let header = NodeHeader::parse(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len())?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let key = parse_key(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        let generation = read_le_u64(block, base + 25)?;

        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }

        ptrs.push(KeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}

// ── Chunks and stripes ──────────────────────────────────────────────────────

/// A single stripe within a btrfs chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A decoded `btrfs_chunk` payload (from the sys array or a chunk-tree leaf).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    /// RAID profile encoded in the chunk `type` bitmask.
    #[must_use]
    pub fn profile(&self) -> RaidProfile {
        RaidProfile::from_chunk_type(self.chunk_type)
    }
}

/// Parse one chunk at `offset`, returning the item and the bytes consumed.
///
/// Checks the fixed header and then `num_stripes * BTRFS_STRIPE_SIZE`
/// available bytes before reading the stripe array.
pub fn parse_chunk(data: &[u8], offset: usize) -> Result<(ChunkItem, usize), ParseError> {
    if offset + BTRFS_CHUNK_FIXED_SIZE > data.len() {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_CHUNK_FIXED_SIZE,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    let length = read_le_u64(data, offset)?;
    let owner = read_le_u64(data, offset + 8)?;
    let stripe_len = read_le_u64(data, offset + 16)?;
    let chunk_type = read_le_u64(data, offset + 24)?;
    let io_align = read_le_u32(data, offset + 32)?;
    let io_width = read_le_u32(data, offset + 36)?;
    let sector_size = read_le_u32(data, offset + 40)?;
    let num_stripes = read_le_u16(data, offset + 44)?;
    let sub_stripes = read_le_u16(data, offset + 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }
    if length == 0 {
        return Err(ParseError::InvalidField {
            field: "chunk_length",
            reason: "chunk length must be non-zero",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let stripes_bytes = stripes_count * BTRFS_STRIPE_SIZE;
    let stripes_base = offset + BTRFS_CHUNK_FIXED_SIZE;
    if stripes_base + stripes_bytes > data.len() {
        return Err(ParseError::InsufficientData {
            needed: stripes_bytes,
            offset: stripes_base,
            actual: data.len().saturating_sub(stripes_base),
        });
    }

    let mut stripes = Vec::with_capacity(stripes_count);
    for idx in 0..stripes_count {
        let base = stripes_base + idx * BTRFS_STRIPE_SIZE;
        stripes.push(Stripe {
            devid: read_le_u64(data, base)?,
            offset: read_le_u64(data, base + 8)?,
            dev_uuid: read_fixed::<16>(data, base + 16)?,
        });
    }

    Ok((
        ChunkItem {
            length,
            owner,
            stripe_len,
            chunk_type,
            io_align,
            io_width,
            sector_size,
            num_stripes,
            sub_stripes,
            stripes,
        },
        BTRFS_CHUNK_FIXED_SIZE + stripes_bytes,
    ))
}

/// Parse the superblock's embedded system chunk array: a concatenation of
/// `{disk_key, chunk}` records totalling `sys_chunk_array_size` bytes.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<(Key, ChunkItem)>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + BTRFS_DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = parse_key(data, cur)?;
        if key.item_type != BTRFS_ITEM_CHUNK_ITEM {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "entry key is not a CHUNK_ITEM",
            });
        }
        cur += BTRFS_DISK_KEY_SIZE;

        let (chunk, consumed) = parse_chunk(data, cur)?;
        if chunk.num_stripes > BTRFS_MAX_STRIPES {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "stripe count above supported maximum",
            });
        }
        cur += consumed;

        entries.push((key, chunk));
    }

    Ok(entries)
}

// ── RAID profiles ───────────────────────────────────────────────────────────

/// Chunk replication profile, decoded from the `type` bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidProfile {
    Single,
    Raid0,
    Raid1,
    Dup,
    Raid10,
    Raid5,
    Raid6,
    Raid1c3,
    Raid1c4,
}

impl RaidProfile {
    /// First matching profile bit wins; no bit set means SINGLE.
    #[must_use]
    pub fn from_chunk_type(chunk_type: u64) -> Self {
        if chunk_type & BTRFS_BLOCK_GROUP_RAID0 != 0 {
            Self::Raid0
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID1 != 0 {
            Self::Raid1
        } else if chunk_type & BTRFS_BLOCK_GROUP_DUP != 0 {
            Self::Dup
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID10 != 0 {
            Self::Raid10
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID5 != 0 {
            Self::Raid5
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID6 != 0 {
            Self::Raid6
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID1C3 != 0 {
            Self::Raid1c3
        } else if chunk_type & BTRFS_BLOCK_GROUP_RAID1C4 != 0 {
            Self::Raid1c4
        } else {
            Self::Single
        }
    }

    /// Whether this tool can translate addresses for the profile.
    /// Striped profiles (RAID 0/10/5/6) are rejected.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            Self::Single | Self::Dup | Self::Raid1 | Self::Raid1c3 | Self::Raid1c4
        )
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Single => "SINGLE",
            Self::Raid0 => "RAID0",
            Self::Raid1 => "RAID1",
            Self::Dup => "DUP",
            Self::Raid10 => "RAID10",
            Self::Raid5 => "RAID5",
            Self::Raid6 => "RAID6",
            Self::Raid1c3 => "RAID1C3",
            Self::Raid1c4 => "RAID1C4",
        };
        f.write_str(name)
    }
}

// ── Device extents ──────────────────────────────────────────────────────────

/// A `btrfs_dev_extent` payload: ownership of a physical range by a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
}

pub fn parse_dev_extent(data: &[u8]) -> Result<DevExtent, ParseError> {
    if data.len() < BTRFS_DEV_EXTENT_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_DEV_EXTENT_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    Ok(DevExtent {
        chunk_tree: read_le_u64(data, 0)?,
        chunk_objectid: read_le_u64(data, 8)?,
        chunk_offset: read_le_u64(data, 16)?,
        length: read_le_u64(data, 24)?,
    })
}

// ── Root items ──────────────────────────────────────────────────────────────

/// The subset of `btrfs_root_item` needed to bootstrap a tree walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItemRef {
    /// Logical address of the tree root block.
    pub bytenr: u64,
    pub generation: u64,
    pub level: u8,
}

/// Parse the root-item fields at their fixed offsets: generation at 160,
/// bytenr at 176, level at 238 (after `drop_progress` and `drop_level`).
pub fn parse_root_item(data: &[u8]) -> Result<RootItemRef, ParseError> {
    if data.len() < BTRFS_ROOT_ITEM_MIN_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_ROOT_ITEM_MIN_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    let bytenr = read_le_u64(data, 176)?;
    if bytenr == 0 {
        return Err(ParseError::InvalidField {
            field: "root_item.bytenr",
            reason: "must be non-zero",
        });
    }

    Ok(RootItemRef {
        bytenr,
        generation: read_le_u64(data, 160)?,
        level: data[238],
    })
}

// ── Free-space info ─────────────────────────────────────────────────────────

/// A `btrfs_free_space_info` payload: the free-space tree's own summary
/// of one block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: u32,
}

pub fn parse_free_space_info(data: &[u8]) -> Result<FreeSpaceInfo, ParseError> {
    if data.len() < BTRFS_FREE_SPACE_INFO_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_FREE_SPACE_INFO_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    Ok(FreeSpaceInfo {
        extent_count: read_le_u32(data, 0)?,
        flags: read_le_u32(data, 4)?,
    })
}
