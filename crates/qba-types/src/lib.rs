#![forbid(unsafe_code)]
//! Shared constants and binary decoding primitives for qba.
//!
//! Everything here is consumed by the on-disk parsers and the analysers:
//! btrfs format constants, the `ParseError` taxonomy, and bounds-checked
//! little-endian read helpers. On-disk structures are tightly packed, so
//! nothing in this crate assumes natural alignment.

use thiserror::Error;

/// btrfs superblock magic (`_BHRfS_M` little-endian).
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Size of one superblock copy on disk.
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

/// Width of the on-disk checksum field (superblock and tree-node header).
pub const BTRFS_CSUM_SIZE: usize = 32;

/// The four fixed physical addresses where superblock copies live.
/// Only the copies that fit inside the device are present.
pub const BTRFS_SUPERBLOCK_ADDRS: [u64; 4] =
    [0x1_0000, 0x400_0000, 0x40_0000_0000, 0x4_0000_0000_0000];

/// The first megabyte of the device is reserved by the format; host
/// allocation there is expected and never a leak.
pub const BTRFS_DEVICE_RANGE_RESERVED: u64 = 0x10_0000;

/// Upper bound on the embedded system chunk array (bytes).
pub const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;

/// Maximum stripes per chunk this tool translates (single-copy audit).
pub const BTRFS_MAX_STRIPES: u16 = 2;

// ── Checksum algorithm tags (superblock `csum_type`) ────────────────────────

pub const BTRFS_CSUM_TYPE_CRC32C: u16 = 0;
pub const BTRFS_CSUM_TYPE_XXHASH64: u16 = 1;
pub const BTRFS_CSUM_TYPE_SHA256: u16 = 2;
pub const BTRFS_CSUM_TYPE_BLAKE2B: u16 = 3;

// ── Read-only compat flags (superblock `compat_ro_flags`) ───────────────────

pub const BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE: u64 = 1 << 0;
pub const BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID: u64 = 1 << 1;
pub const BTRFS_FEATURE_COMPAT_RO_VERITY: u64 = 1 << 2;
pub const BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE: u64 = 1 << 3;

// ── Block group type flags (chunk `type`) ───────────────────────────────────

pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BTRFS_BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
pub const BTRFS_BLOCK_GROUP_RAID1C4: u64 = 1 << 10;

// ── Item type tags (key `type`) ─────────────────────────────────────────────

pub const BTRFS_ITEM_ROOT_ITEM: u8 = 0x84;
pub const BTRFS_ITEM_FREE_SPACE_INFO: u8 = 0xC6;
pub const BTRFS_ITEM_FREE_SPACE_EXTENT: u8 = 0xC7;
pub const BTRFS_ITEM_FREE_SPACE_BITMAP: u8 = 0xC8;
pub const BTRFS_ITEM_DEV_EXTENT: u8 = 0xCC;
pub const BTRFS_ITEM_DEV_ITEM: u8 = 0xD8;
pub const BTRFS_ITEM_CHUNK_ITEM: u8 = 0xE4;

// ── Well-known object IDs ───────────────────────────────────────────────────

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;
/// objectid shared by DEV_ITEM entries and dev-extent keys on device 1.
pub const BTRFS_DEV_ITEMS_OBJECTID: u64 = 1;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Bounds-checked little-endian readers ────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
