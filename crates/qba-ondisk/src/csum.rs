//! Checksum verification for superblocks and tree blocks.
//!
//! btrfs checksums cover everything after the 32-byte `csum` field. The
//! digest is stored at the start of that field; bytes past the digest
//! length are zero. Dispatch is on the superblock's `csum_type` tag:
//! CRC32C (0), XXHASH64 (1), SHA-256 (2), BLAKE2b-256 (3).

use blake2::Blake2b;
use blake2::digest::consts::U32;
use qba_types::{
    BTRFS_CSUM_SIZE, BTRFS_CSUM_TYPE_BLAKE2B, BTRFS_CSUM_TYPE_CRC32C, BTRFS_CSUM_TYPE_SHA256,
    BTRFS_CSUM_TYPE_XXHASH64, BTRFS_SUPER_INFO_SIZE, ParseError, read_le_u16,
};
use sha2::{Digest, Sha256};

use crate::BTRFS_HEADER_SIZE;

type Blake2b256 = Blake2b<U32>;

/// Digest length in bytes for a checksum type tag.
pub fn digest_len(csum_type: u16) -> Result<usize, ParseError> {
    match csum_type {
        BTRFS_CSUM_TYPE_CRC32C => Ok(4),
        BTRFS_CSUM_TYPE_XXHASH64 => Ok(8),
        BTRFS_CSUM_TYPE_SHA256 | BTRFS_CSUM_TYPE_BLAKE2B => Ok(32),
        _ => Err(ParseError::InvalidField {
            field: "csum_type",
            reason: "unknown checksum algorithm tag",
        }),
    }
}

/// Compute the checksum of `data` into a zero-padded 32-byte field.
pub fn compute(csum_type: u16, data: &[u8]) -> Result<[u8; BTRFS_CSUM_SIZE], ParseError> {
    let mut out = [0_u8; BTRFS_CSUM_SIZE];
    match csum_type {
        BTRFS_CSUM_TYPE_CRC32C => {
            out[..4].copy_from_slice(&crc32c::crc32c(data).to_le_bytes());
        }
        BTRFS_CSUM_TYPE_XXHASH64 => {
            out[..8].copy_from_slice(&xxhash_rust::xxh64::xxh64(data, 0).to_le_bytes());
        }
        BTRFS_CSUM_TYPE_SHA256 => {
            out.copy_from_slice(&Sha256::digest(data));
        }
        BTRFS_CSUM_TYPE_BLAKE2B => {
            out.copy_from_slice(&Blake2b256::digest(data));
        }
        _ => {
            return Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "unknown checksum algorithm tag",
            });
        }
    }
    Ok(out)
}

fn matches_stored(csum_type: u16, stored: &[u8], data: &[u8]) -> Result<bool, ParseError> {
    let len = digest_len(csum_type)?;
    let computed = compute(csum_type, data)?;
    Ok(stored[..len] == computed[..len])
}

/// Verify a 4096-byte superblock region. The algorithm tag is read from
/// the region itself; the checksum covers bytes `[0x20, 0x1000)`.
pub fn verify_superblock(region: &[u8]) -> Result<(), ParseError> {
    if region.len() < BTRFS_SUPER_INFO_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_SUPER_INFO_SIZE,
            offset: 0,
            actual: region.len(),
        });
    }

    let csum_type = read_le_u16(region, 0xC4)?;
    if !matches_stored(
        csum_type,
        &region[..BTRFS_CSUM_SIZE],
        &region[BTRFS_CSUM_SIZE..BTRFS_SUPER_INFO_SIZE],
    )? {
        return Err(ParseError::InvalidField {
            field: "superblock_csum",
            reason: "checksum mismatch",
        });
    }
    Ok(())
}

/// Verify a tree block (leaf or internal node). The checksum covers bytes
/// `[0x20, nodesize)`.
pub fn verify_tree_block(block: &[u8], csum_type: u16) -> Result<(), ParseError> {
    if block.len() < BTRFS_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }

    if !matches_stored(csum_type, &block[..BTRFS_CSUM_SIZE], &block[BTRFS_CSUM_SIZE..])? {
        return Err(ParseError::InvalidField {
            field: "tree_block_csum",
            reason: "checksum mismatch",
        });
    }
    Ok(())
}
