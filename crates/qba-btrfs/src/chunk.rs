//! The chunk table: logical address space → physical device translation.
//!
//! Built in two phases. Phase A parses the superblock's embedded system
//! chunk array, which is just enough to read the chunk tree. Phase B
//! walks the chunk tree through a `TreeReader` backed by the phase-A
//! table and produces the authoritative table.

use crate::tree::{NodeExpectation, TreeReader};
use qba_error::{AuditError, Result};
use qba_image::VirtualRead;
use qba_ondisk::{ChunkItem, Key, RaidProfile, Stripe, parse_chunk, parse_sys_chunk_array};
use qba_types::{
    BTRFS_CHUNK_TREE_OBJECTID, BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_ITEM_CHUNK_ITEM,
    BTRFS_MAX_STRIPES,
};
use std::collections::BTreeMap;
use tracing::debug;

/// A validated chunk: one logical region mapped onto device stripes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Logical start address.
    pub logical: u64,
    pub length: u64,
    pub chunk_type: u64,
    pub profile: RaidProfile,
    /// Stripes sorted by physical offset, so the audited copy of a
    /// mirrored profile is deterministic.
    pub stripes: Vec<Stripe>,
}

impl ChunkDescriptor {
    /// Validate and convert a decoded chunk item keyed by `key`.
    ///
    /// The key's `offset` is the chunk's logical start. Striped profiles
    /// and stripe counts above the supported maximum are rejected.
    pub fn from_item(key: &Key, item: ChunkItem) -> Result<Self> {
        let logical = key.offset;
        let profile = item.profile();
        if !profile.is_supported() {
            return Err(AuditError::Unsupported(format!(
                "chunk at {logical:x} uses {profile} profile"
            )));
        }
        if item.num_stripes > BTRFS_MAX_STRIPES {
            return Err(AuditError::Unsupported(format!(
                "chunk at {logical:x} has {} stripes, supported maximum is {BTRFS_MAX_STRIPES}",
                item.num_stripes
            )));
        }
        if logical.checked_add(item.length).is_none() {
            return Err(AuditError::Integrity(format!(
                "chunk at {logical:x} overflows the logical address space"
            )));
        }

        let mut stripes = item.stripes;
        stripes.sort_by_key(|stripe| stripe.offset);

        Ok(Self {
            logical,
            length: item.length,
            chunk_type: item.chunk_type,
            profile,
            stripes,
        })
    }

    /// One past the last logical address of the chunk.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.logical + self.length
    }

    /// The stripe used for address translation (lowest physical offset).
    #[must_use]
    pub fn primary_stripe(&self) -> &Stripe {
        // from_item rejects zero-stripe chunks, so the array is non-empty.
        &self.stripes[0]
    }

    /// Translate a logical address inside this chunk to a physical one.
    #[must_use]
    pub fn logical_to_physical(&self, logical: u64) -> u64 {
        logical - self.logical + self.primary_stripe().offset
    }
}

/// Sorted, non-overlapping mapping from logical chunk start to descriptor.
#[derive(Debug, Clone, Default)]
pub struct ChunkTable {
    chunks: BTreeMap<u64, ChunkDescriptor>,
}

impl ChunkTable {
    /// Phase A: bootstrap table from the superblock's system chunk array.
    pub fn from_sys_chunk_array(sb: &qba_ondisk::Superblock) -> Result<Self> {
        let entries = parse_sys_chunk_array(&sb.sys_chunk_array)?;
        let mut table = Self::default();
        for (key, item) in entries {
            table.insert(ChunkDescriptor::from_item(&key, item)?)?;
        }
        if table.is_empty() {
            return Err(AuditError::Integrity(
                "superblock system chunk array is empty".to_owned(),
            ));
        }
        Ok(table)
    }

    /// Insert a chunk, rejecting overlap with its neighbours.
    pub fn insert(&mut self, chunk: ChunkDescriptor) -> Result<()> {
        if let Some((_, prev)) = self.chunks.range(..=chunk.logical).next_back() {
            if prev.end() > chunk.logical {
                return Err(AuditError::Integrity(format!(
                    "chunk at {:x} overlaps chunk at {:x}",
                    chunk.logical, prev.logical
                )));
            }
        }
        if let Some((next_start, _)) = self.chunks.range(chunk.logical..).next() {
            if chunk.end() > *next_start {
                return Err(AuditError::Integrity(format!(
                    "chunk at {:x} overlaps chunk at {next_start:x}",
                    chunk.logical
                )));
            }
        }
        self.chunks.insert(chunk.logical, chunk);
        Ok(())
    }

    /// Predecessor lookup: the chunk containing `address`.
    pub fn find(&self, address: u64) -> Result<&ChunkDescriptor> {
        self.chunks
            .range(..=address)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.end() > address)
            .ok_or_else(|| {
                AuditError::NotFound(format!("no chunk covers logical address {address:x}"))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkDescriptor> {
        self.chunks.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Phase B: walk the chunk tree (addressed through the bootstrap table)
/// and build the authoritative chunk table.
pub fn load_chunk_table(
    dev: &dyn VirtualRead,
    sb: &qba_ondisk::Superblock,
    bootstrap: &ChunkTable,
) -> Result<ChunkTable> {
    let reader = TreeReader::new(dev, bootstrap, sb);
    let exp = NodeExpectation {
        level: sb.chunk_root_level,
        generation: sb.chunk_root_generation,
        owner: BTRFS_CHUNK_TREE_OBJECTID,
    };

    let mut table = ChunkTable::default();
    reader.walk(sb.chunk_root, &exp, &mut |key, payload| {
        if key.item_type == BTRFS_ITEM_CHUNK_ITEM
            && key.objectid == BTRFS_FIRST_CHUNK_TREE_OBJECTID
        {
            let (item, _) = parse_chunk(payload, 0)?;
            table.insert(ChunkDescriptor::from_item(key, item)?)?;
        }
        Ok(true)
    })?;

    if table.is_empty() {
        return Err(AuditError::Integrity(
            "chunk tree contains no chunk items".to_owned(),
        ));
    }
    debug!(chunks = table.len(), "chunk table loaded");
    Ok(table)
}
