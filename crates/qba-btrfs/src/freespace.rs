//! Free-space-tree analysis: per-chunk allocated/free timelines.
//!
//! Decodes both free-space representations (explicit extents and
//! LSB-first bitmaps), assigns each free range to its owning chunk, and
//! builds per-chunk timelines that alternate allocated and free
//! intervals, covering each chunk exactly. Logical addresses are then
//! translated to physical ones through the chunk's primary stripe.

use crate::chunk::ChunkTable;
use crate::report::{AuditReport, Diagnostic};
use crate::tree::{NodeExpectation, TreeReader};
use qba_error::{AuditError, Result};
use qba_ondisk::{FreeSpaceInfo, RootItemRef, parse_free_space_info};
use qba_types::{
    BTRFS_FREE_SPACE_TREE_OBJECTID, BTRFS_ITEM_FREE_SPACE_BITMAP, BTRFS_ITEM_FREE_SPACE_EXTENT,
    BTRFS_ITEM_FREE_SPACE_INFO,
};
use std::collections::BTreeMap;
use tracing::debug;

/// One interval of a per-chunk space timeline, in both address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    pub log_address: u64,
    pub phys_address: u64,
    pub length: u64,
    /// `true` = allocated (in use), `false` = free.
    pub alloc: bool,
}

/// Analysis output: a complete timeline for every chunk in the table.
#[derive(Debug, Default)]
pub struct FreeSpaceTimelines {
    pub by_chunk: BTreeMap<u64, Vec<SpaceEntry>>,
}

/// Raw decoded content of the free-space tree.
#[derive(Debug, Default)]
struct FstContent {
    /// (logical_start, length) free ranges in key order.
    free: Vec<(u64, u64)>,
    /// FREE_SPACE_INFO payloads keyed by block-group start.
    info: BTreeMap<u64, FreeSpaceInfo>,
}

/// Decode set-bit runs from a free-space bitmap payload.
///
/// Bit `i` (LSB-first within each byte) covers `sectorsize` bytes at
/// `start + i * sectorsize`; a set bit means free.
fn bitmap_runs(start: u64, payload: &[u8], sectorsize: u32, out: &mut Vec<(u64, u64)>) {
    let sectorsize = u64::from(sectorsize);
    let mut run_start: Option<u64> = None;
    let mut bit_index: u64 = 0;

    for byte in payload {
        for bit in 0..8 {
            let set = byte & (1 << bit) != 0;
            match (set, run_start) {
                (true, None) => run_start = Some(bit_index),
                (false, Some(first)) => {
                    out.push((
                        start + first * sectorsize,
                        (bit_index - first) * sectorsize,
                    ));
                    run_start = None;
                }
                _ => {}
            }
            bit_index += 1;
        }
    }
    if let Some(first) = run_start {
        out.push((start + first * sectorsize, (bit_index - first) * sectorsize));
    }
}

/// Walk the free-space tree, decoding every representation.
fn collect_fst(reader: &TreeReader<'_>, fst_root: &RootItemRef, sectorsize: u32) -> Result<FstContent> {
    let exp = NodeExpectation {
        level: fst_root.level,
        generation: fst_root.generation,
        owner: BTRFS_FREE_SPACE_TREE_OBJECTID,
    };

    let mut content = FstContent::default();
    reader.walk(fst_root.bytenr, &exp, &mut |key, payload| {
        match key.item_type {
            BTRFS_ITEM_FREE_SPACE_EXTENT => {
                content.free.push((key.objectid, key.offset));
            }
            BTRFS_ITEM_FREE_SPACE_BITMAP => {
                bitmap_runs(key.objectid, payload, sectorsize, &mut content.free);
            }
            BTRFS_ITEM_FREE_SPACE_INFO => {
                content.info.insert(key.objectid, parse_free_space_info(payload)?);
            }
            _ => {}
        }
        Ok(true)
    })?;

    debug!(
        free_ranges = content.free.len(),
        block_groups = content.info.len(),
        "free space tree walked"
    );
    Ok(content)
}

/// Assign free ranges to chunks and build alternating timelines.
fn build_timelines(
    content: &FstContent,
    chunks: &ChunkTable,
    report: &mut AuditReport,
) -> Result<FreeSpaceTimelines> {
    // Free ranges bucketed by chunk logical start, preserving key order.
    let mut free_by_chunk: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
    let mut found_by_chunk: BTreeMap<u64, u32> = BTreeMap::new();

    for &(start, length) in &content.free {
        if length == 0 {
            return Err(AuditError::Integrity(format!(
                "zero-length free space entry at {start:x}"
            )));
        }
        let Ok(chunk) = chunks.find(start) else {
            report.push(Diagnostic::OrphanFreeSpace { start, length });
            continue;
        };
        let end = start.checked_add(length).ok_or_else(|| {
            AuditError::Integrity(format!(
                "free space entry at {start:x} overflows the logical address space"
            ))
        })?;
        if end > chunk.end() {
            return Err(AuditError::Integrity(format!(
                "free space entry {start:x}, {length:x} crosses the end of its chunk at {:x}",
                chunk.end()
            )));
        }
        free_by_chunk.entry(chunk.logical).or_default().push((start, length));
        *found_by_chunk.entry(chunk.logical).or_default() += 1;
    }

    // Cross-check against the tree's own per-block-group extent counts.
    for (&chunk_start, info) in &content.info {
        let found = found_by_chunk.get(&chunk_start).copied().unwrap_or(0);
        if info.extent_count != found {
            report.push(Diagnostic::FreeSpaceCountMismatch {
                chunk: chunk_start,
                declared: info.extent_count,
                found,
            });
        }
    }

    // Every chunk gets a timeline; no free entries means fully allocated.
    let mut timelines = FreeSpaceTimelines::default();
    for chunk in chunks.iter() {
        let mut entries = Vec::new();
        let mut cursor = chunk.logical;

        let free = free_by_chunk
            .get(&chunk.logical)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for &(start, length) in free {
            if start < cursor {
                return Err(AuditError::Integrity(format!(
                    "free space entries overlap at {start:x} in chunk {:x}",
                    chunk.logical
                )));
            }
            if start > cursor {
                entries.push(space_entry(chunk, cursor, start - cursor, true));
            }
            entries.push(space_entry(chunk, start, length, false));
            cursor = start + length;
        }
        if cursor < chunk.end() {
            entries.push(space_entry(chunk, cursor, chunk.end() - cursor, true));
        }

        timelines.by_chunk.insert(chunk.logical, entries);
    }

    Ok(timelines)
}

fn space_entry(
    chunk: &crate::chunk::ChunkDescriptor,
    log_address: u64,
    length: u64,
    alloc: bool,
) -> SpaceEntry {
    SpaceEntry {
        log_address,
        phys_address: chunk.logical_to_physical(log_address),
        length,
        alloc,
    }
}

/// Run the full free-space-tree analysis.
pub fn analyse(
    reader: &TreeReader<'_>,
    fst_root: &RootItemRef,
    sectorsize: u32,
    chunks: &ChunkTable,
    report: &mut AuditReport,
) -> Result<FreeSpaceTimelines> {
    let content = collect_fst(reader, fst_root, sectorsize)?;
    build_timelines(&content, chunks, report)
}
