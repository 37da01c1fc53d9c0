//! Device-tree analysis: the physical-device allocation timeline.
//!
//! Enumerates dev extents, fills unallocated holes, carves out the four
//! fixed superblock slots, coalesces the qcow segment list, and merges
//! the two timelines in lockstep. The result is grouped by owning chunk;
//! intervals outside every chunk land in an external bucket that is
//! checked here for the chunk-external discrepancy classes.

use crate::chunk::ChunkTable;
use crate::report::{AuditReport, Diagnostic};
use crate::tree::{NodeExpectation, TreeReader};
use qba_error::{AuditError, Result};
use qba_image::QcowSegment;
use qba_ondisk::{RootItemRef, parse_dev_extent};
use qba_types::{
    BTRFS_DEV_ITEMS_OBJECTID, BTRFS_DEV_TREE_OBJECTID, BTRFS_DEVICE_RANGE_RESERVED,
    BTRFS_ITEM_DEV_EXTENT, BTRFS_SUPER_INFO_SIZE, BTRFS_SUPERBLOCK_ADDRS,
};
use std::collections::BTreeMap;
use tracing::debug;

/// How the filesystem accounts for a physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrfsAlloc {
    Unallocated,
    Superblock,
    Chunk,
}

/// One interval of the physical-device timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsExtent {
    pub offset: u64,
    pub length: u64,
    pub alloc: BtrfsAlloc,
    /// Logical address for `Chunk` intervals (and superblock slots carved
    /// out of them); zero otherwise.
    pub address: u64,
}

impl BtrfsExtent {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One interval of the qcow allocation timeline (`alloc = !zero`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QcowExtent {
    pub offset: u64,
    pub length: u64,
    pub alloc: bool,
}

/// Filesystem tag of a merged interval. `ChunkUsed`/`ChunkFree` appear
/// only after reconciliation against the free-space timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergedAlloc {
    Unallocated,
    Superblock,
    Chunk,
    ChunkUsed,
    ChunkFree,
}

/// One interval carrying both views of the same physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedExtent {
    pub offset: u64,
    pub length: u64,
    pub qcow_alloc: bool,
    pub alloc: MergedAlloc,
    pub address: u64,
}

/// Analysis output: merged intervals grouped by owning chunk, plus the
/// chunk-external bucket.
#[derive(Debug, Default)]
pub struct DeviceTimelines {
    pub external: Vec<MergedExtent>,
    pub by_chunk: BTreeMap<u64, Vec<MergedExtent>>,
}

/// A dev extent as read from the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDevExtent {
    pub physical: u64,
    pub length: u64,
    pub chunk_offset: u64,
}

/// Walk the device tree and collect dev extents in physical order.
pub fn collect_dev_extents(
    reader: &TreeReader<'_>,
    dev_root: &RootItemRef,
) -> Result<Vec<RawDevExtent>> {
    let exp = NodeExpectation {
        level: dev_root.level,
        generation: dev_root.generation,
        owner: BTRFS_DEV_TREE_OBJECTID,
    };

    let mut extents = Vec::new();
    reader.walk(dev_root.bytenr, &exp, &mut |key, payload| {
        if key.item_type == BTRFS_ITEM_DEV_EXTENT && key.objectid == BTRFS_DEV_ITEMS_OBJECTID {
            let extent = parse_dev_extent(payload)?;
            extents.push(RawDevExtent {
                physical: key.offset,
                length: extent.length,
                chunk_offset: extent.chunk_offset,
            });
        }
        Ok(true)
    })?;

    debug!(dev_extents = extents.len(), "device tree walked");
    Ok(extents)
}

/// Build the full-device timeline: dev extents plus `Unallocated` fillers
/// so the intervals cover `[0, device_size)` exactly.
pub fn device_timeline(extents: &[RawDevExtent], device_size: u64) -> Result<Vec<BtrfsExtent>> {
    let mut timeline = Vec::with_capacity(extents.len() * 2 + 1);
    let mut cursor = 0_u64;

    for extent in extents {
        if extent.length == 0 {
            return Err(AuditError::Integrity(format!(
                "zero-length device extent at {:x}",
                extent.physical
            )));
        }
        if extent.physical < cursor {
            return Err(AuditError::Integrity(format!(
                "device extent at {:x} overlaps the previous extent ending at {cursor:x}",
                extent.physical
            )));
        }
        let end = extent.physical.checked_add(extent.length).ok_or_else(|| {
            AuditError::Integrity(format!(
                "device extent at {:x} overflows the device address space",
                extent.physical
            ))
        })?;
        if end > device_size {
            return Err(AuditError::Integrity(format!(
                "device extent at {:x}, {:x} extends past the device end {device_size:x}",
                extent.physical, extent.length
            )));
        }

        if extent.physical > cursor {
            timeline.push(BtrfsExtent {
                offset: cursor,
                length: extent.physical - cursor,
                alloc: BtrfsAlloc::Unallocated,
                address: 0,
            });
        }
        timeline.push(BtrfsExtent {
            offset: extent.physical,
            length: extent.length,
            alloc: BtrfsAlloc::Chunk,
            address: extent.chunk_offset,
        });
        cursor = end;
    }

    if cursor < device_size {
        timeline.push(BtrfsExtent {
            offset: cursor,
            length: device_size - cursor,
            alloc: BtrfsAlloc::Unallocated,
            address: 0,
        });
    }

    Ok(timeline)
}

/// Split out the fixed superblock slots as dedicated intervals.
///
/// Each slot that fits in the device and lies wholly within one interval
/// becomes a 4096-byte `Superblock` interval between (up to) two
/// remainders of the original. Slots carved out of a chunk interval keep
/// a translated logical address; slots in unallocated space carry zero.
pub fn carve_superblocks(timeline: Vec<BtrfsExtent>, device_size: u64) -> Vec<BtrfsExtent> {
    let slot_len = BTRFS_SUPER_INFO_SIZE as u64;
    let mut timeline = timeline;

    for addr in BTRFS_SUPERBLOCK_ADDRS {
        let Some(slot_end) = addr.checked_add(slot_len) else {
            continue;
        };
        if slot_end > device_size {
            continue;
        }

        let Some(idx) = timeline
            .iter()
            .position(|ext| ext.offset <= addr && slot_end <= ext.end())
        else {
            continue;
        };

        let original = timeline[idx];
        let mut replacement = Vec::with_capacity(3);
        if addr > original.offset {
            replacement.push(BtrfsExtent {
                offset: original.offset,
                length: addr - original.offset,
                ..original
            });
        }
        let slot_address = match original.alloc {
            BtrfsAlloc::Chunk => original.address + (addr - original.offset),
            _ => 0,
        };
        replacement.push(BtrfsExtent {
            offset: addr,
            length: slot_len,
            alloc: BtrfsAlloc::Superblock,
            address: slot_address,
        });
        if slot_end < original.end() {
            let tail_address = match original.alloc {
                BtrfsAlloc::Chunk => original.address + (slot_end - original.offset),
                _ => original.address,
            };
            replacement.push(BtrfsExtent {
                offset: slot_end,
                length: original.end() - slot_end,
                alloc: original.alloc,
                address: tail_address,
            });
        }
        timeline.splice(idx..=idx, replacement);
    }

    timeline
}

/// Collapse consecutive qcow segments with the same allocation state.
pub fn coalesce_segments(segments: &[QcowSegment]) -> Vec<QcowExtent> {
    let mut out: Vec<QcowExtent> = Vec::new();
    for seg in segments {
        let alloc = seg.allocated();
        match out.last_mut() {
            Some(prev) if prev.alloc == alloc => prev.length += seg.length,
            _ => out.push(QcowExtent {
                offset: seg.start,
                length: seg.length,
                alloc,
            }),
        }
    }
    out
}

/// Lockstep merge of the device and qcow timelines.
///
/// Both inputs must cover the same `[0, device_size)` range. Each output
/// interval is the overlap of the current pair; the side that ends first
/// advances, and a split `Chunk` interval advances its logical address by
/// the consumed amount.
pub fn merge_timelines(device: &[BtrfsExtent], qcow: &[QcowExtent]) -> Result<Vec<MergedExtent>> {
    let mut out = Vec::new();
    let mut di = device.iter().copied();
    let mut qi = qcow.iter().copied();
    let mut d = di.next();
    let mut q = qi.next();

    while let (Some(de), Some(qe)) = (d, q) {
        if de.offset != qe.offset {
            return Err(AuditError::Integrity(format!(
                "device and qcow timelines diverge: {:x} vs {:x}",
                de.offset, qe.offset
            )));
        }

        let length = de.length.min(qe.length);
        out.push(MergedExtent {
            offset: de.offset,
            length,
            qcow_alloc: qe.alloc,
            alloc: match de.alloc {
                BtrfsAlloc::Unallocated => MergedAlloc::Unallocated,
                BtrfsAlloc::Superblock => MergedAlloc::Superblock,
                BtrfsAlloc::Chunk => MergedAlloc::Chunk,
            },
            address: de.address,
        });

        d = advance_device(de, length).or_else(|| di.next());
        q = advance_qcow(qe, length).or_else(|| qi.next());
    }

    if d.is_some() || q.is_some() {
        return Err(AuditError::Integrity(
            "device and qcow timelines cover different ranges".to_owned(),
        ));
    }
    Ok(out)
}

fn advance_device(mut ext: BtrfsExtent, consumed: u64) -> Option<BtrfsExtent> {
    if consumed == ext.length {
        return None;
    }
    ext.offset += consumed;
    ext.length -= consumed;
    if ext.alloc == BtrfsAlloc::Chunk {
        ext.address += consumed;
    }
    Some(ext)
}

fn advance_qcow(mut ext: QcowExtent, consumed: u64) -> Option<QcowExtent> {
    if consumed == ext.length {
        return None;
    }
    ext.offset += consumed;
    ext.length -= consumed;
    Some(ext)
}

/// Group merged intervals by owning chunk; everything outside a chunk
/// goes to the external bucket.
pub fn group_by_chunk(merged: Vec<MergedExtent>, chunks: &ChunkTable) -> Result<DeviceTimelines> {
    let mut timelines = DeviceTimelines::default();

    for ext in merged {
        let in_chunk = matches!(ext.alloc, MergedAlloc::Chunk)
            || (matches!(ext.alloc, MergedAlloc::Superblock) && ext.address != 0);
        if in_chunk {
            let chunk = chunks.find(ext.address).map_err(|_| {
                AuditError::Integrity(format!(
                    "device extent interval at {:x} references unknown chunk address {:x}",
                    ext.offset, ext.address
                ))
            })?;
            timelines.by_chunk.entry(chunk.logical).or_default().push(ext);
        } else {
            timelines.external.push(ext);
        }
    }

    Ok(timelines)
}

/// Chunk-external discrepancy checks.
///
/// Host allocation below the reserved first megabyte is expected and is
/// suppressed or trimmed; the superblock-backing check is not subject to
/// the reservation.
pub fn report_external(external: &[MergedExtent], report: &mut AuditReport) {
    for ext in external {
        match ext.alloc {
            MergedAlloc::Superblock if !ext.qcow_alloc => {
                report.push(Diagnostic::SuperblockNotAllocated { offset: ext.offset });
            }
            MergedAlloc::Unallocated if ext.qcow_alloc => {
                let end = ext.offset + ext.length;
                if end <= BTRFS_DEVICE_RANGE_RESERVED {
                    continue;
                }
                let start = ext.offset.max(BTRFS_DEVICE_RANGE_RESERVED);
                report.push(Diagnostic::AllocatedOutsideChunks {
                    offset: start,
                    length: end - start,
                });
            }
            _ => {}
        }
    }
}

/// Run the full device-tree analysis.
pub fn analyse(
    reader: &TreeReader<'_>,
    dev_root: &RootItemRef,
    segments: &[QcowSegment],
    chunks: &ChunkTable,
    device_size: u64,
    report: &mut AuditReport,
) -> Result<DeviceTimelines> {
    let extents = collect_dev_extents(reader, dev_root)?;
    let timeline = device_timeline(&extents, device_size)?;
    let timeline = carve_superblocks(timeline, device_size);
    let qcow = coalesce_segments(segments);
    let merged = merge_timelines(&timeline, &qcow)?;
    let timelines = group_by_chunk(merged, chunks)?;
    report_external(&timelines.external, report);
    Ok(timelines)
}
