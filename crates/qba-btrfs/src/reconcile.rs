//! Reconciliation: per-chunk lockstep sweep of the device-merged
//! intervals against the free-space timeline.
//!
//! Both inputs cover the chunk's physical range exactly and in order.
//! Each overlap is classified (superblock slots stay superblock,
//! otherwise the free-space state decides used/free) and the two
//! discrepancy classes are emitted: host-backed-but-free (leak) and
//! discarded-but-used (data loss).

use crate::device::{MergedAlloc, MergedExtent};
use crate::freespace::SpaceEntry;
use crate::report::{AuditReport, Diagnostic};
use qba_error::{AuditError, Result};

/// Sweep one chunk. `device` is the chunk's slice of the device-merged
/// vector; `space` is its free-space timeline.
pub fn reconcile_chunk(
    chunk_logical: u64,
    device: &[MergedExtent],
    space: &[SpaceEntry],
    report: &mut AuditReport,
) -> Result<()> {
    let mut di = device.iter().copied();
    let mut si = space.iter().copied();
    let mut d = di.next();
    let mut s = si.next();

    while let (Some(de), Some(se)) = (d, s) {
        if de.offset != se.phys_address {
            return Err(AuditError::Integrity(format!(
                "chunk {chunk_logical:x}: device timeline at {:x} out of step with \
                 free-space timeline at {:x}",
                de.offset, se.phys_address
            )));
        }

        let length = de.length.min(se.length);
        let tag = if de.alloc == MergedAlloc::Superblock {
            MergedAlloc::Superblock
        } else if se.alloc {
            MergedAlloc::ChunkUsed
        } else {
            MergedAlloc::ChunkFree
        };

        match tag {
            MergedAlloc::ChunkFree if de.qcow_alloc => {
                report.push(Diagnostic::AllocatedButFree {
                    offset: de.offset,
                    length,
                    address: de.address,
                });
            }
            MergedAlloc::ChunkUsed if !de.qcow_alloc => {
                report.push(Diagnostic::DiscardedButUsed {
                    offset: de.offset,
                    length,
                    address: de.address,
                });
            }
            _ => {}
        }

        d = advance_device(de, length).or_else(|| di.next());
        s = advance_space(se, length).or_else(|| si.next());
    }

    if d.is_some() || s.is_some() {
        return Err(AuditError::Integrity(format!(
            "chunk {chunk_logical:x}: device and free-space timelines cover different ranges"
        )));
    }
    Ok(())
}

fn advance_device(mut ext: MergedExtent, consumed: u64) -> Option<MergedExtent> {
    if consumed == ext.length {
        return None;
    }
    ext.offset += consumed;
    ext.length -= consumed;
    if ext.alloc == MergedAlloc::Chunk {
        ext.address += consumed;
    }
    Some(ext)
}

fn advance_space(mut entry: SpaceEntry, consumed: u64) -> Option<SpaceEntry> {
    if consumed == entry.length {
        return None;
    }
    entry.phys_address += consumed;
    entry.log_address += consumed;
    entry.length -= consumed;
    Some(entry)
}
