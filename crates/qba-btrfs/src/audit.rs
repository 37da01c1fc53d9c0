//! The audit pipeline: superblock selection through reconciliation.

use crate::chunk::{self, ChunkTable};
use crate::device;
use crate::freespace;
use crate::reconcile;
use crate::report::AuditReport;
use crate::tree::{NodeExpectation, TreeReader};
use qba_error::{AuditError, Result};
use qba_image::{QcowSegment, VirtualRead};
use qba_ondisk::{Key, RootItemRef, Superblock, csum, parse_root_item};
use qba_types::{
    BTRFS_DEV_TREE_OBJECTID, BTRFS_FREE_SPACE_TREE_OBJECTID, BTRFS_ITEM_ROOT_ITEM,
    BTRFS_ROOT_TREE_OBJECTID, BTRFS_SUPER_INFO_SIZE, BTRFS_SUPERBLOCK_ADDRS,
};
use tracing::{debug, info, warn};

/// Load the superblock, following the mirror rule: every slot that fits
/// in the device is read, copies with a valid checksum, magic, and
/// self-address participate, and the highest generation wins.
pub fn load_superblock(dev: &dyn VirtualRead) -> Result<Superblock> {
    let mut best: Option<Superblock> = None;

    for addr in BTRFS_SUPERBLOCK_ADDRS {
        let Some(end) = addr.checked_add(BTRFS_SUPER_INFO_SIZE as u64) else {
            continue;
        };
        if end > dev.len_bytes() {
            continue;
        }

        let mut region = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
        dev.read_at(addr, &mut region)?;

        match load_superblock_copy(&region, addr) {
            Ok(sb) => {
                debug!(
                    addr = format_args!("{addr:x}"),
                    generation = sb.generation,
                    "superblock copy is valid"
                );
                if best.as_ref().is_none_or(|b| sb.generation > b.generation) {
                    best = Some(sb);
                }
            }
            Err(err) => {
                debug!(addr = format_args!("{addr:x}"), %err, "superblock copy rejected");
            }
        }
    }

    best.ok_or_else(|| {
        AuditError::Integrity("no superblock copy validates at any known offset".to_owned())
    })
}

fn load_superblock_copy(region: &[u8], addr: u64) -> Result<Superblock> {
    csum::verify_superblock(region)?;
    let sb = Superblock::parse(region)?;
    if sb.bytenr != addr {
        return Err(AuditError::Integrity(format!(
            "superblock at {addr:x} claims bytenr {:x}",
            sb.bytenr
        )));
    }
    Ok(sb)
}

/// Look up a tree's root item in the root tree.
fn find_tree_root(
    reader: &TreeReader<'_>,
    sb: &Superblock,
    tree_objectid: u64,
) -> Result<Option<RootItemRef>> {
    let exp = NodeExpectation {
        level: sb.root_level,
        generation: sb.generation,
        owner: BTRFS_ROOT_TREE_OBJECTID,
    };
    let target = Key::new(tree_objectid, BTRFS_ITEM_ROOT_ITEM, 0);

    let mut root = None;
    reader.find_item(sb.root, &exp, target, &mut |payload| {
        root = Some(parse_root_item(payload)?);
        Ok(())
    })?;
    Ok(root)
}

/// Run the whole audit over an opened image and its segment list.
///
/// Structural failures return `Err`; discrepancies accumulate in the
/// returned report.
pub fn audit_image(dev: &dyn VirtualRead, segments: &[QcowSegment]) -> Result<AuditReport> {
    let device_size = segments
        .last()
        .map(QcowSegment::end)
        .ok_or_else(|| AuditError::Map("qcow map has no segments".to_owned()))?;

    let sb = load_superblock(dev)?;
    if sb.num_devices != 1 {
        return Err(AuditError::Unsupported(format!(
            "filesystem spans {} devices, only single-device images are audited",
            sb.num_devices
        )));
    }
    if sb.total_bytes != device_size {
        warn!(
            total_bytes = format_args!("{:x}", sb.total_bytes),
            device_size = format_args!("{device_size:x}"),
            "superblock total_bytes disagrees with the qcow virtual size"
        );
    }
    info!(
        generation = sb.generation,
        nodesize = sb.nodesize,
        sectorsize = sb.sectorsize,
        "superblock loaded"
    );

    let bootstrap = ChunkTable::from_sys_chunk_array(&sb)?;
    let chunks = chunk::load_chunk_table(dev, &sb, &bootstrap)?;
    let reader = TreeReader::new(dev, &chunks, &sb);

    let mut report = AuditReport::new();

    let dev_root = find_tree_root(&reader, &sb, BTRFS_DEV_TREE_OBJECTID)?
        .ok_or_else(|| AuditError::NotFound("device tree root item".to_owned()))?;
    let timelines = device::analyse(
        &reader,
        &dev_root,
        segments,
        &chunks,
        device_size,
        &mut report,
    )?;

    if !sb.has_free_space_tree() {
        warn!("not analysing free space as filesystem is not using free space tree");
        return Ok(report);
    }

    let fst_root = find_tree_root(&reader, &sb, BTRFS_FREE_SPACE_TREE_OBJECTID)?
        .ok_or_else(|| AuditError::NotFound("free space tree root item".to_owned()))?;
    let space = freespace::analyse(&reader, &fst_root, sb.sectorsize, &chunks, &mut report)?;

    for (chunk_logical, dev_slice) in &timelines.by_chunk {
        let space_timeline = space.by_chunk.get(chunk_logical).ok_or_else(|| {
            AuditError::Integrity(format!(
                "no free-space timeline for chunk {chunk_logical:x}"
            ))
        })?;
        reconcile::reconcile_chunk(*chunk_logical, dev_slice, space_timeline, &mut report)?;
    }

    Ok(report)
}
