#![forbid(unsafe_code)]
//! End-to-end audits over a synthetic single-device btrfs image.
//!
//! The fixture builds a 128 MiB device containing a system chunk (with
//! the chunk, root, device, and free-space trees as single-leaf trees)
//! and one data chunk, then drives `audit_image` with per-scenario qcow
//! segment lists.

use qba_btrfs::audit_image;
use qba_image::{MemImage, QcowSegment};
use qba_ondisk::{BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, Key, csum};
use qba_types::{
    BTRFS_CSUM_TYPE_CRC32C, BTRFS_DEV_TREE_OBJECTID, BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
    BTRFS_FREE_SPACE_TREE_OBJECTID, BTRFS_ITEM_CHUNK_ITEM, BTRFS_ITEM_DEV_EXTENT,
    BTRFS_ITEM_FREE_SPACE_BITMAP, BTRFS_ITEM_FREE_SPACE_EXTENT, BTRFS_ITEM_FREE_SPACE_INFO,
    BTRFS_ITEM_ROOT_ITEM, BTRFS_MAGIC,
};

const DEVICE_SIZE: u64 = 0x800_0000; // 128 MiB
const NODESIZE: usize = 4096;
const SECTORSIZE: u32 = 4096;

const SB_GEN: u64 = 7;
const CHUNK_GEN: u64 = 4;
const DEV_GEN: u64 = 6;
const FST_GEN: u64 = 5;

// System chunk: trees live here.
const SYS_LOG: u64 = 0x100_0000;
const SYS_PHYS: u64 = 0x10_0000;
const SYS_LEN: u64 = 0x40_0000;
// Data chunk.
const DATA_LOG: u64 = 0x500_0000;
const DATA_PHYS: u64 = 0x100_0000;
const DATA_LEN: u64 = 0x100_0000;

// Single-leaf trees, one node apiece, at the start of the system chunk.
const CHUNK_ROOT_LOG: u64 = SYS_LOG;
const ROOT_TREE_LOG: u64 = SYS_LOG + 0x1000;
const DEV_TREE_LOG: u64 = SYS_LOG + 0x2000;
const FST_LOG: u64 = SYS_LOG + 0x3000;
/// Physical end of the metadata nodes (everything after is free).
const META_END_PHYS: u64 = SYS_PHYS + 0x4000;

fn log_to_phys(logical: u64) -> u64 {
    logical - SYS_LOG + SYS_PHYS
}

// ── On-disk builders ────────────────────────────────────────────────────────

fn chunk_payload(length: u64, chunk_type: u64, stripe_offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&2_u64.to_le_bytes()); // owner
    out.extend_from_slice(&0x1_0000_u64.to_le_bytes()); // stripe_len
    out.extend_from_slice(&chunk_type.to_le_bytes());
    out.extend_from_slice(&SECTORSIZE.to_le_bytes()); // io_align
    out.extend_from_slice(&SECTORSIZE.to_le_bytes()); // io_width
    out.extend_from_slice(&SECTORSIZE.to_le_bytes()); // sector_size
    out.extend_from_slice(&1_u16.to_le_bytes()); // num_stripes
    out.extend_from_slice(&0_u16.to_le_bytes()); // sub_stripes
    out.extend_from_slice(&1_u64.to_le_bytes()); // stripe.devid
    out.extend_from_slice(&stripe_offset.to_le_bytes());
    out.extend_from_slice(&[0_u8; 16]); // stripe.dev_uuid
    out
}

fn root_item_payload(bytenr: u64, generation: u64, level: u8) -> Vec<u8> {
    let mut out = vec![0_u8; 239];
    out[160..168].copy_from_slice(&generation.to_le_bytes());
    out[176..184].copy_from_slice(&bytenr.to_le_bytes());
    out[238] = level;
    out
}

fn dev_extent_payload(chunk_offset: u64, length: u64) -> Vec<u8> {
    let mut out = vec![0_u8; 48];
    out[0..8].copy_from_slice(&3_u64.to_le_bytes()); // chunk_tree
    out[8..16].copy_from_slice(&256_u64.to_le_bytes()); // chunk_objectid
    out[16..24].copy_from_slice(&chunk_offset.to_le_bytes());
    out[24..32].copy_from_slice(&length.to_le_bytes());
    out
}

fn free_space_info_payload(extent_count: u32) -> Vec<u8> {
    let mut out = vec![0_u8; 8];
    out[0..4].copy_from_slice(&extent_count.to_le_bytes());
    out
}

/// Assemble a leaf node with a correct checksum.
fn make_leaf(bytenr: u64, generation: u64, owner: u64, entries: &[(Key, Vec<u8>)]) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE];
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&generation.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&u32::try_from(entries.len()).unwrap().to_le_bytes());
    block[0x64] = 0; // leaf

    let mut payload_end = NODESIZE - BTRFS_HEADER_SIZE;
    for (idx, (key, payload)) in entries.iter().enumerate() {
        payload_end -= payload.len();
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
        block[base + 8] = key.item_type;
        block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
        block[base + 17..base + 21]
            .copy_from_slice(&u32::try_from(payload_end).unwrap().to_le_bytes());
        block[base + 21..base + 25]
            .copy_from_slice(&u32::try_from(payload.len()).unwrap().to_le_bytes());
        let start = BTRFS_HEADER_SIZE + payload_end;
        block[start..start + payload.len()].copy_from_slice(payload);
    }

    let digest = csum::compute(BTRFS_CSUM_TYPE_CRC32C, &block[32..]).unwrap();
    block[..32].copy_from_slice(&digest);
    block
}

/// Write a superblock copy at `addr` with the given compat_ro flags.
fn write_superblock(image: &mut [u8], addr: u64, compat_ro: u64) {
    let base = usize::try_from(addr).unwrap();
    let region = &mut image[base..base + 4096];
    region.fill(0);
    region[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
    region[0x30..0x38].copy_from_slice(&addr.to_le_bytes());
    region[0x48..0x50].copy_from_slice(&SB_GEN.to_le_bytes());
    region[0x50..0x58].copy_from_slice(&ROOT_TREE_LOG.to_le_bytes());
    region[0x58..0x60].copy_from_slice(&CHUNK_ROOT_LOG.to_le_bytes());
    region[0x70..0x78].copy_from_slice(&DEVICE_SIZE.to_le_bytes()); // total_bytes
    region[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes()); // num_devices
    region[0x90..0x94].copy_from_slice(&SECTORSIZE.to_le_bytes());
    region[0x94..0x98].copy_from_slice(&u32::try_from(NODESIZE).unwrap().to_le_bytes());
    region[0xA4..0xAC].copy_from_slice(&CHUNK_GEN.to_le_bytes());
    region[0xB4..0xBC].copy_from_slice(&compat_ro.to_le_bytes());
    region[0xC4..0xC6].copy_from_slice(&BTRFS_CSUM_TYPE_CRC32C.to_le_bytes());
    region[0xC6] = 0; // root_level
    region[0xC7] = 0; // chunk_root_level

    // sys_chunk_array: one entry for the system chunk.
    let mut entry = Vec::with_capacity(97);
    entry.extend_from_slice(&256_u64.to_le_bytes());
    entry.push(BTRFS_ITEM_CHUNK_ITEM);
    entry.extend_from_slice(&SYS_LOG.to_le_bytes());
    entry.extend_from_slice(&chunk_payload(SYS_LEN, 0x2, SYS_PHYS));
    region[0xA0..0xA4].copy_from_slice(&u32::try_from(entry.len()).unwrap().to_le_bytes());
    region[0x32B..0x32B + entry.len()].copy_from_slice(&entry);

    let digest = csum::compute(BTRFS_CSUM_TYPE_CRC32C, &region[32..]).unwrap();
    region[..32].copy_from_slice(&digest);
}

/// Free-space-tree leaf entries for the two chunks.
///
/// The system chunk always has one free extent: its tail after the tree
/// nodes. `data_entries` describes the data chunk: decoded free ranges
/// plus the declared extent count.
fn fst_entries(data_free: &[(Key, Vec<u8>)], data_extent_count: u32) -> Vec<(Key, Vec<u8>)> {
    let sys_free_start = SYS_LOG + (META_END_PHYS - SYS_PHYS);
    let sys_free_len = SYS_LEN - (META_END_PHYS - SYS_PHYS);

    let mut entries = vec![
        (
            Key::new(SYS_LOG, BTRFS_ITEM_FREE_SPACE_INFO, SYS_LEN),
            free_space_info_payload(1),
        ),
        (
            Key::new(sys_free_start, BTRFS_ITEM_FREE_SPACE_EXTENT, sys_free_len),
            Vec::new(),
        ),
        (
            Key::new(DATA_LOG, BTRFS_ITEM_FREE_SPACE_INFO, DATA_LEN),
            free_space_info_payload(data_extent_count),
        ),
    ];
    entries.extend_from_slice(data_free);
    entries
}

/// Build the device bytes: superblock(s), chunk tree, root tree, device
/// tree, and free-space tree, all as single leaves.
fn build_image(compat_ro: u64, fst_leaf_entries: &[(Key, Vec<u8>)], mirror_superblock: bool) -> MemImage {
    let mut image = vec![0_u8; usize::try_from(DEVICE_SIZE).unwrap()];

    write_superblock(&mut image, 0x1_0000, compat_ro);
    if mirror_superblock {
        write_superblock(&mut image, 0x400_0000, compat_ro);
    }

    let chunk_leaf = make_leaf(
        CHUNK_ROOT_LOG,
        CHUNK_GEN,
        3,
        &[
            (
                Key::new(256, BTRFS_ITEM_CHUNK_ITEM, SYS_LOG),
                chunk_payload(SYS_LEN, 0x2, SYS_PHYS),
            ),
            (
                Key::new(256, BTRFS_ITEM_CHUNK_ITEM, DATA_LOG),
                chunk_payload(DATA_LEN, 0x1, DATA_PHYS),
            ),
        ],
    );

    let root_leaf = make_leaf(
        ROOT_TREE_LOG,
        SB_GEN,
        1,
        &[
            (
                Key::new(BTRFS_DEV_TREE_OBJECTID, BTRFS_ITEM_ROOT_ITEM, 0),
                root_item_payload(DEV_TREE_LOG, DEV_GEN, 0),
            ),
            (
                Key::new(BTRFS_FREE_SPACE_TREE_OBJECTID, BTRFS_ITEM_ROOT_ITEM, 0),
                root_item_payload(FST_LOG, FST_GEN, 0),
            ),
        ],
    );

    let dev_leaf = make_leaf(
        DEV_TREE_LOG,
        DEV_GEN,
        BTRFS_DEV_TREE_OBJECTID,
        &[
            (
                Key::new(1, BTRFS_ITEM_DEV_EXTENT, SYS_PHYS),
                dev_extent_payload(SYS_LOG, SYS_LEN),
            ),
            (
                Key::new(1, BTRFS_ITEM_DEV_EXTENT, DATA_PHYS),
                dev_extent_payload(DATA_LOG, DATA_LEN),
            ),
        ],
    );

    let fst_leaf = make_leaf(
        FST_LOG,
        FST_GEN,
        BTRFS_FREE_SPACE_TREE_OBJECTID,
        fst_leaf_entries,
    );

    for (logical, leaf) in [
        (CHUNK_ROOT_LOG, chunk_leaf),
        (ROOT_TREE_LOG, root_leaf),
        (DEV_TREE_LOG, dev_leaf),
        (FST_LOG, fst_leaf),
    ] {
        let base = usize::try_from(log_to_phys(logical)).unwrap();
        image[base..base + NODESIZE].copy_from_slice(&leaf);
    }

    MemImage::new(image)
}

// ── Segment lists ───────────────────────────────────────────────────────────

/// Turn `(end, zero)` breakpoints into a contiguous segment list from 0.
fn segments(breaks: &[(u64, bool)]) -> Vec<QcowSegment> {
    let mut out = Vec::new();
    let mut start = 0_u64;
    for &(end, zero) in breaks {
        assert!(end > start, "segment breakpoints must ascend");
        out.push(QcowSegment {
            start,
            length: end - start,
            zero,
            offset: if zero { None } else { Some(start) },
        });
        start = end;
    }
    assert_eq!(start, DEVICE_SIZE, "segments must cover the device");
    out
}

/// Everything metadata-bearing backed, all free/unallocated space
/// discarded, both superblock slots backed.
fn clean_segments() -> Vec<QcowSegment> {
    segments(&[
        (META_END_PHYS, false),       // reserved MiB + sb 1 + tree nodes
        (DATA_PHYS, true),            // sys chunk free tail + gap
        (DATA_PHYS + DATA_LEN, false), // data chunk fully backed
        (0x400_0000, true),
        (0x400_1000, false), // second superblock slot
        (DEVICE_SIZE, true),
    ])
}

fn diag_lines(report: &qba_btrfs::AuditReport) -> Vec<String> {
    report.diagnostics.iter().map(ToString::to_string).collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn clean_image_reports_nothing() {
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let report = audit_image(&image, &clean_segments()).expect("audit");
    assert!(
        !report.errors_found(),
        "unexpected diagnostics: {:?}",
        diag_lines(&report)
    );
}

#[test]
fn rerun_is_deterministic() {
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(
            &[(
                Key::new(DATA_LOG + 0x80_0000, BTRFS_ITEM_FREE_SPACE_EXTENT, 0x10_0000),
                Vec::new(),
            )],
            1,
        ),
        false,
    );
    let first = audit_image(&image, &clean_segments()).expect("audit");
    let second = audit_image(&image, &clean_segments()).expect("audit");
    assert_eq!(diag_lines(&first), diag_lines(&second));
    assert_eq!(first.errors_found(), second.errors_found());
}

#[test]
fn backed_free_space_is_a_leak() {
    // Data chunk logical [DATA_LOG+8M, +1M) is free per the FST, but the
    // whole chunk is backed on the host.
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(
            &[(
                Key::new(DATA_LOG + 0x80_0000, BTRFS_ITEM_FREE_SPACE_EXTENT, 0x10_0000),
                Vec::new(),
            )],
            1,
        ),
        false,
    );
    let report = audit_image(&image, &clean_segments()).expect("audit");
    assert_eq!(
        diag_lines(&report),
        vec!["qcow range 1800000, 100000 allocated (address 5800000) but is free space"]
    );
    assert!(report.errors_found());
}

#[test]
fn backed_free_space_via_bitmap_is_a_leak() {
    // Same free range, represented as a bitmap: 256 sectors, all bits set.
    let bitmap = vec![0xFF_u8; 32];
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(
            &[(
                Key::new(DATA_LOG + 0x80_0000, BTRFS_ITEM_FREE_SPACE_BITMAP, 0x10_0000),
                bitmap,
            )],
            1,
        ),
        false,
    );
    let report = audit_image(&image, &clean_segments()).expect("audit");
    assert_eq!(
        diag_lines(&report),
        vec!["qcow range 1800000, 100000 allocated (address 5800000) but is free space"]
    );
}

#[test]
fn discarded_live_data_is_data_loss() {
    // Physical [0x190_0000, 0x1A0_0000) inside the data chunk is zero on
    // the host, but the FST considers the whole chunk in use.
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let segs = segments(&[
        (META_END_PHYS, false),
        (DATA_PHYS, true),
        (0x190_0000, false),
        (0x1A0_0000, true), // discarded hole
        (DATA_PHYS + DATA_LEN, false),
        (0x400_0000, true),
        (0x400_1000, false),
        (DEVICE_SIZE, true),
    ]);
    let report = audit_image(&image, &segs).expect("audit");
    assert_eq!(
        diag_lines(&report),
        vec!["qcow range 1900000, 100000 discarded (address 5900000) but is allocated"]
    );
}

#[test]
fn unbacked_first_superblock_is_reported_via_mirror() {
    // The first slot is discarded; the audit proceeds off the mirror at
    // 0x400_0000 and reports the missing backing.
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        true,
    );
    let mut bytes = image.as_slice().to_vec();
    bytes[0x1_0000..0x1_1000].fill(0);
    let image = MemImage::new(bytes);

    let segs = segments(&[
        (0x1_0000, false),
        (0x1_1000, true), // first superblock slot discarded
        (META_END_PHYS, false),
        (DATA_PHYS, true),
        (DATA_PHYS + DATA_LEN, false),
        (0x400_0000, true),
        (0x400_1000, false),
        (DEVICE_SIZE, true),
    ]);
    let report = audit_image(&image, &segs).expect("audit");
    assert_eq!(diag_lines(&report), vec!["superblock at 10000 not allocated"]);
}

#[test]
fn backing_outside_chunks_is_reported_above_reservation() {
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let segs = segments(&[
        (META_END_PHYS, false),
        (DATA_PHYS, true),
        (DATA_PHYS + DATA_LEN, false),
        (0x400_0000, true),
        (0x400_1000, false),
        (0x500_0000, true),
        (0x510_0000, false), // backed, but no chunk owns it
        (DEVICE_SIZE, true),
    ]);
    let report = audit_image(&image, &segs).expect("audit");
    assert_eq!(
        diag_lines(&report),
        vec!["qcow range 5000000, 100000 allocated but not part of any btrfs chunk"]
    );
}

#[test]
fn reservation_backing_is_suppressed() {
    // The clean segment list backs [0, 1 MiB) in full; none of it may be
    // reported even though it is outside every chunk.
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let report = audit_image(&image, &clean_segments()).expect("audit");
    assert!(!report.errors_found());
}

#[test]
fn missing_free_space_tree_skips_reconciliation() {
    // Without the FST flag, backed-but-free ranges cannot be judged; the
    // device-tree analysis still runs and the audit exits cleanly.
    let image = build_image(0, &fst_entries(&[], 0), false);
    let report = audit_image(&image, &clean_segments()).expect("audit");
    assert!(!report.errors_found());
}

#[test]
fn multi_device_filesystem_is_rejected() {
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let mut bytes = image.as_slice().to_vec();
    bytes[0x1_0088..0x1_0090].copy_from_slice(&2_u64.to_le_bytes());
    let digest = csum::compute(BTRFS_CSUM_TYPE_CRC32C, &bytes[0x1_0020..0x1_1000]).unwrap();
    bytes[0x1_0000..0x1_0020].copy_from_slice(&digest);
    let image = MemImage::new(bytes);

    let err = audit_image(&image, &clean_segments()).unwrap_err();
    assert!(err.to_string().contains("devices"));
}

#[test]
fn corrupt_tree_node_aborts_the_audit() {
    let image = build_image(
        BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
        &fst_entries(&[], 0),
        false,
    );
    let mut bytes = image.as_slice().to_vec();
    let dev_leaf_phys = usize::try_from(log_to_phys(DEV_TREE_LOG)).unwrap();
    bytes[dev_leaf_phys + 0x200] ^= 0xFF;
    let image = MemImage::new(bytes);

    let err = audit_image(&image, &clean_segments()).unwrap_err();
    assert!(err.to_string().contains("checksum"), "got: {err}");
}
