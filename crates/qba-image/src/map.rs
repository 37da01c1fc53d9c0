//! The `qemu-img map` contract.
//!
//! `qemu-img map --output json <image>` emits a JSON array describing each
//! virtual-offset range of the image: whether it is backed by a data
//! cluster, reads as zeros, and where its bytes live in the host file.
//! qba consumes that array; it never decodes qcow2 metadata itself.

use crate::QcowSegment;
use qba_error::{AuditError, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// One entry of the `qemu-img map --output json` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QcowMapEntry {
    pub start: u64,
    pub length: u64,
    pub data: bool,
    pub zero: bool,
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub compressed: bool,
    /// Host-file offset of the range's bytes. Only meaningful when the
    /// range does not read as zeros.
    #[serde(default)]
    pub offset: Option<u64>,
}

/// Run `qemu-img map --output json` and return its stdout.
pub fn invoke_qemu_img_map(path: &Path) -> Result<String> {
    debug!(image = %path.display(), "invoking qemu-img map");
    let output = Command::new("qemu-img")
        .args(["map", "--output", "json"])
        .arg(path)
        .output()
        .map_err(|err| AuditError::Map(format!("failed to run qemu-img map: {err}")))?;

    if !output.status.success() {
        return Err(AuditError::Map(format!(
            "qemu-img map failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|err| AuditError::Map(format!("qemu-img map emitted invalid UTF-8: {err}")))
}

/// Parse the JSON array emitted by `qemu-img map --output json`.
pub fn parse_map(json: &str) -> Result<Vec<QcowMapEntry>> {
    serde_json::from_str(json)
        .map_err(|err| AuditError::Map(format!("failed to parse qemu-img map JSON: {err}")))
}

/// Validate map entries and turn them into the segment list.
///
/// Enforced invariants: no compressed ranges, contiguous coverage of
/// `[0, virtual_size)` starting at zero, and a host offset on every
/// range that does not read as zeros.
pub fn segments_from_entries(entries: &[QcowMapEntry]) -> Result<Vec<QcowSegment>> {
    if entries.is_empty() {
        return Err(AuditError::Map("qemu-img map returned no ranges".to_owned()));
    }

    let mut segments = Vec::with_capacity(entries.len());
    let mut expected_start = 0_u64;

    for entry in entries {
        if entry.compressed {
            return Err(AuditError::Map(format!(
                "compressed range at {:x}, {:x}: compressed qcow2 files are not supported",
                entry.start, entry.length
            )));
        }
        if entry.start != expected_start {
            return Err(AuditError::Map(format!(
                "non-contiguous map: range starts at {:x}, expected {:x}",
                entry.start, expected_start
            )));
        }
        if entry.length == 0 {
            return Err(AuditError::Map(format!(
                "zero-length range at {:x}",
                entry.start
            )));
        }

        let offset = if entry.zero {
            None
        } else {
            match entry.offset {
                Some(offset) => Some(offset),
                None => {
                    return Err(AuditError::Map(format!(
                        "data range at {:x}, {:x} has no host offset",
                        entry.start, entry.length
                    )));
                }
            }
        };

        segments.push(QcowSegment {
            start: entry.start,
            length: entry.length,
            zero: entry.zero,
            offset,
        });

        expected_start = entry.start.checked_add(entry.length).ok_or_else(|| {
            AuditError::Map(format!(
                "range at {:x}, {:x} overflows the virtual address space",
                entry.start, entry.length
            ))
        })?;
    }

    debug!(
        segments = segments.len(),
        virtual_size = format_args!("{expected_start:#x}"),
        "qcow map loaded"
    );
    Ok(segments)
}
