//! The audit report: accumulated discrepancies and the exit-status flag.
//!
//! Discrepancies are not errors; every chunk is analysed before the
//! process returns. The report replaces the original tool's process-wide
//! "errors found" flag: the analysers push into it, the caller renders
//! each entry and turns `errors_found` into the exit code.

use serde::Serialize;
use std::fmt;
use tracing::debug;

/// One discrepancy between the qcow allocation map and the filesystem's
/// accounting. Offsets and lengths render as bare lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A fixed superblock slot reads as zeros/discarded on the host.
    SuperblockNotAllocated { offset: u64 },
    /// Host-backed range that no chunk accounts for (leaked space).
    AllocatedOutsideChunks { offset: u64, length: u64 },
    /// Host-backed range the free-space tree says is free (leaked space).
    AllocatedButFree { offset: u64, length: u64, address: u64 },
    /// Discarded range the filesystem still considers in use (data loss).
    DiscardedButUsed { offset: u64, length: u64, address: u64 },
    /// Free-space entry that precedes every chunk.
    OrphanFreeSpace { start: u64, length: u64 },
    /// FREE_SPACE_INFO extent count disagrees with the decoded entries.
    FreeSpaceCountMismatch { chunk: u64, declared: u32, found: u32 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuperblockNotAllocated { offset } => {
                write!(f, "superblock at {offset:x} not allocated")
            }
            Self::AllocatedOutsideChunks { offset, length } => write!(
                f,
                "qcow range {offset:x}, {length:x} allocated but not part of any btrfs chunk"
            ),
            Self::AllocatedButFree {
                offset,
                length,
                address,
            } => write!(
                f,
                "qcow range {offset:x}, {length:x} allocated (address {address:x}) but is free space"
            ),
            Self::DiscardedButUsed {
                offset,
                length,
                address,
            } => write!(
                f,
                "qcow range {offset:x}, {length:x} discarded (address {address:x}) but is allocated"
            ),
            Self::OrphanFreeSpace { start, length } => {
                write!(f, "free space entry {start:x}, {length:x} not within any chunk")
            }
            Self::FreeSpaceCountMismatch {
                chunk,
                declared,
                found,
            } => write!(
                f,
                "free space info for chunk {chunk:x} declares {declared} extents, found {found}"
            ),
        }
    }
}

/// Accumulator for everything the analysers find.
#[derive(Debug, Default, Serialize)]
pub struct AuditReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl AuditReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        debug!(%diagnostic, "discrepancy");
        self.diagnostics.push(diagnostic);
    }

    /// Whether any discrepancy was recorded; becomes the exit status.
    #[must_use]
    pub fn errors_found(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}
