#![forbid(unsafe_code)]
//! Filesystem-side core of qba: chunk table, tree engine, the two
//! allocation analysers, and the reconciliation engine.
//!
//! I/O goes through `qba_image::VirtualRead`, so everything here runs
//! identically over a real qcow2 image or an in-memory fixture. The
//! pipeline is `audit::audit_image`:
//!
//! superblock → chunk table (bootstrap, then chunk tree) → device-tree
//! timeline ∥ free-space timelines → per-chunk reconciliation → report.

pub mod audit;
pub mod chunk;
pub mod device;
pub mod freespace;
pub mod reconcile;
pub mod report;
pub mod tree;

pub use audit::{audit_image, load_superblock};
pub use chunk::{ChunkDescriptor, ChunkTable};
pub use report::{AuditReport, Diagnostic};
pub use tree::{NodeExpectation, TreeReader};
