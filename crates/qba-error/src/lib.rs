#![forbid(unsafe_code)]
//! Error types for qba.
//!
//! Defines `AuditError` and a `Result<T>` alias used throughout the
//! workspace. Variants follow the failure taxonomy of the audit: I/O,
//! map-contract violations, on-disk format errors, unsupported layouts,
//! and integrity failures. Discrepancies found by the analysers are not
//! errors; they accumulate in the audit report.

use qba_types::ParseError;
use thiserror::Error;

/// Unified error type for all qba operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("qcow map: {0}")]
    Map(String),

    #[error("on-disk format: {0}")]
    Parse(#[from] ParseError),

    #[error("unsupported filesystem layout: {0}")]
    Unsupported(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias using `AuditError`.
pub type Result<T> = std::result::Result<T, AuditError>;
