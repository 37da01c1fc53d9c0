#![forbid(unsafe_code)]
//! qba: audit a qcow2 image's host allocation against the single-device
//! btrfs filesystem it contains.
//!
//! Discrepancy lines go to stdout; warnings and errors to stderr. Exit
//! status is 0 for a clean run and 1 when discrepancies were found or
//! the run aborted.

use anyhow::{Context, Result};
use clap::Parser;
use qba_btrfs::audit_image;
use qba_image::QcowImage;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "qba",
    about = "Report qcow2 ranges the filesystem considers free (leaks) and \
             discarded ranges it considers in use (data loss)"
)]
struct Cli {
    /// Path to the qcow2 image.
    image: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Usage problems exit 1, not clap's default 2; --help stays 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let usage_error = !matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = err.print();
            return ExitCode::from(u8::from(usage_error));
        }
    };

    match run(&cli) {
        Ok(errors_found) => ExitCode::from(u8::from(errors_found)),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let image = QcowImage::open(&cli.image)
        .with_context(|| format!("failed to open qcow2 image: {}", cli.image.display()))?;

    let report = audit_image(&image, image.segments())
        .with_context(|| format!("audit failed for {}", cli.image.display()))?;

    for diagnostic in &report.diagnostics {
        println!("{diagnostic}");
    }

    Ok(report.errors_found())
}
