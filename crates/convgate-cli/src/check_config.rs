//! `convgate check-config` command implementation.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use convgate_ratelimit::AdmissionConfig;
use serde::Serialize;

/// Arguments for the `convgate check-config` command.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Path to the TOML config file.
    pub path: PathBuf,
}

/// Effective configuration plus the values derived from it.
#[derive(Debug, Serialize)]
struct ConfigReport<'a> {
    config: &'a AdmissionConfig,
    load_high_water_mark: u32,
}

/// Run the check-config command.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn run(args: &CheckConfigArgs) -> Result<()> {
    let config = AdmissionConfig::from_path(&args.path)
        .with_context(|| format!("invalid configuration at {}", args.path.display()))?;
    tracing::info!(path = %args.path.display(), "Configuration valid");

    let report = ConfigReport {
        config: &config,
        load_high_water_mark: config.load.high_water_mark(),
    };
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &report)?;
    writeln!(stdout)?;
    Ok(())
}
