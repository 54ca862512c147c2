//! convgate operator CLI entrypoint.
//!
//! - `convgate check-config` - Validate an admission config and print the effective values
//! - `convgate replay` - Feed a recorded request trace through the admission gate

#![forbid(unsafe_code)]

mod check_config;
mod replay;

use clap::{Parser, Subcommand};
use convgate_telemetry::TelemetryConfig;

/// convgate operator CLI.
#[derive(Parser)]
#[command(name = "convgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level filter; `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an admission config file.
    ///
    /// Prints the effective configuration, defaults filled in, as JSON.
    CheckConfig(check_config::CheckConfigArgs),

    /// Replay a JSONL request trace.
    ///
    /// Each line is `{"at_ms", "subject", "tier", "size_bytes", "fingerprint"}`. The
    /// gate runs on a simulated clock advanced to each line's `at_ms`.
    Replay(replay::ReplayArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    convgate_telemetry::init_telemetry(
        &TelemetryConfig::new("convgate")
            .with_log_level(cli.log_level)
            .with_json_logs(cli.json_logs),
    )?;

    match cli.command {
        Commands::CheckConfig(args) => check_config::run(&args),
        Commands::Replay(args) => replay::run(&args).await,
    }
}
