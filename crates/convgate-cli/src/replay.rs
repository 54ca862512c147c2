//! `convgate replay` command implementation.
//!
//! Feeds a recorded request trace through an [`AdmissionController`] running on a
//! [`ManualClock`], so hours of traffic replay in milliseconds with the same decisions.
//!
//! # Usage
//!
//! ```text
//! # Human-readable output
//! convgate replay trace.jsonl --config convgate.toml
//!
//! # One JSON object per decision
//! convgate replay trace.jsonl --json
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use convgate_core::{Decision, Tier};
use convgate_ratelimit::{AdmissionConfig, AdmissionController, ManualClock};
use serde::{Deserialize, Serialize};

/// Arguments for the `convgate replay` command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSONL trace file.
    pub trace: PathBuf,

    /// Admission config (TOML); production defaults when omitted.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// One recorded request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceEntry {
    pub at_ms: u64,
    pub subject: String,
    #[serde(default)]
    pub tier: Tier,
    pub size_bytes: i64,
    pub fingerprint: String,
}

/// What the gate said about one trace line.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub line: usize,
    pub at_ms: u64,
    pub subject: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Decision(Decision),
    /// The line was rejected before reaching the gate.
    Invalid(String),
}

impl Verdict {
    fn label(&self) -> &str {
        match self {
            Self::Decision(decision) => decision.reason.as_str(),
            Self::Invalid(_) => "INVALID",
        }
    }
}

/// Decisions for a whole trace plus per-reason counts.
#[derive(Debug, Default, Serialize)]
pub struct ReplayReport {
    pub outcomes: Vec<ReplayOutcome>,
    pub summary: BTreeMap<String, usize>,
}

/// Run the replay command.
///
/// # Errors
///
/// Returns an error if the config or trace cannot be read, or a trace line is not valid JSON.
pub async fn run(args: &ReplayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AdmissionConfig::from_path(path)
            .with_context(|| format!("invalid configuration at {}", path.display()))?,
        None => AdmissionConfig::default(),
    };
    let file = std::fs::File::open(&args.trace)
        .with_context(|| format!("failed to open trace {}", args.trace.display()))?;

    let report = replay(config, BufReader::new(file)).await?;
    tracing::info!(
        lines = report.outcomes.len(),
        trace = %args.trace.display(),
        "Replay finished"
    );

    let mut stdout = std::io::stdout().lock();
    if args.json {
        for outcome in &report.outcomes {
            serde_json::to_writer(&mut stdout, outcome)?;
            writeln!(stdout)?;
        }
        serde_json::to_writer(&mut stdout, &serde_json::json!({ "summary": report.summary }))?;
        writeln!(stdout)?;
    } else {
        render_human(&mut stdout, &report)?;
    }
    Ok(())
}

/// Replay every line of `trace` through a fresh gate built from `config`.
///
/// Blank lines and lines starting with `#` are skipped. Timestamps that go backwards
/// leave the clock where it is.
///
/// # Errors
///
/// Returns an error if reading fails or a line is not a valid trace entry.
pub async fn replay(config: AdmissionConfig, trace: impl BufRead) -> Result<ReplayReport> {
    let clock = Arc::new(ManualClock::new(0));
    let gate = AdmissionController::with_clock(config, clock.clone());
    let mut report = ReplayReport::default();

    for (index, line) in trace.lines().enumerate() {
        let number = index + 1;
        let line = line.with_context(|| format!("failed to read trace line {number}"))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: TraceEntry = serde_json::from_str(line)
            .with_context(|| format!("trace line {number} is not a valid entry"))?;

        clock.advance_to(entry.at_ms);
        let verdict = {
            let _in_flight = gate.enter();
            match gate
                .check(&entry.subject, entry.tier, entry.size_bytes, &entry.fingerprint)
                .await
            {
                Ok(decision) => Verdict::Decision(decision),
                Err(err) => {
                    tracing::warn!(line = number, error = %err, "Skipping invalid trace entry");
                    Verdict::Invalid(err.to_string())
                }
            }
        };

        *report.summary.entry(verdict.label().to_string()).or_default() += 1;
        report.outcomes.push(ReplayOutcome {
            line: number,
            at_ms: entry.at_ms,
            subject: entry.subject,
            verdict,
        });
    }
    Ok(report)
}

fn render_human(out: &mut impl Write, report: &ReplayReport) -> std::io::Result<()> {
    for outcome in &report.outcomes {
        match &outcome.verdict {
            Verdict::Decision(decision) => {
                let verb = if decision.allowed { "ALLOW" } else { "DENY " };
                write!(
                    out,
                    "{:>6}  {:>13}  {verb}  {:<20} {:<24}",
                    outcome.line, outcome.at_ms, decision.reason, outcome.subject
                )?;
                match decision.retry_after_secs {
                    Some(secs) => writeln!(out, " {} (retry after {secs}s)", decision.message)?,
                    None => writeln!(out, " {}", decision.message)?,
                }
            }
            Verdict::Invalid(error) => {
                writeln!(
                    out,
                    "{:>6}  {:>13}  SKIP   {:<20} {:<24} {error}",
                    outcome.line, outcome.at_ms, "INVALID", outcome.subject
                )?;
            }
        }
    }

    writeln!(out)?;
    writeln!(out, "Summary:")?;
    for (reason, count) in &report.summary {
        writeln!(out, "  {reason:<20} {count}")?;
    }
    Ok(())
}
