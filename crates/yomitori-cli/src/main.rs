//! Regression-scoring CLI: the offline quality gate between pipeline
//! versions.
//!
//! Compares two serialized page result collections and prints a
//! human-readable summary plus, optionally, a JSON report. Exit codes:
//! 0 normally, 2 when `--fail-on-risk` is set and any page is risky,
//! 1 on malformed input.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use yomitori::regression::{RegressionReport, compare_result_sets, parse_result_set};
use yomitori::types::PageOcrResult;

#[derive(Debug, Parser)]
#[command(
    name = "yomitori",
    version,
    about = "Score OCR quality drift between a baseline and a candidate result set"
)]
struct Cli {
    /// Baseline result set: a JSON page mapping or array of page results
    baseline: PathBuf,

    /// Candidate result set, same format as the baseline
    candidate: PathBuf,

    /// Write the full JSON report to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Exit with status 2 when any page is risky (quality-gate mode)
    #[arg(long)]
    fail_on_risk: bool,

    /// Minimum additive score for a page to count as risky
    #[arg(long, default_value_t = 2)]
    risk_threshold: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => ExitCode::from(exit_status(&report, cli.fail_on_risk)),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn exit_status(report: &RegressionReport, fail_on_risk: bool) -> u8 {
    if fail_on_risk && report.has_risky_pages() {
        2
    } else {
        0
    }
}

fn run(cli: &Cli) -> anyhow::Result<RegressionReport> {
    let baseline = load_result_set(&cli.baseline)?;
    let candidate = load_result_set(&cli.candidate)?;

    let report = compare_result_sets(&baseline, &candidate, cli.risk_threshold);
    print_summary(&report);

    if let Some(path) = &cli.output {
        let serialized = serde_json::to_vec_pretty(&report)?;
        fs::write(path, serialized)
            .with_context(|| format!("writing report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote JSON report");
    }

    Ok(report)
}

fn load_result_set(path: &Path) -> anyhow::Result<BTreeMap<u32, PageOcrResult>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading result set {}", path.display()))?;
    parse_result_set(&raw).with_context(|| format!("parsing result set {}", path.display()))
}

fn print_summary(report: &RegressionReport) {
    println!(
        "Compared {} page(s) (baseline {}, candidate {})",
        report.pages_compared, report.baseline_pages, report.candidate_pages
    );

    if report.risky_pages.is_empty() {
        println!("No risky pages at threshold {}.", report.risk_threshold);
        return;
    }

    println!(
        "{} risky page(s) at threshold {}:",
        report.risky_pages.len(),
        report.risk_threshold
    );
    for risky in &report.risky_pages {
        let reasons: Vec<&str> = risky.reasons.iter().map(|r| r.as_str()).collect();
        println!(
            "  page {:>4}  score {}  [{}]",
            risky.page_number,
            risky.score,
            reasons.join(", ")
        );
        if let (Some(base), Some(cand)) = (&risky.baseline, &risky.candidate) {
            println!(
                "    words {} -> {}, lines {} -> {}, suspicious {:.2} -> {:.2}, confidence {:.1} -> {:.1}",
                base.word_count,
                cand.word_count,
                base.line_count,
                cand.line_count,
                base.suspicious_ratio,
                cand.suspicious_ratio,
                base.mean_confidence,
                cand.mean_confidence
            );
        }
        if !risky.lost_tokens.is_empty() {
            println!("    lost: {}", risky.lost_tokens.join(" "));
        }
        if !risky.gained_tokens.is_empty() {
            println!("    gained: {}", risky.gained_tokens.join(" "));
        }
    }
}
