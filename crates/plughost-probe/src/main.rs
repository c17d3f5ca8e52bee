//! Probe runner for plughost.
//!
//! Loads one candidate module in this throwaway process, resolves its export
//! table and prints a JSON `ProbeOutcome` on stdout. The host reads it and
//! never maps the candidate itself until the answer is positive.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use plughost_core::{LoaderProbe, ModuleProbe, ProbeOutcome, TracingLog, TypeVerifier};

/// Inspect a plughost plugin module.
#[derive(Parser, Debug)]
#[command(name = "plughost-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Module file to inspect.
    module: PathBuf,

    /// Pretty-print the JSON outcome.
    #[arg(long)]
    pretty: bool,

    /// Verbose diagnostics on stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let log = Arc::new(TracingLog);
    let probe: Arc<dyn ModuleProbe> = Arc::new(LoaderProbe::native().with_log(log.clone()));
    let verifier = TypeVerifier::new(probe).with_log(log);

    let result = verifier.inspect(&args.module);
    let produced = result.is_ok();
    match &result {
        Ok(report) => tracing::info!(
            "{}: {} plugin types, {} failures",
            args.module.display(),
            report.type_names.len(),
            report.failures.len()
        ),
        Err(e) => tracing::warn!("{}: {}", args.module.display(), e),
    }

    let outcome = ProbeOutcome::from_result(result);
    let json = if args.pretty {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;

    Ok(if produced {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var("PLUGHOST_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "plughost=trace" } else { "plughost=warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries the outcome; diagnostics go to stderr
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}
