//! # Main — CLI Entry Point
//!
//! Routes the `sieve` and `stats` subcommands to the engine, after shared
//! setup: structured logging, the rayon pool, and configuration validation.
//!
//! Exit codes: 0 on success (including a fully completed shutdown), 1 on
//! configuration errors, 2 when a run was cancelled.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use gapsieve::config::Config;
use gapsieve::method2::EarlyCancel;
use gapsieve::{method1, method2, stats};

#[derive(Parser)]
#[command(name = "gapsieve", about = "Combined sieve and statistics for prime-gap search")]
struct Cli {
    /// Number of rayon worker threads for the small band (1 = sequential)
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Print a machine-readable run summary to stdout when done
    #[arg(long)]
    json_summary: bool,

    /// Verbosity (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RangeArgs {
    /// Prime P of the primorial P#
    #[arg(long)]
    p: u32,

    /// Divisor D of the primorial (every prime factor at most P)
    #[arg(long, default_value_t = 1)]
    d: u64,

    /// First m value
    #[arg(long)]
    mstart: u64,

    /// Count of m values
    #[arg(long)]
    minc: u64,

    /// Sieve half-length SL (0 = auto-set from the gap-probability target)
    #[arg(long, default_value_t = 0)]
    sieve_length: u64,

    /// Largest prime to sieve with (0 = auto-set from the size of K)
    #[arg(long, default_value_t = 0)]
    max_prime: u64,

    /// Merit floor for the high-merit probability column
    #[arg(long, default_value_t = 18.0)]
    min_merit: f64,

    /// Write the unknowns file (required for sieving)
    #[arg(long)]
    save_unknowns: bool,

    /// Search bookkeeping database
    #[arg(long, env = "GAPSIEVE_SEARCH_DB", default_value = "prime-gap-search.db")]
    search_db: PathBuf,

    /// Record-gaps reference database
    #[arg(long, env = "GAPSIEVE_RECORDS_DB", default_value = "gaps.db")]
    records_db: PathBuf,

    /// Directory for the unknowns file
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the combined sieve and write the unknowns file
    Sieve {
        #[command(flatten)]
        range: RangeArgs,

        /// Use the per-prime queue scheme instead of the staged bands
        #[arg(long)]
        method1: bool,

        /// Run-length encode the unknowns file
        #[arg(long)]
        rle: bool,
    },
    /// Evaluate record probabilities for a previously sieved range
    Stats {
        #[command(flatten)]
        range: RangeArgs,
    },
}

fn build_config(cli: &Cli, range: &RangeArgs, method1: bool, rle: bool) -> Config {
    Config {
        p: range.p,
        d: range.d,
        mstart: range.mstart,
        minc: range.minc,
        sieve_length: range.sieve_length,
        max_prime: range.max_prime,
        min_merit: range.min_merit,
        save_unknowns: range.save_unknowns,
        method1,
        rle,
        verbose: i32::from(cli.verbose),
        threads: cli.threads,
        search_db: range.search_db.clone(),
        records_db: range.records_db.clone(),
        output_dir: range.output_dir.clone(),
    }
}

fn print_summary(enabled: bool, config: &Config, summary: &gapsieve::SieveSummary) {
    if !enabled {
        return;
    }
    let line = serde_json::json!({
        "config": config,
        "rows_written": summary.rows_written,
        "seconds": summary.seconds,
        "cancelled": summary.cancelled,
        "max_prime": summary.effective_max_prime,
        "unknown_file": config.unknown_path(summary.effective_max_prime),
    });
    println!("{line}");
}

fn main() -> ExitCode {
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    if cli.threads > 1 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
        {
            error!("rayon pool setup failed: {e}");
        }
    }

    match &cli.command {
        Commands::Sieve {
            range,
            method1: use_method1,
            rle,
        } => {
            let mut config = build_config(&cli, range, *use_method1, *rle);
            if let Err(e) = config.validate() {
                error!("configuration error: {e:#}");
                return ExitCode::from(1);
            }
            info!(
                "sieving m * {}#/{} + [-{}, {}], m = {} + [0, {})",
                config.p, config.d, config.sieve_length, config.sieve_length, config.mstart,
                config.minc
            );

            let run = if config.method1 {
                method1::sieve(&config)
            } else {
                method2::sieve(&config)
            };
            match run {
                Ok(summary) if summary.cancelled => {
                    info!(
                        rows = summary.rows_written,
                        max_prime = summary.effective_max_prime,
                        "sieve cancelled; wrote truncated output"
                    );
                    print_summary(cli.json_summary, &config, &summary);
                    ExitCode::from(2)
                }
                Ok(summary) => {
                    info!(
                        rows = summary.rows_written,
                        secs = format_args!("{:.1}", summary.seconds),
                        "sieve complete"
                    );
                    print_summary(cli.json_summary, &config, &summary);
                    ExitCode::SUCCESS
                }
                Err(e) if e.downcast_ref::<EarlyCancel>().is_some() => {
                    error!("{e:#}");
                    ExitCode::from(2)
                }
                Err(e) => {
                    error!("sieve failed: {e:#}");
                    ExitCode::from(1)
                }
            }
        }
        Commands::Stats { range } => {
            let mut config = build_config(&cli, range, false, false);
            // The unknowns file must already exist; skip the fresh-output check.
            config.save_unknowns = true;
            if let Err(e) = config.validate_for_stats() {
                error!("configuration error: {e:#}");
                return ExitCode::from(1);
            }
            match stats::evaluate(&config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("stats failed: {e:#}");
                    ExitCode::from(1)
                }
            }
        }
    }
}
