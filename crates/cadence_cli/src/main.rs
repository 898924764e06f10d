//! CADENCE CLI
//!
//! Hosts a scheduler on a tokio ticker: every slice interval runs one pass.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod demo;
mod settings;

use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::demo::{Demo, DemoOptions};
use crate::settings::{ConfigArgs, Settings};

/// Passes allowed for settling at exit
const SETTLE_PASSES: usize = 10_000;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "CADENCE - cooperative update scheduler with a priority job queue", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo model until Ctrl-C or the given duration
    Demo {
        #[command(flatten)]
        config: ConfigArgs,
        /// Stop after this many milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Timer period in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,
        /// Jobs submitted per tick
        #[arg(long, default_value_t = 4)]
        jobs_per_tick: u32,
        /// Terms summed by each job
        #[arg(long, default_value_t = 200_000)]
        job_size: u64,
    },
    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Demo {
            config,
            duration_ms,
            tick_ms,
            jobs_per_tick,
            job_size,
        } => {
            let settings = Settings::resolve(&config)?;
            let options = DemoOptions {
                tick: Duration::from_millis(tick_ms),
                jobs_per_tick,
                job_size,
            };
            run_demo(&settings, &options, duration_ms.map(Duration::from_millis)).await
        }
        Commands::Config { config } => {
            let settings = Settings::resolve(&config)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// Host loop: one pass per slice until Ctrl-C or the deadline.
async fn run_demo(settings: &Settings, options: &DemoOptions, duration: Option<Duration>) -> Result<()> {
    let mut demo = Demo::new(settings, options)?;
    let deadline = duration.map(|d| Instant::now() + d);

    let mut slices = tokio::time::interval(settings.scheduler.slice_interval);
    slices.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        slice = ?settings.scheduler.slice_interval,
        budget = ?settings.scheduler.time_budget,
        "host loop started"
    );

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("interrupt received, terminating");
                break;
            }
            _ = slices.tick() => {
                let report = demo.scheduler_mut().run_pass()?;
                if report.was_interrupted() {
                    debug!(pass = report.pass, remaining = report.remaining, "pass continues next slice");
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("demo duration elapsed, terminating");
                    break;
                }
            }
        }
    }

    let summary = demo.shutdown(SETTLE_PASSES)?;
    let metrics = &summary.metrics;
    info!(
        passes = metrics.passes,
        cycles = metrics.cycles,
        cycles_per_pass = metrics.cycles_per_pass(),
        signal_fires = metrics.signal_fires,
        remote_fires = metrics.remote_fires,
        timer_fires = metrics.timer_fires,
        budget_exhaustions = metrics.budget_exhaustions,
        "scheduler summary"
    );
    let stats = &summary.stats;
    info!(
        ticks = stats.ticks,
        submitted = stats.submitted,
        completed = stats.completed,
        cancelled = stats.cancelled,
        failed = stats.failed,
        checksum = stats.checksum,
        grants = ?stats.grants,
        "demo summary"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
