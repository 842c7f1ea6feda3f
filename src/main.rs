use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bandpoints::rollup::jobs::TickerScheduler;
use bandpoints::sim::Simulator;
use bandpoints::storage::models::RollupGranularity;
use bandpoints::{Config, CoreContext, Error, Result};

#[derive(Parser)]
#[command(name = "bandpoints", version, about = "Points ledger and reward engine for bandwidth-sharing nodes")]
struct Cli {
    /// Path to a TOML config file (overrides environment-based lookup)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP surface and the rollup scheduler
    Start,
    /// Aggregate one hourly window (defaults to the last closed hour)
    RollupHour {
        #[arg(long)]
        window_start: Option<i64>,
    },
    /// Aggregate one daily window (defaults to the last closed day)
    RollupDay {
        #[arg(long)]
        window_start: Option<i64>,
    },
    /// Generate dev traffic against a local database
    Simulate {
        #[arg(long, default_value_t = 5)]
        devices: usize,
        #[arg(long, default_value_t = 30)]
        ticks: i64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Show an account's balance
    Balance { account_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };
    if let Some(db) = cli.db {
        config.database.url = db;
    }

    let ctx = CoreContext::init(config).await?;

    match cli.command {
        Commands::Start => {
            let addr: SocketAddr = format!(
                "{}:{}",
                ctx.config.app.listen_address, ctx.config.app.listen_port
            )
            .parse()
            .map_err(|e| Error::Config(format!("bad listen address: {}", e)))?;

            bandpoints::api::start_http(ctx.clone(), addr).await?;

            if ctx.config.rollup.enable_scheduler {
                let scheduler = TickerScheduler::new(
                    Arc::new(ctx.aggregator.clone()),
                    Duration::from_secs(ctx.config.rollup.tick_secs),
                );
                scheduler.spawn();
                info!("rollup scheduler running every {}s", ctx.config.rollup.tick_secs);
            }

            info!("bandpoints node started");
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        Commands::RollupHour { window_start } => {
            run_rollup(&ctx, RollupGranularity::Hour, window_start).await?;
        }

        Commands::RollupDay { window_start } => {
            run_rollup(&ctx, RollupGranularity::Day, window_start).await?;
        }

        Commands::Simulate { devices, ticks, seed } => {
            let mut sim = Simulator::new(ctx.heartbeat.clone(), ctx.aggregator.clone(), seed);
            let base = chrono::Utc::now().timestamp();
            sim.provision(devices, base).await?;
            info!("simulating {} devices for {} minutes", devices, ticks);
            for i in 0..ticks {
                sim.tick(base + i * 60).await?;
            }
            println!(
                "accepted={} bad_signature={} rejected={} probes={} points={}",
                sim.stats.heartbeats_accepted,
                sim.stats.signature_failures,
                sim.stats.heartbeats_rejected,
                sim.stats.probes_recorded,
                sim.stats.points_awarded,
            );
        }

        Commands::Balance { account_id } => {
            let balance = ctx.ledger.get_balance(&account_id).await?;
            println!(
                "account={} points={} tokens={}",
                balance.account_id,
                balance.points,
                balance.token_amount()
            );
        }
    }

    Ok(())
}

async fn run_rollup(
    ctx: &CoreContext,
    granularity: RollupGranularity,
    window_start: Option<i64>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let window_start =
        window_start.unwrap_or_else(|| granularity.window_start(now) - granularity.window_secs());

    let report = ctx.aggregator.run(granularity, window_start, now).await?;
    let rewards = match granularity {
        RollupGranularity::Hour => ctx.aggregator.distribute_rewards(report.window_start).await?,
        RollupGranularity::Day => 0,
    };
    println!(
        "window={}..{} accounts={} rewards={}",
        report.window_start,
        report.window_start + granularity.window_secs(),
        report.accounts_processed,
        rewards,
    );
    Ok(())
}
