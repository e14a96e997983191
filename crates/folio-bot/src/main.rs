//! folio-bot: portfolio state core for crypto paper trading.
//!
//! Usage:
//!   folio-bot [OPTIONS]
//!
//! Options:
//!   --capital <USD>              Initial session capital
//!   --session-id <ID>            Session identifier
//!   --continue-session           Resume an existing session
//!   --override-session-capital   Reset the resumed session's cash to --capital
//!   --once                       Run exactly one cycle, then exit
//!   -c, --config <FILE>          Config file path (default: config/folio.toml)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use folio_bot::config::BotConfig;
use folio_bot::engine::CycleEngine;
use folio_bot::ledger::StateLedger;
use folio_bot::pricing::source::ReplayDataSource;

/// CLI arguments for folio-bot.
#[derive(Parser, Debug)]
#[command(name = "folio-bot")]
#[command(about = "Portfolio state core for crypto paper trading")]
#[command(version)]
struct Args {
    /// Initial session capital in USD.
    #[arg(long, default_value = "10000")]
    capital: Decimal,

    /// Session identifier.
    #[arg(long, default_value = "default")]
    session_id: String,

    /// Resume an existing session instead of failing on a duplicate id.
    #[arg(long)]
    continue_session: bool,

    /// Reset the resumed session's cash to --capital.
    #[arg(long, requires = "continue_session")]
    override_session_capital: bool,

    /// Run exactly one cycle, then exit.
    #[arg(long)]
    once: bool,

    /// Config file path.
    #[arg(short, long, default_value = "config/folio.toml")]
    config: PathBuf,

    /// Seconds between cycles in continuous mode.
    #[arg(long, default_value = "60")]
    cycle_interval_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        BotConfig::default()
    };
    config.apply_env_overrides();

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if !args.config.exists() {
        warn!(path = ?args.config, "Config file not found, using defaults");
    }
    config.validate().context("Configuration validation failed")?;

    info!(
        session_id = %args.session_id,
        capital = %args.capital,
        symbols = ?config.symbols,
        "Starting folio-bot"
    );

    let db_path = if args.once {
        // One-shot runs stay ephemeral.
        ":memory:".to_string()
    } else {
        config.db_path.clone()
    };
    let ledger = StateLedger::connect(&db_path)
        .await
        .context("Failed to open state ledger")?;

    // Strategy signals and exchange connectors live outside this core; the
    // replay source feeds whatever data has been loaded into it, and an empty
    // source simply produces empty snapshots and zero routed orders.
    let source = Arc::new(ReplayDataSource::new());

    let mut engine = CycleEngine::new(
        config,
        ledger,
        source,
        &args.session_id,
        args.capital,
        args.continue_session,
        args.override_session_capital,
    )
    .await
    .context("Failed to initialize cycle engine")?;

    if args.once {
        let report = engine.run_cycle(&[]).await.context("Cycle failed")?;
        info!(
            cycle = report.cycle_id,
            routed = report.routed,
            equity = %report.equity,
            "Single cycle complete"
        );
        engine.shutdown().await.context("Shutdown failed")?;
        return Ok(());
    }

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(args.cycle_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.run_cycle(&[]).await {
                    Ok(report) => {
                        info!(cycle = report.cycle_id, equity = %report.equity, "Cycle finished");
                    }
                    Err(e) => {
                        // The cycle loop logs and proceeds; state was not
                        // mutated by the failed cycle.
                        warn!(error = %e, "Cycle failed; continuing");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.shutdown().await.context("Shutdown failed")?;
    Ok(())
}
