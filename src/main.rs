use clap::Parser;
use std::path::PathBuf;
use tradewatch::api::{ApiCredentials, CoinbaseClient};
use tradewatch::monitor::TradingMonitor;
use tradewatch::persistence::SnapshotStore;

#[derive(Parser)]
#[command(
    name = "tradewatch",
    about = "Trigger-based trading monitor for Coinbase Advanced Trade"
)]
struct Args {
    /// Path to the trading state document
    #[arg(long, default_value = "trading_config.json")]
    state_file: PathBuf,

    /// Path to the venue API key file
    #[arg(long, default_value = "cdp_api_key.json")]
    credentials: PathBuf,

    /// Run a single monitoring cycle and exit
    #[arg(long)]
    once: bool,

    /// Force dry-run mode regardless of the state document
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();

    let credentials = ApiCredentials::from_file(&args.credentials)?;
    let client = CoinbaseClient::new(&credentials)?;
    let store = SnapshotStore::new(&args.state_file);

    let mut monitor = TradingMonitor::new(client, store)?;
    if args.dry_run {
        monitor.force_dry_run();
    }

    tracing::info!("🚀 crypto trading monitor started");
    tracing::info!(
        "  mode: {}",
        if monitor.dry_run() {
            "DRY RUN"
        } else {
            "LIVE TRADING"
        }
    );
    tracing::info!("  check interval: {} minutes", monitor.check_interval_minutes());
    tracing::info!("  trading budget: €{:.2}", monitor.budget_eur());

    if args.once {
        monitor.cycle().await?;
    } else {
        tokio::select! {
            result = monitor.run() => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⏹  interrupt received, shutting down...");
            }
        }
    }

    // The last snapshot always goes out, interrupt or not
    monitor.flush()?;
    tracing::info!("final trading budget: €{:.2}", monitor.budget_eur());

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradewatch=info".into()),
        )
        .init();
}
