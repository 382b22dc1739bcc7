use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use autotrader::bandit::{BanditSelector, ConfiguredBucketer, ConfiguredReward};
use autotrader::config::{AppConfig, LoggingConfig};
use autotrader::domain::{Bar, HistoricalSeries};
use autotrader::error::{AutotraderError, Result};
use autotrader::persistence::{InMemoryGateway, PersistenceGateway, PostgresGateway};
use autotrader::strategy::reference_strategies;
use autotrader::walkforward::WalkForwardOrchestrator;

#[derive(Parser)]
#[command(name = "autotrader")]
#[command(version = "0.1.0")]
#[command(about = "Strategy-selection decision core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory
    #[arg(short, long, default_value = "config", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the layered configuration and print it
    CheckConfig,
    /// Run walk-forward evaluation of the reference strategies over a bar file
    WalkForward {
        /// JSON file with `symbol`, `timeframe` and `bars`
        #[arg(long)]
        bars: PathBuf,
        /// Write registry rows to Postgres instead of memory
        #[arg(long)]
        persist: bool,
        /// Save the resulting bandit state to this file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Apply database migrations
    Migrate,
}

#[derive(Deserialize)]
struct BarFile {
    symbol: String,
    timeframe: String,
    bars: Vec<Bar>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_validated(&cli.config)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            info!(dir = %cli.config.display(), "configuration is valid");
        }
        Commands::WalkForward {
            bars,
            persist,
            snapshot,
        } => run_walk_forward(&config, &bars, persist, snapshot.as_deref()).await?,
        Commands::Migrate => {
            let gateway = connect(&config).await?;
            gateway.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn run_walk_forward(
    config: &AppConfig,
    path: &std::path::Path,
    persist: bool,
    snapshot: Option<&std::path::Path>,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let file: BarFile = serde_json::from_str(&raw)?;
    let series = HistoricalSeries::new(file.symbol, file.timeframe, file.bars)?;
    info!(
        symbol = %series.symbol,
        timeframe = %series.timeframe,
        bars = series.len(),
        "loaded bars"
    );

    let gateway: Arc<dyn PersistenceGateway> = if persist {
        Arc::new(connect(config).await?)
    } else {
        Arc::new(InMemoryGateway::new())
    };

    let mut selector = BanditSelector::new(
        config.bandit.clone(),
        Box::new(ConfiguredBucketer::new(config.bucketing.clone())),
    )?;
    let reward = ConfiguredReward::new(config.reward.mapping, &config.bandit);
    let orchestrator =
        WalkForwardOrchestrator::new(gateway, Box::new(reward), config.risk.risk_per_trade);

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current window");
            cancel.cancel();
        }
    });

    let mut strategies = reference_strategies();
    let runs = orchestrator
        .run(&series, &mut strategies, &config.walk_forward, &mut selector)
        .await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);

    if let Some(path) = snapshot {
        std::fs::write(path, selector.snapshot().to_json()?)?;
        info!(path = %path.display(), "bandit snapshot saved");
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PostgresGateway> {
    let database = config.persistence.database.as_ref().ok_or_else(|| {
        AutotraderError::Configuration("persistence.database is not configured".to_string())
    })?;
    PostgresGateway::connect(database).await
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},autotrader=debug,sqlx=warn", logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
