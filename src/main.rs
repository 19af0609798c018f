use clap::{Parser, Subcommand};
use odds_aggregator::{
    config::AggregatorConfig,
    events::EventBus,
    transport::{ConnectionManager, OddsSource},
    utils::{logger, metrics},
    OddsError, ProviderManager, Result,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "odds-aggregator")]
#[command(about = "Multi-provider odds aggregation and arbitrage detection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/aggregator.toml")]
    config: PathBuf,

    /// Log level, overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log file path, overrides the config file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the providers and the live channel, log events until Ctrl-C
    Run,
    /// Fetch aggregated odds once and print them as JSON
    Snapshot {
        /// Restrict to one sport
        #[arg(long)]
        sport: Option<String>,

        /// Restrict to one event
        #[arg(long)]
        event: Option<String>,

        /// Only print markets with an arbitrage opportunity
        #[arg(long)]
        arbitrage_only: bool,
    },
    /// Validate configuration
    Validate,
    /// Show provider status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = AggregatorConfig::load(&cli.config)?;

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.monitoring.log_level);
    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.monitoring.log_file));
    logger::init(log_level, &log_file)?;

    info!("Starting Odds Aggregator v{}", odds_aggregator::VERSION);
    info!("Configuration loaded from: {}", cli.config.display());

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Snapshot {
            sport,
            event,
            arbitrage_only,
        } => snapshot(config, sport, event, arbitrage_only).await,
        Commands::Validate => validate_config(config),
        Commands::Status => show_status(config).await,
    }
}

async fn run(config: AggregatorConfig) -> Result<()> {
    config.validate()?;

    if config.monitoring.enable_metrics {
        let addr: SocketAddr = config
            .monitoring
            .metrics_addr
            .parse()
            .map_err(|e| OddsError::Config(format!("Invalid metrics address: {}", e)))?;
        metrics::install_prometheus_exporter(addr)?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let events = EventBus::default();
    let providers = ProviderManager::from_config(&config, events.clone()).await?;
    providers.initialize().await;

    let source: Arc<dyn OddsSource> = Arc::new(providers.clone());
    let connection = ConnectionManager::from_config(config.connection.clone(), events.clone(), source)?;

    let mut odds = events.subscribe_odds_updates();
    let mut statuses = events.subscribe_connection_status();
    let mut health = events.subscribe_provider_status();

    let logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(update) = odds.recv() => info!(
                    provider = %update.quote.provider_id,
                    event = %update.quote.event,
                    market = %update.quote.market,
                    outcome = %update.quote.outcome,
                    odds = update.quote.odds,
                    change = ?update.change_ratio,
                    "Odds update"
                ),
                Some(state) = statuses.recv() => info!(
                    method = %state.method,
                    status = %state.status,
                    "Connection status"
                ),
                Some(handle) = health.recv() => info!(
                    provider = %handle.id,
                    status = %handle.status,
                    "Provider status"
                ),
                else => break,
            }
        }
    });

    if let Err(e) = connection.connect().await {
        error!("Live channel could not be opened: {}", e);
    }

    info!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    connection.disconnect().await?;
    providers.shutdown().await;
    logger.abort();

    Ok(())
}

async fn snapshot(
    config: AggregatorConfig,
    sport: Option<String>,
    event: Option<String>,
    arbitrage_only: bool,
) -> Result<()> {
    config.validate()?;

    let providers = ProviderManager::from_config(&config, EventBus::default()).await?;
    providers.initialize().await;

    let mut markets = providers
        .get_aggregated_odds(sport.as_deref(), event.as_deref())
        .await;
    if arbitrage_only {
        markets.retain(|m| m.arbitrage.is_some());
    }

    println!("{}", serde_json::to_string_pretty(&markets)?);
    providers.shutdown().await;
    Ok(())
}

fn validate_config(config: AggregatorConfig) -> Result<()> {
    info!("Validating configuration...");

    match config.validate() {
        Ok(()) => {
            info!("Configuration is valid");
            println!("Configuration validation passed!");
            println!("  Providers: {}", config.enabled_providers().count());
            println!(
                "  Transport order: {}",
                config
                    .connection
                    .attempt_order()
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_status(config: AggregatorConfig) -> Result<()> {
    info!("Checking provider status...");
    config.validate()?;

    let providers = ProviderManager::from_config(&config, EventBus::default()).await?;
    providers.initialize().await;
    let health = providers.check_all_health().await;

    println!("System Status:");
    println!("  Version: {}", odds_aggregator::VERSION);
    println!(
        "  Providers: {}/{} healthy",
        providers.healthy_provider_count().await,
        providers.provider_count().await
    );
    for handle in providers.provider_statuses().await {
        let healthy = health.get(&handle.id).copied().unwrap_or(false);
        println!(
            "  - {} ({}): status={} healthy={} errors={} last_sync={}",
            handle.id,
            handle.config.base_url,
            handle.status,
            healthy,
            handle.error_count,
            handle
                .last_sync
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        if let Some(last_error) = &handle.last_error {
            warn!(provider = %handle.id, "Last error: {}", last_error);
        }
    }

    providers.shutdown().await;
    Ok(())
}
