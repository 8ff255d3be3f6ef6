use std::sync::Arc;

use anyhow::Result;
use bybit_broker::{BybitClient, BybitConfig};
use tokio::signal::unix::SignalKind;

mod agent;
mod config;
mod error;
mod events;
mod market_data;
mod metrics;
#[cfg(test)]
mod mock_exchange;
mod position_manager;
mod shutdown;
mod trade_executor;
mod types;

use agent::TradingAgent;
use config::AgentConfig;
use events::{spawn_stdout_mirror, EventBus};
use shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting regime trading agent");

    // 2. Load configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbol: {} ({}x)", config.symbol, config.leverage);
    tracing::info!("  Risk fraction: {:.0}%", config.risk_fraction * 100.0);
    tracing::info!("  Max slippage: {}%", config.max_slippage_percent);
    tracing::info!("  Max holding: {} days", config.max_holding_days);
    tracing::info!("  Poll interval: {} seconds", config.scan_interval_seconds);
    tracing::info!("  Dry run: {}", config.dry_run);

    // 3. Exchange client
    let bybit = BybitClient::new(BybitConfig::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.testnet,
    ))?;

    // 4. Safety gate: testnet by default, mainnet orders require LIVE_TRADING_APPROVED=yes
    if !config.testnet && !config.dry_run {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "BYBIT_TESTNET=false points at mainnet ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or DRY_RUN=true to watch signals only.",
                bybit.base_url()
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE - REAL MONEY AT RISK ({})", bybit.base_url());
    } else {
        tracing::info!("{} mode ({})", config.environment_name(), bybit.base_url());
    }

    // 5. Decision log stream and cancellation
    let events = EventBus::default();
    if config.event_stream_stdout {
        spawn_stdout_mirror(events.subscribe());
    }
    let shutdown = ShutdownSignal::new();

    // Graceful shutdown (SIGINT + SIGTERM)
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
        signal_shutdown.request();
    });

    // 6. Agent
    let mut agent = TradingAgent::new(config, Arc::new(bybit), events, shutdown);

    let mut status = agent.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            tracing::debug!(
                cycle = snapshot.cycle,
                running = snapshot.running,
                in_position = snapshot.position.is_some(),
                trades = snapshot.stats.total_trades,
                "Status updated"
            );
        }
    });

    agent.initialize().await?;
    agent.run().await?;

    tracing::info!("Agent stopped");
    Ok(())
}
