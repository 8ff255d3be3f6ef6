use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use broker_trait::{ExchangeClient, LeverageStatus};
use chrono::Utc;
use risk_manager::RiskManager;
use signal_engine::{SignalEvaluation, SignalGenerator};
use tokio::sync::watch;

use crate::config::AgentConfig;
use crate::error::{AgentError, CycleOutcome, EntryOutcome};
use crate::events::{AgentEvent, EventBus};
use crate::market_data::fetch_features;
use crate::metrics::AgentMetrics;
use crate::position_manager::PositionManager;
use crate::shutdown::ShutdownSignal;
use crate::trade_executor::TradeExecutor;
use crate::types::StatusSnapshot;

/// Single-instrument trading loop: features, signal, guarded entry, exits.
pub struct TradingAgent {
    config: AgentConfig,
    exchange: Arc<dyn ExchangeClient>,
    signals: SignalGenerator,
    executor: TradeExecutor,
    positions: PositionManager,
    metrics: AgentMetrics,
    events: EventBus,
    status_tx: watch::Sender<StatusSnapshot>,
    shutdown: ShutdownSignal,
    /// Set while the exchange reports a position this agent did not open
    external_position: bool,
    cycle: u64,
}

impl TradingAgent {
    pub fn new(
        config: AgentConfig,
        exchange: Arc<dyn ExchangeClient>,
        events: EventBus,
        shutdown: ShutdownSignal,
    ) -> Self {
        let risk_manager = RiskManager::new(config.risk_parameters());
        let executor = TradeExecutor::new(
            config.clone(),
            exchange.clone(),
            risk_manager.clone(),
            events.clone(),
        );
        let positions = PositionManager::new(
            exchange.clone(),
            risk_manager.clone(),
            config.symbol.clone(),
            config.max_holding(),
            events.clone(),
        );
        let metrics = AgentMetrics::new(config.metrics_log_interval_cycles);
        let (status_tx, _) = watch::channel(StatusSnapshot::default());

        Self {
            config,
            exchange,
            signals: SignalGenerator::new(risk_manager),
            executor,
            positions,
            metrics,
            events,
            status_tx,
            shutdown,
            external_position: false,
            cycle: 0,
        }
    }

    /// Latest status, refreshed after every cycle.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    #[cfg(test)]
    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    #[cfg(test)]
    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Leverage, balance and pre-existing position checks before the loop starts.
    pub async fn initialize(&mut self) -> Result<()> {
        let symbol = self.config.symbol.clone();
        tracing::info!(
            testnet = self.exchange.is_testnet(),
            "Initializing {} on {}",
            symbol,
            self.exchange.broker_name()
        );

        if self.config.dry_run {
            tracing::info!("Dry run: leverage left unchanged");
        } else {
            match self.exchange.set_leverage(&symbol, self.config.leverage).await {
                Ok(status) => self.events.publish(AgentEvent::LeverageConfigured {
                    leverage: self.config.leverage,
                    already_set: status == LeverageStatus::AlreadySet,
                }),
                // Not fatal: the account may already be at the right leverage
                Err(e) => self.events.publish(AgentEvent::LeverageFailed {
                    error: e.to_string(),
                }),
            }
        }

        let balance = self.exchange.get_available_balance().await?;
        if balance < self.config.min_balance {
            bail!(
                "Available balance {:.2} below minimum {:.2}",
                balance,
                self.config.min_balance
            );
        }

        if let Some(position) = self.exchange.get_open_position(&symbol).await? {
            self.external_position = true;
            self.events
                .publish(AgentEvent::ExternalPosition { position });
        }

        self.events.publish(AgentEvent::Started {
            symbol,
            environment: self.config.environment_name().to_string(),
            leverage: self.config.leverage,
            dry_run: self.config.dry_run,
            balance,
        });
        Ok(())
    }

    /// One full cycle. Never fails; every outcome is reported and logged.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let outcome = self.cycle_inner().await;
        self.cycle += 1;
        self.metrics.record_cycle(&outcome);
        self.publish_status(true);
        outcome
    }

    async fn cycle_inner(&mut self) -> CycleOutcome {
        if self.shutdown.is_requested() {
            return CycleOutcome::Stopped;
        }

        if self.positions.has_position() {
            let start = AgentMetrics::start_timer();
            let tick = self.positions.tick().await;
            self.metrics.record_execution_duration(start);
            return CycleOutcome::Monitored(tick);
        }

        if self.external_position {
            match self.exchange.get_open_position(&self.config.symbol).await {
                Ok(Some(_)) => {
                    tracing::warn!("Untracked exchange position still open; not entering");
                    return CycleOutcome::Blocked;
                }
                Ok(None) => {
                    tracing::info!("Untracked exchange position gone; resuming entries");
                    self.external_position = false;
                }
                Err(e) => {
                    let error = AgentError::DataUnavailable(format!("open position: {}", e));
                    self.events.publish(AgentEvent::DataUnavailable {
                        reason: error.to_string(),
                    });
                    return CycleOutcome::Skipped(error);
                }
            }
        }

        let start = AgentMetrics::start_timer();
        let features =
            match fetch_features(self.exchange.as_ref(), &self.config.symbol, self.config.candle_limit)
                .await
            {
                Ok(features) => features,
                Err(error) => {
                    self.events.publish(AgentEvent::DataUnavailable {
                        reason: error.to_string(),
                    });
                    return CycleOutcome::Skipped(error);
                }
            };
        self.metrics.record_data_duration(start);

        let signal = match self.signals.evaluate(&features.hour1) {
            SignalEvaluation::Signal(signal) => signal,
            SignalEvaluation::NoSignal(reason) => {
                self.events.publish(AgentEvent::NoSignal {
                    reason: reason.to_string(),
                });
                return CycleOutcome::NoSignal;
            }
        };
        self.events.publish(AgentEvent::SignalGenerated {
            signal: signal.clone(),
        });

        if self.shutdown.is_requested() {
            return CycleOutcome::Stopped;
        }

        let start = AgentMetrics::start_timer();
        let outcome = self.executor.execute_entry(&signal).await;
        self.metrics.record_execution_duration(start);

        match outcome {
            EntryOutcome::Filled(position) => match self.positions.open(*position) {
                Ok(()) => CycleOutcome::Entered,
                Err(error) => CycleOutcome::EntryRejected(error),
            },
            EntryOutcome::DryRun(_) => CycleOutcome::DryRun,
            EntryOutcome::Rejected(error) => CycleOutcome::EntryRejected(error),
            EntryOutcome::Unconfirmed(error) => {
                // Treat the exchange as holding an untracked position until it says otherwise
                self.external_position = true;
                CycleOutcome::EntryRejected(error)
            }
        }
    }

    /// Poll until a stop is requested, then publish the shutdown report.
    pub async fn run(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.config.scan_interval_seconds);
        tracing::info!(
            "Agent is now running. Polling every {}s. Press Ctrl+C to stop.",
            self.config.scan_interval_seconds
        );

        while !self.shutdown.is_requested() {
            let cycle_start = AgentMetrics::start_timer();
            let outcome = self.run_cycle().await;
            self.metrics.finish_cycle(cycle_start, self.positions.stats());
            tracing::debug!(cycle = self.cycle, outcome = ?outcome, "Cycle finished");

            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.wait() => {}
            }
        }

        self.shutdown_report().await;
        Ok(())
    }

    async fn shutdown_report(&mut self) {
        let open_position = if self.positions.has_position() || self.external_position {
            match self.exchange.get_open_position(&self.config.symbol).await {
                Ok(position) => position,
                Err(e) => {
                    tracing::warn!("Could not read open position at shutdown: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.metrics.log_metrics(self.positions.stats());
        self.events.publish(AgentEvent::Stopped {
            stats: self.positions.stats().clone(),
            metrics: self.metrics.to_json(self.positions.stats()),
            open_position,
        });
        self.publish_status(false);
    }

    fn publish_status(&self, running: bool) {
        self.status_tx.send_replace(StatusSnapshot {
            cycle: self.cycle,
            running,
            position: self.positions.position().cloned(),
            stats: self.positions.stats().clone(),
            updated_at: Some(Utc::now()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TickOutcome;
    use crate::mock_exchange::{downtrend_candles, test_config, uptrend_candles, MockExchange};
    use analysis_core::Timeframe;
    use broker_trait::{ExchangePosition, OrderSide};
    use rust_decimal_macros::dec;

    fn build_agent(exchange: Arc<MockExchange>, dry_run: bool) -> TradingAgent {
        TradingAgent::new(
            test_config(dry_run),
            exchange,
            EventBus::default(),
            ShutdownSignal::new(),
        )
    }

    fn script_uptrend(exchange: &MockExchange) {
        for tf in Timeframe::all() {
            exchange.set_candles(tf, uptrend_candles(tf, 250));
        }
    }

    fn external() -> ExchangePosition {
        ExchangePosition {
            side: OrderSide::Buy,
            size: dec!(0.01),
            entry_price: 60000.0,
            unrealized_pnl: 0.0,
        }
    }

    #[tokio::test]
    async fn test_dry_run_cycle_places_no_order() {
        let exchange = Arc::new(MockExchange::new());
        script_uptrend(&exchange);
        exchange.push_prices(&[150.0]);
        let mut agent = build_agent(exchange.clone(), true);

        assert_eq!(agent.run_cycle().await, CycleOutcome::DryRun);
        assert!(exchange.orders().is_empty());
        assert!(!agent.positions().has_position());
        assert_eq!(agent.metrics().dry_run_entries, 1);
    }

    #[tokio::test]
    async fn test_entry_then_monitoring() {
        let exchange = Arc::new(MockExchange::new());
        script_uptrend(&exchange);
        exchange.push_prices(&[150.0, 150.5]);
        let mut agent = build_agent(exchange.clone(), false);
        let status = agent.status();

        assert_eq!(agent.run_cycle().await, CycleOutcome::Entered);
        let position = agent.positions().position().unwrap();
        // 1000 * 0.3 * 2 / 150 = 4
        assert_eq!(position.size, dec!(4));
        assert_eq!(status.borrow().cycle, 1);
        assert!(status.borrow().position.is_some());

        // Next cycle only monitors; no new entry
        assert_eq!(
            agent.run_cycle().await,
            CycleOutcome::Monitored(TickOutcome::Holding)
        );
        assert_eq!(exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_bearish_market_has_no_signal() {
        let exchange = Arc::new(MockExchange::new());
        for tf in Timeframe::all() {
            exchange.set_candles(tf, downtrend_candles(tf, 250));
        }
        let mut agent = build_agent(exchange.clone(), false);

        assert_eq!(agent.run_cycle().await, CycleOutcome::NoSignal);
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_missing_candles_skip_cycle() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_candles(Timeframe::Hour1, uptrend_candles(Timeframe::Hour1, 250));
        let mut agent = build_agent(exchange.clone(), false);

        let outcome = agent.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped(AgentError::DataUnavailable(_))
        ));
        assert_eq!(agent.metrics().data_unavailable, 1);
    }

    #[tokio::test]
    async fn test_external_position_blocks_entries() {
        let exchange = Arc::new(MockExchange::new());
        script_uptrend(&exchange);
        exchange.set_open_position(Some(external()));
        let mut agent = build_agent(exchange.clone(), false);
        agent.initialize().await.unwrap();

        assert_eq!(agent.run_cycle().await, CycleOutcome::Blocked);
        assert!(exchange.orders().is_empty());

        // Closed manually; entries resume
        exchange.set_open_position(None);
        exchange.push_prices(&[150.0]);
        assert_eq!(agent.run_cycle().await, CycleOutcome::Entered);
    }

    #[tokio::test]
    async fn test_unconfirmed_entry_blocks_next_entry() {
        let exchange = Arc::new(MockExchange::new());
        script_uptrend(&exchange);
        exchange.push_prices(&[150.0]);
        exchange.set_reject_orders(true);
        let mut agent = build_agent(exchange.clone(), false);
        agent.initialize().await.unwrap();

        assert!(matches!(
            agent.run_cycle().await,
            CycleOutcome::EntryRejected(AgentError::ExecutionRejected(_))
        ));
        assert_eq!(exchange.orders().len(), 1);

        // The failed buy went through after all
        exchange.set_open_position(Some(external()));
        assert_eq!(agent.run_cycle().await, CycleOutcome::Blocked);
        assert_eq!(exchange.orders().len(), 1);

        exchange.set_open_position(None);
        exchange.set_reject_orders(false);
        exchange.push_prices(&[150.0]);
        assert_eq!(agent.run_cycle().await, CycleOutcome::Entered);
        assert_eq!(exchange.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_requested_before_cycle() {
        let exchange = Arc::new(MockExchange::new());
        script_uptrend(&exchange);
        let shutdown = ShutdownSignal::new();
        let mut agent = TradingAgent::new(
            test_config(false),
            exchange.clone(),
            EventBus::default(),
            shutdown.clone(),
        );

        shutdown.request();
        assert_eq!(agent.run_cycle().await, CycleOutcome::Stopped);
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_with_report_on_stop() {
        let exchange = Arc::new(MockExchange::new());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let shutdown = ShutdownSignal::new();
        let mut agent = TradingAgent::new(
            test_config(false),
            exchange,
            events,
            shutdown.clone(),
        );

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(1), agent.run())
            .await
            .unwrap()
            .unwrap();

        let mut stopped = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AgentEvent::Stopped { .. }) {
                stopped = true;
            }
        }
        assert!(stopped);
        assert!(!agent.status().borrow().running);
    }

    #[tokio::test]
    async fn test_initialize_rejects_low_balance() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_balance(5.0);
        let mut agent = build_agent(exchange, false);
        assert!(agent.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_leverage_failure_is_not_fatal() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_leverage_result(None);
        let mut agent = build_agent(exchange.clone(), false);
        agent.initialize().await.unwrap();
        assert_eq!(exchange.leverage_calls(), 1);

        let exchange = Arc::new(MockExchange::new());
        exchange.set_leverage_result(Some(LeverageStatus::AlreadySet));
        let mut agent = build_agent(exchange, false);
        agent.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_skips_leverage() {
        let exchange = Arc::new(MockExchange::new());
        let mut agent = build_agent(exchange.clone(), true);
        agent.initialize().await.unwrap();
        assert_eq!(exchange.leverage_calls(), 0);
    }
}
