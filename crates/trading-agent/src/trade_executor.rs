use std::sync::Arc;

use anyhow::Result;
use broker_trait::{ExchangeClient, InstrumentConstraints, MarketOrderRequest};
use chrono::Utc;
use risk_manager::RiskManager;
use signal_engine::Signal;

use crate::config::AgentConfig;
use crate::error::{AgentError, DryRunPreview, EntryOutcome};
use crate::events::{AgentEvent, EventBus};
use crate::types::Position;

/// Percent distance between the signal's reference price and the live price.
pub fn slippage_percent(reference_price: f64, live_price: f64) -> f64 {
    (live_price - reference_price).abs() / reference_price * 100.0
}

/// Turns a signal into a guarded, filled entry.
pub struct TradeExecutor {
    config: AgentConfig,
    exchange: Arc<dyn ExchangeClient>,
    risk_manager: RiskManager,
    events: EventBus,
}

impl TradeExecutor {
    pub fn new(
        config: AgentConfig,
        exchange: Arc<dyn ExchangeClient>,
        risk_manager: RiskManager,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            exchange,
            risk_manager,
            events,
        }
    }

    /// Execute an entry for `signal`.
    ///
    /// Price, balance and constraints are all fetched inside this call, so
    /// sizing and the slippage check never mix snapshots across cycles.
    pub async fn execute_entry(&self, signal: &Signal) -> EntryOutcome {
        // 1. Live price
        let live_price = match self.exchange.get_live_price(&self.config.symbol).await {
            Ok(price) => price,
            Err(e) => return self.reject(AgentError::DataUnavailable(format!("live price: {}", e))),
        };

        // 2. Slippage guard against the (closed-candle) signal price
        let slippage_pct = slippage_percent(signal.entry_price, live_price);
        tracing::info!(
            signal_price = signal.entry_price,
            live_price,
            "Slippage {:.2}% (max {:.2}%)",
            slippage_pct,
            self.config.max_slippage_percent
        );
        if slippage_pct > self.config.max_slippage_percent {
            return self.reject(AgentError::ExecutionRejected(format!(
                "slippage {:.2}% exceeds {:.2}%",
                slippage_pct, self.config.max_slippage_percent
            )));
        }

        // 3. Balance
        let balance = match self.exchange.get_available_balance().await {
            Ok(balance) => balance,
            Err(e) => return self.reject(AgentError::DataUnavailable(format!("balance: {}", e))),
        };
        if balance < self.config.min_balance {
            return self.reject(AgentError::Constraint(format!(
                "balance {:.2} below minimum {:.2}",
                balance, self.config.min_balance
            )));
        }

        // 4. Sizing at the live price
        let constraints = self.instrument_constraints().await;
        let sizing = match self.risk_manager.calculate_position_size(
            live_price,
            balance,
            constraints.min_qty,
            constraints.qty_step,
        ) {
            Ok(sizing) => sizing,
            Err(e) => return self.reject(AgentError::Constraint(format!("sizing: {}", e))),
        };
        if sizing.bumped_to_minimum {
            tracing::warn!(
                raw_quantity = sizing.raw_quantity,
                "Quantity raised to instrument minimum {}",
                constraints.min_qty
            );
        }

        if self.config.dry_run {
            let prices = signal.prices_at(live_price);
            self.events.publish(AgentEvent::DryRunEntry {
                live_price,
                slippage_pct,
                quantity: sizing.quantity,
                tp1_price: prices.tp1,
                tp2_price: prices.tp2,
                sl_price: prices.sl,
                quality: signal.quality,
            });
            return EntryOutcome::DryRun(DryRunPreview {
                live_price,
                slippage_pct,
                quantity: sizing.quantity,
                tp1_price: prices.tp1,
                tp2_price: prices.tp2,
                sl_price: prices.sl,
            });
        }

        tracing::info!(
            "Executing BUY {} {} @ ~${:.2} (notional ${:.2}, {}x)",
            sizing.quantity,
            self.config.symbol,
            live_price,
            sizing.position_value,
            self.config.leverage
        );

        // 5. Market buy. From here on a failure may still have left a position open
        let order = MarketOrderRequest::buy(&self.config.symbol, sizing.quantity);
        let fill = match self.exchange.place_market_order(order).await {
            Ok(fill) => fill,
            Err(e) => {
                return self.unconfirmed(AgentError::ExecutionRejected(format!(
                    "order failed: {}",
                    e
                )))
            }
        };
        if !fill.filled {
            return self.unconfirmed(AgentError::ExecutionRejected(format!(
                "order {} not filled",
                fill.order_id
            )));
        }

        // 6. Targets from the actual fill
        let fill_price = if fill.avg_price > 0.0 {
            fill.avg_price
        } else {
            live_price
        };
        let position = Position::from_fill(
            signal.clone(),
            fill_price,
            fill.filled_qty,
            balance,
            Utc::now(),
        );

        self.events.publish(AgentEvent::EntryFilled {
            order_id: fill.order_id,
            quantity: fill.filled_qty,
            signal_price: signal.entry_price,
            fill_price,
            slippage_pct: (fill_price - signal.entry_price) / signal.entry_price * 100.0,
            tp1_price: position.tp1_price,
            tp2_price: position.tp2_price,
            sl_price: position.sl_price,
            balance,
        });

        EntryOutcome::Filled(Box::new(position))
    }

    /// Lot-size rules, or the 0.001 / 0.001 fallback.
    async fn instrument_constraints(&self) -> InstrumentConstraints {
        let fetched: Result<InstrumentConstraints> = self
            .exchange
            .get_instrument_constraints(&self.config.symbol)
            .await;
        fetched.unwrap_or_else(|e| {
            tracing::warn!("Instrument info unavailable, using defaults: {}", e);
            InstrumentConstraints::default()
        })
    }

    fn unconfirmed(&self, error: AgentError) -> EntryOutcome {
        tracing::warn!("Entry order outcome unconfirmed: {}", error);
        self.events.publish(AgentEvent::EntryRejected {
            reason: error.to_string(),
        });
        EntryOutcome::Unconfirmed(error)
    }

    fn reject(&self, error: AgentError) -> EntryOutcome {
        self.events.publish(AgentEvent::EntryRejected {
            reason: error.to_string(),
        });
        EntryOutcome::Rejected(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_exchange::{test_config, test_signal as signal_at, MockExchange};
    use rust_decimal_macros::dec;

    fn executor(exchange: Arc<MockExchange>, dry_run: bool) -> TradeExecutor {
        TradeExecutor::new(
            test_config(dry_run),
            exchange,
            RiskManager::default(),
            EventBus::default(),
        )
    }

    #[test]
    fn test_slippage_percent() {
        assert!((slippage_percent(100.0, 101.6) - 1.6).abs() < 1e-9);
        assert!((slippage_percent(100.0, 98.5) - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_excess_slippage() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[101.6]);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        assert!(matches!(
            outcome,
            EntryOutcome::Rejected(AgentError::ExecutionRejected(_))
        ));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_proceeds_within_slippage() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[101.4]);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        let position = match outcome {
            EntryOutcome::Filled(p) => p,
            other => panic!("expected fill, got {:?}", other),
        };
        let orders = exchange.orders();
        assert_eq!(orders.len(), 1);
        assert!(!orders[0].reduce_only);
        // 1000 * 0.3 * 2 / 101.4 = 5.917... -> 5.917
        assert_eq!(orders[0].qty, dec!(5.917));
        assert_eq!(position.size, dec!(5.917));
        assert_eq!(position.remaining_size, position.size);
    }

    #[tokio::test]
    async fn test_targets_recomputed_from_fill_price() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[2000.0]);
        exchange.set_fill_price(2010.0);

        let outcome = executor(exchange, false).execute_entry(&signal_at(2000.0)).await;

        let EntryOutcome::Filled(position) = outcome else {
            panic!("expected fill");
        };
        assert_eq!(position.entry_price, 2010.0);
        assert!((position.tp1_price - 2010.0 * 1.04).abs() < 1e-9);
        assert!((position.tp2_price - 2010.0 * 1.065).abs() < 1e-9);
        assert!((position.sl_price - 2010.0 * 0.975).abs() < 1e-9);
        assert_eq!(position.highest_price, 2010.0);
        assert_eq!(position.initial_balance, 1000.0);
        assert!(!position.tp1_hit);
        assert!(position.trailing_stop.is_none());
    }

    #[tokio::test]
    async fn test_unfilled_order_is_unconfirmed() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[100.0]);
        exchange.set_unfilled_orders(true);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        assert!(matches!(
            outcome,
            EntryOutcome::Unconfirmed(AgentError::ExecutionRejected(_))
        ));
        assert_eq!(exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_order_error_is_unconfirmed() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[100.0]);
        exchange.set_reject_orders(true);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        assert!(matches!(
            outcome,
            EntryOutcome::Unconfirmed(AgentError::ExecutionRejected(_))
        ));
        assert_eq!(exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_price_is_data_unavailable() {
        let exchange = Arc::new(MockExchange::new());

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        assert!(matches!(
            outcome,
            EntryOutcome::Rejected(AgentError::DataUnavailable(_))
        ));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_low_balance_is_constraint() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[100.0]);
        exchange.set_balance(5.0);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(100.0)).await;

        assert!(matches!(outcome, EntryOutcome::Rejected(AgentError::Constraint(_))));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_places_no_order() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[101.0]);

        let outcome = executor(exchange.clone(), true).execute_entry(&signal_at(100.0)).await;

        let EntryOutcome::DryRun(preview) = outcome else {
            panic!("expected dry run");
        };
        assert!(exchange.orders().is_empty());
        assert_eq!(preview.live_price, 101.0);
        assert!((preview.tp1_price - 101.0 * 1.04).abs() < 1e-9);
        assert!((preview.sl_price - 101.0 * 0.975).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_constraints_fall_back_to_defaults() {
        let exchange = Arc::new(MockExchange::new());
        exchange.push_prices(&[60000.0]);
        exchange.set_balance(20.0);
        exchange.set_constraints(None);

        let outcome = executor(exchange.clone(), false).execute_entry(&signal_at(60000.0)).await;

        // 20 * 0.6 / 60000 = 0.0002 -> raised to the 0.001 fallback minimum
        assert!(matches!(outcome, EntryOutcome::Filled(_)));
        assert_eq!(exchange.orders()[0].qty, dec!(0.001));
    }
}
