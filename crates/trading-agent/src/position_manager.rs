use std::sync::Arc;

use broker_trait::{ExchangeClient, InstrumentConstraints, MarketOrderRequest};
use chrono::{DateTime, Duration, Utc};
use risk_manager::{round_to_step, RiskManager};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::{AgentError, TickOutcome};
use crate::events::{AgentEvent, EventBus, ExitReport};
use crate::types::{
    ExitDecision, ExitReason, Position, TradeStats, TP1_CLOSE_FRACTION,
};

/// Quantity to send for a close of `close_qty` out of `remaining`.
///
/// Rounds to the instrument step. Closes everything instead when the rounded
/// order would be empty or under the minimum, or would leave a remainder the
/// exchange could no longer close.
pub fn order_quantity(
    close_qty: Decimal,
    remaining: Decimal,
    constraints: &InstrumentConstraints,
) -> Decimal {
    let rounded = round_to_step(close_qty, constraints.qty_step).min(remaining);
    let leftover = remaining - rounded;
    if rounded <= Decimal::ZERO
        || rounded < constraints.min_qty
        || (leftover > Decimal::ZERO && leftover < constraints.min_qty)
    {
        return remaining;
    }
    rounded
}

/// Evaluate exit conditions for one tick.
///
/// Records the new high and any trailing-stop price on `position` (market
/// observations); leaves TP1-hit and remaining size for [`apply_fill`].
/// TP1, TP2 and trailing are a priority chain; stop-loss and timeout are
/// checked after it and replace whatever it chose.
pub fn evaluate_exit(
    position: &mut Position,
    price: f64,
    now: DateTime<Utc>,
    risk_manager: &RiskManager,
    max_holding: Duration,
) -> Option<ExitDecision> {
    if price > position.highest_price {
        position.highest_price = price;
    }

    let remaining = position.remaining_size;
    let mut decision = None;

    if !position.tp1_hit && price >= position.tp1_price {
        decision = Some(ExitDecision {
            reason: ExitReason::Tp1,
            close_qty: remaining * TP1_CLOSE_FRACTION,
        });
    } else if price >= position.tp2_price {
        decision = Some(ExitDecision {
            reason: ExitReason::Tp2,
            close_qty: remaining,
        });
    } else if position.tp1_hit {
        if let Some(trailing) = risk_manager.calculate_trailing_stop(
            position.entry_price,
            position.highest_price,
            position.signal.vol_regime,
        ) {
            position.trailing_stop = Some(trailing);
            if price <= trailing {
                decision = Some(ExitDecision {
                    reason: ExitReason::Trailing,
                    close_qty: remaining,
                });
            }
        }
    }

    if price <= position.sl_price {
        decision = Some(ExitDecision {
            reason: ExitReason::StopLoss,
            close_qty: remaining,
        });
    }

    if position.holding_time(now) >= max_holding {
        decision = Some(ExitDecision {
            reason: ExitReason::Timeout,
            close_qty: remaining,
        });
    }

    decision.filter(|d| d.close_qty > Decimal::ZERO)
}

/// Commit a confirmed close fill and return the P&L booked for it.
pub fn apply_fill(position: &mut Position, reason: ExitReason, closed_qty: Decimal, exit_price: f64) -> f64 {
    let closed_qty = closed_qty.min(position.remaining_size);
    let pnl = closed_qty.to_f64().unwrap_or(0.0) * (exit_price - position.entry_price);

    position.remaining_size -= closed_qty;
    position.realized_pnl += pnl;
    if reason == ExitReason::Tp1 {
        position.tp1_hit = true;
    }
    pnl
}

/// Owns the single live position and the trade counters.
pub struct PositionManager {
    exchange: Arc<dyn ExchangeClient>,
    risk_manager: RiskManager,
    symbol: String,
    max_holding: Duration,
    events: EventBus,
    position: Option<Position>,
    stats: TradeStats,
}

impl PositionManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        risk_manager: RiskManager,
        symbol: String,
        max_holding: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            exchange,
            risk_manager,
            symbol,
            max_holding,
            events,
            position: None,
            stats: TradeStats::default(),
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn stats(&self) -> &TradeStats {
        &self.stats
    }

    /// Take ownership of a freshly filled position.
    pub fn open(&mut self, position: Position) -> Result<(), AgentError> {
        if self.position.is_some() {
            return Err(AgentError::Constraint(
                "a position is already open".to_string(),
            ));
        }
        self.position = Some(position);
        Ok(())
    }

    /// One monitoring tick.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.position.is_none() {
            return TickOutcome::Idle;
        }

        // 1. Live price; nothing changes without it
        let price = match self.exchange.get_live_price(&self.symbol).await {
            Ok(price) => price,
            Err(e) => {
                let error = AgentError::DataUnavailable(format!("live price: {}", e));
                self.events.publish(AgentEvent::DataUnavailable {
                    reason: error.to_string(),
                });
                return TickOutcome::Failed(error);
            }
        };

        let now = Utc::now();
        let Some(position) = self.position.as_mut() else {
            return TickOutcome::Idle;
        };

        // 2-3. High-water mark, trailing stop, exit conditions
        let decision = evaluate_exit(position, price, now, &self.risk_manager, self.max_holding);

        self.events.publish(AgentEvent::PositionUpdate {
            state: position.state(),
            price,
            pnl_pct: position.pnl_percent(price),
            highest_price: position.highest_price,
            remaining_size: position.remaining_size,
            trailing_stop: position.trailing_stop,
            holding_hours: hours(position.holding_time(now)),
        });

        let remaining = position.remaining_size;
        let Some(mut decision) = decision else {
            return TickOutcome::Holding;
        };

        let constraints = self.instrument_constraints().await;
        decision.close_qty = order_quantity(decision.close_qty, remaining, &constraints);

        tracing::info!(
            reason = %decision.reason,
            close_qty = %decision.close_qty,
            "Exit condition met @ ${:.2}",
            price
        );

        // 4. Reduce-only close; bookkeeping only after a confirmed fill
        let order = MarketOrderRequest::close_long(&self.symbol, decision.close_qty);
        let fill = match self.exchange.place_market_order(order).await {
            Ok(fill) if fill.filled => fill,
            Ok(fill) => return self.exit_failed(decision, format!("order {} not filled", fill.order_id)),
            Err(e) => return self.exit_failed(decision, e.to_string()),
        };

        let exit_price = if fill.avg_price > 0.0 { fill.avg_price } else { price };
        let closed_qty = if fill.filled_qty > Decimal::ZERO {
            fill.filled_qty
        } else {
            decision.close_qty
        };

        let balance_after = match self.exchange.get_available_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::warn!("Balance unavailable after exit: {}", e);
                None
            }
        };

        let exit_time = Utc::now();
        let Some(position) = self.position.as_mut() else {
            return TickOutcome::Idle;
        };
        let closed_qty = closed_qty.min(position.remaining_size);
        let pnl_amount = apply_fill(position, decision.reason, closed_qty, exit_price);

        let close_percent = if position.size > Decimal::ZERO {
            (closed_qty / position.size * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        self.events.publish(AgentEvent::ExitExecuted(ExitReport {
            reason: decision.reason,
            entry_time: position.entry_time,
            exit_time,
            holding_hours: hours(position.holding_time(exit_time)),
            entry_price: position.entry_price,
            exit_price,
            highest_price: position.highest_price,
            close_qty: closed_qty,
            close_percent,
            partial: closed_qty < position.size,
            pnl_amount,
            pnl_percent: position.pnl_percent(exit_price),
            remaining_size: position.remaining_size,
            balance_change: balance_after.map(|b| b - position.initial_balance),
        }));

        if !position.is_closed() {
            return TickOutcome::PartialExit {
                reason: decision.reason,
                remaining: position.remaining_size,
            };
        }

        // CLOSED: fold the position's total P&L into the counters once
        let realized_pnl = position.realized_pnl;
        self.position = None;
        self.stats.record(realized_pnl);
        self.events.publish(AgentEvent::PositionClosed {
            realized_pnl,
            stats: self.stats.clone(),
        });

        TickOutcome::Closed {
            reason: decision.reason,
            realized_pnl,
        }
    }

    async fn instrument_constraints(&self) -> InstrumentConstraints {
        match self.exchange.get_instrument_constraints(&self.symbol).await {
            Ok(constraints) => constraints,
            Err(e) => {
                tracing::warn!("Instrument info unavailable, using defaults: {}", e);
                InstrumentConstraints::default()
            }
        }
    }

    fn exit_failed(&self, decision: ExitDecision, error: String) -> TickOutcome {
        self.events.publish(AgentEvent::ExitFailed {
            reason: decision.reason,
            quantity: decision.close_qty,
            error: error.clone(),
        });
        TickOutcome::Failed(AgentError::PartialUpdateFailure(format!(
            "{} close failed: {}",
            decision.reason, error
        )))
    }
}

fn hours(duration: Duration) -> f64 {
    duration.num_seconds() as f64 / 3600.0
}
