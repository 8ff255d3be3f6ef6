use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use signal_engine::Signal;

/// Remaining size at or below this is treated as fully closed.
pub const CLOSED_SIZE_EPSILON: Decimal = dec!(0.001);

/// Share of the remaining size closed at TP1.
pub const TP1_CLOSE_FRACTION: Decimal = dec!(0.5);

/// The single live long position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Filled size at entry
    pub size: Decimal,
    pub remaining_size: Decimal,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub sl_price: f64,
    pub tp1_hit: bool,
    pub trailing_stop: Option<f64>,
    /// Only ever increases
    pub highest_price: f64,
    pub signal: Signal,
    /// Available balance right before entry
    pub initial_balance: f64,
    /// Accumulated over partial exits, folded into stats on close
    pub realized_pnl: f64,
}

impl Position {
    /// New position from an entry fill. Targets are re-anchored to the fill price.
    pub fn from_fill(
        signal: Signal,
        fill_price: f64,
        filled_qty: Decimal,
        initial_balance: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let prices = signal.prices_at(fill_price);
        Self {
            entry_price: fill_price,
            entry_time,
            size: filled_qty,
            remaining_size: filled_qty,
            tp1_price: prices.tp1,
            tp2_price: prices.tp2,
            sl_price: prices.sl,
            tp1_hit: false,
            trailing_stop: None,
            highest_price: fill_price,
            signal,
            initial_balance,
            realized_pnl: 0.0,
        }
    }

    pub fn pnl_percent(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn holding_time(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }

    pub fn is_closed(&self) -> bool {
        self.remaining_size <= CLOSED_SIZE_EPSILON
    }

    pub fn state(&self) -> PositionState {
        if self.is_closed() {
            PositionState::Closed
        } else if self.remaining_size < self.size {
            PositionState::PartiallyClosed
        } else {
            PositionState::Open
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Open,
    PartiallyClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Tp1,
    Tp2,
    Trailing,
    StopLoss,
    Timeout,
}

impl ExitReason {
    pub fn name(&self) -> &'static str {
        match self {
            ExitReason::Tp1 => "TP1",
            ExitReason::Tp2 => "TP2",
            ExitReason::Trailing => "TRAILING",
            ExitReason::StopLoss => "SL",
            ExitReason::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An exit the state machine wants executed this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub close_qty: Decimal,
}

/// Running counters for closed positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_profit: f64,
}

impl TradeStats {
    pub fn record(&mut self, pnl: f64) {
        self.total_trades += 1;
        if pnl > 0.0 {
            self.winning_trades += 1;
        }
        self.total_profit += pnl;
    }

    /// Win rate in percent (0 with no trades)
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64 * 100.0
    }
}

/// Per-cycle view published to observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub cycle: u64,
    pub running: bool,
    pub position: Option<Position>,
    pub stats: TradeStats,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_exchange::test_signal;

    #[test]
    fn test_position_states() {
        let mut p = Position::from_fill(test_signal(100.0), 100.0, dec!(1), 500.0, Utc::now());
        assert_eq!(p.state(), PositionState::Open);

        p.remaining_size = dec!(0.5);
        assert_eq!(p.state(), PositionState::PartiallyClosed);

        // Dust at or below the epsilon counts as closed
        p.remaining_size = dec!(0.001);
        assert_eq!(p.state(), PositionState::Closed);
        assert!(p.is_closed());
    }

    #[test]
    fn test_pnl_and_holding() {
        let entry = Utc::now() - Duration::hours(5);
        let p = Position::from_fill(test_signal(200.0), 200.0, dec!(1), 500.0, entry);
        assert!((p.pnl_percent(210.0) - 5.0).abs() < 1e-9);
        assert_eq!(p.holding_time(entry + Duration::hours(5)), Duration::hours(5));
    }

    #[test]
    fn test_trade_stats() {
        let mut stats = TradeStats::default();
        assert_eq!(stats.win_rate(), 0.0);
        stats.record(17.5);
        stats.record(-4.0);
        stats.record(0.0);
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.winning_trades, 1);
        assert!((stats.total_profit - 13.5).abs() < 1e-9);
        assert!((stats.win_rate() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_reason_names() {
        assert_eq!(ExitReason::StopLoss.to_string(), "SL");
        assert_eq!(
            serde_json::to_string(&ExitReason::StopLoss).unwrap(),
            "\"STOP_LOSS\""
        );
    }
}
