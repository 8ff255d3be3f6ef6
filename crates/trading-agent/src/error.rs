use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{ExitReason, Position};

/// Recoverable failures inside a cycle. None of these stop the loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// Candle or price fetch failed or came back empty
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Slippage guard tripped, or the order failed or did not fill
    #[error("execution rejected: {0}")]
    ExecutionRejected(String),

    /// A close order failed; the position is left as it was
    #[error("position update failed: {0}")]
    PartialUpdateFailure(String),

    /// Configuration or account constraint (e.g. balance below minimum)
    #[error("constraint: {0}")]
    Constraint(String),
}

/// What the slippage-checked dry run would have done.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunPreview {
    pub live_price: f64,
    pub slippage_pct: f64,
    pub quantity: Decimal,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub sl_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Filled(Box<Position>),
    DryRun(DryRunPreview),
    /// Nothing was sent to the exchange
    Rejected(AgentError),
    /// A buy was sent but its fill could not be confirmed; the exchange may
    /// hold a position this agent does not track
    Unconfirmed(AgentError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No position to monitor
    Idle,
    /// No exit condition met
    Holding,
    PartialExit {
        reason: ExitReason,
        remaining: Decimal,
    },
    Closed {
        reason: ExitReason,
        realized_pnl: f64,
    },
    Failed(AgentError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoSignal,
    Entered,
    DryRun,
    EntryRejected(AgentError),
    Monitored(TickOutcome),
    /// An untracked exchange position blocks entries
    Blocked,
    Skipped(AgentError),
    /// Stop was requested before an action started
    Stopped,
}
