//! Decision log stream.
//!
//! Every component publishes typed events on the [`EventBus`]. Each event is
//! written through `tracing` and fanned out to any subscribers; publishing
//! never waits on, or fails because of, the subscribers.

use broker_trait::ExchangePosition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use signal_engine::Signal;
use tokio::sync::broadcast;

use crate::types::{ExitReason, PositionState, TradeStats};

pub const EVENT_BUFFER: usize = 256;

/// Full accounting for one executed exit.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub reason: ExitReason,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub holding_hours: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub highest_price: f64,
    pub close_qty: Decimal,
    /// Closed quantity as a percent of the original size
    pub close_percent: f64,
    pub partial: bool,
    pub pnl_amount: f64,
    pub pnl_percent: f64,
    pub remaining_size: Decimal,
    /// Balance after the fill minus balance at entry, when it could be read
    pub balance_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        symbol: String,
        environment: String,
        leverage: u32,
        dry_run: bool,
        balance: f64,
    },
    LeverageConfigured {
        leverage: u32,
        already_set: bool,
    },
    LeverageFailed {
        error: String,
    },
    /// A position exists on the exchange that this agent did not open
    ExternalPosition {
        position: ExchangePosition,
    },
    DataUnavailable {
        reason: String,
    },
    NoSignal {
        reason: String,
    },
    SignalGenerated {
        signal: Signal,
    },
    EntryRejected {
        reason: String,
    },
    DryRunEntry {
        live_price: f64,
        slippage_pct: f64,
        quantity: Decimal,
        tp1_price: f64,
        tp2_price: f64,
        sl_price: f64,
        quality: f64,
    },
    EntryFilled {
        order_id: String,
        quantity: Decimal,
        signal_price: f64,
        fill_price: f64,
        /// Signed fill slippage versus the signal price, in percent
        slippage_pct: f64,
        tp1_price: f64,
        tp2_price: f64,
        sl_price: f64,
        balance: f64,
    },
    PositionUpdate {
        state: PositionState,
        price: f64,
        pnl_pct: f64,
        highest_price: f64,
        remaining_size: Decimal,
        trailing_stop: Option<f64>,
        holding_hours: f64,
    },
    ExitExecuted(ExitReport),
    ExitFailed {
        reason: ExitReason,
        quantity: Decimal,
        error: String,
    },
    PositionClosed {
        realized_pnl: f64,
        stats: TradeStats,
    },
    Stopped {
        stats: TradeStats,
        metrics: serde_json::Value,
        open_position: Option<ExchangePosition>,
    },
}

impl AgentEvent {
    /// Write the event through tracing at a level matching its severity.
    fn log(&self) {
        match self {
            AgentEvent::Started {
                symbol,
                environment,
                leverage,
                dry_run,
                balance,
            } => tracing::info!(
                symbol = %symbol,
                environment = %environment,
                leverage,
                dry_run,
                "Agent started with {:.2} available",
                balance
            ),
            AgentEvent::LeverageConfigured {
                leverage,
                already_set,
            } => tracing::info!(leverage, already_set, "Leverage configured"),
            AgentEvent::LeverageFailed { error } => {
                tracing::warn!("Failed to set leverage: {}", error)
            }
            AgentEvent::ExternalPosition { position } => tracing::warn!(
                side = %position.side,
                size = %position.size,
                entry_price = position.entry_price,
                unrealized_pnl = position.unrealized_pnl,
                "Untracked exchange position found, entries blocked"
            ),
            AgentEvent::DataUnavailable { reason } => {
                tracing::warn!("Data unavailable: {}", reason)
            }
            AgentEvent::NoSignal { reason } => tracing::info!("No signal: {}", reason),
            AgentEvent::SignalGenerated { signal } => tracing::info!(
                entry = signal.entry_price,
                quality = signal.quality,
                vol_regime = %signal.vol_regime,
                atr_ratio = signal.atr_ratio,
                market_regime = %signal.market_regime,
                "Entry signal: TP1 ${:.2} (+{:.1}%), TP2 ${:.2} (+{:.1}%), SL ${:.2} (-{:.1}%)",
                signal.tp1_price,
                signal.targets.tp1_pct * 100.0,
                signal.tp2_price,
                signal.targets.tp2_pct * 100.0,
                signal.sl_price,
                signal.targets.sl_pct * 100.0
            ),
            AgentEvent::EntryRejected { reason } => tracing::warn!("Entry rejected: {}", reason),
            AgentEvent::DryRunEntry {
                live_price,
                slippage_pct,
                quantity,
                tp1_price,
                tp2_price,
                sl_price,
                quality,
            } => tracing::info!(
                quantity = %quantity,
                quality,
                "DRY RUN entry @ ${:.2} (slippage {:.2}%): TP1 ${:.2}, TP2 ${:.2}, SL ${:.2}",
                live_price,
                slippage_pct,
                tp1_price,
                tp2_price,
                sl_price
            ),
            AgentEvent::EntryFilled {
                order_id,
                quantity,
                signal_price,
                fill_price,
                slippage_pct,
                tp1_price,
                tp2_price,
                sl_price,
                ..
            } => tracing::info!(
                order_id = %order_id,
                quantity = %quantity,
                "Entry filled @ ${:.2} (signal ${:.2}, slippage {:+.2}%): TP1 ${:.2}, TP2 ${:.2}, SL ${:.2}",
                fill_price,
                signal_price,
                slippage_pct,
                tp1_price,
                tp2_price,
                sl_price
            ),
            AgentEvent::PositionUpdate {
                state,
                price,
                pnl_pct,
                highest_price,
                remaining_size,
                trailing_stop,
                holding_hours,
            } => tracing::info!(
                state = ?state,
                remaining = %remaining_size,
                highest = highest_price,
                trailing_stop = ?trailing_stop,
                "Position @ ${:.2} ({:+.2}%), held {:.1}h",
                price,
                pnl_pct,
                holding_hours
            ),
            AgentEvent::ExitExecuted(report) => tracing::info!(
                reason = %report.reason,
                close_qty = %report.close_qty,
                remaining = %report.remaining_size,
                partial = report.partial,
                balance_change = ?report.balance_change,
                "Exit executed @ ${:.2}: P&L {:+.2} ({:+.2}%)",
                report.exit_price,
                report.pnl_amount,
                report.pnl_percent
            ),
            AgentEvent::ExitFailed {
                reason,
                quantity,
                error,
            } => tracing::error!(
                reason = %reason,
                quantity = %quantity,
                "Exit order failed, retrying next tick: {}",
                error
            ),
            AgentEvent::PositionClosed {
                realized_pnl,
                stats,
            } => tracing::info!(
                total_trades = stats.total_trades,
                winning_trades = stats.winning_trades,
                "Position closed: P&L {:+.2}, win rate {:.1}%, cumulative {:+.2}",
                realized_pnl,
                stats.win_rate(),
                stats.total_profit
            ),
            AgentEvent::Stopped {
                stats,
                open_position,
                ..
            } => {
                tracing::info!(
                    total_trades = stats.total_trades,
                    winning_trades = stats.winning_trades,
                    "Agent stopped: cumulative P&L {:+.2}",
                    stats.total_profit
                );
                if let Some(p) = open_position {
                    tracing::warn!(
                        side = %p.side,
                        size = %p.size,
                        entry_price = p.entry_price,
                        "Position still open at shutdown, unrealized P&L {:+.2}",
                        p.unrealized_pnl
                    );
                }
            }
        }
    }
}

/// Broadcast sink for agent events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        event.log();
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

/// Mirror the event stream to stdout as JSON lines until the bus is dropped.
pub fn spawn_stdout_mirror(mut rx: broadcast::Receiver<AgentEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::debug!("Failed to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event mirror lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
