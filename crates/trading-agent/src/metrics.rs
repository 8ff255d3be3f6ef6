use std::collections::VecDeque;
use std::time::Instant;

use crate::error::{AgentError, CycleOutcome, TickOutcome};
use crate::types::TradeStats;

const RECENT_WINDOW: usize = 20;

/// Structured telemetry for the trading agent.
/// Tracks per-cycle timing, decision counters, and a rolling trade window.
/// Trade totals live in [`TradeStats`] and are passed in when reporting.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub signals_generated: u64,
    pub signals_absent: u64,
    pub entries_filled: u64,
    pub entries_rejected: u64,
    pub dry_run_entries: u64,
    pub exits_executed: u64,
    pub exits_failed: u64,
    pub data_unavailable: u64,

    // Per-cycle timing (last cycle)
    pub last_data_duration_ms: u64,
    pub last_execution_duration_ms: u64,
    pub last_total_duration_ms: u64,

    // Rolling 20-trade window
    recent_trades: VecDeque<TradeRecord>,
    log_interval_cycles: u64,
}

struct TradeRecord {
    pnl: f64,
    won: bool,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            signals_generated: 0,
            signals_absent: 0,
            entries_filled: 0,
            entries_rejected: 0,
            dry_run_entries: 0,
            exits_executed: 0,
            exits_failed: 0,
            data_unavailable: 0,
            last_data_duration_ms: 0,
            last_execution_duration_ms: 0,
            last_total_duration_ms: 0,
            recent_trades: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_data_duration(&mut self, start: Instant) {
        self.last_data_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_execution_duration(&mut self, start: Instant) {
        self.last_execution_duration_ms = start.elapsed().as_millis() as u64;
    }

    /// Count what a cycle did.
    pub fn record_cycle(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::NoSignal => self.signals_absent += 1,
            CycleOutcome::Entered => {
                self.signals_generated += 1;
                self.entries_filled += 1;
            }
            CycleOutcome::DryRun => {
                self.signals_generated += 1;
                self.dry_run_entries += 1;
            }
            CycleOutcome::EntryRejected(_) => {
                self.signals_generated += 1;
                self.entries_rejected += 1;
            }
            CycleOutcome::Monitored(tick) => self.record_tick(tick),
            CycleOutcome::Skipped(_) => self.data_unavailable += 1,
            CycleOutcome::Blocked | CycleOutcome::Stopped => {}
        }
    }

    fn record_tick(&mut self, tick: &TickOutcome) {
        match tick {
            TickOutcome::PartialExit { .. } => self.exits_executed += 1,
            TickOutcome::Closed { realized_pnl, .. } => {
                self.exits_executed += 1;
                self.record_trade_result(*realized_pnl);
            }
            TickOutcome::Failed(AgentError::DataUnavailable(_)) => {
                self.data_unavailable += 1
            }
            TickOutcome::Failed(_) => self.exits_failed += 1,
            TickOutcome::Idle | TickOutcome::Holding => {}
        }
    }

    /// Push a closed trade into the rolling window.
    pub fn record_trade_result(&mut self, pnl: f64) {
        self.recent_trades.push_back(TradeRecord { pnl, won: pnl > 0.0 });
        if self.recent_trades.len() > RECENT_WINDOW {
            self.recent_trades.pop_front();
        }
    }

    pub fn finish_cycle(&mut self, cycle_start: Instant, stats: &TradeStats) {
        self.last_total_duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.cycles_run += 1;

        // Emit structured metrics periodically
        if self.log_interval_cycles > 0 && self.cycles_run.is_multiple_of(self.log_interval_cycles)
        {
            self.log_metrics(stats);
        }
    }

    /// Rolling win rate from last 20 trades (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        let wins = self.recent_trades.iter().filter(|t| t.won).count() as f64;
        (wins / self.recent_trades.len() as f64) * 100.0
    }

    /// Rolling average P&L from last 20 trades
    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        self.recent_trades.iter().map(|t| t.pnl).sum::<f64>() / self.recent_trades.len() as f64
    }

    pub fn log_metrics(&self, stats: &TradeStats) {
        tracing::info!(
            cycles = self.cycles_run,
            signals_generated = self.signals_generated,
            signals_absent = self.signals_absent,
            entries_filled = self.entries_filled,
            entries_rejected = self.entries_rejected,
            dry_run_entries = self.dry_run_entries,
            exits_executed = self.exits_executed,
            exits_failed = self.exits_failed,
            data_unavailable = self.data_unavailable,
            total_trades = stats.total_trades,
            total_pnl = format!("{:.2}", stats.total_profit),
            overall_win_rate = format!("{:.1}%", stats.win_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            recent_avg_pnl = format!("{:.2}", self.recent_avg_pnl()),
            last_cycle_ms = self.last_total_duration_ms,
            last_data_ms = self.last_data_duration_ms,
            last_execution_ms = self.last_execution_duration_ms,
            "Agent metrics summary"
        );
    }

    /// Counters as JSON, for the shutdown report
    pub fn to_json(&self, stats: &TradeStats) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run,
            "signals_generated": self.signals_generated,
            "signals_absent": self.signals_absent,
            "entries_filled": self.entries_filled,
            "entries_rejected": self.entries_rejected,
            "dry_run_entries": self.dry_run_entries,
            "exits_executed": self.exits_executed,
            "exits_failed": self.exits_failed,
            "data_unavailable": self.data_unavailable,
            "total_trades": stats.total_trades,
            "winning_trades": stats.winning_trades,
            "total_pnl": stats.total_profit,
            "overall_win_rate": stats.win_rate(),
            "recent_win_rate": self.recent_win_rate(),
        })
    }
}
