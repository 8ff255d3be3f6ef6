use serde::{Deserialize, Serialize};
use technical_analysis::FeatureRow;

/// Maximum points per quality component.
pub const COMPONENT_MAX: f64 = 25.0;

/// Returns inspected by the momentum component.
pub const MOMENTUM_WINDOW: usize = 5;

/// Per-component breakdown of a signal quality score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityScore {
    pub trend: f64,
    pub momentum: f64,
    pub rsi: f64,
    pub volume: f64,
}

impl QualityScore {
    /// Sum of the components, capped at 100.
    pub fn total(&self) -> f64 {
        (self.trend + self.momentum + self.rsi + self.volume).min(100.0)
    }
}

/// Score the latest row of a (1-hour) feature history.
pub fn score_quality(rows: &[FeatureRow]) -> QualityScore {
    let Some(last) = rows.last() else {
        return QualityScore::default();
    };

    QualityScore {
        trend: trend_component(last),
        momentum: momentum_component(rows),
        rsi: rsi_component(last.rsi),
        volume: volume_component(last.volume_ratio()),
    }
}

/// Normalized EMA spreads, scaled; zero unless the stack is bullish.
fn trend_component(row: &FeatureRow) -> f64 {
    if !row.has_bullish_stack() {
        return 0.0;
    }
    let gap_fast_mid = (row.ema_fast - row.ema_mid) / row.ema_mid;
    let gap_mid_slow = (row.ema_mid - row.ema_slow) / row.ema_slow;
    COMPONENT_MAX.min((gap_fast_mid + gap_mid_slow) * 1000.0)
}

/// Share of the last five returns that are positive. Missing returns count as not positive.
fn momentum_component(rows: &[FeatureRow]) -> f64 {
    if rows.len() < MOMENTUM_WINDOW {
        return 0.0;
    }
    let recent = &rows[rows.len() - MOMENTUM_WINDOW..];
    let positive = recent
        .iter()
        .filter(|r| matches!(r.returns, Some(ret) if ret > 0.0))
        .count();
    positive as f64 / MOMENTUM_WINDOW as f64 * COMPONENT_MAX
}

fn rsi_component(rsi: Option<f64>) -> f64 {
    match rsi {
        Some(v) if (30.0..=70.0).contains(&v) => 25.0,
        Some(v) if (40.0..=60.0).contains(&v) => 15.0,
        _ => 0.0,
    }
}

fn volume_component(volume_ratio: Option<f64>) -> f64 {
    match volume_ratio {
        Some(r) if r > 1.2 => 25.0,
        Some(r) if r > 1.0 => 15.0,
        _ => 0.0,
    }
}
