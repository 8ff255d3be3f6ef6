//! Entry signal generation: gate, quality score, and adaptive targets.

pub mod quality;

use chrono::{DateTime, Utc};
use market_regime_detector::{
    detect_volatility_regime, trailing_atr_mean, MarketRegime, MarketRegimeDetector,
    VolatilityRegime, VOLATILITY_LOOKBACK,
};
use risk_manager::{RiskManager, TargetPrices, TradeTargets};
use serde::{Deserialize, Serialize};
use technical_analysis::{is_warmed_up, FeatureRow, MultiTimeframeFeatures};

pub use quality::{score_quality, QualityScore};

/// Default minimum quality score for an entry.
pub const BASE_MIN_QUALITY: f64 = 60.0;

/// Minimum quality score during an ATR spike or ULTRA_HIGH volatility.
pub const ELEVATED_MIN_QUALITY: f64 = 75.0;

/// Current ATR-percent above this multiple of its trailing mean is a spike.
pub const ATR_SPIKE_MULTIPLE: f64 = 1.5;

/// A long entry recommendation. Built once, consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Close of the last closed 1-hour candle
    pub entry_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub sl_price: f64,
    /// Exit distances as fractions of the entry price
    pub targets: TradeTargets,
    pub quality: f64,
    pub quality_breakdown: QualityScore,
    pub vol_regime: VolatilityRegime,
    pub atr_ratio: f64,
    pub market_regime: MarketRegime,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Re-anchor the signal's percentages to a different entry price.
    pub fn prices_at(&self, entry_price: f64) -> TargetPrices {
        self.targets.prices(entry_price)
    }
}

/// Why a cycle produced no signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoSignalReason {
    /// Fewer than the warm-up rows on the 1-hour timeframe
    InsufficientHistory { rows: usize },
    /// Latest 1-hour row is not strictly fast > mid > slow
    NoBullishStack,
    /// Latest 1-hour row has no ATR-percent
    MissingAtr,
    BelowThreshold { quality: f64, min_quality: f64 },
}

impl std::fmt::Display for NoSignalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoSignalReason::InsufficientHistory { rows } => {
                write!(f, "insufficient 1h history ({} rows)", rows)
            }
            NoSignalReason::NoBullishStack => write!(f, "EMA stack not bullish"),
            NoSignalReason::MissingAtr => write!(f, "ATR not available"),
            NoSignalReason::BelowThreshold {
                quality,
                min_quality,
            } => write!(f, "quality {:.1} below {:.0}", quality, min_quality),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvaluation {
    Signal(Signal),
    NoSignal(NoSignalReason),
}

/// Minimum quality given current ATR, its trailing mean, and the volatility regime.
pub fn minimum_quality(atr_pct: f64, atr_avg: Option<f64>, regime: VolatilityRegime) -> f64 {
    let spike = matches!(atr_avg, Some(avg) if atr_pct > avg * ATR_SPIKE_MULTIPLE);
    if spike || regime == VolatilityRegime::UltraHigh {
        ELEVATED_MIN_QUALITY
    } else {
        BASE_MIN_QUALITY
    }
}

pub struct SignalGenerator {
    risk: RiskManager,
    regime_detector: MarketRegimeDetector,
}

impl SignalGenerator {
    pub fn new(risk: RiskManager) -> Self {
        Self {
            risk,
            regime_detector: MarketRegimeDetector::new(),
        }
    }

    pub fn risk_manager(&self) -> &RiskManager {
        &self.risk
    }

    /// Entry signal for this cycle's features, if any.
    pub fn check_entry_signal(&self, features: &MultiTimeframeFeatures) -> Option<Signal> {
        match self.evaluate(&features.hour1) {
            SignalEvaluation::Signal(signal) => Some(signal),
            SignalEvaluation::NoSignal(_) => None,
        }
    }

    /// Evaluate the 1-hour feature history.
    ///
    /// The warm-up and bullish-stack checks are hard gates evaluated before
    /// any scoring.
    pub fn evaluate(&self, hour1: &[FeatureRow]) -> SignalEvaluation {
        if !is_warmed_up(hour1) {
            return SignalEvaluation::NoSignal(NoSignalReason::InsufficientHistory {
                rows: hour1.len(),
            });
        }
        let Some(last) = hour1.last() else {
            return SignalEvaluation::NoSignal(NoSignalReason::InsufficientHistory { rows: 0 });
        };
        if !last.has_bullish_stack() {
            return SignalEvaluation::NoSignal(NoSignalReason::NoBullishStack);
        }
        let Some(atr_pct) = last.atr_pct else {
            return SignalEvaluation::NoSignal(NoSignalReason::MissingAtr);
        };

        let volatility = detect_volatility_regime(hour1);
        let market = self.regime_detector.detect_regime(hour1);

        let atr_avg = trailing_atr_mean(hour1, VOLATILITY_LOOKBACK);
        let min_quality = minimum_quality(atr_pct, atr_avg, volatility.regime);

        let breakdown = score_quality(hour1);
        let quality = breakdown.total();
        if quality < min_quality {
            tracing::debug!(quality, min_quality, "Signal quality below threshold");
            return SignalEvaluation::NoSignal(NoSignalReason::BelowThreshold {
                quality,
                min_quality,
            });
        }

        let targets = self.risk.calculate_targets(atr_pct, volatility.regime);
        let prices = targets.prices(last.close);

        SignalEvaluation::Signal(Signal {
            entry_price: last.close,
            tp1_price: prices.tp1,
            tp2_price: prices.tp2,
            sl_price: prices.sl,
            targets,
            quality,
            quality_breakdown: breakdown,
            vol_regime: volatility.regime,
            atr_ratio: volatility.atr_ratio,
            market_regime: market.regime,
            timestamp: last.timestamp,
        })
    }
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new(RiskManager::default())
    }
}
