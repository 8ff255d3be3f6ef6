use analysis_core::stats::{mean_present, std_dev};
use serde::{Deserialize, Serialize};
use technical_analysis::FeatureRow;

/// Rows averaged for the ATR-percent baseline.
pub const VOLATILITY_LOOKBACK: usize = 30;

/// Rows required before a market regime can be classified.
pub const MARKET_REGIME_MIN_ROWS: usize = 50;

/// Volatility regime, from the ratio of current ATR-percent to its trailing mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityRegime {
    UltraLow,
    Low,
    Normal,
    High,
    UltraHigh,
}

impl VolatilityRegime {
    /// Classify an ATR ratio. Each band's upper bound is exclusive.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.7 {
            VolatilityRegime::UltraLow
        } else if ratio < 0.9 {
            VolatilityRegime::Low
        } else if ratio < 1.1 {
            VolatilityRegime::Normal
        } else if ratio < 1.3 {
            VolatilityRegime::High
        } else {
            VolatilityRegime::UltraHigh
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VolatilityRegime::UltraLow => "ULTRA_LOW",
            VolatilityRegime::Low => "LOW",
            VolatilityRegime::Normal => "NORMAL",
            VolatilityRegime::High => "HIGH",
            VolatilityRegime::UltraHigh => "ULTRA_HIGH",
        }
    }
}

impl std::fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Market trend regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    /// Rising EMA with most closes above it, calm returns
    TrendUp,

    /// Same as `TrendUp` but with return stdev of 3% or more
    VolatileUp,

    /// Falling EMA with most closes below it
    TrendDown,

    /// Tight 50-row high/low range
    Sideways,

    /// None of the above
    Volatile,

    /// Fewer than 50 rows
    Unknown,
}

impl MarketRegime {
    pub fn name(&self) -> &'static str {
        match self {
            MarketRegime::TrendUp => "TREND_UP",
            MarketRegime::VolatileUp => "VOLATILE_UP",
            MarketRegime::TrendDown => "TREND_DOWN",
            MarketRegime::Sideways => "SIDEWAYS",
            MarketRegime::Volatile => "VOLATILE",
            MarketRegime::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Volatility regime together with the ratio it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityReading {
    pub regime: VolatilityRegime,
    pub atr_ratio: f64,
}

impl VolatilityReading {
    /// Safe default used while there is not enough history.
    pub fn neutral() -> Self {
        Self {
            regime: VolatilityRegime::Normal,
            atr_ratio: 1.0,
        }
    }
}

/// Inputs to the market regime decision, kept for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMetrics {
    /// EMA-fast change over 20 rows, per row, as a fraction of the current close
    pub ema_slope: f64,

    /// Share of the last 20 closes above EMA-fast
    pub above_ema_fraction: f64,

    /// Sample standard deviation of returns over the last 50 rows
    pub returns_std: f64,

    /// (50-row high - 50-row low) / 50-row low
    pub range_fraction: f64,
}

/// Market regime result with the metrics behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDetectionResult {
    pub regime: MarketRegime,
    pub metrics: Option<RegimeMetrics>,
}

/// Mean ATR-percent over the trailing lookback rows, skipping warm-up gaps.
pub fn trailing_atr_mean(rows: &[FeatureRow], lookback: usize) -> Option<f64> {
    let start = rows.len().saturating_sub(lookback);
    let window: Vec<Option<f64>> = rows[start..].iter().map(|r| r.atr_pct).collect();
    mean_present(&window)
}

/// Classify the volatility regime of the latest row.
///
/// Falls back to NORMAL / 1.0 with fewer than 30 rows, a zero baseline, or a
/// missing current ATR.
pub fn detect_volatility_regime(rows: &[FeatureRow]) -> VolatilityReading {
    if rows.len() < VOLATILITY_LOOKBACK {
        return VolatilityReading::neutral();
    }

    let current = match rows.last().and_then(|r| r.atr_pct) {
        Some(atr) => atr,
        None => return VolatilityReading::neutral(),
    };

    let baseline = match trailing_atr_mean(rows, VOLATILITY_LOOKBACK) {
        Some(avg) if avg != 0.0 => avg,
        _ => return VolatilityReading::neutral(),
    };

    let atr_ratio = current / baseline;
    VolatilityReading {
        regime: VolatilityRegime::from_ratio(atr_ratio),
        atr_ratio,
    }
}

/// Market regime detector
pub struct MarketRegimeDetector {
    /// Minimum rows required for analysis
    min_rows: usize,
}

impl MarketRegimeDetector {
    pub fn new() -> Self {
        Self {
            min_rows: MARKET_REGIME_MIN_ROWS,
        }
    }

    /// Classify the market regime from the latest rows.
    pub fn detect_regime(&self, rows: &[FeatureRow]) -> RegimeDetectionResult {
        if rows.len() < self.min_rows {
            return RegimeDetectionResult {
                regime: MarketRegime::Unknown,
                metrics: None,
            };
        }

        let metrics = self.calculate_metrics(rows);
        RegimeDetectionResult {
            regime: Self::classify(&metrics),
            metrics: Some(metrics),
        }
    }

    fn calculate_metrics(&self, rows: &[FeatureRow]) -> RegimeMetrics {
        let n = rows.len();
        let last = &rows[n - 1];
        let recent = &rows[n - self.min_rows..];

        let ema_slope = (last.ema_fast - rows[n - 21].ema_fast) / 20.0 / last.close;

        let last20 = &recent[recent.len() - 20..];
        let above = last20.iter().filter(|r| r.close > r.ema_fast).count();
        let above_ema_fraction = above as f64 / last20.len() as f64;

        let returns: Vec<f64> = recent.iter().filter_map(|r| r.returns).collect();
        let returns_std = std_dev(&returns);

        let high = recent.iter().map(|r| r.high).fold(f64::NEG_INFINITY, f64::max);
        let low = recent.iter().map(|r| r.low).fold(f64::INFINITY, f64::min);
        let range_fraction = (high - low) / low;

        RegimeMetrics {
            ema_slope,
            above_ema_fraction,
            returns_std,
            range_fraction,
        }
    }

    /// First matching clause wins.
    fn classify(m: &RegimeMetrics) -> MarketRegime {
        if m.ema_slope > 0.001 && m.above_ema_fraction > 0.7 {
            if m.returns_std < 0.03 {
                MarketRegime::TrendUp
            } else {
                MarketRegime::VolatileUp
            }
        } else if m.ema_slope < -0.001 && m.above_ema_fraction < 0.3 {
            MarketRegime::TrendDown
        } else if m.range_fraction < 0.15 {
            MarketRegime::Sideways
        } else {
            MarketRegime::Volatile
        }
    }
}

impl Default for MarketRegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}
