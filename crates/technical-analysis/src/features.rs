use analysis_core::{Candle, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::{atr_percent, ema, rolling_mean, rsi, simple_returns};

pub const EMA_FAST_PERIOD: usize = 20;
pub const EMA_MID_PERIOD: usize = 50;
pub const EMA_SLOW_PERIOD: usize = 200;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const VOLUME_MA_PERIOD: usize = 20;

/// Rows needed before the slow EMA is considered warmed up.
pub const WARMUP_ROWS: usize = EMA_SLOW_PERIOD;

/// One candle plus every indicator derived from history up to and including it.
///
/// Optional fields are `None` while their lookback window is still filling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ema_fast: f64,
    pub ema_mid: f64,
    pub ema_slow: f64,
    pub rsi: Option<f64>,
    pub atr_pct: Option<f64>,
    pub volume_ma: Option<f64>,
    pub returns: Option<f64>,
}

impl FeatureRow {
    /// Strict bullish stack: fast > mid > slow.
    pub fn has_bullish_stack(&self) -> bool {
        self.ema_fast > self.ema_mid && self.ema_mid > self.ema_slow
    }

    /// Current volume relative to its moving average.
    pub fn volume_ratio(&self) -> Option<f64> {
        match self.volume_ma {
            Some(ma) if ma > 0.0 => Some(self.volume / ma),
            _ => None,
        }
    }
}

/// Compute the feature rows for one timeframe, aligned 1:1 with `candles`.
///
/// An empty input yields no rows; callers treat that as "data unavailable".
pub fn compute_features(candles: &[Candle]) -> Vec<FeatureRow> {
    if candles.is_empty() {
        return vec![];
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<Option<f64>> = candles.iter().map(|c| Some(c.volume)).collect();

    let ema_fast = ema(&closes, EMA_FAST_PERIOD);
    let ema_mid = ema(&closes, EMA_MID_PERIOD);
    let ema_slow = ema(&closes, EMA_SLOW_PERIOD);
    let rsi_values = rsi(&closes, RSI_PERIOD);
    let atr_values = atr_percent(candles, ATR_PERIOD);
    let volume_ma = rolling_mean(&volumes, VOLUME_MA_PERIOD);
    let returns = simple_returns(&closes);

    candles
        .iter()
        .enumerate()
        .map(|(i, c)| FeatureRow {
            timestamp: c.timestamp,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            ema_fast: ema_fast[i],
            ema_mid: ema_mid[i],
            ema_slow: ema_slow[i],
            rsi: rsi_values[i],
            atr_pct: atr_values[i],
            volume_ma: volume_ma[i],
            returns: returns[i],
        })
        .collect()
}

/// Whether a row sequence is long enough for slow-EMA dependent logic.
pub fn is_warmed_up(rows: &[FeatureRow]) -> bool {
    rows.len() >= WARMUP_ROWS
}

/// Feature rows for every timeframe fetched in one cycle.
#[derive(Debug, Clone, Default)]
pub struct MultiTimeframeFeatures {
    pub hour1: Vec<FeatureRow>,
    pub min15: Vec<FeatureRow>,
    pub min5: Vec<FeatureRow>,
}

impl MultiTimeframeFeatures {
    pub fn rows(&self, timeframe: Timeframe) -> &[FeatureRow] {
        match timeframe {
            Timeframe::Hour1 => &self.hour1,
            Timeframe::Min15 => &self.min15,
            Timeframe::Min5 => &self.min5,
        }
    }

    /// Timeframes that produced no rows this cycle.
    pub fn missing(&self) -> Vec<Timeframe> {
        Timeframe::all()
            .into_iter()
            .filter(|tf| self.rows(*tf).is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trending_candles(count: usize, step: f64) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(count as i64);
        (0..count)
            .map(|i| {
                let close = 100.0 + i as f64 * step;
                Candle {
                    timestamp: start + Duration::hours(i as i64),
                    open: close - step,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1000.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn test_empty_input_produces_no_rows() {
        assert!(compute_features(&[]).is_empty());
    }

    #[test]
    fn test_rows_aligned_with_candles() {
        let candles = trending_candles(250, 0.5);
        let rows = compute_features(&candles);

        assert_eq!(rows.len(), candles.len());
        for (row, candle) in rows.iter().zip(candles.iter()) {
            assert_eq!(row.timestamp, candle.timestamp);
            assert_eq!(row.close, candle.close);
        }
    }

    #[test]
    fn test_warmup_gaps() {
        let rows = compute_features(&trending_candles(30, 1.0));

        assert!(rows[13].rsi.is_none());
        assert!(rows[14].rsi.is_some());
        assert!(rows[12].atr_pct.is_none());
        assert!(rows[13].atr_pct.is_some());
        assert!(rows[18].volume_ma.is_none());
        assert!(rows[19].volume_ma.is_some());
        assert!(rows[0].returns.is_none());
        assert!(rows[1].returns.is_some());
        assert!(!is_warmed_up(&rows));
    }

    #[test]
    fn test_recompute_is_bit_identical() {
        let candles = trending_candles(300, 0.25);
        let first = compute_features(&candles);
        let second = compute_features(&candles);

        assert_eq!(first, second);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.ema_slow.to_bits(), b.ema_slow.to_bits());
            assert_eq!(
                a.atr_pct.map(f64::to_bits),
                b.atr_pct.map(f64::to_bits)
            );
        }
    }

    #[test]
    fn test_uptrend_has_bullish_stack() {
        let rows = compute_features(&trending_candles(300, 0.5));
        let last = rows.last().unwrap();

        assert!(is_warmed_up(&rows));
        assert!(last.has_bullish_stack());
    }

    #[test]
    fn test_downtrend_breaks_stack() {
        let rows = compute_features(&trending_candles(300, -0.2));
        assert!(!rows.last().unwrap().has_bullish_stack());
    }

    #[test]
    fn test_missing_timeframes() {
        let features = MultiTimeframeFeatures {
            hour1: compute_features(&trending_candles(5, 1.0)),
            min15: vec![],
            min5: compute_features(&trending_candles(5, 1.0)),
        };
        assert_eq!(features.missing(), vec![Timeframe::Min15]);
    }
}
