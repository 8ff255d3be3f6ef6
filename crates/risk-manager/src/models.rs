use market_regime_detector::VolatilityRegime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Share of available balance committed per entry (0.3 = 30%)
    pub risk_fraction: f64,
    pub leverage: u32,
    /// Absolute ceiling on the stop-loss distance, as a fraction (0.03 = 3%)
    pub max_stop_loss_fraction: f64,
    /// Profit from entry, as a fraction, at which the trailing stop arms
    pub trailing_activation_fraction: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            risk_fraction: 0.3,
            leverage: 2,
            max_stop_loss_fraction: 0.03,
            trailing_activation_fraction: 0.05,
        }
    }
}

/// TP1 / TP2 / SL distances as multiples of current ATR-percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeMultipliers {
    pub tp1: f64,
    pub tp2: f64,
    pub sl: f64,
}

impl RegimeMultipliers {
    pub fn for_regime(regime: VolatilityRegime) -> Self {
        let (tp1, tp2, sl) = match regime {
            VolatilityRegime::UltraLow => (6.0, 9.0, 2.0),
            VolatilityRegime::Low => (5.0, 7.5, 2.3),
            VolatilityRegime::Normal => (4.0, 6.5, 2.5),
            VolatilityRegime::High => (3.0, 5.0, 3.0),
            VolatilityRegime::UltraHigh => (2.5, 4.0, 3.5),
        };
        Self { tp1, tp2, sl }
    }
}

/// Inclusive `(min, max)` band, as fractions of price.
pub type Band = (f64, f64);

/// Safe ranges each raw target is clamped into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBands {
    pub tp1: Band,
    pub tp2: Band,
    pub sl: Band,
}

impl TargetBands {
    pub fn for_regime(regime: VolatilityRegime) -> Self {
        match regime {
            VolatilityRegime::UltraLow => Self {
                tp1: (0.08, 0.20),
                tp2: (0.15, 0.35),
                sl: (0.02, 0.06),
            },
            VolatilityRegime::Low => Self {
                tp1: (0.06, 0.18),
                tp2: (0.12, 0.30),
                sl: (0.025, 0.07),
            },
            VolatilityRegime::Normal => Self {
                tp1: (0.04, 0.15),
                tp2: (0.08, 0.25),
                sl: (0.025, 0.08),
            },
            VolatilityRegime::High => Self {
                tp1: (0.03, 0.12),
                tp2: (0.06, 0.20),
                sl: (0.03, 0.09),
            },
            VolatilityRegime::UltraHigh => Self {
                tp1: (0.02, 0.10),
                tp2: (0.04, 0.15),
                sl: (0.035, 0.10),
            },
        }
    }
}

/// Exit distances from entry, as fractions (0.04 = 4%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeTargets {
    pub tp1_pct: f64,
    pub tp2_pct: f64,
    pub sl_pct: f64,
}

impl TradeTargets {
    /// Long-side exit prices anchored at `entry_price`.
    pub fn prices(&self, entry_price: f64) -> TargetPrices {
        TargetPrices {
            tp1: entry_price * (1.0 + self.tp1_pct),
            tp2: entry_price * (1.0 + self.tp2_pct),
            sl: entry_price * (1.0 - self.sl_pct),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetPrices {
    pub tp1: f64,
    pub tp2: f64,
    pub sl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeCalculation {
    /// Balance share committed before leverage
    pub usable_balance: f64,
    /// Notional after leverage
    pub position_value: f64,
    pub raw_quantity: f64,
    /// Quantity after step rounding and the minimum-quantity floor
    pub quantity: Decimal,
    /// True when the instrument minimum replaced a smaller rounded quantity
    pub bumped_to_minimum: bool,
}
