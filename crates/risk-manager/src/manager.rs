use anyhow::{anyhow, Result};
use market_regime_detector::VolatilityRegime;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::*;

#[derive(Debug, Clone)]
pub struct RiskManager {
    params: RiskParameters,
}

impl RiskManager {
    pub fn new(params: RiskParameters) -> Self {
        Self { params }
    }

    pub fn parameters(&self) -> &RiskParameters {
        &self.params
    }

    /// Adaptive take-profit / stop-loss distances for the current volatility.
    ///
    /// Raw distances are `atr_pct * multiplier`, clamped into the regime's
    /// band; the stop-loss is then capped at the absolute maximum.
    pub fn calculate_targets(&self, atr_pct: f64, regime: VolatilityRegime) -> TradeTargets {
        let mults = RegimeMultipliers::for_regime(regime);
        let bands = TargetBands::for_regime(regime);

        let tp1 = clamp_band(atr_pct * mults.tp1, bands.tp1);
        let tp2 = clamp_band(atr_pct * mults.tp2, bands.tp2);
        let sl = clamp_band(atr_pct * mults.sl, bands.sl).min(self.params.max_stop_loss_fraction);

        TradeTargets {
            tp1_pct: tp1,
            tp2_pct: tp2,
            sl_pct: sl,
        }
    }

    /// Size an entry from the available balance at `price`.
    ///
    /// `balance * risk_fraction * leverage / price`, rounded to the quantity
    /// step. A result below the instrument minimum is raised to the minimum,
    /// which can exceed the nominal risk fraction.
    pub fn calculate_position_size(
        &self,
        price: f64,
        available_balance: f64,
        min_qty: Decimal,
        qty_step: Decimal,
    ) -> Result<PositionSizeCalculation> {
        if !(price.is_finite() && price > 0.0) {
            return Err(anyhow!("Invalid price for sizing: {}", price));
        }
        if !available_balance.is_finite() || available_balance < 0.0 {
            return Err(anyhow!("Invalid balance for sizing: {}", available_balance));
        }

        let usable_balance = available_balance * self.params.risk_fraction;
        let position_value = usable_balance * self.params.leverage as f64;
        let raw_quantity = position_value / price;

        let raw = Decimal::from_f64(raw_quantity)
            .ok_or_else(|| anyhow!("Quantity {} not representable", raw_quantity))?;
        let rounded = round_to_step(raw, qty_step);

        let (quantity, bumped_to_minimum) = if rounded < min_qty {
            (min_qty, true)
        } else {
            (rounded, false)
        };

        tracing::debug!(
            raw_quantity,
            rounded = %rounded,
            min_qty = %min_qty,
            "Position size calculated"
        );

        Ok(PositionSizeCalculation {
            usable_balance,
            position_value,
            raw_quantity,
            quantity,
            bumped_to_minimum,
        })
    }

    /// Trailing stop price for a long position, or `None` below the activation profit.
    ///
    /// Profit is measured from `entry_price` to `highest_price`; the stop sits
    /// a regime-dependent gap below the highest price.
    pub fn calculate_trailing_stop(
        &self,
        entry_price: f64,
        highest_price: f64,
        regime: VolatilityRegime,
    ) -> Option<f64> {
        let profit = (highest_price - entry_price) / entry_price;
        if profit < self.params.trailing_activation_fraction {
            return None;
        }

        Some(highest_price * (1.0 - trailing_gap(regime)))
    }
}

impl Default for RiskManager {
    fn default() -> Self {
        Self::new(RiskParameters::default())
    }
}

/// Distance of the trailing stop below the highest price, by volatility.
pub fn trailing_gap(regime: VolatilityRegime) -> f64 {
    match regime {
        VolatilityRegime::UltraLow | VolatilityRegime::Low => 0.02,
        VolatilityRegime::Normal => 0.03,
        VolatilityRegime::High | VolatilityRegime::UltraHigh => 0.05,
    }
}

fn clamp_band(value: f64, (min, max): Band) -> f64 {
    value.clamp(min, max)
}

/// Round to the nearest multiple of `step` (banker's rounding on ties).
/// A non-positive step leaves the quantity untouched.
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).round() * step).normalize()
}
