use analysis_core::{Candle, Timeframe};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchange types (venue-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub side: OrderSide,
    pub size: Decimal,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Lot-size rules for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConstraints {
    pub min_qty: Decimal,
    pub qty_step: Decimal,
}

impl Default for InstrumentConstraints {
    /// Fallback when the exchange cannot be asked: 0.001 / 0.001.
    fn default() -> Self {
        Self {
            min_qty: dec!(0.001),
            qty_step: dec!(0.001),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    /// Only ever shrink an existing position
    pub reduce_only: bool,
}

impl MarketOrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            qty,
            reduce_only: false,
        }
    }

    /// Reduce-only sell closing (part of) a long position.
    pub fn close_long(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty,
            reduce_only: true,
        }
    }
}

/// Outcome of a submitted market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub filled: bool,
    pub filled_qty: Decimal,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeverageStatus {
    Set,
    AlreadySet,
}

// ---------------------------------------------------------------------------
// Exchange trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Closed candles in ascending time order
    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize)
        -> Result<Vec<Candle>>;

    /// Last traded price
    async fn get_live_price(&self, symbol: &str) -> Result<f64>;

    /// Balance available for new positions, in the quote currency
    async fn get_available_balance(&self) -> Result<f64>;

    /// Open position for a symbol (None if flat)
    async fn get_open_position(&self, symbol: &str) -> Result<Option<ExchangePosition>>;

    async fn get_instrument_constraints(&self, symbol: &str) -> Result<InstrumentConstraints>;

    /// Submit a market order and wait for its fill status
    async fn place_market_order(&self, order: MarketOrderRequest) -> Result<OrderFill>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageStatus>;

    /// Whether this is a testnet account
    fn is_testnet(&self) -> bool;

    /// Exchange name for logging
    fn broker_name(&self) -> &str;
}
