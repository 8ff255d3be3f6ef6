//! Scripted in-memory exchange for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use analysis_core::{Candle, Timeframe};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_trait::{
    ExchangeClient, ExchangePosition, InstrumentConstraints, LeverageStatus, MarketOrderRequest,
    OrderFill,
};
use chrono::{Duration, Utc};
use market_regime_detector::{MarketRegime, VolatilityRegime};
use risk_manager::TradeTargets;
use rust_decimal::Decimal;
use signal_engine::{QualityScore, Signal};

use crate::config::AgentConfig;

#[derive(Default)]
struct MockState {
    candles: HashMap<Timeframe, Vec<Candle>>,
    /// Served in order; an empty queue means the price is unavailable
    prices: VecDeque<f64>,
    last_price: Option<f64>,
    balances: VecDeque<f64>,
    balance: f64,
    open_position: Option<ExchangePosition>,
    constraints: Option<InstrumentConstraints>,
    fill_price: Option<f64>,
    reject_orders: bool,
    unfilled_orders: bool,
    /// Reject quantities off the instrument step or under the minimum
    enforce_qty_step: bool,
    leverage_result: Option<LeverageStatus>,
    orders: Vec<MarketOrderRequest>,
    leverage_calls: u32,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: 1000.0,
                constraints: Some(InstrumentConstraints::default()),
                leverage_result: Some(LeverageStatus::Set),
                ..Default::default()
            }),
        }
    }

    pub fn set_candles(&self, timeframe: Timeframe, candles: Vec<Candle>) {
        self.state.lock().unwrap().candles.insert(timeframe, candles);
    }

    pub fn push_prices(&self, prices: &[f64]) {
        self.state.lock().unwrap().prices.extend(prices.iter().copied());
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().unwrap().balance = balance;
    }

    /// Balances served before falling back to the fixed balance.
    pub fn push_balances(&self, balances: &[f64]) {
        self.state.lock().unwrap().balances.extend(balances.iter().copied());
    }

    pub fn set_open_position(&self, position: Option<ExchangePosition>) {
        self.state.lock().unwrap().open_position = position;
    }

    pub fn set_constraints(&self, constraints: Option<InstrumentConstraints>) {
        self.state.lock().unwrap().constraints = constraints;
    }

    pub fn set_fill_price(&self, price: f64) {
        self.state.lock().unwrap().fill_price = Some(price);
    }

    pub fn set_reject_orders(&self, reject: bool) {
        self.state.lock().unwrap().reject_orders = reject;
    }

    pub fn set_unfilled_orders(&self, unfilled: bool) {
        self.state.lock().unwrap().unfilled_orders = unfilled;
    }

    pub fn set_enforce_qty_step(&self, enforce: bool) {
        self.state.lock().unwrap().enforce_qty_step = enforce;
    }

    pub fn set_leverage_result(&self, result: Option<LeverageStatus>) {
        self.state.lock().unwrap().leverage_result = result;
    }

    pub fn orders(&self) -> Vec<MarketOrderRequest> {
        self.state.lock().unwrap().orders.clone()
    }

    pub fn leverage_calls(&self) -> u32 {
        self.state.lock().unwrap().leverage_calls
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_candles(&self, _symbol: &str, timeframe: Timeframe, _limit: usize) -> Result<Vec<Candle>> {
        self.state
            .lock()
            .unwrap()
            .candles
            .get(&timeframe)
            .cloned()
            .ok_or_else(|| anyhow!("no {} candles scripted", timeframe))
    }

    async fn get_live_price(&self, _symbol: &str) -> Result<f64> {
        let mut state = self.state.lock().unwrap();
        let price = state
            .prices
            .pop_front()
            .ok_or_else(|| anyhow!("price unavailable"))?;
        state.last_price = Some(price);
        Ok(price)
    }

    async fn get_available_balance(&self) -> Result<f64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.balances.pop_front().unwrap_or(state.balance))
    }

    async fn get_open_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>> {
        Ok(self.state.lock().unwrap().open_position.clone())
    }

    async fn get_instrument_constraints(&self, _symbol: &str) -> Result<InstrumentConstraints> {
        self.state
            .lock()
            .unwrap()
            .constraints
            .ok_or_else(|| anyhow!("instrument info unavailable"))
    }

    async fn place_market_order(&self, order: MarketOrderRequest) -> Result<OrderFill> {
        let mut state = self.state.lock().unwrap();
        state.orders.push(order.clone());
        if state.reject_orders {
            return Err(anyhow!("order rejected"));
        }
        if state.enforce_qty_step {
            let constraints = state.constraints.unwrap_or_default();
            if !(order.qty % constraints.qty_step).is_zero() || order.qty < constraints.min_qty {
                return Err(anyhow!("invalid order qty {}", order.qty));
            }
        }
        if state.unfilled_orders {
            return Ok(OrderFill {
                order_id: format!("mock-{}", state.orders.len()),
                filled: false,
                filled_qty: Decimal::ZERO,
                avg_price: 0.0,
            });
        }
        let avg_price = state.fill_price.or(state.last_price).unwrap_or(0.0);
        Ok(OrderFill {
            order_id: format!("mock-{}", state.orders.len()),
            filled: true,
            filled_qty: order.qty,
            avg_price,
        })
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<LeverageStatus> {
        let mut state = self.state.lock().unwrap();
        state.leverage_calls += 1;
        state
            .leverage_result
            .ok_or_else(|| anyhow!("leverage endpoint failed"))
    }

    fn is_testnet(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "mock"
    }
}

/// Zigzag uptrend with a volume surge on the last candle, ending one interval ago.
pub fn uptrend_candles(timeframe: Timeframe, count: usize) -> Vec<Candle> {
    let span = Duration::minutes(timeframe.to_minutes());
    let start = Utc::now() - span * (count as i32 + 1);
    let mut close = 100.0;
    (0..count)
        .map(|i| {
            close += if i % 2 == 0 { 1.0 } else { -0.6 };
            Candle {
                timestamp: start + span * i as i32,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: if i == count - 1 { 2000.0 } else { 1000.0 },
            }
        })
        .collect()
}

/// Zigzag downtrend: fast < mid < slow on the last candle.
pub fn downtrend_candles(timeframe: Timeframe, count: usize) -> Vec<Candle> {
    let span = Duration::minutes(timeframe.to_minutes());
    let start = Utc::now() - span * (count as i32 + 1);
    let mut close = 200.0;
    (0..count)
        .map(|i| {
            close += if i % 2 == 0 { 0.6 } else { -1.0 };
            Candle {
                timestamp: start + span * i as i32,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 2000.0,
            }
        })
        .collect()
}

pub fn test_config(dry_run: bool) -> AgentConfig {
    AgentConfig {
        symbol: "BTCUSDT".to_string(),
        leverage: 2,
        risk_fraction: 0.3,
        max_slippage_percent: 1.5,
        min_balance: 10.0,
        max_holding_days: 30,
        scan_interval_seconds: 300,
        candle_limit: 500,
        dry_run,
        testnet: true,
        api_key: String::new(),
        api_secret: String::new(),
        metrics_log_interval_cycles: 12,
        event_stream_stdout: false,
    }
}

/// NORMAL-regime signal at 1% ATR before band clamping: +4% / +6.5% / -2.5%.
pub fn test_signal(entry_price: f64) -> Signal {
    let targets = TradeTargets {
        tp1_pct: 0.04,
        tp2_pct: 0.065,
        sl_pct: 0.025,
    };
    let prices = targets.prices(entry_price);
    Signal {
        entry_price,
        tp1_price: prices.tp1,
        tp2_price: prices.tp2,
        sl_price: prices.sl,
        targets,
        quality: 80.0,
        quality_breakdown: QualityScore::default(),
        vol_regime: VolatilityRegime::Normal,
        atr_ratio: 1.0,
        market_regime: MarketRegime::TrendUp,
        timestamp: Utc::now(),
    }
}
