use anyhow::{anyhow, bail, Context, Result};
use risk_manager::RiskParameters;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Instrument
    pub symbol: String,                    // BTCUSDT
    pub leverage: u32,                     // 2x

    // Risk parameters
    pub risk_fraction: f64,                // 0.3 (30% of available balance)
    pub max_slippage_percent: f64,         // 1.5%
    pub min_balance: f64,                  // 10 USDT
    pub max_holding_days: i64,             // 30

    // Trading parameters
    pub scan_interval_seconds: u64,        // 300 (5 minutes)
    pub candle_limit: usize,               // 500 per timeframe
    pub dry_run: bool,                     // true: signals only, no orders

    // Exchange
    pub testnet: bool,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,

    // Telemetry
    pub metrics_log_interval_cycles: u64,  // 12 (once an hour at 5-min cycles)
    pub event_stream_stdout: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let testnet: bool = parse_bool(&get("BYBIT_TESTNET", "true"))
            .context("BYBIT_TESTNET must be true/false")?;

        // Testnet keys first, then the generic pair
        let (api_key, api_secret) = if testnet {
            (
                var("BYBIT_TESTNET_API_KEY").or_else(|| var("BYBIT_API_KEY")),
                var("BYBIT_TESTNET_API_SECRET").or_else(|| var("BYBIT_API_SECRET")),
            )
        } else {
            (var("BYBIT_API_KEY"), var("BYBIT_API_SECRET"))
        };

        let config = Self {
            symbol: get("TRADING_SYMBOL", "BTCUSDT").trim().to_uppercase(),
            leverage: get("LEVERAGE", "2")
                .parse()
                .context("LEVERAGE must be a positive integer")?,
            risk_fraction: get("RISK_FRACTION", "0.3")
                .parse()
                .context("RISK_FRACTION must be a number")?,
            max_slippage_percent: get("MAX_SLIPPAGE_PERCENT", "1.5")
                .parse()
                .context("MAX_SLIPPAGE_PERCENT must be a number")?,
            min_balance: get("MIN_BALANCE", "10")
                .parse()
                .context("MIN_BALANCE must be a number")?,
            max_holding_days: get("MAX_HOLDING_DAYS", "30")
                .parse()
                .context("MAX_HOLDING_DAYS must be an integer")?,
            scan_interval_seconds: get("SCAN_INTERVAL", "300")
                .parse()
                .context("SCAN_INTERVAL must be seconds")?,
            candle_limit: get("CANDLE_LIMIT", "500")
                .parse()
                .context("CANDLE_LIMIT must be an integer")?,
            dry_run: parse_bool(&get("DRY_RUN", "true")).context("DRY_RUN must be true/false")?,
            testnet,
            api_key: api_key.ok_or_else(|| anyhow!("Bybit API key not set"))?,
            api_secret: api_secret.ok_or_else(|| anyhow!("Bybit API secret not set"))?,
            metrics_log_interval_cycles: get("METRICS_LOG_INTERVAL", "12")
                .parse()
                .context("METRICS_LOG_INTERVAL must be an integer")?,
            event_stream_stdout: parse_bool(&get("EVENT_STREAM_STDOUT", "false"))
                .context("EVENT_STREAM_STDOUT must be true/false")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("TRADING_SYMBOL is empty");
        }
        if self.leverage == 0 || self.leverage > 100 {
            bail!("LEVERAGE must be between 1 and 100, got {}", self.leverage);
        }
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            bail!("RISK_FRACTION must be in (0, 1], got {}", self.risk_fraction);
        }
        if self.max_slippage_percent.is_nan() || self.max_slippage_percent < 0.0 {
            bail!(
                "MAX_SLIPPAGE_PERCENT must be non-negative, got {}",
                self.max_slippage_percent
            );
        }
        if self.min_balance < 0.0 {
            bail!("MIN_BALANCE must be non-negative, got {}", self.min_balance);
        }
        if self.max_holding_days <= 0 {
            bail!("MAX_HOLDING_DAYS must be positive, got {}", self.max_holding_days);
        }
        if self.scan_interval_seconds == 0 {
            bail!("SCAN_INTERVAL must be greater than zero");
        }
        // One extra candle: the still-forming candle is dropped after the fetch
        let min_candles = technical_analysis::WARMUP_ROWS + 1;
        if self.candle_limit < min_candles {
            bail!(
                "CANDLE_LIMIT must be at least {} to warm up the slow EMA on closed candles, got {}",
                min_candles,
                self.candle_limit
            );
        }
        if self.candle_limit > 1000 {
            bail!("CANDLE_LIMIT above exchange maximum of 1000: {}", self.candle_limit);
        }
        Ok(())
    }

    pub fn risk_parameters(&self) -> RiskParameters {
        RiskParameters {
            risk_fraction: self.risk_fraction,
            leverage: self.leverage,
            ..RiskParameters::default()
        }
    }

    pub fn max_holding(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_holding_days)
    }

    pub fn environment_name(&self) -> &'static str {
        if self.testnet {
            "testnet"
        } else {
            "mainnet"
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid boolean '{}'", other)),
    }
}
