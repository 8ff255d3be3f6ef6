use analysis_core::{Candle, Timeframe};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// retCode returned by set-leverage when the value is unchanged.
pub const RET_CODE_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Non-zero retCode from the v5 API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Bybit API error {code}: {message}")]
pub struct BybitApiError {
    pub code: i64,
    pub message: String,
}

/// Common v5 response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct BybitResponse<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg")]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> BybitResponse<T> {
    pub fn into_result(self) -> Result<T> {
        if self.ret_code != 0 {
            return Err(BybitApiError {
                code: self.ret_code,
                message: self.ret_msg,
            }
            .into());
        }
        self.result
            .ok_or_else(|| anyhow!("Bybit response missing result: {}", self.ret_msg))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResult<T> {
    pub list: Vec<T>,
}

/// Kline rows: `[start_ms, open, high, low, close, volume, turnover]`, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineResult {
    pub list: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerItem {
    pub symbol: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletAccount {
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletCoin {
    pub coin: String,
    #[serde(default)]
    pub equity: String,
    #[serde(rename = "availableToWithdraw", default)]
    pub available_to_withdraw: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionItem {
    pub symbol: String,
    pub side: String,
    pub size: String,
    #[serde(rename = "avgPrice")]
    pub avg_price: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    #[serde(rename = "lotSizeFilter")]
    pub lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LotSizeFilter {
    #[serde(rename = "minOrderQty")]
    pub min_order_qty: String,
    #[serde(rename = "qtyStep")]
    pub qty_step: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCreateResult {
    #[serde(rename = "orderId")]
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderHistoryItem {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderStatus")]
    pub order_status: String,
    #[serde(rename = "cumExecQty", default)]
    pub cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
}

/// Body of `/v5/order/create` for a market order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderBody {
    pub category: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: String,
    pub time_in_force: String,
    pub position_idx: u8,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLeverageBody {
    pub category: String,
    pub symbol: String,
    pub buy_leverage: String,
    pub sell_leverage: String,
}

/// Kline interval code for a timeframe.
pub fn interval_code(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::Min5 => "5",
        Timeframe::Min15 => "15",
        Timeframe::Hour1 => "60",
    }
}

/// Parse a numeric string field; empty strings read as zero.
pub fn parse_f64(value: &str) -> Result<f64> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse::<f64>()
        .map_err(|e| anyhow!("Invalid number '{}': {}", value, e))
}

pub fn parse_decimal(value: &str) -> Result<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value).map_err(|e| anyhow!("Invalid decimal '{}': {}", value, e))
}

/// Convert raw kline rows into candles sorted ascending by time.
pub fn parse_klines(rows: &[Vec<String>]) -> Result<Vec<Candle>> {
    let mut candles = rows
        .iter()
        .map(|row| {
            if row.len() < 6 {
                return Err(anyhow!("Kline row has {} fields", row.len()));
            }
            let start_ms: i64 = row[0]
                .parse()
                .map_err(|e| anyhow!("Invalid kline timestamp '{}': {}", row[0], e))?;
            let timestamp = DateTime::from_timestamp_millis(start_ms)
                .ok_or_else(|| anyhow!("Kline timestamp out of range: {}", start_ms))?;
            Ok(Candle {
                timestamp,
                open: parse_f64(&row[1])?,
                high: parse_f64(&row[2])?,
                low: parse_f64(&row[3])?,
                close: parse_f64(&row[4])?,
                volume: parse_f64(&row[5])?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Drop candles whose interval has not ended by `now`.
pub fn closed_candles(mut candles: Vec<Candle>, timeframe: Timeframe, now: DateTime<Utc>) -> Vec<Candle> {
    let span = Duration::minutes(timeframe.to_minutes());
    candles.retain(|c| c.timestamp + span <= now);
    candles
}

/// Available quote balance from a wallet snapshot (USDT or USD).
pub fn available_balance(accounts: &[WalletAccount]) -> Result<f64> {
    let Some(account) = accounts.first() else {
        return Ok(0.0);
    };
    for coin in &account.coin {
        if coin.coin == "USDT" || coin.coin == "USD" {
            let available = parse_f64(&coin.available_to_withdraw)?;
            if available > 0.0 {
                return Ok(available);
            }
            return parse_f64(&coin.equity);
        }
    }
    Ok(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(ts: i64, close: &str) -> Vec<String> {
        vec![
            ts.to_string(),
            "100".into(),
            "101".into(),
            "99".into(),
            close.into(),
            "12.5".into(),
            "1250".into(),
        ]
    }

    #[test]
    fn test_parse_klines_sorts_ascending() {
        let rows = vec![
            row(1_700_007_200_000, "102"),
            row(1_700_003_600_000, "101"),
            row(1_700_000_000_000, "100"),
        ];
        let candles = parse_klines(&rows).unwrap();

        assert_eq!(candles.len(), 3);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[0].close, 100.0);
        assert_eq!(candles[2].close, 102.0);
        assert_eq!(candles[1].volume, 12.5);
    }

    #[test]
    fn test_parse_klines_rejects_short_row() {
        let rows = vec![vec!["1700000000000".to_string(), "1".to_string()]];
        assert!(parse_klines(&rows).is_err());
    }

    #[test]
    fn test_closed_candles_drops_open_interval() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..3)
            .map(|i| Candle {
                timestamp: base + Duration::hours(i),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            })
            .collect();
        let now = base + Duration::minutes(150);
        let closed = closed_candles(candles, Timeframe::Hour1, now);

        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].timestamp, base + Duration::hours(1));
    }

    #[test]
    fn test_available_balance_falls_back_to_equity() {
        let json = r#"[{"coin":[
            {"coin":"BTC","equity":"1","availableToWithdraw":"1"},
            {"coin":"USDT","equity":"250.5","availableToWithdraw":""}
        ]}]"#;
        let accounts: Vec<WalletAccount> = serde_json::from_str(json).unwrap();
        assert_eq!(available_balance(&accounts).unwrap(), 250.5);
    }

    #[test]
    fn test_available_balance_prefers_withdrawable() {
        let json = r#"[{"coin":[{"coin":"USDT","equity":"300","availableToWithdraw":"120"}]}]"#;
        let accounts: Vec<WalletAccount> = serde_json::from_str(json).unwrap();
        assert_eq!(available_balance(&accounts).unwrap(), 120.0);
        assert_eq!(available_balance(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_error_envelope() {
        let json = r#"{"retCode":110043,"retMsg":"leverage not modified","result":{}}"#;
        let response: BybitResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        let err = response.into_result().unwrap_err();
        let api = err.downcast_ref::<BybitApiError>().unwrap();
        assert_eq!(api.code, RET_CODE_LEVERAGE_NOT_MODIFIED);
    }

    #[test]
    fn test_order_body_field_names() {
        let body = CreateOrderBody {
            category: "linear".into(),
            symbol: "BTCUSDT".into(),
            side: "Sell".into(),
            order_type: "Market".into(),
            qty: "0.05".into(),
            time_in_force: "IOC".into(),
            position_idx: 0,
            reduce_only: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["orderType"], "Market");
        assert_eq!(value["timeInForce"], "IOC");
        assert_eq!(value["positionIdx"], 0);
        assert_eq!(value["reduceOnly"], true);
    }
}
