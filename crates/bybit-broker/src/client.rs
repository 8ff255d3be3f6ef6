use crate::models::*;
use analysis_core::{Candle, Timeframe};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use broker_trait::{
    ExchangeClient, ExchangePosition, InstrumentConstraints, LeverageStatus, MarketOrderRequest,
    OrderFill, OrderSide,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const CATEGORY: &str = "linear";

#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    /// Milliseconds a signed request stays valid
    pub recv_window: u64,
    /// Wait between order submission and the fill lookup
    pub settle_delay: Duration,
}

impl BybitConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, testnet: bool) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            testnet,
            recv_window: 60_000,
            settle_delay: Duration::from_secs(2),
        }
    }

    /// Read credentials from the environment.
    /// Testnet uses BYBIT_TESTNET_API_KEY / BYBIT_TESTNET_API_SECRET,
    /// mainnet BYBIT_API_KEY / BYBIT_API_SECRET.
    pub fn from_env(testnet: bool) -> Result<Self> {
        let (key_var, secret_var) = if testnet {
            ("BYBIT_TESTNET_API_KEY", "BYBIT_TESTNET_API_SECRET")
        } else {
            ("BYBIT_API_KEY", "BYBIT_API_SECRET")
        };
        let api_key = std::env::var(key_var).map_err(|_| anyhow!("{} not set", key_var))?;
        let api_secret =
            std::env::var(secret_var).map_err(|_| anyhow!("{} not set", secret_var))?;

        Ok(Self::new(api_key, api_secret, testnet))
    }
}

/// Bybit v5 REST client for USDT linear perpetuals.
pub struct BybitClient {
    client: Client,
    base_url: String,
    config: BybitConfig,
}

impl BybitClient {
    pub fn new(config: BybitConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        let base_url = if config.testnet { TESTNET_URL } else { MAINNET_URL }.to_string();

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex encoded.
    fn sign(&self, timestamp: i64, payload: &str) -> Result<String> {
        sign_payload(
            &self.config.api_secret,
            &self.config.api_key,
            timestamp,
            self.config.recv_window,
            payload,
        )
    }

    fn auth_headers(&self, payload: &str) -> Result<header::HeaderMap> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, payload)?;

        let mut headers = header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", header::HeaderValue::from_str(&self.config.api_key)?);
        headers.insert("X-BAPI-SIGN", header::HeaderValue::from_str(&signature)?);
        headers.insert(
            "X-BAPI-TIMESTAMP",
            header::HeaderValue::from_str(&timestamp.to_string())?,
        );
        headers.insert(
            "X-BAPI-RECV-WINDOW",
            header::HeaderValue::from_str(&self.config.recv_window.to_string())?,
        );
        Ok(headers)
    }

    /// Unsigned GET against a market-data endpoint.
    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, encode_query(query));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        Self::read_envelope(path, response).await
    }

    /// Signed GET; the signed payload is the exact query string sent.
    async fn private_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let query_string = encode_query(query);
        let url = format!("{}{}?{}", self.base_url, path, query_string);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers(&query_string)?)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        Self::read_envelope(path, response).await
    }

    /// Signed POST; the signed payload is the JSON body.
    async fn private_post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let json = serde_json::to_string(body)?;

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers(&json)?)
            .header(header::CONTENT_TYPE, "application/json")
            .body(json)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;

        Self::read_envelope(path, response).await
    }

    async fn read_envelope<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!("Bybit {} HTTP {}: {}", path, status, error_text));
        }

        let envelope = response.json::<BybitResponse<T>>().await?;
        envelope.into_result()
    }

    /// Fetch klines, oldest first, excluding the still-forming candle.
    pub async fn get_klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let result: KlineResult = self
            .public_get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval_code(timeframe).to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = parse_klines(&result.list)?;
        Ok(closed_candles(candles, timeframe, Utc::now()))
    }

    pub async fn get_last_price(&self, symbol: &str) -> Result<f64> {
        let result: ListResult<TickerItem> = self
            .public_get(
                "/v5/market/tickers",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
            )
            .await?;

        let ticker = result
            .list
            .first()
            .ok_or_else(|| anyhow!("No ticker for {}", symbol))?;
        let price = parse_f64(&ticker.last_price)?;
        if price <= 0.0 {
            return Err(anyhow!("Non-positive last price for {}: {}", symbol, price));
        }
        Ok(price)
    }

    pub async fn get_wallet_balance(&self) -> Result<f64> {
        let result: ListResult<WalletAccount> = self
            .private_get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
            )
            .await?;

        available_balance(&result.list)
    }

    pub async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>> {
        let result: ListResult<PositionItem> = self
            .private_get(
                "/v5/position/list",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
            )
            .await?;

        for item in result.list {
            let size = parse_decimal(&item.size)?;
            if size > rust_decimal::Decimal::ZERO {
                let side = if item.side == "Sell" {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                return Ok(Some(ExchangePosition {
                    side,
                    size,
                    entry_price: parse_f64(&item.avg_price)?,
                    unrealized_pnl: parse_f64(&item.unrealised_pnl)?,
                }));
            }
        }
        Ok(None)
    }

    pub async fn get_lot_size(&self, symbol: &str) -> Result<InstrumentConstraints> {
        let result: ListResult<InstrumentInfo> = self
            .public_get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
            )
            .await?;

        let info = result
            .list
            .first()
            .ok_or_else(|| anyhow!("No instrument info for {}", symbol))?;

        Ok(InstrumentConstraints {
            min_qty: parse_decimal(&info.lot_size_filter.min_order_qty)?,
            qty_step: parse_decimal(&info.lot_size_filter.qty_step)?,
        })
    }

    /// Submit a market IOC order and look up its fill after the settle delay.
    pub async fn submit_market_order(&self, order: MarketOrderRequest) -> Result<OrderFill> {
        let body = CreateOrderBody {
            category: CATEGORY.to_string(),
            symbol: order.symbol.clone(),
            side: order.side.as_str().to_string(),
            order_type: "Market".to_string(),
            qty: order.qty.normalize().to_string(),
            time_in_force: "IOC".to_string(),
            position_idx: 0,
            reduce_only: order.reduce_only,
        };

        tracing::info!(
            side = %order.side,
            qty = %body.qty,
            reduce_only = order.reduce_only,
            "Submitting market order to Bybit"
        );

        let created: OrderCreateResult = self.private_post("/v5/order/create", &body).await?;
        tracing::info!("Order accepted: {}", created.order_id);

        tokio::time::sleep(self.config.settle_delay).await;
        self.get_order_fill(&order.symbol, &created.order_id).await
    }

    pub async fn get_order_fill(&self, symbol: &str, order_id: &str) -> Result<OrderFill> {
        let result: ListResult<OrderHistoryItem> = self
            .private_get(
                "/v5/order/history",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;

        let item = result
            .list
            .first()
            .ok_or_else(|| anyhow!("Order {} not found in history", order_id))?;

        let filled_qty = parse_decimal(&item.cum_exec_qty)?;
        let avg_price = parse_f64(&item.avg_price)?;
        let filled = item.order_status == "Filled" && filled_qty > rust_decimal::Decimal::ZERO;

        if !filled {
            tracing::warn!("Order {} status: {}", order_id, item.order_status);
        }

        Ok(OrderFill {
            order_id: item.order_id.clone(),
            filled,
            filled_qty,
            avg_price,
        })
    }

    pub async fn set_symbol_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageStatus> {
        let body = SetLeverageBody {
            category: CATEGORY.to_string(),
            symbol: symbol.to_string(),
            buy_leverage: leverage.to_string(),
            sell_leverage: leverage.to_string(),
        };

        match self
            .private_post::<_, serde_json::Value>("/v5/position/set-leverage", &body)
            .await
        {
            Ok(_) => Ok(LeverageStatus::Set),
            Err(e) => match e.downcast_ref::<BybitApiError>() {
                Some(api) if api.code == RET_CODE_LEVERAGE_NOT_MODIFIED => {
                    Ok(LeverageStatus::AlreadySet)
                }
                _ => Err(e),
            },
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Sign a request payload the way the v5 API expects.
pub fn sign_payload(
    secret: &str,
    api_key: &str,
    timestamp: i64,
    recv_window: u64,
    payload: &str,
) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("Invalid API secret: {}", e))?;
    mac.update(format!("{}{}{}{}", timestamp, api_key, recv_window, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` in the given order. Values here are plain tokens that need no escaping.
fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        self.get_klines(symbol, timeframe, limit).await
    }

    async fn get_live_price(&self, symbol: &str) -> Result<f64> {
        self.get_last_price(symbol).await
    }

    async fn get_available_balance(&self) -> Result<f64> {
        self.get_wallet_balance().await
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<ExchangePosition>> {
        self.get_position(symbol).await
    }

    async fn get_instrument_constraints(&self, symbol: &str) -> Result<InstrumentConstraints> {
        self.get_lot_size(symbol).await
    }

    async fn place_market_order(&self, order: MarketOrderRequest) -> Result<OrderFill> {
        self.submit_market_order(order).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageStatus> {
        self.set_symbol_leverage(symbol, leverage).await
    }

    fn is_testnet(&self) -> bool {
        self.config.testnet
    }

    fn broker_name(&self) -> &str {
        "bybit"
    }
}
