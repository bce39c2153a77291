// =============================================================================
// Binance European Options REST client with HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret never leaves the signer and is never logged. Signed
// requests carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift between the engine and the venue.
// =============================================================================

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::types::{
    OptionContract, OptionKind, OrderRequest, OrderSnapshot, OrderStatus, TopOfBook,
};
use crate::venue::{OptionsVenue, Signer};

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Fallback price increment when the chain entry carries no price filter.
const DEFAULT_TICK: Decimal = dec!(0.1);

/// REST client for the venue's options segment.
pub struct BinanceOptionsClient {
    base_url: String,
    underlying: String,
    signer: Box<dyn Signer>,
    client: reqwest::Client,
}

impl BinanceOptionsClient {
    /// # Arguments
    /// * `api_key`    - sent as a header, never in query params.
    /// * `signer`     - authenticates the canonical query string.
    /// * `underlying` - e.g. "BTCUSDT"; anchors reference price and chain.
    pub fn new(
        base_url: impl Into<String>,
        underlying: impl Into<String>,
        api_key: &str,
        signer: Box<dyn Signer>,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            underlying: underlying.into(),
            signer,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow, and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.signer.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, EngineError> {
        let resp = req.send().await.map_err(EngineError::transport)?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        let venue_code = body.get("code").and_then(Value::as_i64);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("no error body")
            .to_string();
        let code = map_error_code(status.as_u16(), venue_code);
        warn!(status = status.as_u16(), code = %code, msg = %msg, "venue returned error");
        Err(EngineError::api(status.as_u16(), code, msg))
    }

    async fn get(&self, path: &str, query: &str) -> Result<Value, EngineError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(self.client.get(&url)).await
    }

    /// Order-path errors additionally map balance rejections onto the
    /// non-recoverable order-execution code.
    fn as_order_error(err: EngineError) -> EngineError {
        if let EngineError::Api { message, .. } = &err {
            if message.to_lowercase().contains("insufficient") {
                return EngineError::order("INSUFFICIENT_BALANCE", message.clone());
            }
        }
        err
    }
}

#[async_trait]
impl OptionsVenue for BinanceOptionsClient {
    #[instrument(skip(self), name = "venue::reference_price")]
    async fn reference_price(&self) -> Result<Decimal, EngineError> {
        let body = self
            .get("/eapi/v1/index", &format!("underlying={}", self.underlying))
            .await?;
        let price = parse_decimal_field(&body, "indexPrice")?;
        debug!(%price, "reference price fetched");
        Ok(price)
    }

    #[instrument(skip(self), name = "venue::expiries")]
    async fn expiries(&self) -> Result<Vec<NaiveDate>, EngineError> {
        let body = self.get("/eapi/v1/exchangeInfo", "").await?;
        let symbols = chain_entries(&body)?;

        let mut dates: Vec<NaiveDate> = symbols
            .iter()
            .filter(|entry| self.matches_underlying(entry))
            .filter_map(parse_expiry)
            .collect();
        dates.sort_unstable();
        dates.dedup();

        debug!(count = dates.len(), "expiries listed");
        Ok(dates)
    }

    #[instrument(skip(self), name = "venue::options_chain")]
    async fn options_chain(&self, expiry: NaiveDate) -> Result<Vec<OptionContract>, EngineError> {
        let body = self.get("/eapi/v1/exchangeInfo", "").await?;
        let symbols = chain_entries(&body)?;

        let mut chain = Vec::new();
        for entry in symbols {
            if !self.matches_underlying(entry) {
                continue;
            }
            if parse_expiry(entry) != Some(expiry) {
                continue;
            }
            match parse_contract(entry, expiry) {
                Ok(contract) => chain.push(contract),
                Err(e) => warn!(error = %e, "skipping malformed chain entry"),
            }
        }

        debug!(%expiry, count = chain.len(), "options chain fetched");
        Ok(chain)
    }

    #[instrument(skip(self), name = "venue::book")]
    async fn book(&self, symbol: &str, depth: u32) -> Result<TopOfBook, EngineError> {
        let body = self
            .get("/eapi/v1/depth", &format!("symbol={symbol}&limit={depth}"))
            .await?;
        parse_depth(&body)
    }

    #[instrument(skip(self, req), name = "venue::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderSnapshot, EngineError> {
        let params = format!(
            "symbol={}&side={}&type=LIMIT&quantity={}&price={}&timeInForce=GTC",
            req.symbol, req.side, req.qty, req.price
        );
        let url = format!(
            "{}/eapi/v1/order?{}",
            self.base_url,
            self.signed_query(&params)
        );

        debug!(symbol = %req.symbol, side = %req.side, qty = %req.qty, price = %req.price, "placing order");
        let body = self
            .send(self.client.post(&url))
            .await
            .map_err(Self::as_order_error)?;
        parse_snapshot(&body)
    }

    #[instrument(skip(self), name = "venue::modify_order")]
    async fn modify_order(
        &self,
        order_id: &str,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderSnapshot, EngineError> {
        let params = format!("orderId={order_id}&symbol={symbol}&quantity={qty}&price={price}");
        let url = format!(
            "{}/eapi/v1/order?{}",
            self.base_url,
            self.signed_query(&params)
        );

        debug!(order_id, symbol, %qty, %price, "modifying order");
        let body = self
            .send(self.client.put(&url))
            .await
            .map_err(Self::as_order_error)?;
        parse_snapshot(&body)
    }

    #[instrument(skip(self), name = "venue::cancel_order")]
    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderSnapshot, EngineError> {
        let params = format!("orderId={order_id}&symbol={symbol}");
        let url = format!(
            "{}/eapi/v1/order?{}",
            self.base_url,
            self.signed_query(&params)
        );

        debug!(order_id, symbol, "cancelling order");
        let body = self.send(self.client.delete(&url)).await?;
        parse_snapshot(&body)
    }

    #[instrument(skip(self), name = "venue::get_order")]
    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderSnapshot, EngineError> {
        let params = format!("orderId={order_id}&symbol={symbol}");
        let url = format!(
            "{}/eapi/v1/order?{}",
            self.base_url,
            self.signed_query(&params)
        );
        let body = self.send(self.client.get(&url)).await?;
        parse_snapshot(&body)
    }
}

impl BinanceOptionsClient {
    fn matches_underlying(&self, entry: &Value) -> bool {
        entry
            .get("underlying")
            .and_then(Value::as_str)
            .map(|u| u == self.underlying)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for BinanceOptionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceOptionsClient")
            .field("base_url", &self.base_url)
            .field("underlying", &self.underlying)
            .field("signer", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Response parsing (free functions so they stay testable without a server)
// =============================================================================

/// Map an HTTP status plus the venue's numeric error code onto the stable
/// codes the error taxonomy classifies on.
fn map_error_code(status: u16, venue_code: Option<i64>) -> String {
    match venue_code {
        Some(-1003) => "RATE_LIMIT_EXCEEDED".to_string(),
        Some(-1022) => "INVALID_SIGNATURE".to_string(),
        Some(-2014) | Some(-2015) => "INVALID_API_KEY".to_string(),
        Some(code) => format!("VENUE_{code}"),
        None if status == 429 => "RATE_LIMIT_EXCEEDED".to_string(),
        None => String::new(),
    }
}

fn chain_entries(body: &Value) -> Result<&Vec<Value>, EngineError> {
    body.get("optionSymbols")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", "exchangeInfo missing optionSymbols"))
}

/// Accept a field that the venue serialises as either string or number.
fn parse_decimal_field(value: &Value, key: &str) -> Result<Decimal, EngineError> {
    let field = value
        .get(key)
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", format!("missing field `{key}`")))?;
    parse_decimal(field)
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", format!("unparsable field `{key}`")))
}

fn parse_decimal(field: &Value) -> Option<Decimal> {
    match field {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn parse_expiry(entry: &Value) -> Option<NaiveDate> {
    let ms = entry.get("expiryDate").and_then(Value::as_i64)?;
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

fn parse_contract(entry: &Value, expiry: NaiveDate) -> Result<OptionContract, EngineError> {
    let symbol = entry
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", "chain entry missing symbol"))?
        .to_string();

    let kind = match entry.get("side").and_then(Value::as_str) {
        Some("CALL") => OptionKind::Call,
        Some("PUT") => OptionKind::Put,
        other => {
            return Err(EngineError::api(
                0,
                "BAD_RESPONSE",
                format!("chain entry {symbol}: bad side {other:?}"),
            ))
        }
    };

    let strike = parse_decimal_field(entry, "strikePrice")?;

    let tick_size = entry
        .get("filters")
        .and_then(Value::as_array)
        .and_then(|filters| {
            filters.iter().find(|f| {
                f.get("filterType").and_then(Value::as_str) == Some("PRICE_FILTER")
            })
        })
        .and_then(|f| f.get("tickSize"))
        .and_then(parse_decimal)
        .unwrap_or(DEFAULT_TICK);

    Ok(OptionContract {
        symbol,
        kind,
        strike,
        expiry,
        tick_size,
        book: None,
    })
}

fn parse_depth(body: &Value) -> Result<TopOfBook, EngineError> {
    let top = |side: &str| -> Option<(Decimal, Decimal)> {
        let level = body.get(side)?.as_array()?.first()?.as_array()?;
        let price = parse_decimal(level.first()?)?;
        let size = parse_decimal(level.get(1)?)?;
        Some((price, size))
    };

    let (bid, bid_size) = top("bids")
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", "depth response missing bids"))?;
    let (ask, ask_size) = top("asks")
        .ok_or_else(|| EngineError::api(0, "BAD_RESPONSE", "depth response missing asks"))?;

    Ok(TopOfBook {
        bid,
        ask,
        bid_size,
        ask_size,
    })
}

fn parse_snapshot(body: &Value) -> Result<OrderSnapshot, EngineError> {
    let order_id = match body.get("orderId") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(EngineError::api(
                0,
                "BAD_RESPONSE",
                "order response missing orderId",
            ))
        }
    };

    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(OrderStatus::from_venue)
        .unwrap_or(OrderStatus::Unknown);

    let filled_qty = body
        .get("executedQty")
        .and_then(parse_decimal)
        .unwrap_or(Decimal::ZERO);
    let avg_price = body
        .get("avgPrice")
        .and_then(parse_decimal)
        .unwrap_or(Decimal::ZERO);
    let original_qty = parse_decimal_field(body, "quantity")?;
    let price = body
        .get("price")
        .and_then(parse_decimal)
        .unwrap_or(Decimal::ZERO);

    Ok(OrderSnapshot {
        order_id,
        status,
        filled_qty,
        avg_price,
        original_qty,
        price,
    })
}
