//! Binance spot adapter.
//!
//! # REST endpoints
//!
//! | Operation    | Method | Path                  |
//! |--------------|--------|-----------------------|
//! | Account info | GET    | `/api/v3/account`     |
//! | Place order  | POST   | `/api/v3/order`       |
//! | Order history| GET    | `/api/v3/allOrders`   |
//!
//! Signed requests carry an HMAC-SHA256 `signature` parameter and the
//! `X-MBX-APIKEY` header. Demo credentials are routed to the spot testnet.
//!
//! # Market data
//!
//! One WebSocket per subscribed symbol on the combined endpoint, using the
//! `<symbol>@ticker` stream (last price, best bid/ask, 24h volume).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use bx_core::credentials::Credential;
use bx_core::error::BxError;
use bx_core::time_util::now_ms;
use bx_core::types::enums::{OrderStatus, OrderType, Side, TimeInForce, VenueId};
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
use bx_core::ws::{MdTransport, OnCloseCallback, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, field_u64};
use crate::{BrokerAdapter, QuoteCallback, auth};

const LIVE_REST: &str = "https://api.binance.com";
const LIVE_WS: &str = "wss://stream.binance.com:443/ws";
const DEMO_REST: &str = "https://testnet.binance.vision";
const DEMO_WS: &str = "wss://stream.testnet.binance.vision/ws";

const VENUE: VenueId = VenueId::Binance;

/// Binance spot adapter.
pub struct BinanceAdapter {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    ws_url: String,
    recv_window: u64,
    connected: AtomicBool,
    /// One open market-data transport per canonical symbol.
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl BinanceAdapter {
    /// Build an adapter from a stored credential. No network traffic until
    /// [`connect`](BrokerAdapter::connect).
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        let api_key = credential.require("api_key")?.to_string();
        let api_secret = credential.require("api_secret")?.to_string();
        let (base_url, ws_url) = if credential.demo {
            (DEMO_REST, DEMO_WS)
        } else {
            (LIVE_REST, LIVE_WS)
        };
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            api_secret,
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            recv_window: 5_000,
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Signed GET returning the parsed JSON body alongside the HTTP status.
    async fn signed_get(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<(reqwest::StatusCode, Value), BxError> {
        let timestamp = now_ms().to_string();
        let recv_window = self.recv_window.to_string();
        let mut params: Vec<(&str, &str)> = extra.to_vec();
        params.push(("recvWindow", &recv_window));
        params.push(("timestamp", &timestamp));

        let query = auth::build_signed_query(&params, &self.api_secret);
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        let status = resp.status();
        let body = resp
            .json()
            .await
            .map_err(|e| BxError::Parse(format!("binance {path}: {e}")))?;
        Ok((status, body))
    }

    fn venue_symbol(symbol: &str) -> String {
        symbol::canonical(symbol)
    }
}

/// Map Binance order-status vocabulary to the canonical one.
fn map_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_NEW" => OrderStatus::Pending,
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartialFill,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" | "PENDING_CANCEL" => OrderStatus::Cancelled,
        other => {
            warn!("[binance] unknown order status {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

/// Translate one `/api/v3/order` (or `allOrders`) entry.
fn translate_order(entry: &Value) -> OrderResult {
    let filled = field_num(entry, "executedQty").unwrap_or(0.0);
    let quote_filled = field_num(entry, "cummulativeQuoteQty").unwrap_or(0.0);
    let avg_price = if filled > 0.0 { quote_filled / filled } else { 0.0 };
    OrderResult {
        order_id: field_u64(entry, "orderId")
            .map(|id| id.to_string())
            .unwrap_or_default(),
        venue: VENUE,
        status: map_status(field_str(entry, "status").unwrap_or("")),
        filled_quantity: filled,
        avg_price,
        message: String::new(),
    }
}

/// Translate one `<symbol>@ticker` event into a canonical quote.
fn translate_ticker(canonical_symbol: &str, event: &Value) -> Option<Quote> {
    let price = field_num(event, "c")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: field_num(event, "b"),
        ask: field_num(event, "a"),
        volume: field_num(event, "v"),
        timestamp_ms: field_u64(event, "E").unwrap_or_else(now_ms),
    })
}

#[async_trait]
impl BrokerAdapter for BinanceAdapter {
    fn venue(&self) -> VenueId {
        VENUE
    }

    fn supports_symbol(&self, symbol: &str) -> bool {
        symbol::split_pair(symbol).is_some()
    }

    async fn connect(&self) -> Result<(), BxError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (status, body) = self.signed_get("/api/v3/account", &[]).await?;
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BxError::Auth {
                venue: VENUE,
                reason: field_str(&body, "msg").unwrap_or("invalid api key").to_string(),
            });
        }
        if !status.is_success() {
            // Signature errors come back as 400 with a negative code.
            let msg = field_str(&body, "msg").unwrap_or("account query failed");
            return Err(BxError::Auth {
                venue: VENUE,
                reason: format!("{status}: {msg}"),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("[binance] connected ({})", self.base_url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[binance] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let (status, body) = self.signed_get("/api/v3/account", &[]).await?;
        if !status.is_success() {
            return Err(BxError::trading(
                VENUE,
                field_str(&body, "msg").unwrap_or("account query failed"),
            ));
        }

        let balances = body
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| BxError::Parse("binance account: missing balances".into()))?;

        Ok(balances
            .iter()
            .filter_map(|entry| {
                let asset = field_str(entry, "asset")?;
                let free = field_num(entry, "free")?;
                let locked = field_num(entry, "locked")?;
                (free != 0.0 || locked != 0.0)
                    .then(|| AccountBalance::new(asset, VENUE, free, locked))
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        // Spot account — no derivative positions.
        Ok(Vec::new())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let venue_symbol = Self::venue_symbol(&request.symbol);
        let side = match request.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let (order_type, price) = match request.order_type {
            OrderType::Market => ("MARKET", None),
            OrderType::Limit => ("LIMIT", request.limit_price),
            OrderType::Stop => ("STOP_LOSS_LIMIT", request.limit_price),
        };
        let tif = match request.time_in_force {
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::Gtc | TimeInForce::Day => "GTC",
        };

        let quantity = format!("{}", request.quantity);
        let timestamp = now_ms().to_string();
        let recv_window = self.recv_window.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("symbol", &venue_symbol),
            ("side", side),
            ("type", order_type),
            ("quantity", &quantity),
        ];
        let price_str = price.map(|p| format!("{p}"));
        if let Some(ref p) = price_str {
            params.push(("price", p));
            params.push(("timeInForce", tif));
        }
        let stop_str = request.stop_price.map(|p| format!("{p}"));
        if let Some(ref p) = stop_str {
            params.push(("stopPrice", p));
        }
        params.push(("recvWindow", &recv_window));
        params.push(("timestamp", &timestamp));

        let query = auth::build_signed_query(&params, &self.api_secret);
        let url = format!("{}/api/v3/order", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query)
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BxError::Parse(format!("binance order: {e}")))?;

        if status.is_client_error() {
            // Business-level refusal (insufficient balance, filter failure,
            // unknown symbol) — a normal rejected result, not a fault.
            let msg = field_str(&body, "msg").unwrap_or("order rejected");
            return Ok(OrderResult::rejected(VENUE, msg));
        }
        if !status.is_success() {
            return Err(BxError::trading(VENUE, format!("HTTP {status}")));
        }

        Ok(translate_order(&body))
    }

    async fn get_order_history(&self, symbol: &str) -> Result<Vec<OrderResult>, BxError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let (status, body) = self
            .signed_get("/api/v3/allOrders", &[("symbol", &venue_symbol)])
            .await?;
        if !status.is_success() {
            return Err(BxError::trading(
                VENUE,
                field_str(&body, "msg").unwrap_or("allOrders failed"),
            ));
        }

        let orders = body
            .as_array()
            .ok_or_else(|| BxError::Parse("binance allOrders: expected array".into()))?;
        let mut results: Vec<OrderResult> = orders.iter().map(translate_order).collect();
        results.reverse(); // venue returns oldest first
        Ok(results)
    }

    async fn subscribe_market_data(
        &self,
        symbol: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        if !self.supports_symbol(symbol) {
            return Err(BxError::Subscription {
                venue: VENUE,
                symbol: symbol.to_string(),
                reason: "not a tradable pair".into(),
            });
        }

        let canonical = symbol::canonical(symbol);
        let stream = format!(
            "{}/{}@ticker",
            self.ws_url,
            Self::venue_symbol(symbol).to_lowercase()
        );
        let config = TransportConfig::new(stream, format!("binance:{canonical}"));

        let on_text: ws::OnTextCallback = {
            let canonical = canonical.clone();
            std::sync::Arc::new(move |text: &str| {
                if let Ok(event) = serde_json::from_str::<Value>(text) {
                    if let Some(quote) = translate_ticker(&canonical, &event) {
                        on_quote(quote);
                    }
                }
            })
        };

        let transport = MdTransport::open(config, on_text, on_close)
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        let mut feeds = self.feeds.lock().await;
        if let Some(mut old) = feeds.insert(canonical, transport) {
            old.stop().await;
        }
        Ok(())
    }

    async fn unsubscribe_market_data(&self, symbol: &str) -> Result<(), BxError> {
        let canonical = symbol::canonical(symbol);
        let mut feeds = self.feeds.lock().await;
        if let Some(mut transport) = feeds.remove(&canonical) {
            transport.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_vocabulary_maps_to_canonical() {
        assert_eq!(map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_status("PARTIALLY_FILLED"), OrderStatus::PartialFill);
        assert_eq!(map_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(map_status("NEW"), OrderStatus::Pending);
    }

    #[test]
    fn order_translation_computes_avg_price() {
        let body = json!({
            "orderId": 28,
            "status": "FILLED",
            "executedQty": "2.0",
            "cummulativeQuoteQty": "100000.0"
        });
        let result = translate_order(&body);
        assert_eq!(result.order_id, "28");
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.avg_price, 50_000.0);
    }

    #[test]
    fn ticker_translation() {
        let event = json!({
            "e": "24hrTicker",
            "E": 1700000000123u64,
            "s": "BTCUSDT",
            "c": "50000.10",
            "b": "50000.00",
            "a": "50000.20",
            "v": "1234.5"
        });
        let quote = translate_ticker("BTCUSDT", &event).unwrap();
        assert_eq!(quote.price, 50_000.10);
        assert_eq!(quote.bid, Some(50_000.00));
        assert_eq!(quote.timestamp_ms, 1_700_000_000_123);
        assert!((quote.spread().unwrap() - 0.2).abs() < 1e-9);
    }
}
