//! Coinbase Exchange adapter.
//!
//! Private REST requests carry `CB-ACCESS-KEY`, `CB-ACCESS-PASSPHRASE`,
//! `CB-ACCESS-TIMESTAMP` (epoch seconds), and `CB-ACCESS-SIGN` — base64
//! HMAC-SHA256 over `timestamp + method + path + body`, keyed with the
//! **base64-decoded** API secret. Demo credentials route to the public
//! sandbox.
//!
//! Products are dash-delimited (`BTC-USD`); market data uses the `ticker`
//! channel of the WebSocket feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
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

use crate::json_util::{field_num, field_str};
use crate::{BrokerAdapter, QuoteCallback, auth};

const LIVE_REST: &str = "https://api.exchange.coinbase.com";
const LIVE_WS: &str = "wss://ws-feed.exchange.coinbase.com";
const DEMO_REST: &str = "https://api-public.sandbox.exchange.coinbase.com";
const DEMO_WS: &str = "wss://ws-feed-public.sandbox.exchange.coinbase.com";

const VENUE: VenueId = VenueId::Coinbase;

/// Coinbase Exchange adapter.
pub struct CoinbaseAdapter {
    http: reqwest::Client,
    api_key: String,
    /// Base64-decoded API secret (decoded once at construction).
    secret: Vec<u8>,
    passphrase: String,
    base_url: String,
    ws_url: String,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl CoinbaseAdapter {
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        let secret = auth::decode_b64_secret(VENUE, credential.require("api_secret")?)?;
        let (base_url, ws_url) = if credential.demo {
            (DEMO_REST, DEMO_WS)
        } else {
            (LIVE_REST, LIVE_WS)
        };
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: credential.require("api_key")?.to_string(),
            secret,
            passphrase: credential.require("passphrase")?.to_string(),
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    async fn signed_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(reqwest::StatusCode, Value), BxError> {
        let timestamp = (now_ms() / 1_000).to_string();
        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let message = format!("{timestamp}{method}{path}{payload}");
        let signature = auth::hmac_sha256_b64(&self.secret, &message);

        let url = format!("{}{}", self.base_url, path);
        let mut req = match method {
            "POST" => self.http.post(&url).header("Content-Type", "application/json"),
            _ => self.http.get(&url),
        };
        req = req
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
            .header("User-Agent", "bx-engine");
        if !payload.is_empty() {
            req = req.body(payload);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;
        let status = resp.status();
        let body = resp
            .json()
            .await
            .map_err(|e| BxError::Parse(format!("coinbase {path}: {e}")))?;
        Ok((status, body))
    }

    fn product_id(symbol_: &str) -> Result<String, BxError> {
        symbol::delimited(&symbol::canonical(symbol_), '-').ok_or_else(|| BxError::Subscription {
            venue: VENUE,
            symbol: symbol_.to_string(),
            reason: "not a recognizable pair".into(),
        })
    }
}

fn map_status(entry: &Value) -> OrderStatus {
    match field_str(entry, "status").unwrap_or("") {
        "open" | "pending" | "active" | "received" => OrderStatus::Pending,
        "rejected" => OrderStatus::Rejected,
        "done" => match field_str(entry, "done_reason") {
            Some("canceled") | Some("cancelled") => OrderStatus::Cancelled,
            _ => OrderStatus::Filled,
        },
        other => {
            warn!("[coinbase] unknown order status {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

fn translate_order(entry: &Value) -> OrderResult {
    let filled = field_num(entry, "filled_size").unwrap_or(0.0);
    let executed_value = field_num(entry, "executed_value").unwrap_or(0.0);
    let avg_price = if filled > 0.0 { executed_value / filled } else { 0.0 };
    OrderResult {
        order_id: field_str(entry, "id").unwrap_or("").to_string(),
        venue: VENUE,
        status: map_status(entry),
        filled_quantity: filled,
        avg_price,
        message: String::new(),
    }
}

fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    if field_str(msg, "type") != Some("ticker") {
        return None;
    }
    let price = field_num(msg, "price")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: field_num(msg, "best_bid"),
        ask: field_num(msg, "best_ask"),
        volume: field_num(msg, "volume_24h"),
        // The feed carries an ISO-8601 `time`; local receive time is close
        // enough for staleness checks.
        timestamp_ms: now_ms(),
    })
}

#[async_trait]
impl BrokerAdapter for CoinbaseAdapter {
    fn venue(&self) -> VenueId {
        VENUE
    }

    fn supports_symbol(&self, symbol_: &str) -> bool {
        symbol::split_pair(&symbol::canonical(symbol_)).is_some()
    }

    async fn connect(&self) -> Result<(), BxError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (status, body) = self.signed_request("GET", "/accounts", None).await?;
        if !status.is_success() {
            return Err(BxError::Auth {
                venue: VENUE,
                reason: field_str(&body, "message")
                    .unwrap_or("accounts query failed")
                    .to_string(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("[coinbase] connected ({})", self.base_url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[coinbase] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let (status, body) = self.signed_request("GET", "/accounts", None).await?;
        if !status.is_success() {
            return Err(BxError::trading(
                VENUE,
                field_str(&body, "message").unwrap_or("accounts query failed"),
            ));
        }

        let accounts = body
            .as_array()
            .ok_or_else(|| BxError::Parse("coinbase accounts: expected array".into()))?;

        Ok(accounts
            .iter()
            .filter_map(|entry| {
                let asset = field_str(entry, "currency")?;
                let free = field_num(entry, "available")?;
                let locked = field_num(entry, "hold").unwrap_or(0.0);
                (free != 0.0 || locked != 0.0)
                    .then(|| AccountBalance::new(asset, VENUE, free, locked))
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        // Spot exchange — no derivative positions.
        Ok(Vec::new())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let product_id = Self::product_id(&request.symbol)?;
        let mut order = json!({
            "product_id": product_id,
            "side": match request.side { Side::Buy => "buy", Side::Sell => "sell" },
            "type": match request.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "stop",
            },
            "size": request.quantity.to_string(),
        });
        if let Some(price) = request.limit_price {
            order["price"] = json!(price.to_string());
            order["time_in_force"] = json!(match request.time_in_force {
                TimeInForce::Ioc => "IOC",
                TimeInForce::Fok => "FOK",
                TimeInForce::Gtc | TimeInForce::Day => "GTC",
            });
        }
        if let Some(stop) = request.stop_price {
            order["stop_price"] = json!(stop.to_string());
            order["stop"] = json!(match request.side {
                Side::Buy => "entry",
                Side::Sell => "loss",
            });
        }

        let (status, body) = self.signed_request("POST", "/orders", Some(&order)).await?;
        if status.is_client_error() {
            let msg = field_str(&body, "message").unwrap_or("order rejected");
            return Ok(OrderResult::rejected(VENUE, msg));
        }
        if !status.is_success() {
            return Err(BxError::trading(VENUE, format!("HTTP {status}")));
        }

        Ok(translate_order(&body))
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let product_id = Self::product_id(symbol_)?;
        let path = format!("/orders?status=all&product_id={product_id}");
        let (status, body) = self.signed_request("GET", &path, None).await?;
        if !status.is_success() {
            return Err(BxError::trading(
                VENUE,
                field_str(&body, "message").unwrap_or("orders query failed"),
            ));
        }

        Ok(body
            .as_array()
            .map(|orders| orders.iter().map(translate_order).collect())
            .unwrap_or_default())
    }

    async fn subscribe_market_data(
        &self,
        symbol_: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        let product_id = Self::product_id(symbol_)?;
        let canonical = symbol::canonical(symbol_);

        let mut config = TransportConfig::new(self.ws_url.clone(), format!("coinbase:{canonical}"));
        config.subscribe_msg = Some(
            json!({
                "type": "subscribe",
                "product_ids": [product_id],
                "channels": ["ticker"]
            })
            .to_string(),
        );

        let on_text: ws::OnTextCallback = {
            let canonical = canonical.clone();
            std::sync::Arc::new(move |text: &str| {
                if let Ok(msg) = serde_json::from_str::<Value>(text) {
                    if let Some(quote) = translate_ticker(&canonical, &msg) {
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

    async fn unsubscribe_market_data(&self, symbol_: &str) -> Result<(), BxError> {
        let canonical = symbol::canonical(symbol_);
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
    fn done_reason_distinguishes_fill_from_cancel() {
        let filled = json!({ "status": "done", "done_reason": "filled" });
        assert_eq!(map_status(&filled), OrderStatus::Filled);

        let cancelled = json!({ "status": "done", "done_reason": "canceled" });
        assert_eq!(map_status(&cancelled), OrderStatus::Cancelled);

        let open = json!({ "status": "open" });
        assert_eq!(map_status(&open), OrderStatus::Pending);
    }

    #[test]
    fn order_translation_computes_avg_price() {
        let body = json!({
            "id": "d0c5340b-6d6c-49d9-b567-48c4bfca13d2",
            "status": "done",
            "done_reason": "filled",
            "filled_size": "0.5",
            "executed_value": "25000.0"
        });
        let result = translate_order(&body);
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.avg_price, 50_000.0);
    }

    #[test]
    fn non_ticker_messages_ignored() {
        let sub_ack = json!({ "type": "subscriptions", "channels": [] });
        assert!(translate_ticker("BTCUSD", &sub_ack).is_none());

        let tick = json!({
            "type": "ticker",
            "product_id": "BTC-USD",
            "price": "50005.0",
            "best_bid": "50004.0",
            "best_ask": "50006.0",
            "volume_24h": "8000.1"
        });
        let quote = translate_ticker("BTCUSD", &tick).unwrap();
        assert_eq!(quote.price, 50_005.0);
        assert_eq!(quote.symbol, "BTCUSD");
    }
}
