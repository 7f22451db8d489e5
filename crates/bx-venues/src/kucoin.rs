//! KuCoin spot adapter.
//!
//! Private REST calls carry `KC-API-*` headers: the signature is base64
//! HMAC-SHA256 over `timestamp + method + path + body`, and (key version 2)
//! the passphrase header is itself HMAC-signed with the API secret.
//! Envelopes wrap everything as `{"code":"200000","data":...}`.
//!
//! Market data needs a two-step handshake: POST `/api/v1/bullet-public`
//! hands out a token plus the actual WebSocket endpoint, then the socket
//! is opened at `endpoint?token=...` and topics are subscribed over it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

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
use bx_core::ws::{MdTransport, OnCloseCallback, PingPayload, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, field_u64};
use crate::{BrokerAdapter, QuoteCallback, auth};

const REST_LIVE: &str = "https://api.kucoin.com";
const REST_DEMO: &str = "https://openapi-sandbox.kucoin.com";

const VENUE: VenueId = VenueId::Kucoin;

/// KuCoin spot adapter.
pub struct KucoinAdapter {
    http: reqwest::Client,
    rest: &'static str,
    api_key: String,
    api_secret: String,
    passphrase: String,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl KucoinAdapter {
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        Ok(Self {
            http: reqwest::Client::new(),
            rest: if credential.demo { REST_DEMO } else { REST_LIVE },
            api_key: credential.require("api_key")?.to_string(),
            api_secret: credential.require("api_secret")?.to_string(),
            passphrase: credential.require("passphrase")?.to_string(),
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Signed private request. `path` includes the query string; `body` is
    /// the raw JSON body for POSTs, empty for GETs.
    async fn signed(&self, method: &str, path: &str, body: &str) -> Result<Value, BxError> {
        let timestamp = now_ms().to_string();
        let prehash = format!("{timestamp}{method}{path}{body}");
        let signature = auth::hmac_sha256_b64(self.api_secret.as_bytes(), &prehash);
        let passphrase = auth::hmac_sha256_b64(self.api_secret.as_bytes(), &self.passphrase);

        let url = format!("{}{path}", self.rest);
        let builder = match method {
            "POST" => self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.to_string()),
            _ => self.http.get(&url),
        };

        let resp = builder
            .header("KC-API-KEY", &self.api_key)
            .header("KC-API-SIGN", signature)
            .header("KC-API-TIMESTAMP", timestamp)
            .header("KC-API-PASSPHRASE", passphrase)
            .header("KC-API-KEY-VERSION", "2")
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        resp.json()
            .await
            .map_err(|e| BxError::Parse(format!("kucoin {path}: {e}")))
    }

    /// KuCoin wants dash-delimited pairs (`BTC-USDT`).
    fn kucoin_symbol(symbol_: &str) -> Result<String, BxError> {
        symbol::delimited(&symbol::canonical(symbol_), '-').ok_or_else(|| BxError::Subscription {
            venue: VENUE,
            symbol: symbol_.to_string(),
            reason: "not a recognizable pair".into(),
        })
    }
}

/// Pull `data` out of the `code`/`msg` envelope.
fn unwrap_envelope(body: Value) -> Result<Value, String> {
    match field_str(&body, "code") {
        Some("200000") => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        Some(code) => Err(format!(
            "{code}: {}",
            field_str(&body, "msg").unwrap_or("unknown error")
        )),
        None => Err(format!("malformed envelope: {body}")),
    }
}

/// Done/active order record → canonical result.
fn translate_order(order: &Value) -> Option<OrderResult> {
    let size = field_num(order, "size").unwrap_or(0.0);
    let dealt = field_num(order, "dealSize").unwrap_or(0.0);
    let funds = field_num(order, "dealFunds").unwrap_or(0.0);
    let active = order.get("isActive").and_then(Value::as_bool).unwrap_or(false);
    let cancelled = order
        .get("cancelExist")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let status = if active {
        if dealt > 0.0 {
            OrderStatus::PartialFill
        } else {
            OrderStatus::Pending
        }
    } else if cancelled && dealt < size {
        OrderStatus::Cancelled
    } else if dealt > 0.0 {
        OrderStatus::Filled
    } else {
        OrderStatus::Cancelled
    };

    Some(OrderResult {
        order_id: field_str(order, "id")?.to_string(),
        venue: VENUE,
        status,
        filled_quantity: dealt,
        avg_price: if dealt > 0.0 { funds / dealt } else { 0.0 },
        message: String::new(),
    })
}

/// `/market/ticker:<SYM>` push message → canonical quote.
fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    if field_str(msg, "type")? != "message" {
        return None;
    }
    if !field_str(msg, "topic")?.starts_with("/market/ticker:") {
        return None;
    }
    let data = msg.get("data")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price: field_num(data, "price")?,
        bid: field_num(data, "bestBid"),
        ask: field_num(data, "bestAsk"),
        volume: field_num(data, "size"),
        timestamp_ms: field_u64(data, "time").unwrap_or_else(now_ms),
    })
}

#[async_trait]
impl BrokerAdapter for KucoinAdapter {
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

        let body = self.signed("GET", "/api/v1/accounts?type=trade", "").await?;
        unwrap_envelope(body).map_err(|reason| BxError::Auth {
            venue: VENUE,
            reason,
        })?;

        self.connected.store(true, Ordering::SeqCst);
        info!("[kucoin] connected ({})", self.rest);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[kucoin] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self.signed("GET", "/api/v1/accounts?type=trade", "").await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let accounts = data
            .as_array()
            .ok_or_else(|| BxError::Parse("kucoin accounts: expected array".into()))?;

        Ok(accounts
            .iter()
            .filter_map(|entry| {
                let total = field_num(entry, "balance")?;
                let free = field_num(entry, "available")?;
                (total != 0.0).then(|| {
                    AccountBalance::new(
                        field_str(entry, "currency").unwrap_or("").to_string(),
                        VENUE,
                        free,
                        field_num(entry, "holds").unwrap_or(total - free),
                    )
                })
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        // Spot trade accounts, no derivatives positions.
        Ok(Vec::new())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let kucoin_symbol = Self::kucoin_symbol(&request.symbol)?;
        let side = match request.side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };

        let mut order = json!({
            "clientOid": uuid::Uuid::new_v4().to_string(),
            "symbol": kucoin_symbol,
            "side": side,
            "size": request.quantity.to_string(),
        });
        let path = match request.order_type {
            OrderType::Market => {
                order["type"] = json!("market");
                "/api/v1/orders"
            }
            OrderType::Limit => {
                order["type"] = json!("limit");
                if let Some(price) = request.limit_price {
                    order["price"] = json!(price.to_string());
                }
                order["timeInForce"] = json!(match request.time_in_force {
                    TimeInForce::Ioc => "IOC",
                    TimeInForce::Fok => "FOK",
                    _ => "GTC",
                });
                "/api/v1/orders"
            }
            OrderType::Stop => {
                order["type"] = json!("market");
                if let Some(stop) = request.stop_price {
                    order["stopPrice"] = json!(stop.to_string());
                }
                order["stop"] = json!(match request.side {
                    Side::Buy => "entry",
                    Side::Sell => "loss",
                });
                "/api/v1/stop-order"
            }
        };

        let body = self.signed("POST", path, &order.to_string()).await?;
        match unwrap_envelope(body) {
            Ok(data) => Ok(OrderResult {
                order_id: field_str(&data, "orderId").unwrap_or("").to_string(),
                venue: VENUE,
                status: OrderStatus::Pending,
                filled_quantity: 0.0,
                avg_price: 0.0,
                message: String::new(),
            }),
            // The venue answered with an order-level refusal code.
            Err(reason) => Ok(OrderResult::rejected(VENUE, reason)),
        }
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let kucoin_symbol = Self::kucoin_symbol(symbol_)?;
        let path = format!("/api/v1/orders?status=done&symbol={kucoin_symbol}");

        let body = self.signed("GET", &path, "").await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let items = data
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().filter_map(translate_order).collect())
    }

    async fn subscribe_market_data(
        &self,
        symbol_: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        let kucoin_symbol = Self::kucoin_symbol(symbol_)?;
        let canonical = symbol::canonical(symbol_);

        // Token handshake first: the bullet endpoint names the socket host
        // and the ping cadence it expects.
        let resp = self
            .http
            .post(format!("{}/api/v1/bullet-public", self.rest))
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BxError::Parse(format!("kucoin bullet-public: {e}")))?;
        let data = unwrap_envelope(body).map_err(|r| BxError::connection(VENUE, r))?;

        let token = field_str(&data, "token")
            .ok_or_else(|| BxError::Parse("kucoin bullet-public: missing token".into()))?;
        let server = data
            .get("instanceServers")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .ok_or_else(|| BxError::Parse("kucoin bullet-public: no instance servers".into()))?;
        let endpoint = field_str(server, "endpoint")
            .ok_or_else(|| BxError::Parse("kucoin bullet-public: missing endpoint".into()))?;
        let ping_ms = field_u64(server, "pingInterval").unwrap_or(18_000);

        let connect_id = uuid::Uuid::new_v4().to_string();
        let mut config = TransportConfig::new(
            format!("{endpoint}?token={token}&connectId={connect_id}"),
            format!("kucoin:{canonical}"),
        );
        config.subscribe_msg = Some(
            json!({
                "id": now_ms().to_string(),
                "type": "subscribe",
                "topic": format!("/market/ticker:{kucoin_symbol}"),
                "response": true
            })
            .to_string(),
        );
        config.ping_interval = Some(Duration::from_millis(ping_ms));
        config.ping_payload = Some(PingPayload::Json(json!({
            "id": connect_id,
            "type": "ping"
        })));

        let on_text: ws::OnTextCallback = {
            let canonical = canonical.clone();
            Arc::new(move |text: &str| {
                if let Ok(msg) = serde_json::from_str::<Value>(text) {
                    match field_str(&msg, "type") {
                        Some("message") => {
                            if let Some(quote) = translate_ticker(&canonical, &msg) {
                                on_quote(quote);
                            }
                        }
                        Some("error") => {
                            warn!(
                                "[kucoin:{canonical}] server error: {}",
                                field_str(&msg, "data").unwrap_or("?")
                            );
                        }
                        _ => {} // welcome, ack, pong
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
    fn symbol_is_dash_delimited() {
        assert_eq!(KucoinAdapter::kucoin_symbol("BTCUSDT").unwrap(), "BTC-USDT");
        assert!(KucoinAdapter::kucoin_symbol("AAPL").is_err());
    }

    #[test]
    fn envelope_codes() {
        let ok = json!({ "code": "200000", "data": { "orderId": "5bd6e9286d99522a52e458de" } });
        assert!(unwrap_envelope(ok).is_ok());

        let refused = json!({ "code": "200004", "msg": "Balance insufficient!" });
        assert_eq!(
            unwrap_envelope(refused).unwrap_err(),
            "200004: Balance insufficient!"
        );
    }

    #[test]
    fn done_order_translation() {
        let order = json!({
            "id": "5c35c02703aa673ceec2a168",
            "symbol": "BTC-USDT",
            "size": "1",
            "dealSize": "1",
            "dealFunds": "45000",
            "isActive": false,
            "cancelExist": false
        });
        let result = translate_order(&order).unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.avg_price, 45_000.0);

        let cancelled = json!({
            "id": "5c35c02703aa673ceec2a169",
            "size": "1",
            "dealSize": "0",
            "dealFunds": "0",
            "isActive": false,
            "cancelExist": true
        });
        assert_eq!(
            translate_order(&cancelled).unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn ticker_push_translation() {
        let msg = json!({
            "type": "message",
            "topic": "/market/ticker:BTC-USDT",
            "subject": "trade.ticker",
            "data": {
                "price": "45123.4",
                "bestBid": "45123.0",
                "bestAsk": "45124.0",
                "size": "0.05",
                "time": 1_669_000_000_000u64
            }
        });
        let quote = translate_ticker("BTCUSDT", &msg).unwrap();
        assert_eq!(quote.price, 45_123.4);
        assert_eq!(quote.ask, Some(45_124.0));
        assert_eq!(quote.timestamp_ms, 1_669_000_000_000);

        let welcome = json!({ "type": "welcome", "id": "abc" });
        assert!(translate_ticker("BTCUSDT", &welcome).is_none());
    }
}
