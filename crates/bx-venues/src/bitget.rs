//! Bitget v2 spot adapter.
//!
//! Private REST requests are signed like OKX — base64 HMAC-SHA256 over
//! `timestamp + METHOD + path + body` — but with millisecond epoch
//! timestamps and `ACCESS-*` headers. Responses use the
//! `{ code, msg, data }` envelope where `code == "00000"` is success. Demo
//! credentials set the `paptrading: 1` header.
//!
//! Market data: public v2 WebSocket, `ticker` channel, text `"ping"`
//! keep-alive every 30 s.

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
use bx_core::ws::{MdTransport, OnCloseCallback, PingPayload, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, field_u64};
use crate::{BrokerAdapter, QuoteCallback, auth};

const REST: &str = "https://api.bitget.com";
const WS: &str = "wss://ws.bitget.com/v2/ws/public";

const VENUE: VenueId = VenueId::Bitget;

/// Bitget v2 spot adapter.
pub struct BitgetAdapter {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    demo: bool,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl BitgetAdapter {
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: credential.require("api_key")?.to_string(),
            api_secret: credential.require("api_secret")?.to_string(),
            passphrase: credential.require("passphrase")?.to_string(),
            demo: credential.demo,
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    async fn signed_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BxError> {
        let timestamp = now_ms().to_string();
        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let message = format!("{timestamp}{method}{path}{payload}");
        let signature = auth::hmac_sha256_b64(self.api_secret.as_bytes(), &message);

        let url = format!("{REST}{path}");
        let mut req = match method {
            "POST" => self.http.post(&url),
            _ => self.http.get(&url),
        };
        req = req
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if self.demo {
            req = req.header("paptrading", "1");
        }
        if !payload.is_empty() {
            req = req.body(payload);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;
        resp.json()
            .await
            .map_err(|e| BxError::Parse(format!("bitget {path}: {e}")))
    }
}

fn unwrap_envelope(body: Value) -> Result<Value, String> {
    let code = field_str(&body, "code").unwrap_or("");
    if code == "00000" {
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    } else {
        let msg = field_str(&body, "msg").unwrap_or("unknown error");
        Err(format!("code {code}: {msg}"))
    }
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "live" | "new" | "init" => OrderStatus::Pending,
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartialFill,
        "rejected" => OrderStatus::Rejected,
        "cancelled" | "canceled" => OrderStatus::Cancelled,
        other => {
            warn!("[bitget] unknown order status {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

fn translate_order(entry: &Value) -> OrderResult {
    OrderResult {
        order_id: field_str(entry, "orderId").unwrap_or("").to_string(),
        venue: VENUE,
        status: map_status(field_str(entry, "status").unwrap_or("live")),
        filled_quantity: field_num(entry, "baseVolume").unwrap_or(0.0),
        avg_price: field_num(entry, "priceAvg").unwrap_or(0.0),
        message: String::new(),
    }
}

fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    let data = msg.get("data")?.as_array()?.first()?;
    let price = field_num(data, "lastPr")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: field_num(data, "bidPr"),
        ask: field_num(data, "askPr"),
        volume: field_num(data, "baseVolume"),
        timestamp_ms: field_u64(data, "ts").unwrap_or_else(now_ms),
    })
}

#[async_trait]
impl BrokerAdapter for BitgetAdapter {
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

        let body = self
            .signed_request("GET", "/api/v2/spot/account/assets", None)
            .await?;
        unwrap_envelope(body).map_err(|reason| BxError::Auth {
            venue: VENUE,
            reason,
        })?;

        self.connected.store(true, Ordering::SeqCst);
        info!("[bitget] connected (demo={})", self.demo);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[bitget] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self
            .signed_request("GET", "/api/v2/spot/account/assets", None)
            .await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        Ok(data
            .as_array()
            .map(|assets| {
                assets
                    .iter()
                    .filter_map(|entry| {
                        let asset = field_str(entry, "coin")?;
                        let free = field_num(entry, "available")?;
                        let locked = field_num(entry, "frozen").unwrap_or(0.0);
                        (free != 0.0 || locked != 0.0)
                            .then(|| AccountBalance::new(asset, VENUE, free, locked))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        // Spot account — no derivative positions.
        Ok(Vec::new())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let mut order = json!({
            "symbol": symbol::canonical(&request.symbol),
            "side": match request.side { Side::Buy => "buy", Side::Sell => "sell" },
            "orderType": match request.order_type {
                OrderType::Market => "market",
                OrderType::Limit | OrderType::Stop => "limit",
            },
            "force": match request.time_in_force {
                TimeInForce::Ioc => "ioc",
                TimeInForce::Fok => "fok",
                TimeInForce::Gtc | TimeInForce::Day => "gtc",
            },
            "size": request.quantity.to_string(),
        });
        if let Some(price) = request.limit_price {
            order["price"] = json!(price.to_string());
        }

        let body = self
            .signed_request("POST", "/api/v2/spot/trade/place-order", Some(&order))
            .await?;
        match unwrap_envelope(body) {
            Ok(data) => Ok(OrderResult {
                order_id: field_str(&data, "orderId").unwrap_or("").to_string(),
                venue: VENUE,
                status: OrderStatus::Pending,
                filled_quantity: 0.0,
                avg_price: 0.0,
                message: String::new(),
            }),
            Err(reason) => Ok(OrderResult::rejected(VENUE, reason)),
        }
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let path = format!(
            "/api/v2/spot/trade/history-orders?symbol={}",
            symbol::canonical(symbol_)
        );
        let body = self.signed_request("GET", &path, None).await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        Ok(data
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
        if !self.supports_symbol(symbol_) {
            return Err(BxError::Subscription {
                venue: VENUE,
                symbol: symbol_.to_string(),
                reason: "not a tradable pair".into(),
            });
        }

        let canonical = symbol::canonical(symbol_);
        let mut config = TransportConfig::new(WS, format!("bitget:{canonical}"));
        config.subscribe_msg = Some(
            json!({
                "op": "subscribe",
                "args": [{ "instType": "SPOT", "channel": "ticker", "instId": canonical }]
            })
            .to_string(),
        );
        config.ping_interval = Some(std::time::Duration::from_secs(30));
        config.ping_payload = Some(PingPayload::Text("ping".into()));

        let on_text: ws::OnTextCallback = {
            let canonical = canonical.clone();
            std::sync::Arc::new(move |text: &str| {
                if text == "pong" {
                    return;
                }
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
    fn envelope_success_code() {
        let ok = json!({ "code": "00000", "msg": "success", "data": [] });
        assert!(unwrap_envelope(ok).is_ok());

        let err = json!({ "code": "43012", "msg": "Insufficient balance" });
        assert!(unwrap_envelope(err).unwrap_err().contains("43012"));
    }

    #[test]
    fn ticker_translation() {
        let msg = json!({
            "action": "snapshot",
            "arg": { "instType": "SPOT", "channel": "ticker", "instId": "BTCUSDT" },
            "data": [{
                "instId": "BTCUSDT",
                "lastPr": "49999.9",
                "bidPr": "49999.0",
                "askPr": "50000.5",
                "baseVolume": "321.0",
                "ts": "1700000000777"
            }]
        });
        let quote = translate_ticker("BTCUSDT", &msg).unwrap();
        assert_eq!(quote.price, 49_999.9);
        assert_eq!(quote.venue, VenueId::Bitget);
    }

    #[test]
    fn status_vocabulary_maps_to_canonical() {
        assert_eq!(map_status("init"), OrderStatus::Pending);
        assert_eq!(map_status("partially_filled"), OrderStatus::PartialFill);
        assert_eq!(map_status("cancelled"), OrderStatus::Cancelled);
    }
}
