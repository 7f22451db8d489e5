//! Bybit v5 adapter (unified account, spot trading, linear positions).
//!
//! Private REST requests are signed with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + payload` and sent via the
//! `X-BAPI-*` headers. All v5 responses wrap the payload in
//! `{ retCode, retMsg, result }` — `retCode != 0` is the venue's refusal
//! channel, mapped to auth errors on connect and rejected results on order
//! placement.
//!
//! Market data: one WebSocket per symbol on `/v5/public/spot`, topic
//! `tickers.<SYMBOL>`, with the JSON `{"op":"ping"}` keep-alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use bx_core::credentials::Credential;
use bx_core::error::BxError;
use bx_core::time_util::now_ms;
use bx_core::types::enums::{OrderStatus, OrderType, PositionSide, Side, TimeInForce, VenueId};
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
use bx_core::ws::{MdTransport, OnCloseCallback, PingPayload, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, field_u64};
use crate::{BrokerAdapter, QuoteCallback, auth};

const LIVE_REST: &str = "https://api.bybit.com";
const LIVE_WS: &str = "wss://stream.bybit.com/v5/public/spot";
const DEMO_REST: &str = "https://api-testnet.bybit.com";
const DEMO_WS: &str = "wss://stream-testnet.bybit.com/v5/public/spot";

const VENUE: VenueId = VenueId::Bybit;
const RECV_WINDOW: &str = "5000";

/// Bybit v5 adapter.
pub struct BybitAdapter {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    ws_url: String,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl BybitAdapter {
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
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    fn sign_headers(&self, payload: &str) -> Vec<(&'static str, String)> {
        let timestamp = now_ms().to_string();
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let signature = auth::hmac_sha256_hex(&self.api_secret, &message);
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", signature),
        ]
    }

    /// Signed GET; query is the raw (unencoded) query string.
    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, BxError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let mut req = self.http.get(&url);
        for (name, value) in self.sign_headers(query) {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;
        resp.json()
            .await
            .map_err(|e| BxError::Parse(format!("bybit {path}: {e}")))
    }

    /// Signed POST with a JSON body.
    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value, BxError> {
        let payload = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).header("Content-Type", "application/json");
        for (name, value) in self.sign_headers(&payload) {
            req = req.header(name, value);
        }
        let resp = req
            .body(payload)
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;
        resp.json()
            .await
            .map_err(|e| BxError::Parse(format!("bybit {path}: {e}")))
    }
}

/// Pull `result` out of a v5 envelope, surfacing `retCode != 0` as the
/// provided error mapping.
fn unwrap_envelope(body: Value) -> Result<Value, String> {
    let code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
    if code == 0 {
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    } else {
        let msg = field_str(&body, "retMsg").unwrap_or("unknown error");
        Err(format!("retCode {code}: {msg}"))
    }
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "New" | "Untriggered" | "Triggered" => OrderStatus::Pending,
        "Filled" => OrderStatus::Filled,
        "PartiallyFilled" => OrderStatus::PartialFill,
        "Rejected" => OrderStatus::Rejected,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
        other => {
            warn!("[bybit] unknown order status {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

fn translate_order(entry: &Value) -> OrderResult {
    OrderResult {
        order_id: field_str(entry, "orderId").unwrap_or("").to_string(),
        venue: VENUE,
        status: map_status(field_str(entry, "orderStatus").unwrap_or("New")),
        filled_quantity: field_num(entry, "cumExecQty").unwrap_or(0.0),
        avg_price: field_num(entry, "avgPrice").unwrap_or(0.0),
        message: String::new(),
    }
}

fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    let data = msg.get("data")?;
    let price = field_num(data, "lastPrice")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: field_num(data, "bid1Price"),
        ask: field_num(data, "ask1Price"),
        volume: field_num(data, "volume24h"),
        timestamp_ms: field_u64(msg, "ts").unwrap_or_else(now_ms),
    })
}

#[async_trait]
impl BrokerAdapter for BybitAdapter {
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

        let body = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        unwrap_envelope(body).map_err(|reason| BxError::Auth {
            venue: VENUE,
            reason,
        })?;

        self.connected.store(true, Ordering::SeqCst);
        info!("[bybit] connected ({})", self.base_url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[bybit] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let coins = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .and_then(|acct| acct.get("coin"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(coins
            .iter()
            .filter_map(|entry| {
                let asset = field_str(entry, "coin")?;
                let total = field_num(entry, "walletBalance")?;
                let locked = field_num(entry, "locked").unwrap_or(0.0);
                let free = (total - locked).max(0.0);
                (total != 0.0).then(|| AccountBalance::new(asset, VENUE, free, locked))
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        let body = self
            .signed_get("/v5/position/list", "category=linear&settleCoin=USDT")
            .await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let list = result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(list
            .iter()
            .filter_map(|entry| {
                let quantity = field_num(entry, "size")?;
                if quantity == 0.0 {
                    return None;
                }
                let side = match field_str(entry, "side")? {
                    "Buy" => PositionSide::Long,
                    _ => PositionSide::Short,
                };
                Some(Position {
                    symbol: symbol::canonical(field_str(entry, "symbol")?),
                    venue: VENUE,
                    side,
                    quantity,
                    entry_price: field_num(entry, "avgPrice").unwrap_or(0.0),
                    mark_price: field_num(entry, "markPrice").unwrap_or(0.0),
                    unrealized_pnl: field_num(entry, "unrealisedPnl").unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let mut order = json!({
            "category": "spot",
            "symbol": symbol::canonical(&request.symbol),
            "side": match request.side { Side::Buy => "Buy", Side::Sell => "Sell" },
            "orderType": match request.order_type {
                OrderType::Market => "Market",
                OrderType::Limit | OrderType::Stop => "Limit",
            },
            "qty": request.quantity.to_string(),
        });
        if let Some(price) = request.limit_price {
            order["price"] = json!(price.to_string());
            order["timeInForce"] = json!(match request.time_in_force {
                TimeInForce::Ioc => "IOC",
                TimeInForce::Fok => "FOK",
                TimeInForce::Gtc | TimeInForce::Day => "GTC",
            });
        }
        if let Some(trigger) = request.stop_price {
            order["triggerPrice"] = json!(trigger.to_string());
        }

        let body = self.signed_post("/v5/order/create", &order).await?;
        match unwrap_envelope(body) {
            Ok(result) => Ok(OrderResult {
                order_id: field_str(&result, "orderId").unwrap_or("").to_string(),
                venue: VENUE,
                status: OrderStatus::Pending,
                filled_quantity: 0.0,
                avg_price: 0.0,
                message: String::new(),
            }),
            // v5 reports refusals in-band; treat them all as business
            // rejections rather than faults.
            Err(reason) => Ok(OrderResult::rejected(VENUE, reason)),
        }
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let query = format!("category=spot&symbol={}", symbol::canonical(symbol_));
        let body = self.signed_get("/v5/order/history", &query).await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        Ok(result
            .get("list")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(translate_order).collect())
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
        let mut config = TransportConfig::new(self.ws_url.clone(), format!("bybit:{canonical}"));
        config.subscribe_msg = Some(
            json!({ "op": "subscribe", "args": [format!("tickers.{canonical}")] }).to_string(),
        );
        config.ping_interval = Some(std::time::Duration::from_secs(20));
        config.ping_payload = Some(PingPayload::Json(json!({ "op": "ping" })));

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
    fn envelope_surfaces_ret_code() {
        let ok = json!({ "retCode": 0, "retMsg": "OK", "result": { "x": 1 } });
        assert!(unwrap_envelope(ok).is_ok());

        let err = json!({ "retCode": 170131, "retMsg": "Insufficient balance" });
        let reason = unwrap_envelope(err).unwrap_err();
        assert!(reason.contains("Insufficient balance"));
    }

    #[test]
    fn status_vocabulary_maps_to_canonical() {
        assert_eq!(map_status("PartiallyFilled"), OrderStatus::PartialFill);
        assert_eq!(map_status("Deactivated"), OrderStatus::Cancelled);
        assert_eq!(map_status("New"), OrderStatus::Pending);
    }

    #[test]
    fn ticker_translation() {
        let msg = json!({
            "topic": "tickers.BTCUSDT",
            "ts": 1700000000001u64,
            "data": {
                "symbol": "BTCUSDT",
                "lastPrice": "50001.5",
                "bid1Price": "50001.0",
                "ask1Price": "50002.0",
                "volume24h": "999.9"
            }
        });
        let quote = translate_ticker("BTCUSDT", &msg).unwrap();
        assert_eq!(quote.price, 50_001.5);
        assert_eq!(quote.venue, VenueId::Bybit);
        assert_eq!(quote.timestamp_ms, 1_700_000_000_001);
    }
}
