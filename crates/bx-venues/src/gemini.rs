//! Gemini spot adapter.
//!
//! Private REST calls POST an empty body; the request itself travels in
//! the `X-GEMINI-PAYLOAD` header as base64 JSON (endpoint path + nonce +
//! parameters) and `X-GEMINI-SIGNATURE` is hex HMAC-SHA384 over that
//! base64 string. The sandbox at `api.sandbox.gemini.com` serves demo
//! credentials.
//!
//! Gemini has no native market order type; market requests are emulated
//! as immediate-or-cancel limit orders, which requires a price hint on
//! the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::info;

use bx_core::credentials::Credential;
use bx_core::error::BxError;
use bx_core::time_util::now_ms;
use bx_core::types::enums::{OrderStatus, OrderType, Side, VenueId};
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
use bx_core::ws::{MdTransport, OnCloseCallback, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, field_u64};
use crate::{BrokerAdapter, QuoteCallback, auth};

const REST_LIVE: &str = "https://api.gemini.com";
const REST_DEMO: &str = "https://api.sandbox.gemini.com";
const WS_LIVE: &str = "wss://api.gemini.com";
const WS_DEMO: &str = "wss://api.sandbox.gemini.com";

const VENUE: VenueId = VenueId::Gemini;

/// Gemini spot adapter.
pub struct GeminiAdapter {
    http: reqwest::Client,
    rest: &'static str,
    ws: &'static str,
    api_key: String,
    api_secret: String,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl GeminiAdapter {
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        Ok(Self {
            http: reqwest::Client::new(),
            rest: if credential.demo { REST_DEMO } else { REST_LIVE },
            ws: if credential.demo { WS_DEMO } else { WS_LIVE },
            api_key: credential.require("api_key")?.to_string(),
            api_secret: credential.require("api_secret")?.to_string(),
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Signed private POST. `fields` are merged into the payload next to
    /// the mandatory `request` and `nonce` members.
    async fn private_post(&self, path: &str, fields: Map<String, Value>) -> Result<Value, BxError> {
        let mut payload = fields;
        payload.insert("request".into(), json!(path));
        payload.insert("nonce".into(), json!(now_ms().to_string()));

        let payload_b64 = auth::encode_b64(Value::Object(payload).to_string().as_bytes());
        let signature = auth::hmac_sha384_hex(&self.api_secret, &payload_b64);

        let resp = self
            .http
            .post(format!("{}{path}", self.rest))
            .header("Content-Type", "text/plain")
            .header("Content-Length", "0")
            .header("X-GEMINI-APIKEY", &self.api_key)
            .header("X-GEMINI-PAYLOAD", payload_b64)
            .header("X-GEMINI-SIGNATURE", signature)
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BxError::Parse(format!("gemini {path}: {e}")))?;

        // Errors come back as {"result":"error","reason":...,"message":...}
        // with a non-2xx status; surface them through the envelope check so
        // order placement can decide refusal vs fault.
        if !status.is_success() && field_str(&body, "result") != Some("error") {
            return Err(BxError::trading(VENUE, format!("HTTP {status}")));
        }
        Ok(body)
    }

    /// Gemini wants lowercase compact pairs (`btcusd`).
    fn gemini_symbol(symbol_: &str) -> String {
        symbol::canonical(symbol_).to_lowercase()
    }
}

fn envelope_error(body: &Value) -> Option<(String, String)> {
    if field_str(body, "result") == Some("error") {
        let reason = field_str(body, "reason").unwrap_or("Unknown").to_string();
        let message = field_str(body, "message").unwrap_or("").to_string();
        Some((reason, message))
    } else {
        None
    }
}

/// Refusal reasons that mean the venue understood us and said no.
fn is_business_rejection(reason: &str) -> bool {
    matches!(
        reason,
        "InsufficientFunds"
            | "InvalidQuantity"
            | "InvalidPrice"
            | "InvalidSymbol"
            | "InvalidSide"
            | "MarketNotOpen"
            | "OrderNotFound"
    )
}

fn translate_order(order: &Value) -> Option<OrderResult> {
    let executed = field_num(order, "executed_amount").unwrap_or(0.0);
    let original = field_num(order, "original_amount").unwrap_or(0.0);
    let is_live = order.get("is_live").and_then(Value::as_bool).unwrap_or(false);
    let is_cancelled = order
        .get("is_cancelled")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let status = if is_cancelled {
        OrderStatus::Cancelled
    } else if executed > 0.0 && executed >= original {
        OrderStatus::Filled
    } else if executed > 0.0 {
        OrderStatus::PartialFill
    } else if is_live {
        OrderStatus::Pending
    } else {
        OrderStatus::Cancelled
    };

    Some(OrderResult {
        order_id: field_str(order, "order_id")?.to_string(),
        venue: VENUE,
        status,
        filled_quantity: executed,
        avg_price: field_num(order, "avg_execution_price").unwrap_or(0.0),
        message: String::new(),
    })
}

/// The v1 market-data socket frames order book changes and trades into
/// `update` events; only trade events carry an unambiguous last price.
fn translate_update(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    if field_str(msg, "type")? != "update" {
        return None;
    }
    let events = msg.get("events")?.as_array()?;
    let trade = events
        .iter()
        .rev()
        .find(|e| field_str(e, "type") == Some("trade"))?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price: field_num(trade, "price")?,
        bid: None,
        ask: None,
        volume: field_num(trade, "amount"),
        timestamp_ms: field_u64(msg, "timestampms").unwrap_or_else(now_ms),
    })
}

#[async_trait]
impl BrokerAdapter for GeminiAdapter {
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

        let body = self.private_post("/v1/balances", Map::new()).await?;
        if let Some((reason, message)) = envelope_error(&body) {
            return Err(BxError::Auth {
                venue: VENUE,
                reason: format!("{reason}: {message}"),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("[gemini] connected ({})", self.rest);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[gemini] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self.private_post("/v1/balances", Map::new()).await?;
        if let Some((reason, message)) = envelope_error(&body) {
            return Err(BxError::trading(VENUE, format!("{reason}: {message}")));
        }

        let entries = body
            .as_array()
            .ok_or_else(|| BxError::Parse("gemini balances: expected array".into()))?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let total = field_num(entry, "amount")?;
                let free = field_num(entry, "available")?;
                (total != 0.0).then(|| {
                    AccountBalance::new(
                        field_str(entry, "currency").unwrap_or("").to_uppercase(),
                        VENUE,
                        free,
                        total - free,
                    )
                })
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        // Spot exchange, no derivatives positions.
        Ok(Vec::new())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        // Market emulation: IOC limit at the caller's price hint.
        let (price, options) = match request.order_type {
            OrderType::Limit => (request.limit_price, Vec::new()),
            OrderType::Market => (request.limit_price, vec!["immediate-or-cancel"]),
            OrderType::Stop => (request.stop_price, Vec::new()),
        };
        let Some(price) = price else {
            return Ok(OrderResult::rejected(
                VENUE,
                "a limit price hint is required (no native market orders)",
            ));
        };

        let mut fields = Map::new();
        fields.insert("symbol".into(), json!(Self::gemini_symbol(&request.symbol)));
        fields.insert("amount".into(), json!(request.quantity.to_string()));
        fields.insert("price".into(), json!(price.to_string()));
        fields.insert(
            "side".into(),
            json!(match request.side {
                Side::Buy => "buy",
                Side::Sell => "sell",
            }),
        );
        fields.insert(
            "type".into(),
            json!(match request.order_type {
                OrderType::Stop => "exchange stop limit",
                _ => "exchange limit",
            }),
        );
        if request.order_type == OrderType::Stop {
            if let Some(stop) = request.stop_price {
                fields.insert("stop_price".into(), json!(stop.to_string()));
            }
        }
        if !options.is_empty() {
            fields.insert("options".into(), json!(options));
        }

        let body = self.private_post("/v1/order/new", fields).await?;
        if let Some((reason, message)) = envelope_error(&body) {
            return if is_business_rejection(&reason) {
                Ok(OrderResult::rejected(VENUE, format!("{reason}: {message}")))
            } else {
                Err(BxError::trading(VENUE, format!("{reason}: {message}")))
            };
        }

        translate_order(&body)
            .ok_or_else(|| BxError::Parse(format!("gemini order/new: unrecognized shape: {body}")))
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let mut fields = Map::new();
        fields.insert("symbol".into(), json!(Self::gemini_symbol(symbol_)));
        fields.insert("limit_trades".into(), json!(100));

        let body = self.private_post("/v1/mytrades", fields).await?;
        if let Some((reason, message)) = envelope_error(&body) {
            return Err(BxError::trading(VENUE, format!("{reason}: {message}")));
        }

        let trades = body.as_array().cloned().unwrap_or_default();
        // Past-trade records are fills by definition; newest first already.
        Ok(trades
            .iter()
            .filter_map(|trade| {
                Some(OrderResult {
                    order_id: field_str(trade, "order_id")?.to_string(),
                    venue: VENUE,
                    status: OrderStatus::Filled,
                    filled_quantity: field_num(trade, "amount")?,
                    avg_price: field_num(trade, "price")?,
                    message: String::new(),
                })
            })
            .collect())
    }

    async fn subscribe_market_data(
        &self,
        symbol_: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        let canonical = symbol::canonical(symbol_);
        // Per-symbol socket; the path itself is the subscription, no
        // subscribe message needed.
        let url = format!(
            "{}/v1/marketdata/{}?top_of_book=false&trades=true",
            self.ws,
            Self::gemini_symbol(symbol_)
        );

        let config = TransportConfig::new(url, format!("gemini:{canonical}"));

        let on_text: ws::OnTextCallback = {
            let canonical = canonical.clone();
            Arc::new(move |text: &str| {
                if let Ok(msg) = serde_json::from_str::<Value>(text) {
                    if let Some(quote) = translate_update(&canonical, &msg) {
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
    fn symbol_is_lowercase_compact() {
        assert_eq!(GeminiAdapter::gemini_symbol("BTC/USD"), "btcusd");
        assert_eq!(GeminiAdapter::gemini_symbol("eth-usd"), "ethusd");
    }

    #[test]
    fn order_status_resolution() {
        let filled = json!({
            "order_id": "106817811",
            "executed_amount": "1.0",
            "original_amount": "1.0",
            "avg_execution_price": "3632.85",
            "is_live": false,
            "is_cancelled": false
        });
        let result = translate_order(&filled).unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.avg_price, 3632.85);

        let resting = json!({
            "order_id": "106817812",
            "executed_amount": "0",
            "original_amount": "1.0",
            "is_live": true,
            "is_cancelled": false
        });
        assert_eq!(translate_order(&resting).unwrap().status, OrderStatus::Pending);

        // IOC that executed nothing comes back dead and unexecuted.
        let swept = json!({
            "order_id": "106817813",
            "executed_amount": "0",
            "original_amount": "1.0",
            "is_live": false,
            "is_cancelled": false
        });
        assert_eq!(translate_order(&swept).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn rejection_reasons_split_from_faults() {
        assert!(is_business_rejection("InsufficientFunds"));
        assert!(!is_business_rejection("InvalidSignature"));
        assert!(!is_business_rejection("Maintenance"));
    }

    #[test]
    fn trade_events_become_quotes() {
        let msg = json!({
            "type": "update",
            "eventId": 36902232362u64,
            "timestampms": 1629464726493u64,
            "events": [
                { "type": "change", "side": "bid", "price": "49000", "remaining": "1" },
                { "type": "trade", "price": "49010.5", "amount": "0.25", "makerSide": "ask" }
            ]
        });
        let quote = translate_update("BTCUSD", &msg).unwrap();
        assert_eq!(quote.price, 49_010.5);
        assert_eq!(quote.volume, Some(0.25));
        assert_eq!(quote.timestamp_ms, 1_629_464_726_493);
        assert!(quote.bid.is_none());

        let heartbeat = json!({ "type": "heartbeat" });
        assert!(translate_update("BTCUSD", &heartbeat).is_none());
    }
}
