//! OKX v5 adapter.
//!
//! Private REST requests carry four headers: `OK-ACCESS-KEY`,
//! `OK-ACCESS-PASSPHRASE`, `OK-ACCESS-TIMESTAMP` (ISO-8601 UTC with
//! milliseconds), and `OK-ACCESS-SIGN` — base64 HMAC-SHA256 over
//! `timestamp + method + path + body`. Demo credentials set the
//! `x-simulated-trading: 1` header instead of switching hosts.
//!
//! Instruments are dash-delimited (`BTC-USDT`); market data uses the public
//! `tickers` channel with the text `"ping"` keep-alive.

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

const REST: &str = "https://www.okx.com";
const WS: &str = "wss://ws.okx.com:8443/ws/v5/public";

const VENUE: VenueId = VenueId::Okx;

/// OKX v5 adapter.
pub struct OkxAdapter {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    demo: bool,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl OkxAdapter {
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
        let timestamp = iso8601_utc(now_ms());
        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let message = format!("{timestamp}{method}{path}{payload}");
        let signature = auth::hmac_sha256_b64(self.api_secret.as_bytes(), &message);

        let url = format!("{REST}{path}");
        let mut req = match method {
            "POST" => self.http.post(&url).header("Content-Type", "application/json"),
            _ => self.http.get(&url),
        };
        req = req
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        if self.demo {
            req = req.header("x-simulated-trading", "1");
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
            .map_err(|e| BxError::Parse(format!("okx {path}: {e}")))
    }

    fn venue_symbol(symbol_: &str) -> Result<String, BxError> {
        symbol::delimited(&symbol::canonical(symbol_), '-').ok_or_else(|| BxError::Subscription {
            venue: VENUE,
            symbol: symbol_.to_string(),
            reason: "not a recognizable pair".into(),
        })
    }
}

/// Pull `data` out of an OKX envelope; `code != "0"` is the venue refusal.
fn unwrap_envelope(body: Value) -> Result<Vec<Value>, String> {
    let code = field_str(&body, "code").unwrap_or("-1");
    if code == "0" {
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    } else {
        let msg = field_str(&body, "msg").unwrap_or("unknown error");
        // Per-order errors land in data[0].sMsg with an empty top-level msg.
        let detail = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .and_then(|e| field_str(e, "sMsg"))
            .unwrap_or("");
        if detail.is_empty() {
            Err(format!("code {code}: {msg}"))
        } else {
            Err(format!("code {code}: {detail}"))
        }
    }
}

fn map_status(state: &str) -> OrderStatus {
    match state {
        "live" => OrderStatus::Pending,
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartialFill,
        "canceled" | "mmp_canceled" => OrderStatus::Cancelled,
        other => {
            warn!("[okx] unknown order state {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

fn translate_order(entry: &Value) -> OrderResult {
    OrderResult {
        order_id: field_str(entry, "ordId").unwrap_or("").to_string(),
        venue: VENUE,
        status: map_status(field_str(entry, "state").unwrap_or("live")),
        filled_quantity: field_num(entry, "accFillSz").unwrap_or(0.0),
        avg_price: field_num(entry, "avgPx").unwrap_or(0.0),
        message: String::new(),
    }
}

fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    let data = msg.get("data")?.as_array()?.first()?;
    let price = field_num(data, "last")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: field_num(data, "bidPx"),
        ask: field_num(data, "askPx"),
        volume: field_num(data, "vol24h"),
        timestamp_ms: field_u64(data, "ts").unwrap_or_else(now_ms),
    })
}

/// ISO-8601 UTC timestamp with milliseconds (`2024-01-02T03:04:05.678Z`)
/// from a Unix epoch in milliseconds. Civil-date conversion per Howard
/// Hinnant's `civil_from_days` algorithm.
fn iso8601_utc(epoch_ms: u64) -> String {
    let days = (epoch_ms / 86_400_000) as i64;
    let ms_of_day = epoch_ms % 86_400_000;

    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    let (h, m, s, ms) = (
        ms_of_day / 3_600_000,
        ms_of_day / 60_000 % 60,
        ms_of_day / 1_000 % 60,
        ms_of_day % 1_000,
    );
    format!("{year:04}-{month:02}-{day:02}T{h:02}:{m:02}:{s:02}.{ms:03}Z")
}

#[async_trait]
impl BrokerAdapter for OkxAdapter {
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
            .signed_request("GET", "/api/v5/account/balance", None)
            .await?;
        unwrap_envelope(body).map_err(|reason| BxError::Auth {
            venue: VENUE,
            reason,
        })?;

        self.connected.store(true, Ordering::SeqCst);
        info!("[okx] connected (demo={})", self.demo);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[okx] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self
            .signed_request("GET", "/api/v5/account/balance", None)
            .await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let details = data
            .first()
            .and_then(|acct| acct.get("details"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(details
            .iter()
            .filter_map(|entry| {
                let asset = field_str(entry, "ccy")?;
                let free = field_num(entry, "availBal")?;
                let locked = field_num(entry, "frozenBal").unwrap_or(0.0);
                (free != 0.0 || locked != 0.0)
                    .then(|| AccountBalance::new(asset, VENUE, free, locked))
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        let body = self
            .signed_request("GET", "/api/v5/account/positions", None)
            .await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        Ok(data
            .iter()
            .filter_map(|entry| {
                let net = field_num(entry, "pos")?;
                if net == 0.0 {
                    return None;
                }
                let side = if net > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                Some(Position {
                    symbol: symbol::canonical(field_str(entry, "instId")?),
                    venue: VENUE,
                    side,
                    quantity: net.abs(),
                    entry_price: field_num(entry, "avgPx").unwrap_or(0.0),
                    mark_price: field_num(entry, "markPx").unwrap_or(0.0),
                    unrealized_pnl: field_num(entry, "upl").unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let inst_id = Self::venue_symbol(&request.symbol)?;
        let ord_type = match (request.order_type, request.time_in_force) {
            (OrderType::Market, _) => "market",
            (_, TimeInForce::Ioc) => "ioc",
            (_, TimeInForce::Fok) => "fok",
            _ => "limit",
        };
        let mut order = json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": match request.side { Side::Buy => "buy", Side::Sell => "sell" },
            "ordType": ord_type,
            "sz": request.quantity.to_string(),
        });
        if let Some(price) = request.limit_price {
            order["px"] = json!(price.to_string());
        }

        let body = self
            .signed_request("POST", "/api/v5/trade/order", Some(&order))
            .await?;
        match unwrap_envelope(body) {
            Ok(data) => {
                let entry = data.first().cloned().unwrap_or(Value::Null);
                Ok(OrderResult {
                    order_id: field_str(&entry, "ordId").unwrap_or("").to_string(),
                    venue: VENUE,
                    status: OrderStatus::Pending,
                    filled_quantity: 0.0,
                    avg_price: 0.0,
                    message: String::new(),
                })
            }
            Err(reason) => Ok(OrderResult::rejected(VENUE, reason)),
        }
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let inst_id = Self::venue_symbol(symbol_)?;
        let path = format!("/api/v5/trade/orders-history?instType=SPOT&instId={inst_id}");
        let body = self.signed_request("GET", &path, None).await?;
        let data = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;
        Ok(data.iter().map(translate_order).collect())
    }

    async fn subscribe_market_data(
        &self,
        symbol_: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        let inst_id = Self::venue_symbol(symbol_)?;
        let canonical = symbol::canonical(symbol_);

        let mut config = TransportConfig::new(WS, format!("okx:{canonical}"));
        config.subscribe_msg = Some(
            json!({
                "op": "subscribe",
                "args": [{ "channel": "tickers", "instId": inst_id }]
            })
            .to_string(),
        );
        config.ping_interval = Some(std::time::Duration::from_secs(25));
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
