//! Kraken spot adapter.
//!
//! Private REST calls are form-encoded POSTs with a monotonically
//! increasing `nonce`; `API-Sign` is
//! `base64(HMAC-SHA512(path ‖ SHA256(nonce ‖ postdata)))` keyed with the
//! base64-decoded secret. Responses carry an `error` array — entries
//! prefixed `EOrder:` are business refusals, anything else is a fault.
//!
//! Kraken quirks handled here: bitcoin is `XBT`, REST assets come back in
//! the legacy `X`/`Z` prefixed form (`XXBT`, `ZUSD`), and the v1 WebSocket
//! wants slash-delimited pairs (`XBT/USD`) with array-framed ticker
//! payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use bx_core::credentials::Credential;
use bx_core::error::BxError;
use bx_core::time_util::now_ms;
use bx_core::types::enums::{OrderStatus, OrderType, PositionSide, Side, VenueId};
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
use bx_core::ws::{MdTransport, OnCloseCallback, TransportConfig};
use bx_core::{symbol, ws};

use crate::json_util::{field_num, field_str, num};
use crate::{BrokerAdapter, QuoteCallback, auth};

const REST: &str = "https://api.kraken.com";
const WS: &str = "wss://ws.kraken.com";

const VENUE: VenueId = VenueId::Kraken;

/// Kraken spot adapter.
pub struct KrakenAdapter {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, MdTransport>>,
}

impl KrakenAdapter {
    pub fn new(credential: &Credential) -> Result<Self, BxError> {
        // Kraken has no public testnet; demo credentials still hit the live
        // API but are expected to be trade-permission-less keys.
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: credential.require("api_key")?.to_string(),
            api_secret: credential.require("api_secret")?.to_string(),
            connected: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Signed private POST. `params` are the form fields minus the nonce.
    async fn private_post(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, BxError> {
        let nonce = now_ms().to_string();
        let mut form: Vec<(&str, &str)> = vec![("nonce", &nonce)];
        form.extend_from_slice(params);
        let postdata: String = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = auth::kraken_sign(&self.api_secret, path, &nonce, &postdata)?;

        let resp = self
            .http
            .post(format!("{REST}{path}"))
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await
            .map_err(|e| BxError::connection(VENUE, e))?;

        resp.json()
            .await
            .map_err(|e| BxError::Parse(format!("kraken {path}: {e}")))
    }

    /// REST pair in compact form with Kraken's bitcoin code (`XBTUSD`).
    fn rest_pair(symbol_: &str) -> Result<String, BxError> {
        let canonical = symbol::canonical(symbol_);
        let (base, quote) = symbol::split_pair(&canonical).ok_or_else(|| {
            BxError::Subscription {
                venue: VENUE,
                symbol: symbol_.to_string(),
                reason: "not a recognizable pair".into(),
            }
        })?;
        Ok(format!("{}{}", to_kraken_asset(base), quote))
    }

    /// WebSocket pair in slash form (`XBT/USD`).
    fn ws_pair(symbol_: &str) -> Result<String, BxError> {
        let canonical = symbol::canonical(symbol_);
        let (base, quote) = symbol::split_pair(&canonical).ok_or_else(|| {
            BxError::Subscription {
                venue: VENUE,
                symbol: symbol_.to_string(),
                reason: "not a recognizable pair".into(),
            }
        })?;
        Ok(format!("{}/{}", to_kraken_asset(base), quote))
    }
}

/// Canonical asset code → Kraken's (`BTC` → `XBT`).
fn to_kraken_asset(asset: &str) -> &str {
    match asset {
        "BTC" => "XBT",
        other => other,
    }
}

/// Kraken asset code → canonical, stripping the legacy `X`/`Z` prefix
/// (`XXBT` → `BTC`, `ZUSD` → `USD`).
fn from_kraken_asset(asset: &str) -> String {
    let stripped = if asset.len() == 4 && (asset.starts_with('X') || asset.starts_with('Z')) {
        &asset[1..]
    } else {
        asset
    };
    match stripped {
        "XBT" => "BTC".to_string(),
        other => other.to_string(),
    }
}

/// Kraken pair → canonical symbol. Handles both the legacy prefixed form
/// (`XXBTZUSD`) and the plain one (`XBTUSD`).
fn from_kraken_pair(pair: &str) -> String {
    let compact = symbol::canonical(pair);
    let unprefixed = if compact.len() == 8
        && compact.starts_with(['X', 'Z'])
        && compact[4..].starts_with(['X', 'Z'])
    {
        format!(
            "{}{}",
            from_kraken_asset(&compact[..4]),
            from_kraken_asset(&compact[4..])
        )
    } else {
        compact
    };
    unprefixed.replace("XBT", "BTC")
}

/// Pull `result` out of the envelope; the error mapper decides whether a
/// non-empty `error` array is a refusal or a fault.
fn unwrap_envelope(body: Value) -> Result<Value, String> {
    let errors: Vec<String> = body
        .get("error")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|e| e.as_str().map(String::from)).collect())
        .unwrap_or_default();
    if errors.is_empty() {
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    } else {
        Err(errors.join("; "))
    }
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "pending" | "open" => OrderStatus::Pending,
        "closed" => OrderStatus::Filled,
        "canceled" | "expired" => OrderStatus::Cancelled,
        other => {
            warn!("[kraken] unknown order status {other:?}, treating as pending");
            OrderStatus::Pending
        }
    }
}

/// Translate one v1 WebSocket ticker frame:
/// `[channelID, {"a":[...],"b":[...],"c":[...],"v":[...]}, "ticker", "XBT/USD"]`.
fn translate_ticker(canonical_symbol: &str, msg: &Value) -> Option<Quote> {
    let frame = msg.as_array()?;
    if frame.len() < 4 || frame.get(2)?.as_str()? != "ticker" {
        return None;
    }
    let data = frame.get(1)?;
    let first = |key: &str| data.get(key)?.as_array()?.first().and_then(num);
    let price = first("c")?;
    Some(Quote {
        symbol: canonical_symbol.to_string(),
        venue: VENUE,
        price,
        bid: first("b"),
        ask: first("a"),
        volume: data
            .get("v")
            .and_then(Value::as_array)
            .and_then(|v| v.get(1))
            .and_then(num),
        timestamp_ms: now_ms(),
    })
}

#[async_trait]
impl BrokerAdapter for KrakenAdapter {
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

        let body = self.private_post("/0/private/Balance", &[]).await?;
        unwrap_envelope(body).map_err(|reason| BxError::Auth {
            venue: VENUE,
            reason,
        })?;

        self.connected.store(true, Ordering::SeqCst);
        info!("[kraken] connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, mut transport) in feeds.drain() {
            transport.stop().await;
        }
        info!("[kraken] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let body = self.private_post("/0/private/Balance", &[]).await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let map = result
            .as_object()
            .ok_or_else(|| BxError::Parse("kraken Balance: expected object".into()))?;

        // Kraken's Balance endpoint reports one total per asset with no
        // free/locked split; report it all as free.
        Ok(map
            .iter()
            .filter_map(|(asset, total)| {
                let total = num(total)?;
                (total != 0.0)
                    .then(|| AccountBalance::new(from_kraken_asset(asset), VENUE, total, 0.0))
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        let body = self
            .private_post("/0/private/OpenPositions", &[("docalcs", "true")])
            .await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let map = result.as_object().cloned().unwrap_or_default();
        Ok(map
            .values()
            .filter_map(|entry| {
                let quantity = field_num(entry, "vol")?;
                if quantity == 0.0 {
                    return None;
                }
                let side = match field_str(entry, "type")? {
                    "buy" => PositionSide::Long,
                    _ => PositionSide::Short,
                };
                let cost = field_num(entry, "cost").unwrap_or(0.0);
                let value = field_num(entry, "value").unwrap_or(cost);
                Some(Position {
                    symbol: from_kraken_pair(field_str(entry, "pair").unwrap_or("")),
                    venue: VENUE,
                    side,
                    quantity,
                    entry_price: cost / quantity,
                    mark_price: value / quantity,
                    unrealized_pnl: field_num(entry, "net").unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let pair = Self::rest_pair(&request.symbol)?;
        let ordertype = match request.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop-loss",
        };
        let side = match request.side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        let volume = request.quantity.to_string();

        let mut params: Vec<(&str, &str)> = vec![
            ("pair", &pair),
            ("type", side),
            ("ordertype", ordertype),
            ("volume", &volume),
        ];
        let price = match request.order_type {
            OrderType::Limit => request.limit_price,
            OrderType::Stop => request.stop_price,
            OrderType::Market => None,
        };
        let price_str = price.map(|p| p.to_string());
        if let Some(ref p) = price_str {
            params.push(("price", p));
        }

        let body = self.private_post("/0/private/AddOrder", &params).await?;
        match unwrap_envelope(body) {
            Ok(result) => {
                let order_id = result
                    .get("txid")
                    .and_then(Value::as_array)
                    .and_then(|t| t.first())
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(OrderResult {
                    order_id,
                    venue: VENUE,
                    status: OrderStatus::Pending,
                    filled_quantity: 0.0,
                    avg_price: 0.0,
                    message: String::new(),
                })
            }
            Err(reason) if reason.contains("EOrder:") || reason.contains("EGeneral:Invalid") => {
                Ok(OrderResult::rejected(VENUE, reason))
            }
            Err(reason) => Err(BxError::trading(VENUE, reason)),
        }
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let pair = Self::rest_pair(symbol_)?;
        let body = self.private_post("/0/private/ClosedOrders", &[]).await?;
        let result = unwrap_envelope(body).map_err(|r| BxError::trading(VENUE, r))?;

        let closed = result
            .get("closed")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(closed
            .iter()
            .filter_map(|(txid, entry)| {
                let entry_pair = entry
                    .get("descr")
                    .and_then(|d| field_str(d, "pair"))
                    .unwrap_or("");
                if !entry_pair.eq_ignore_ascii_case(&pair) {
                    return None;
                }
                Some(OrderResult {
                    order_id: txid.clone(),
                    venue: VENUE,
                    status: map_status(field_str(entry, "status").unwrap_or("open")),
                    filled_quantity: field_num(entry, "vol_exec").unwrap_or(0.0),
                    avg_price: field_num(entry, "price").unwrap_or(0.0),
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
        let pair = Self::ws_pair(symbol_)?;
        let canonical = symbol::canonical(symbol_);

        let mut config = TransportConfig::new(WS, format!("kraken:{canonical}"));
        config.subscribe_msg = Some(
            json!({
                "event": "subscribe",
                "pair": [pair],
                "subscription": { "name": "ticker" }
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
    fn asset_code_translation() {
        assert_eq!(from_kraken_asset("XXBT"), "BTC");
        assert_eq!(from_kraken_asset("ZUSD"), "USD");
        assert_eq!(from_kraken_asset("SOL"), "SOL");
        assert_eq!(to_kraken_asset("BTC"), "XBT");
    }

    #[test]
    fn pair_translation_handles_legacy_prefixes() {
        assert_eq!(from_kraken_pair("XXBTZUSD"), "BTCUSD");
        assert_eq!(from_kraken_pair("XBTUSD"), "BTCUSD");
        assert_eq!(from_kraken_pair("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn pair_formats() {
        assert_eq!(KrakenAdapter::rest_pair("BTCUSD").unwrap(), "XBTUSD");
        assert_eq!(KrakenAdapter::ws_pair("BTCUSD").unwrap(), "XBT/USD");
        assert!(KrakenAdapter::rest_pair("AAPL").is_err());
    }

    #[test]
    fn envelope_error_join() {
        let err = json!({ "error": ["EOrder:Insufficient funds"] });
        assert_eq!(unwrap_envelope(err).unwrap_err(), "EOrder:Insufficient funds");

        let ok = json!({ "error": [], "result": { "txid": ["OABC"] } });
        assert!(unwrap_envelope(ok).is_ok());
    }

    #[test]
    fn ws_ticker_frame_translation() {
        let frame = json!([
            42,
            {
                "a": ["50001.0", 1, "1.0"],
                "b": ["50000.0", 2, "2.0"],
                "c": ["50000.5", "0.1"],
                "v": ["100.0", "2500.0"]
            },
            "ticker",
            "XBT/USD"
        ]);
        let quote = translate_ticker("BTCUSD", &frame).unwrap();
        assert_eq!(quote.price, 50_000.5);
        assert_eq!(quote.bid, Some(50_000.0));
        assert_eq!(quote.volume, Some(2_500.0));

        // Heartbeat events are objects, not frames.
        assert!(translate_ticker("BTCUSD", &json!({ "event": "heartbeat" })).is_none());
    }
}
