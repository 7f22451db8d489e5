//! # bx-venues
//!
//! Venue adapters for the broker-aggregation engine.
//!
//! Each venue implements the [`BrokerAdapter`] trait, which provides a
//! uniform interface over heterogeneous broker APIs: authentication, symbol
//! format, order/position/balance shapes, and status vocabularies are all
//! translated at the adapter boundary into the canonical `bx-core` types.
//! The engine layers above (manager, multiplexer, scorer, router,
//! reconciler) never branch on venue identity except to select an instance.
//!
//! ## Supported venues
//!
//! | Venue    | Module     | Auth scheme                       | Market data       |
//! |----------|------------|-----------------------------------|-------------------|
//! | Binance  | `binance`  | HMAC-SHA256 signed query          | WS `@ticker`      |
//! | Bitget   | `bitget`   | HMAC-SHA256 (base64) headers      | WS `ticker`       |
//! | Bybit    | `bybit`    | HMAC-SHA256 headers               | WS `tickers.*`    |
//! | Coinbase | `coinbase` | HMAC-SHA256 (b64 key) headers     | WS `ticker`       |
//! | Gemini   | `gemini`   | HMAC-SHA384 payload signature     | WS v1 marketdata  |
//! | Kraken   | `kraken`   | HMAC-SHA512 nonce signature       | WS v1 `ticker`    |
//! | KuCoin   | `kucoin`   | HMAC-SHA256 (v2) headers          | WS bullet token   |
//! | OKX      | `okx`      | HMAC-SHA256 (base64) headers      | WS `tickers`      |
//! | Paper    | `paper`    | none (in-process simulation)      | synthetic feed    |

pub mod auth;
pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod coinbase;
pub mod gemini;
mod json_util;
pub mod kraken;
pub mod kucoin;
pub mod okx;
pub mod paper;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use bx_core::error::BxError;
use bx_core::types::enums::VenueId;
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};

/// Callback invoked for every market-data tick an adapter produces.
pub type QuoteCallback = Arc<dyn Fn(Quote) + Send + Sync>;

/// Callback invoked once when a market-data transport closes on its own.
/// The argument is a human-readable reason. Re-exported from `bx-core::ws`
/// so the multiplexer can hand its closure straight to the transport.
pub use bx_core::ws::OnCloseCallback;

/// Trait implemented by all venue adapters.
///
/// # Lifecycle
///
/// 1. Construct via the [`registry`] from a stored credential.
/// 2. [`connect`](BrokerAdapter::connect) authenticates. It is idempotent —
///    calling it twice while connected is a no-op.
/// 3. Account/order/market-data operations.
/// 4. [`disconnect`](BrokerAdapter::disconnect) closes all transports and
///    releases resources.
///
/// All methods take `&self` — adapters keep mutable state behind
/// `tokio::sync::Mutex` so one `Arc<dyn BrokerAdapter>` can be shared by
/// the manager, multiplexer, and router concurrently.
///
/// # Error discipline
///
/// - Bad credentials → [`BxError::Auth`]; transport faults →
///   [`BxError::Connection`].
/// - Business-level order refusals (insufficient funds, unsupported symbol,
///   size filters) are **not** errors: `place_order` returns `Ok` with a
///   `rejected` [`OrderResult`] carrying the venue's reason.
/// - A symbol a venue cannot stream → [`BxError::Subscription`]; the caller
///   excludes that venue and carries on.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Which venue this adapter talks to.
    fn venue(&self) -> VenueId;

    /// Whether the venue can quote/trade this canonical symbol at all.
    /// A cheap static check (symbol shape), not a network call.
    fn supports_symbol(&self, symbol: &str) -> bool;

    /// Authenticate and validate the session. Idempotent.
    async fn connect(&self) -> Result<(), BxError>;

    /// Close all transports and mark the session disconnected. Idempotent.
    async fn disconnect(&self) -> Result<(), BxError>;

    /// Pure state query — no network traffic.
    fn is_connected(&self) -> bool;

    /// Current balances, translated to canonical shape.
    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError>;

    /// Open positions, translated to canonical shape. Venues without a
    /// position concept (spot-only) return an empty list.
    async fn get_positions(&self) -> Result<Vec<Position>, BxError>;

    /// Submit an order. Business rejections come back as a `rejected`
    /// result, never as an `Err`.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError>;

    /// Historical orders for one symbol, most recent first where the venue
    /// defines an order.
    async fn get_order_history(&self, symbol: &str) -> Result<Vec<OrderResult>, BxError>;

    /// Open a market-data stream for `symbol`. One stream per symbol per
    /// adapter — fan-out to multiple consumers happens in the multiplexer,
    /// not here. `on_close` fires once if the transport dies on its own;
    /// the adapter does not reconnect market data by itself.
    async fn subscribe_market_data(
        &self,
        symbol: &str,
        on_quote: QuoteCallback,
        on_close: OnCloseCallback,
    ) -> Result<(), BxError>;

    /// Close the market-data stream for `symbol`. A no-op when no stream
    /// is open.
    async fn unsubscribe_market_data(&self, symbol: &str) -> Result<(), BxError>;
}
