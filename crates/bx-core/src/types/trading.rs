//! Trading-related data structures — orders, positions, and balances.
//!
//! These types flow between the router/reconciler and the venue adapters.

use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, OrderType, PositionSide, Side, TimeInForce, VenueId};

// ---------------------------------------------------------------------------
// Order request (caller → router → adapter)
// ---------------------------------------------------------------------------

/// A caller's trade intent. Ephemeral — created per routing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Canonical symbol (e.g. `"BTCUSD"`).
    pub symbol: String,
    pub side: Side,
    /// Order quantity in base units. Always positive.
    pub quantity: f64,
    pub order_type: OrderType,
    /// Limit price (required for limit orders).
    pub limit_price: Option<f64>,
    /// Stop trigger price (required for stop orders).
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// A market order with GTC time-in-force.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    /// A limit order with GTC time-in-force.
    pub fn limit(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }
}

// ---------------------------------------------------------------------------
// Order result (adapter → router → caller)
// ---------------------------------------------------------------------------

/// The normalized outcome of one routing attempt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    /// Venue-assigned order id (empty for rejections that never reached
    /// the venue's order book).
    pub order_id: String,
    pub venue: VenueId,
    pub status: OrderStatus,
    /// Cumulative filled quantity.
    pub filled_quantity: f64,
    /// Average fill price (0 when nothing filled).
    pub avg_price: f64,
    /// Human-readable detail; always non-empty for rejections.
    pub message: String,
}

impl OrderResult {
    /// A business-level rejection. Rejections are normal results, never
    /// propagated faults.
    pub fn rejected(venue: VenueId, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "order rejected".to_string();
        }
        Self {
            order_id: String::new(),
            venue,
            status: OrderStatus::Rejected,
            filled_quantity: 0.0,
            avg_price: 0.0,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Open exposure on one venue.
///
/// Side and unsigned magnitude are stored separately; `quantity` is never
/// negative. Use [`Position::signed_quantity`] for net math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub venue: VenueId,
    pub side: PositionSide,
    /// Unsigned magnitude of the exposure.
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    /// Quantity with the sign implied by the side (long positive).
    pub fn signed_quantity(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.quantity,
            PositionSide::Short => -self.quantity,
        }
    }

    /// Recompute unrealized P&L from the entry/mark prices.
    pub fn compute_pnl(&self) -> f64 {
        (self.mark_price - self.entry_price) * self.signed_quantity()
    }
}

// ---------------------------------------------------------------------------
// Account balance
// ---------------------------------------------------------------------------

/// Cash/position split for one asset on one venue (or merged view).
///
/// `total == free + locked` always holds; construct via
/// [`AccountBalance::new`] so the invariant cannot be violated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Asset or currency code (e.g. `"USD"`, `"BTC"`).
    pub asset: String,
    pub venue: VenueId,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
}

impl AccountBalance {
    /// Build a balance with `total` derived from `free + locked`.
    pub fn new(asset: impl Into<String>, venue: VenueId, free: f64, locked: f64) -> Self {
        Self {
            asset: asset.into(),
            venue,
            free,
            locked,
            total: free + locked,
        }
    }
}
