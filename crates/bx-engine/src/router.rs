//! Order routing.
//!
//! Picks a venue — explicit override or the scorer's best — and submits
//! through its adapter. Every adapter fault is converted to a rejected
//! result here; the only error a caller ever sees is
//! `NoVenueAvailable` when no connected venue can take the order.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use bx_core::error::BxError;
use bx_core::time_util::elapsed_ms;
use bx_core::types::enums::{OrderStatus, OrderType, VenueId};
use bx_core::types::trading::{OrderRequest, OrderResult};
use bx_venues::BrokerAdapter;

use crate::manager::ConnectionMap;
use crate::scorer::{QuoteBoard, Scorer};

/// Routes orders to the best (or explicitly chosen) connected venue.
pub struct OrderRouter {
    connections: ConnectionMap,
    board: Arc<QuoteBoard>,
    scorer: Arc<Scorer>,
}

impl OrderRouter {
    pub fn new(connections: ConnectionMap, board: Arc<QuoteBoard>, scorer: Arc<Scorer>) -> Self {
        Self {
            connections,
            board,
            scorer,
        }
    }

    /// Route one order. `venue_override` bypasses the scorer but must name
    /// a connected venue.
    pub async fn route_order(
        &self,
        request: &OrderRequest,
        venue_override: Option<VenueId>,
    ) -> Result<OrderResult, BxError> {
        let venue = match venue_override {
            Some(venue) => venue,
            None => self
                .scorer
                .find_best(&request.symbol)
                .map(|best| best.venue)
                .ok_or_else(|| BxError::NoVenueAvailable(request.symbol.clone()))?,
        };

        let adapter = self
            .connected_adapter(venue)
            .await
            .ok_or_else(|| BxError::NoVenueAvailable(request.symbol.clone()))?;

        info!(
            "[router] {:?} {} {} -> {venue}",
            request.side, request.quantity, request.symbol
        );

        let started = Instant::now();
        let outcome = adapter.place_order(request).await;
        self.board.record_latency(venue, elapsed_ms(started));

        match outcome {
            Ok(result) => Ok(self.normalize(request, result)),
            // Adapter faults never escape the router.
            Err(e) => {
                warn!("[router] {venue} fault during placement: {e}");
                Ok(OrderResult::rejected(venue, e.to_string()))
            }
        }
    }

    /// Post-process an adapter result into the canonical routing outcome.
    ///
    /// Market orders are treated as immediately filled: venues that only
    /// acknowledge get a synthesized fill at the best-known price. Limit
    /// and stop orders stay pending until a later status query.
    fn normalize(&self, request: &OrderRequest, mut result: OrderResult) -> OrderResult {
        if request.order_type != OrderType::Market {
            return result;
        }
        if result.status != OrderStatus::Pending {
            return result;
        }

        result.status = OrderStatus::Filled;
        result.filled_quantity = request.quantity;
        if result.avg_price <= 0.0 {
            result.avg_price = request
                .limit_price
                .or_else(|| {
                    self.board
                        .latest(&request.symbol, result.venue)
                        .map(|quote| quote.price)
                })
                .unwrap_or(0.0);
        }
        result
    }

    async fn connected_adapter(&self, venue: VenueId) -> Option<Arc<dyn BrokerAdapter>> {
        self.connections
            .read()
            .await
            .get(&venue)
            .filter(|adapter| adapter.is_connected())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    use bx_core::config::EngineConfig;
    use bx_core::time_util::now_ms;
    use bx_core::types::enums::Side;
    use bx_core::types::market::Quote;

    use crate::testing::{MockAdapter, PlaceBehavior};

    fn fresh_quote(venue: VenueId, price: f64) -> Quote {
        Quote {
            symbol: "BTCUSD".into(),
            venue,
            price,
            bid: Some(price - 1.0),
            ask: Some(price + 1.0),
            volume: None,
            timestamp_ms: now_ms(),
        }
    }

    fn router_with(
        adapters: Vec<Arc<MockAdapter>>,
    ) -> (OrderRouter, Arc<QuoteBoard>, ConnectionMap) {
        let mut map: HashMap<VenueId, Arc<dyn BrokerAdapter>> = HashMap::new();
        for adapter in adapters {
            map.insert(adapter.venue(), adapter);
        }
        let connections: ConnectionMap = Arc::new(RwLock::new(map));
        let board = Arc::new(QuoteBoard::new());
        let scorer = Arc::new(Scorer::new(Arc::clone(&board), EngineConfig::default()));
        let router = OrderRouter::new(Arc::clone(&connections), Arc::clone(&board), scorer);
        (router, board, connections)
    }

    #[tokio::test]
    async fn no_quoted_venue_is_a_typed_error() {
        let (router, _, _) = router_with(vec![]);
        let err = router
            .route_order(&OrderRequest::market("BTCUSD", Side::Buy, 1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BxError::NoVenueAvailable(s) if s == "BTCUSD"));
    }

    #[tokio::test]
    async fn override_must_be_connected() {
        let (router, _, _) = router_with(vec![]);
        let err = router
            .route_order(
                &OrderRequest::market("BTCUSD", Side::Buy, 1.0),
                Some(VenueId::Kraken),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BxError::NoVenueAvailable(_)));
    }

    #[tokio::test]
    async fn routes_to_best_scored_venue() {
        let good = MockAdapter::connected(VenueId::Kraken).await;
        let bad = MockAdapter::connected(VenueId::Binance).await;
        let (router, board, _) = router_with(vec![Arc::clone(&good), Arc::clone(&bad)]);

        // Kraken quotes tighter and cheaper.
        board.update(fresh_quote(VenueId::Kraken, 49_000.0));
        board.update(fresh_quote(VenueId::Binance, 50_000.0));

        let result = router
            .route_order(&OrderRequest::market("BTCUSD", Side::Buy, 0.5), None)
            .await
            .unwrap();
        assert_eq!(result.venue, VenueId::Kraken);
        assert_eq!(good.placed_count(), 1);
        assert_eq!(bad.placed_count(), 0);
    }

    #[tokio::test]
    async fn market_ack_synthesizes_fill_at_best_known_price() {
        let venue = MockAdapter::connected(VenueId::Bybit).await;
        // Venue only acknowledges: pending, no price.
        venue.set_place(PlaceBehavior::Reply(OrderResult {
            order_id: "abc".into(),
            venue: VenueId::Bybit,
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_price: 0.0,
            message: String::new(),
        }));
        let (router, board, _) = router_with(vec![venue]);
        board.update(fresh_quote(VenueId::Bybit, 48_500.0));

        let result = router
            .route_order(&OrderRequest::market("BTCUSD", Side::Buy, 2.0), None)
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, 2.0);
        assert_eq!(result.avg_price, 48_500.0);
    }

    #[tokio::test]
    async fn limit_orders_stay_pending() {
        let venue = MockAdapter::connected(VenueId::Okx).await;
        venue.set_place(PlaceBehavior::Reply(OrderResult {
            order_id: "xyz".into(),
            venue: VenueId::Okx,
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_price: 0.0,
            message: String::new(),
        }));
        let (router, _, _) = router_with(vec![venue]);

        let result = router
            .route_order(
                &OrderRequest::limit("BTCUSD", Side::Sell, 1.0, 52_000.0),
                Some(VenueId::Okx),
            )
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Pending);
        assert_eq!(result.filled_quantity, 0.0);
    }

    #[tokio::test]
    async fn adapter_fault_becomes_rejected_result() {
        let venue = MockAdapter::connected(VenueId::Gemini).await;
        venue.set_place(PlaceBehavior::Fault("socket reset".into()));
        let (router, _, _) = router_with(vec![venue]);

        let result = router
            .route_order(
                &OrderRequest::market("BTCUSD", Side::Buy, 1.0),
                Some(VenueId::Gemini),
            )
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert!(!result.message.is_empty());
    }
}
