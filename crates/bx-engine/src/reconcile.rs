//! Position and balance reconciliation.
//!
//! Concatenates per-venue snapshots into one venue-tagged view. No
//! cross-venue netting: a long on one venue and a short on another stay
//! two records. A failing venue is logged and omitted; the merge itself
//! never fails.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use bx_core::time_util::elapsed_ms;
use bx_core::types::enums::VenueId;
use bx_core::types::trading::{AccountBalance, Position};
use bx_venues::BrokerAdapter;

use crate::manager::ConnectionMap;
use crate::scorer::QuoteBoard;

/// Merges balances and positions across all connected venues.
pub struct Reconciler {
    connections: ConnectionMap,
    board: Arc<QuoteBoard>,
}

impl Reconciler {
    pub fn new(connections: ConnectionMap, board: Arc<QuoteBoard>) -> Self {
        Self { connections, board }
    }

    /// Balances from every connected venue, venue-tagged, in venue order.
    pub async fn merged_balances(&self) -> Vec<AccountBalance> {
        let mut merged = Vec::new();
        for (venue, adapter) in self.connected().await {
            let started = Instant::now();
            match adapter.get_balances().await {
                Ok(balances) => {
                    self.board.record_latency(venue, elapsed_ms(started));
                    merged.extend(balances);
                }
                Err(e) => warn!("[reconciler] {venue} balances omitted: {e}"),
            }
        }
        merged
    }

    /// Positions from every connected venue, venue-tagged, in venue order.
    pub async fn merged_positions(&self) -> Vec<Position> {
        let mut merged = Vec::new();
        for (venue, adapter) in self.connected().await {
            let started = Instant::now();
            match adapter.get_positions().await {
                Ok(positions) => {
                    self.board.record_latency(venue, elapsed_ms(started));
                    merged.extend(positions);
                }
                Err(e) => warn!("[reconciler] {venue} positions omitted: {e}"),
            }
        }
        merged
    }

    /// Connected adapters in deterministic venue order.
    async fn connected(&self) -> Vec<(VenueId, Arc<dyn BrokerAdapter>)> {
        let connections = self.connections.read().await;
        let mut adapters: Vec<(VenueId, Arc<dyn BrokerAdapter>)> = connections
            .iter()
            .filter(|(_, adapter)| adapter.is_connected())
            .map(|(&venue, adapter)| (venue, Arc::clone(adapter)))
            .collect();
        adapters.sort_by_key(|(venue, _)| *venue);
        adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    use bx_core::types::enums::PositionSide;

    use crate::testing::MockAdapter;

    fn reconciler_with(adapters: Vec<Arc<MockAdapter>>) -> Reconciler {
        let mut map: HashMap<VenueId, Arc<dyn BrokerAdapter>> = HashMap::new();
        for adapter in adapters {
            map.insert(adapter.venue(), adapter);
        }
        Reconciler::new(
            Arc::new(RwLock::new(map)),
            Arc::new(QuoteBoard::new()),
        )
    }

    fn position(venue: VenueId, symbol: &str) -> Position {
        Position {
            symbol: symbol.into(),
            venue,
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 100.0,
            mark_price: 101.0,
            unrealized_pnl: 1.0,
        }
    }

    #[tokio::test]
    async fn merge_concatenates_without_netting() {
        let a = MockAdapter::connected(VenueId::Binance).await;
        a.set_positions(Ok(vec![position(VenueId::Binance, "BTCUSD")]));
        let b = MockAdapter::connected(VenueId::Kraken).await;
        let mut short = position(VenueId::Kraken, "BTCUSD");
        short.side = PositionSide::Short;
        b.set_positions(Ok(vec![short]));

        let merged = reconciler_with(vec![a, b]).merged_positions().await;
        // Same symbol, opposite sides, two distinct records.
        assert_eq!(merged.len(), 2);
        assert_ne!(merged[0].side, merged[1].side);
    }

    #[tokio::test]
    async fn failing_venue_is_omitted_not_fatal() {
        let healthy = MockAdapter::connected(VenueId::Binance).await;
        healthy.set_positions(Ok(vec![position(VenueId::Binance, "ETHUSD")]));
        let broken = MockAdapter::connected(VenueId::Kraken).await;
        broken.set_positions(Err("maintenance window".into()));

        let merged = reconciler_with(vec![healthy, broken]).merged_positions().await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].venue, VenueId::Binance);
    }

    #[tokio::test]
    async fn balances_merge_with_venue_tags() {
        let a = MockAdapter::connected(VenueId::Bybit).await;
        a.set_balances(Ok(vec![AccountBalance::new("USDT", VenueId::Bybit, 5_000.0, 0.0)]));
        let b = MockAdapter::connected(VenueId::Okx).await;
        b.set_balances(Ok(vec![AccountBalance::new("USDT", VenueId::Okx, 2_500.0, 100.0)]));

        let merged = reconciler_with(vec![a, b]).merged_balances().await;
        assert_eq!(merged.len(), 2);
        for balance in &merged {
            assert!((balance.total - (balance.free + balance.locked)).abs() < 1e-9);
        }
        // Deterministic venue order: bybit before okx.
        assert_eq!(merged[0].venue, VenueId::Bybit);
    }

    #[tokio::test]
    async fn disconnected_adapters_are_skipped() {
        let adapter = MockAdapter::new(VenueId::Binance);
        adapter.set_balances(Ok(vec![AccountBalance::new(
            "USD",
            VenueId::Binance,
            1.0,
            0.0,
        )]));
        // Never connected.
        let merged = reconciler_with(vec![adapter]).merged_balances().await;
        assert!(merged.is_empty());
    }
}
