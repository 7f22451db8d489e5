//! # bx-engine
//!
//! The broker-aggregation engine: everything between the venue adapters
//! and the host application.
//!
//! - **Connection manager** (`manager`) — credential store + venue
//!   connect/disconnect lifecycle
//! - **Market-data multiplexer** (`mux`) — one feed per symbol with
//!   synthetic fallback and scheduled reconnects
//! - **Quote board & scorer** (`scorer`) — latest quotes, latency
//!   estimates, composite venue ranking (lower is better)
//! - **Order router** (`router`) — best-execution or override routing,
//!   fault-to-rejection normalization
//! - **Reconciler** (`reconcile`) — merged venue-tagged balances and
//!   positions
//!
//! [`BrokerHub`] wires these together over one shared connection map and
//! quote board. It is an explicitly constructed object — build one, pass
//! it around; there are no global singletons.

pub mod manager;
pub mod mux;
pub mod reconcile;
pub mod router;
pub mod scorer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use bx_core::config::EngineConfig;
use bx_core::credentials::{Credential, CredentialStore};
use bx_core::error::BxError;
use bx_core::types::enums::VenueId;
use bx_core::types::market::BrokerComparison;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};

pub use bx_venues::{BrokerAdapter, QuoteCallback};
pub use manager::{ConnectionManager, ConnectionMap};
pub use mux::{MarketDataMux, SubscriberId};
pub use reconcile::Reconciler;
pub use router::OrderRouter;
pub use scorer::{QuoteBoard, Scorer};

/// The assembled engine: one shared connection map and quote board,
/// served through the public operations below.
pub struct BrokerHub {
    manager: ConnectionManager,
    mux: MarketDataMux,
    router: OrderRouter,
    reconciler: Reconciler,
    scorer: Arc<Scorer>,
}

impl BrokerHub {
    /// Build the hub from a validated configuration. Opens (or creates)
    /// the credential store at `config.credential_path`.
    pub fn new(config: EngineConfig) -> Result<Self, BxError> {
        config.score_weights.validate()?;
        let store = CredentialStore::open(&config.credential_path)?;

        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let board = Arc::new(QuoteBoard::new());
        let scorer = Arc::new(Scorer::new(Arc::clone(&board), config.clone()));

        Ok(Self {
            manager: ConnectionManager::new(store, Arc::clone(&connections), Arc::clone(&board)),
            mux: MarketDataMux::new(
                Arc::clone(&connections),
                Arc::clone(&board),
                Duration::from_millis(config.fallback_interval_ms),
                Duration::from_millis(config.reconnect_delay_ms),
            ),
            router: OrderRouter::new(
                Arc::clone(&connections),
                Arc::clone(&board),
                Arc::clone(&scorer),
            ),
            reconciler: Reconciler::new(connections, board),
            scorer,
        })
    }

    // -- connection lifecycle ------------------------------------------------

    pub async fn connect_to_broker(&self, venue: VenueId) -> Result<(), BxError> {
        self.manager.connect(venue).await?;
        // Subscribed symbols the venue supports get a stream right away.
        self.mux.on_venue_connected(venue).await;
        Ok(())
    }

    pub async fn disconnect_from_broker(&self, venue: VenueId) -> Result<(), BxError> {
        self.manager.disconnect(venue).await?;
        // Feeds that lost their last venue switch to synthetic data.
        self.mux.on_venue_disconnected(venue).await;
        Ok(())
    }

    /// Persist a credential. Replacing the credential of a live venue
    /// recycles its session; the mux rides the gap on synthetic data and
    /// reopens streams on the fresh adapter.
    pub async fn set_credentials(&self, credential: Credential) -> Result<(), BxError> {
        let venue = credential.venue;
        let was_live = self.manager.is_connected(venue).await;
        if was_live {
            self.mux.on_venue_disconnected(venue).await;
        }
        self.manager.set_credentials(credential).await?;
        if was_live && self.manager.is_connected(venue).await {
            self.mux.on_venue_connected(venue).await;
        }
        Ok(())
    }

    pub async fn is_connected_to_broker(&self, venue: VenueId) -> bool {
        self.manager.is_connected(venue).await
    }

    // -- market data ---------------------------------------------------------

    pub async fn subscribe(&self, symbol: &str, callback: QuoteCallback) -> SubscriberId {
        self.mux.subscribe(symbol, callback).await
    }

    pub async fn unsubscribe(&self, symbol: &str, id: SubscriberId) {
        self.mux.unsubscribe(symbol, id).await
    }

    // -- scoring -------------------------------------------------------------

    pub fn get_comparisons(&self, symbol: &str) -> Vec<BrokerComparison> {
        self.scorer.get_comparisons(symbol)
    }

    pub fn find_best(&self, symbol: &str) -> Option<BrokerComparison> {
        self.scorer.find_best(symbol)
    }

    // -- trading -------------------------------------------------------------

    pub async fn route_order(
        &self,
        request: &OrderRequest,
        venue_override: Option<VenueId>,
    ) -> Result<OrderResult, BxError> {
        self.router.route_order(request, venue_override).await
    }

    pub async fn get_order_history(
        &self,
        venue: VenueId,
        symbol: &str,
    ) -> Result<Vec<OrderResult>, BxError> {
        let adapter = self
            .manager
            .adapter(venue)
            .await
            .ok_or_else(|| BxError::Connection {
                venue,
                reason: "not connected".into(),
            })?;
        adapter.get_order_history(symbol).await
    }

    // -- reconciliation ------------------------------------------------------

    pub async fn get_merged_balances(&self) -> Vec<AccountBalance> {
        self.reconciler.merged_balances().await
    }

    pub async fn get_merged_positions(&self) -> Vec<Position> {
        self.reconciler.merged_positions().await
    }
}

// ---------------------------------------------------------------------------
// Shared test support
// ---------------------------------------------------------------------------

/// A scriptable in-memory adapter used by the engine tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use bx_core::error::BxError;
    use bx_core::time_util::now_ms;
    use bx_core::types::enums::{OrderStatus, VenueId};
    use bx_core::types::market::Quote;
    use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
    use bx_venues::{BrokerAdapter, OnCloseCallback, QuoteCallback};

    use std::sync::Arc;

    pub(crate) enum PlaceBehavior {
        /// Return this result.
        Reply(OrderResult),
        /// Fail with a trading fault carrying this message.
        Fault(String),
    }

    struct Stream {
        on_quote: QuoteCallback,
        on_close: Option<OnCloseCallback>,
    }

    pub(crate) struct MockAdapter {
        venue: VenueId,
        connected: AtomicBool,
        supports: AtomicBool,
        fail_subscribe: AtomicBool,
        balances: Mutex<Result<Vec<AccountBalance>, String>>,
        positions: Mutex<Result<Vec<Position>, String>>,
        place: Mutex<PlaceBehavior>,
        placed: AtomicUsize,
        streams: Mutex<HashMap<String, Stream>>,
    }

    impl MockAdapter {
        pub(crate) fn new(venue: VenueId) -> Arc<Self> {
            Arc::new(Self {
                venue,
                connected: AtomicBool::new(false),
                supports: AtomicBool::new(true),
                fail_subscribe: AtomicBool::new(false),
                balances: Mutex::new(Ok(Vec::new())),
                positions: Mutex::new(Ok(Vec::new())),
                place: Mutex::new(PlaceBehavior::Reply(OrderResult {
                    order_id: "mock-order".into(),
                    venue,
                    status: OrderStatus::Filled,
                    filled_quantity: 0.0,
                    avg_price: 0.0,
                    message: String::new(),
                })),
                placed: AtomicUsize::new(0),
                streams: Mutex::new(HashMap::new()),
            })
        }

        pub(crate) async fn connected(venue: VenueId) -> Arc<Self> {
            let adapter = Self::new(venue);
            adapter.connect().await.unwrap();
            adapter
        }

        pub(crate) fn set_place(&self, behavior: PlaceBehavior) {
            *self.place.lock().unwrap() = behavior;
        }

        pub(crate) fn set_balances(&self, balances: Result<Vec<AccountBalance>, String>) {
            *self.balances.lock().unwrap() = balances;
        }

        pub(crate) fn set_positions(&self, positions: Result<Vec<Position>, String>) {
            *self.positions.lock().unwrap() = positions;
        }

        pub(crate) fn set_supports(&self, supports: bool) {
            self.supports.store(supports, Ordering::SeqCst);
        }

        pub(crate) fn set_fail_subscribe(&self, fail: bool) {
            self.fail_subscribe.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn placed_count(&self) -> usize {
            self.placed.load(Ordering::SeqCst)
        }

        pub(crate) fn stream_count(&self) -> usize {
            self.streams.lock().unwrap().len()
        }

        /// Emit one tick on an open stream, as the venue would.
        pub(crate) fn push_quote(&self, symbol: &str, price: f64) {
            let streams = self.streams.lock().unwrap();
            if let Some(stream) = streams.get(symbol) {
                (stream.on_quote)(Quote {
                    symbol: symbol.to_string(),
                    venue: self.venue,
                    price,
                    bid: Some(price - 0.5),
                    ask: Some(price + 0.5),
                    volume: None,
                    timestamp_ms: now_ms(),
                });
            }
        }

        /// Kill a stream from the venue side, firing its close callback.
        pub(crate) fn close_stream(&self, symbol: &str, reason: &str) {
            let stream = self.streams.lock().unwrap().remove(symbol);
            if let Some(stream) = stream {
                if let Some(on_close) = stream.on_close {
                    on_close(reason.to_string());
                }
            }
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockAdapter {
        fn venue(&self) -> VenueId {
            self.venue
        }

        fn supports_symbol(&self, _symbol: &str) -> bool {
            self.supports.load(Ordering::SeqCst)
        }

        async fn connect(&self) -> Result<(), BxError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BxError> {
            self.connected.store(false, Ordering::SeqCst);
            self.streams.lock().unwrap().clear();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
            self.balances
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| BxError::trading(self.venue, reason))
        }

        async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
            self.positions
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| BxError::trading(self.venue, reason))
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderResult, BxError> {
            self.placed.fetch_add(1, Ordering::SeqCst);
            match &*self.place.lock().unwrap() {
                PlaceBehavior::Reply(result) => Ok(result.clone()),
                PlaceBehavior::Fault(reason) => Err(BxError::trading(self.venue, reason)),
            }
        }

        async fn get_order_history(&self, _symbol: &str) -> Result<Vec<OrderResult>, BxError> {
            Ok(Vec::new())
        }

        async fn subscribe_market_data(
            &self,
            symbol: &str,
            on_quote: QuoteCallback,
            on_close: OnCloseCallback,
        ) -> Result<(), BxError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(BxError::Subscription {
                    venue: self.venue,
                    symbol: symbol.to_string(),
                    reason: "scripted failure".into(),
                });
            }
            self.streams.lock().unwrap().insert(
                symbol.to_string(),
                Stream {
                    on_quote,
                    on_close: Some(on_close),
                },
            );
            Ok(())
        }

        async fn unsubscribe_market_data(&self, symbol: &str) -> Result<(), BxError> {
            self.streams.lock().unwrap().remove(symbol);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use bx_core::types::enums::{OrderStatus, Side};

    fn hub(tag: &str) -> (BrokerHub, PathBuf) {
        let path = std::env::temp_dir().join(format!("bx-hub-{tag}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = EngineConfig {
            credential_path: path.clone(),
            ..EngineConfig::default()
        };
        (BrokerHub::new(config).unwrap(), path)
    }

    async fn hub_with_paper(tag: &str) -> (BrokerHub, PathBuf) {
        let (hub, path) = hub(tag);
        hub.set_credentials(Credential {
            venue: VenueId::Paper,
            keys: HashMap::new(),
            demo: true,
        })
        .await
        .unwrap();
        hub.connect_to_broker(VenueId::Paper).await.unwrap();
        (hub, path)
    }

    #[test]
    fn invalid_weights_fail_construction() {
        let mut config = EngineConfig::default();
        config.score_weights.price = -1.0;
        assert!(matches!(BrokerHub::new(config), Err(BxError::Config(_))));
    }

    #[tokio::test]
    async fn market_round_trip_restores_position() {
        let (hub, path) = hub_with_paper("roundtrip").await;

        let buy = hub
            .route_order(
                &OrderRequest::market("BTCUSDT", Side::Buy, 0.5),
                Some(VenueId::Paper),
            )
            .await
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.filled_quantity, 0.5);

        let positions = hub.get_merged_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 0.5);

        let sell = hub
            .route_order(
                &OrderRequest::market("BTCUSDT", Side::Sell, 0.5),
                Some(VenueId::Paper),
            )
            .await
            .unwrap();
        assert_eq!(sell.status, OrderStatus::Filled);

        // Back to the pre-trade (flat) exposure.
        assert!(hub.get_merged_positions().await.is_empty());

        let balances = hub.get_merged_balances().await;
        assert!(!balances.is_empty());
        for balance in &balances {
            assert!((balance.total - (balance.free + balance.locked)).abs() < 1e-9);
        }

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn routing_without_any_venue_is_typed() {
        let (hub, path) = hub("novenue");
        let err = hub
            .route_order(&OrderRequest::market("BTCUSD", Side::Buy, 1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BxError::NoVenueAvailable(_)));
        assert!(hub.get_comparisons("BTCUSD").is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn order_history_flows_through_hub() {
        let (hub, path) = hub_with_paper("history").await;
        hub.route_order(
            &OrderRequest::market("ETHUSDT", Side::Buy, 1.0),
            Some(VenueId::Paper),
        )
        .await
        .unwrap();

        let history = hub
            .get_order_history(VenueId::Paper, "ETHUSDT")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Filled);

        assert!(
            hub.get_order_history(VenueId::Kraken, "ETHUSDT")
                .await
                .is_err()
        );
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_replacement_keeps_feeds_alive() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (hub, path) = hub_with_paper("recycle-feed").await;

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callback: QuoteCallback = Arc::new(move |_quote| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        hub.subscribe("BTCUSDT", callback).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let before = count.load(Ordering::SeqCst);
        assert!(before >= 1);

        // Replacing the live credential recycles the session; ticks must
        // keep flowing through the recycled adapter afterwards.
        hub.set_credentials(Credential {
            venue: VenueId::Paper,
            keys: HashMap::new(),
            demo: true,
        })
        .await
        .unwrap();
        assert!(hub.is_connected_to_broker(VenueId::Paper).await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(count.load(Ordering::SeqCst) > before);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn disconnect_updates_state_and_mux() {
        let (hub, path) = hub_with_paper("disconnect").await;
        assert!(hub.is_connected_to_broker(VenueId::Paper).await);

        hub.disconnect_from_broker(VenueId::Paper).await.unwrap();
        assert!(!hub.is_connected_to_broker(VenueId::Paper).await);
        let _ = std::fs::remove_file(path);
    }
}
