//! Market-data multiplexer.
//!
//! One logical subscription per symbol, no matter how many venues stream
//! it or how many callbacks consume it. The mux owns all resilience
//! policy:
//!
//! - ticks from every live venue transport fan out to every subscriber
//!   and land on the quote board;
//! - when a symbol has subscribers but zero live transports, a synthetic
//!   fallback generator keeps ticks flowing;
//! - a closed transport gets one scheduled reconnect per `(symbol, venue)`
//!   key, abandoned silently if the venue or subscription is gone when
//!   the timer fires;
//! - when the last subscriber leaves, transports close, timers die, and
//!   the board forgets the symbol. Zero subscribers, zero resources.
//!
//! Adapters never reconnect market data on their own.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bx_core::symbol;
use bx_core::synth::SyntheticWalk;
use bx_core::time_util::now_ms;
use bx_core::types::enums::VenueId;
use bx_core::types::market::Quote;
use bx_venues::{BrokerAdapter, OnCloseCallback, QuoteCallback};

use crate::manager::ConnectionMap;
use crate::scorer::QuoteBoard;

/// Token returned by `subscribe`; identifies one callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type SubscriberMap = Arc<RwLock<HashMap<u64, QuoteCallback>>>;

/// Per-symbol feed state. Lives inside the mux's feed table.
struct SymbolFeed {
    subscribers: SubscriberMap,
    /// Venues with a currently open transport.
    live: HashSet<VenueId>,
    fallback: Option<JoinHandle<()>>,
    /// At most one pending reconnect per venue.
    reconnects: HashMap<VenueId, JoinHandle<()>>,
}

impl SymbolFeed {
    fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            live: HashSet::new(),
            fallback: None,
            reconnects: HashMap::new(),
        }
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Fans venue ticks out to subscribers and keeps every symbol live.
#[derive(Clone)]
pub struct MarketDataMux {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    connections: ConnectionMap,
    board: Arc<QuoteBoard>,
    feeds: Mutex<HashMap<String, SymbolFeed>>,
    next_id: AtomicU64,
    fallback_interval: Duration,
    reconnect_delay: Duration,
}

impl MarketDataMux {
    pub fn new(
        connections: ConnectionMap,
        board: Arc<QuoteBoard>,
        fallback_interval: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                connections,
                board,
                feeds: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fallback_interval,
                reconnect_delay,
            }),
        }
    }

    /// Register a callback for a symbol's ticks.
    ///
    /// The first subscriber for a symbol opens a transport on every
    /// connected venue that supports it; if none opens, the fallback
    /// generator engages so the subscriber still receives ticks.
    pub async fn subscribe(&self, symbol_: &str, callback: QuoteCallback) -> SubscriberId {
        let canonical = symbol::canonical(symbol_);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut feeds = self.inner.feeds.lock().await;
        let is_new = !feeds.contains_key(&canonical);
        let feed = feeds.entry(canonical.clone()).or_insert_with(SymbolFeed::new);
        feed.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);

        if is_new {
            let adapters: Vec<(VenueId, Arc<dyn BrokerAdapter>)> = self
                .inner
                .connections
                .read()
                .await
                .iter()
                .map(|(&venue, adapter)| (venue, Arc::clone(adapter)))
                .collect();

            for (venue, adapter) in adapters {
                if !adapter.is_connected() || !adapter.supports_symbol(&canonical) {
                    continue;
                }
                match MuxInner::open_stream(
                    &self.inner,
                    &canonical,
                    venue,
                    &adapter,
                    &feed.subscribers,
                )
                .await
                {
                    Ok(()) => {
                        feed.live.insert(venue);
                    }
                    Err(e) => warn!("[mux] {canonical}@{venue} stream setup failed: {e}"),
                }
            }

            if feed.live.is_empty() {
                MuxInner::start_fallback(&self.inner, &canonical, feed);
            }
            info!(
                "[mux] {canonical} feed created ({} live venues)",
                feed.live.len()
            );
        }

        SubscriberId(id)
    }

    /// Remove one callback registration. Idempotent — unknown ids and
    /// never-subscribed symbols are no-ops. The last subscriber's
    /// departure closes transports, cancels timers, and clears the board.
    pub async fn unsubscribe(&self, symbol_: &str, id: SubscriberId) {
        let canonical = symbol::canonical(symbol_);
        let mut feeds = self.inner.feeds.lock().await;
        let Some(feed) = feeds.get_mut(&canonical) else {
            return;
        };

        feed.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
        if feed.subscriber_count() > 0 {
            return;
        }

        // Zero subscribers: the feed must hold no resource of any kind.
        let feed = match feeds.remove(&canonical) {
            Some(feed) => feed,
            None => return,
        };
        if let Some(fallback) = feed.fallback {
            fallback.abort();
        }
        for (_, reconnect) in feed.reconnects {
            reconnect.abort();
        }

        let connections = self.inner.connections.read().await;
        for venue in &feed.live {
            if let Some(adapter) = connections.get(venue) {
                if let Err(e) = adapter.unsubscribe_market_data(&canonical).await {
                    warn!("[mux] {canonical}@{venue} unsubscribe reported: {e}");
                }
            }
        }
        drop(connections);

        self.inner.board.remove_symbol(&canonical);
        info!("[mux] {canonical} feed destroyed (last subscriber left)");
    }

    /// Drop a venue from every feed after the manager disconnected it.
    /// Its transports are already closed by the adapter; pending
    /// reconnects for it are cancelled and fallback engages where needed.
    pub async fn on_venue_disconnected(&self, venue: VenueId) {
        let mut feeds = self.inner.feeds.lock().await;
        for (symbol_, feed) in feeds.iter_mut() {
            feed.live.remove(&venue);
            if let Some(reconnect) = feed.reconnects.remove(&venue) {
                reconnect.abort();
            }
            if feed.live.is_empty() && feed.subscriber_count() > 0 {
                MuxInner::start_fallback(&self.inner, symbol_, feed);
            }
        }
    }

    /// Open streams on a venue for every subscribed symbol, after the
    /// manager (re)connected it. Symbols it now serves leave fallback;
    /// a failed open arms the usual reconnect.
    pub async fn on_venue_connected(&self, venue: VenueId) {
        let adapter = self.inner.connections.read().await.get(&venue).cloned();
        let Some(adapter) = adapter.filter(|a| a.is_connected()) else {
            return;
        };

        let mut feeds = self.inner.feeds.lock().await;
        for (symbol_, feed) in feeds.iter_mut() {
            if feed.live.contains(&venue) || !adapter.supports_symbol(symbol_) {
                continue;
            }
            match MuxInner::open_stream(&self.inner, symbol_, venue, &adapter, &feed.subscribers)
                .await
            {
                Ok(()) => {
                    feed.live.insert(venue);
                    if let Some(fallback) = feed.fallback.take() {
                        fallback.abort();
                    }
                    info!("[mux] {symbol_}@{venue} stream opened");
                }
                Err(e) => {
                    warn!("[mux] {symbol_}@{venue} stream open failed: {e}");
                    if !feed.reconnects.contains_key(&venue) {
                        let handle = tokio::spawn(MuxInner::reconnect_later(
                            Arc::clone(&self.inner),
                            symbol_.clone(),
                            venue,
                        ));
                        feed.reconnects.insert(venue, handle);
                    }
                }
            }
        }
    }

    /// Number of active symbol feeds. Test/diagnostic hook.
    pub async fn feed_count(&self) -> usize {
        self.inner.feeds.lock().await.len()
    }
}

impl MuxInner {
    /// Open one venue transport for a symbol. Caller holds the feed lock
    /// and records the venue as live on success.
    fn open_stream<'a>(
        inner: &'a Arc<Self>,
        symbol_: &'a str,
        venue: VenueId,
        adapter: &'a Arc<dyn BrokerAdapter>,
        subscribers: &'a SubscriberMap,
    ) -> impl std::future::Future<Output = Result<(), bx_core::BxError>> + Send + 'a {
        async move {
        let on_quote: QuoteCallback = {
            let board = Arc::clone(&inner.board);
            let subscribers = Arc::clone(subscribers);
            Arc::new(move |quote: Quote| {
                board.update(quote.clone());
                let subs = subscribers.read().unwrap_or_else(PoisonError::into_inner);
                for callback in subs.values() {
                    callback(quote.clone());
                }
            })
        };

        let on_close: OnCloseCallback = {
            let inner = Arc::clone(inner);
            let symbol_ = symbol_.to_string();
            Box::new(move |reason: String| {
                tokio::spawn(Self::handle_close(inner, symbol_, venue, reason));
            })
        };

        adapter
            .subscribe_market_data(symbol_, on_quote, on_close)
            .await
        }
    }

    /// A transport died on its own: engage fallback if the symbol went
    /// dark and schedule one reconnect for the `(symbol, venue)` key.
    async fn handle_close(inner: Arc<Self>, symbol_: String, venue: VenueId, reason: String) {
        warn!("[mux] {symbol_}@{venue} transport closed: {reason}");

        let mut feeds = inner.feeds.lock().await;
        let Some(feed) = feeds.get_mut(&symbol_) else {
            return; // subscription gone — nothing to resurrect
        };
        feed.live.remove(&venue);

        if feed.live.is_empty() && feed.subscriber_count() > 0 {
            Self::start_fallback(&inner, &symbol_, feed);
        }

        if !feed.reconnects.contains_key(&venue) {
            let handle = tokio::spawn(Self::reconnect_later(
                Arc::clone(&inner),
                symbol_.clone(),
                venue,
            ));
            feed.reconnects.insert(venue, handle);
        }
    }

    /// Delayed reconnect loop for one `(symbol, venue)` key. Abandoned
    /// silently when the venue is disconnected or the subscription is gone
    /// by the time an attempt fires; a failed reopen sleeps and retries.
    /// The feed's `reconnects` entry holds this task until it resolves.
    async fn reconnect_later(inner: Arc<Self>, symbol_: String, venue: VenueId) {
        loop {
            tokio::time::sleep(inner.reconnect_delay).await;

            let adapter = inner.connections.read().await.get(&venue).cloned();

            let mut feeds = inner.feeds.lock().await;
            let Some(feed) = feeds.get_mut(&symbol_) else {
                return;
            };

            let Some(adapter) = adapter.filter(|a| a.is_connected()) else {
                feed.reconnects.remove(&venue);
                debug!("[mux] {symbol_}@{venue} reconnect abandoned (venue disconnected)");
                return;
            };

            match Self::open_stream(&inner, &symbol_, venue, &adapter, &feed.subscribers).await {
                Ok(()) => {
                    feed.reconnects.remove(&venue);
                    feed.live.insert(venue);
                    if let Some(fallback) = feed.fallback.take() {
                        fallback.abort();
                    }
                    info!("[mux] {symbol_}@{venue} transport reopened");
                    return;
                }
                Err(e) => warn!("[mux] {symbol_}@{venue} reconnect failed: {e}"),
            }
        }
    }

    /// Start the synthetic generator for a dark symbol. One per feed.
    ///
    /// Synthetic ticks reach subscribers but never the quote board: the
    /// scorer must not rank a venue nobody can route to.
    fn start_fallback(inner: &Arc<Self>, symbol_: &str, feed: &mut SymbolFeed) {
        if feed.fallback.is_some() {
            return;
        }
        info!("[mux] {symbol_} dark, engaging synthetic fallback");

        let subscribers = Arc::clone(&feed.subscribers);
        let symbol_ = symbol_.to_string();
        let period = inner.fallback_interval;

        feed.fallback = Some(tokio::spawn(async move {
            let mut walk = SyntheticWalk::new(&symbol_);
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
                let price = walk.step(jitter);
                let quote = Quote {
                    symbol: symbol_.clone(),
                    venue: VenueId::Paper,
                    price,
                    bid: Some(price * 0.9995),
                    ask: Some(price * 1.0005),
                    volume: None,
                    timestamp_ms: now_ms(),
                };
                let subs = subscribers.read().unwrap_or_else(PoisonError::into_inner);
                for callback in subs.values() {
                    callback(quote.clone());
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::testing::MockAdapter;

    fn mux_with(
        adapters: Vec<Arc<MockAdapter>>,
    ) -> (MarketDataMux, Arc<QuoteBoard>, ConnectionMap) {
        let mut map: HashMap<VenueId, Arc<dyn BrokerAdapter>> = HashMap::new();
        for adapter in adapters {
            map.insert(adapter.venue(), adapter);
        }
        let connections: ConnectionMap = Arc::new(tokio::sync::RwLock::new(map));
        let board = Arc::new(QuoteBoard::new());
        let mux = MarketDataMux::new(
            Arc::clone(&connections),
            Arc::clone(&board),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        (mux, board, connections)
    }

    fn counting_callback() -> (QuoteCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callback: QuoteCallback = Arc::new(move |_quote| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_delivers_a_tick_within_two_seconds() {
        let (mux, board, _) = mux_with(vec![]);
        let (callback, count) = counting_callback();

        mux.subscribe("BTCUSD", callback).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(count.load(Ordering::SeqCst) >= 1);
        // Synthetic data never reaches the board.
        assert!(board.snapshot("BTCUSD").is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (mux, _, _) = mux_with(vec![]);

        // Before ever subscribing: no-op.
        mux.unsubscribe("BTCUSD", SubscriberId(999)).await;

        let (callback, _) = counting_callback();
        let id = mux.subscribe("BTCUSD", callback).await;
        assert_eq!(mux.feed_count().await, 1);

        mux.unsubscribe("BTCUSD", id).await;
        mux.unsubscribe("BTCUSD", id).await;
        assert_eq!(mux.feed_count().await, 0);
    }

    #[tokio::test]
    async fn ticks_fan_out_to_every_subscriber_and_the_board() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, board, _) = mux_with(vec![Arc::clone(&venue)]);

        let (first, first_count) = counting_callback();
        let (second, second_count) = counting_callback();
        mux.subscribe("BTCUSD", first).await;
        mux.subscribe("btc-usd", second).await; // same canonical symbol
        assert_eq!(venue.stream_count(), 1);

        venue.push_quote("BTCUSD", 50_000.0);
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            board.latest("BTCUSD", VenueId::Binance).unwrap().price,
            50_000.0
        );
    }

    #[tokio::test]
    async fn last_unsubscribe_releases_everything() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, board, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, _) = counting_callback();
        let id = mux.subscribe("BTCUSD", callback).await;
        venue.push_quote("BTCUSD", 50_000.0);

        mux.unsubscribe("BTCUSD", id).await;
        assert_eq!(mux.feed_count().await, 0);
        assert_eq!(venue.stream_count(), 0);
        assert!(board.snapshot("BTCUSD").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_engages_fallback_then_reconnects() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, _, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, count) = counting_callback();
        mux.subscribe("BTCUSD", callback).await;
        assert_eq!(venue.stream_count(), 1);

        venue.close_stream("BTCUSD", "remote close");
        // Fallback keeps ticks flowing during the outage.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);

        // The scheduled reconnect reopens the venue stream after 5 s.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(venue.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_after_a_failed_reopen() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, _, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, _) = counting_callback();
        mux.subscribe("BTCUSD", callback).await;
        venue.set_fail_subscribe(true);
        venue.close_stream("BTCUSD", "remote close");

        // First attempt at 5 s fails; the loop arms another.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(venue.stream_count(), 0);

        venue.set_fail_subscribe(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(venue.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_symbol_falls_back_without_a_stream() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        venue.set_supports(false);
        let (mux, _, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, count) = counting_callback();
        mux.subscribe("AAPL", callback).await;
        assert_eq!(venue.stream_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stream_setup_is_not_fatal() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        venue.set_fail_subscribe(true);
        let (mux, _, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, count) = counting_callback();
        mux.subscribe("BTCUSD", callback).await;
        assert_eq!(venue.stream_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn venue_reconnect_reopens_streams() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, _, _) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, _) = counting_callback();
        mux.subscribe("BTCUSD", callback).await;
        assert_eq!(venue.stream_count(), 1);

        venue.disconnect().await.unwrap();
        mux.on_venue_disconnected(VenueId::Binance).await;
        assert_eq!(venue.stream_count(), 0);

        venue.connect().await.unwrap();
        mux.on_venue_connected(VenueId::Binance).await;
        assert_eq!(venue.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn venue_disconnect_switches_feeds_to_fallback() {
        let venue = MockAdapter::connected(VenueId::Binance).await;
        let (mux, _, connections) = mux_with(vec![Arc::clone(&venue)]);

        let (callback, count) = counting_callback();
        mux.subscribe("BTCUSD", callback).await;
        assert_eq!(venue.stream_count(), 1);

        // Manager-side disconnect: adapter closes its transports itself.
        venue.disconnect().await.unwrap();
        connections.write().await.remove(&VenueId::Binance);
        mux.on_venue_disconnected(VenueId::Binance).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_eq!(mux.feed_count().await, 1);
    }
}
