//! Paper (simulated) venue.
//!
//! Fully in-process: no network, no credentials. Seeded with 100 000 of
//! cash per quote currency, marks every symbol off the deterministic
//! synthetic walk, fills market orders instantly at the mark, and rests
//! limit/stop orders as pending. Market data is a 1 s synthetic tick
//! stream. Useful for end-to-end routing tests and demo setups, and as
//! the venue of last resort when nothing real is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use bx_core::error::BxError;
use bx_core::synth::SyntheticWalk;
use bx_core::time_util::now_ms;
use bx_core::types::enums::{OrderStatus, OrderType, PositionSide, Side, VenueId};
use bx_core::types::market::Quote;
use bx_core::types::trading::{AccountBalance, OrderRequest, OrderResult, Position};
use bx_core::ws::OnCloseCallback;
use bx_core::symbol;

use crate::{BrokerAdapter, QuoteCallback};

const VENUE: VenueId = VenueId::Paper;
const SEED_CASH: f64 = 100_000.0;

#[derive(Default)]
struct PaperBook {
    /// Free cash/asset units by currency code. Quote currencies are seeded
    /// lazily with [`SEED_CASH`] on first touch.
    cash: HashMap<String, f64>,
    /// Net exposure per symbol; removed when flat.
    positions: HashMap<String, Position>,
    /// Fill/rejection log, oldest first, tagged with the symbol.
    orders: Vec<(String, OrderResult)>,
    /// Last trade or synthetic price per symbol.
    marks: HashMap<String, f64>,
}

impl PaperBook {
    fn cash_mut(&mut self, currency: &str) -> &mut f64 {
        self.cash
            .entry(currency.to_string())
            .or_insert(SEED_CASH)
    }

    fn mark(&mut self, symbol_: &str) -> f64 {
        *self
            .marks
            .entry(symbol_.to_string())
            .or_insert_with(|| SyntheticWalk::new(symbol_).last())
    }

    /// Net a fill into the symbol's position, rolling any realized P&L
    /// into cash via the price itself (cash already moved by notional).
    fn apply_fill(&mut self, symbol_: &str, side: Side, quantity: f64, price: f64) {
        let signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let old = self
            .positions
            .get(symbol_)
            .map(Position::signed_quantity)
            .unwrap_or(0.0);
        let new = old + signed;

        if new.abs() < 1e-12 {
            self.positions.remove(symbol_);
            return;
        }

        let entry_price = if old == 0.0 || old.signum() != new.signum() {
            // Opened fresh or flipped through zero: the surviving exposure
            // was established at this fill's price.
            price
        } else if new.abs() > old.abs() {
            // Added to the position: volume-weighted entry.
            let old_entry = self
                .positions
                .get(symbol_)
                .map(|p| p.entry_price)
                .unwrap_or(price);
            (old_entry * old.abs() + price * signed.abs()) / new.abs()
        } else {
            // Reduced: entry unchanged.
            self.positions
                .get(symbol_)
                .map(|p| p.entry_price)
                .unwrap_or(price)
        };

        self.positions.insert(
            symbol_.to_string(),
            Position {
                symbol: symbol_.to_string(),
                venue: VENUE,
                side: if new > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: new.abs(),
                entry_price,
                mark_price: price,
                unrealized_pnl: 0.0,
            },
        );
    }
}

/// Simulated venue with instant fills and synthetic quotes.
pub struct PaperAdapter {
    connected: AtomicBool,
    book: Arc<Mutex<PaperBook>>,
    feeds: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Default for PaperAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperAdapter {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            book: Arc::new(Mutex::new(PaperBook::default())),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Quote currency for cash accounting; non-pair symbols (equities)
    /// settle in USD.
    fn quote_currency(symbol_: &str) -> String {
        symbol::split_pair(&symbol::canonical(symbol_))
            .map(|(_, quote)| quote.to_string())
            .unwrap_or_else(|| "USD".to_string())
    }
}

#[async_trait]
impl BrokerAdapter for PaperAdapter {
    fn venue(&self) -> VenueId {
        VENUE
    }

    fn supports_symbol(&self, symbol_: &str) -> bool {
        !symbol_.trim().is_empty()
    }

    async fn connect(&self) -> Result<(), BxError> {
        self.connected.store(true, Ordering::SeqCst);
        info!("[paper] connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BxError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut feeds = self.feeds.lock().await;
        for (_, task) in feeds.drain() {
            task.abort();
        }
        info!("[paper] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>, BxError> {
        let mut book = self.book.lock().await;
        // A venue never queried shows its seed, not an empty account.
        book.cash_mut("USD");
        let mut balances: Vec<AccountBalance> = book
            .cash
            .iter()
            .map(|(currency, &free)| AccountBalance::new(currency.clone(), VENUE, free, 0.0))
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BxError> {
        let mut book = self.book.lock().await;
        let symbols: Vec<String> = book.positions.keys().cloned().collect();

        let mut positions = Vec::with_capacity(symbols.len());
        for symbol_ in symbols {
            let mark = book.mark(&symbol_);
            if let Some(held) = book.positions.get(&symbol_) {
                let mut position = held.clone();
                position.mark_price = mark;
                position.unrealized_pnl = position.compute_pnl();
                positions.push(position);
            }
        }
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BxError> {
        let canonical = symbol::canonical(&request.symbol);
        let mut book = self.book.lock().await;

        // Resting order types are acknowledged, never simulated to fill.
        if request.order_type != OrderType::Market {
            let result = OrderResult {
                order_id: uuid::Uuid::new_v4().to_string(),
                venue: VENUE,
                status: OrderStatus::Pending,
                filled_quantity: 0.0,
                avg_price: 0.0,
                message: String::new(),
            };
            book.orders.push((canonical, result.clone()));
            return Ok(result);
        }

        let price = book.mark(&canonical);
        let notional = price * request.quantity;
        let currency = Self::quote_currency(&canonical);
        let cash = book.cash_mut(&currency);

        if request.side == Side::Buy && *cash < notional {
            let result = OrderResult::rejected(
                VENUE,
                format!("insufficient {currency}: need {notional:.2}, have {cash:.2}"),
            );
            book.orders.push((canonical, result.clone()));
            return Ok(result);
        }

        match request.side {
            Side::Buy => *cash -= notional,
            Side::Sell => *cash += notional,
        }
        book.apply_fill(&canonical, request.side, request.quantity, price);

        let result = OrderResult {
            order_id: uuid::Uuid::new_v4().to_string(),
            venue: VENUE,
            status: OrderStatus::Filled,
            filled_quantity: request.quantity,
            avg_price: price,
            message: String::new(),
        };
        debug!(
            "[paper] filled {:?} {} {} @ {price}",
            request.side, request.quantity, canonical
        );
        book.orders.push((canonical, result.clone()));
        Ok(result)
    }

    async fn get_order_history(&self, symbol_: &str) -> Result<Vec<OrderResult>, BxError> {
        let canonical = symbol::canonical(symbol_);
        let book = self.book.lock().await;
        Ok(book
            .orders
            .iter()
            .rev() // newest first
            .filter(|(s, _)| *s == canonical)
            .map(|(_, result)| result.clone())
            .collect())
    }

    async fn subscribe_market_data(
        &self,
        symbol_: &str,
        on_quote: QuoteCallback,
        _on_close: OnCloseCallback,
    ) -> Result<(), BxError> {
        let canonical = symbol::canonical(symbol_);
        let book = Arc::clone(&self.book);

        let task = {
            let canonical = canonical.clone();
            tokio::spawn(async move {
                let mut walk = SyntheticWalk::new(&canonical);
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
                    let price = walk.step(jitter);
                    book.lock()
                        .await
                        .marks
                        .insert(canonical.clone(), price);
                    on_quote(Quote {
                        symbol: canonical.clone(),
                        venue: VENUE,
                        price,
                        bid: Some(price * 0.9995),
                        ask: Some(price * 1.0005),
                        volume: None,
                        timestamp_ms: now_ms(),
                    });
                }
            })
        };

        let mut feeds = self.feeds.lock().await;
        if let Some(old) = feeds.insert(canonical, task) {
            old.abort();
        }
        // The stream never self-closes, so on_close is simply dropped.
        Ok(())
    }

    async fn unsubscribe_market_data(&self, symbol_: &str) -> Result<(), BxError> {
        let canonical = symbol::canonical(symbol_);
        let mut feeds = self.feeds.lock().await;
        if let Some(task) = feeds.remove(&canonical) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_round_trip_conserves_cash_at_flat_price() {
        let paper = PaperAdapter::new();
        paper.connect().await.unwrap();

        let buy = paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert!(buy.avg_price > 0.0);

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].quantity, 1.0);

        let sell = paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Sell, 1.0))
            .await
            .unwrap();
        assert_eq!(sell.status, OrderStatus::Filled);
        // No feed ran, so the mark never moved: flat position, cash back
        // to the seed.
        assert!(paper.get_positions().await.unwrap().is_empty());
        let balances = paper.get_balances().await.unwrap();
        let usdt = balances.iter().find(|b| b.asset == "USDT").unwrap();
        assert!((usdt.total - SEED_CASH).abs() < 1e-6);
    }

    #[tokio::test]
    async fn oversized_buy_is_rejected_not_an_error() {
        let paper = PaperAdapter::new();
        let result = paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 1e9))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert!(result.message.contains("insufficient"));
        // The rejection still lands in the history.
        let history = paper.get_order_history("BTCUSDT").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn limit_orders_rest_as_pending() {
        let paper = PaperAdapter::new();
        let result = paper
            .place_order(&OrderRequest::limit("ETHUSDT", Side::Buy, 2.0, 1_000.0))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Pending);
        assert!(!result.order_id.is_empty());
        assert!(paper.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_per_symbol() {
        let paper = PaperAdapter::new();
        paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.1))
            .await
            .unwrap();
        paper
            .place_order(&OrderRequest::market("ETHUSDT", Side::Buy, 0.1))
            .await
            .unwrap();
        let last = paper
            .place_order(&OrderRequest::market("BTCUSDT", Side::Sell, 0.1))
            .await
            .unwrap();

        let history = paper.get_order_history("BTCUSDT").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].order_id, last.order_id);
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_feed_ticks_every_second() {
        use std::sync::atomic::AtomicUsize;

        let paper = PaperAdapter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        paper
            .subscribe_market_data(
                "AAPL",
                Arc::new(move |quote| {
                    assert_eq!(quote.venue, VenueId::Paper);
                    assert!(quote.price > 0.0);
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        paper.unsubscribe_market_data("AAPL").await.unwrap();
        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
