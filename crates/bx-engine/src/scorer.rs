//! Quote board and venue scorer.
//!
//! The board is the shared `(symbol, venue) → Quote` table plus a per-venue
//! latency tracker; transports write into it from their read loops, the
//! scorer reads from it on demand. Updates and reads use sync locks so the
//! tick path never awaits.
//!
//! The scorer ranks venues by a weighted composite of min-max normalized
//! price, spread, and latency — **lower is better**. Only venues with a
//! fresh quote participate; a venue without data is omitted, never given a
//! default score. Equal scores fall back to ascending lexical venue id.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use ahash::AHashMap;

use bx_core::config::EngineConfig;
use bx_core::latency::RttTracker;
use bx_core::time_util::now_ms;
use bx_core::types::enums::VenueId;
use bx_core::types::market::{BrokerComparison, Quote};

// ---------------------------------------------------------------------------
// Quote board
// ---------------------------------------------------------------------------

/// Shared latest-quote table and per-venue latency estimates.
#[derive(Default)]
pub struct QuoteBoard {
    quotes: RwLock<AHashMap<String, HashMap<VenueId, Quote>>>,
    latency: RwLock<AHashMap<VenueId, RttTracker>>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick, overwriting the previous quote for its venue.
    pub fn update(&self, quote: Quote) {
        let mut quotes = self
            .quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        quotes
            .entry(quote.symbol.clone())
            .or_default()
            .insert(quote.venue, quote);
    }

    /// All current quotes for a symbol, any venue, any age.
    pub fn snapshot(&self, symbol: &str) -> Vec<Quote> {
        let quotes = self.quotes.read().unwrap_or_else(PoisonError::into_inner);
        quotes
            .get(symbol)
            .map(|per_venue| per_venue.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest quote for one `(symbol, venue)` pair.
    pub fn latest(&self, symbol: &str, venue: VenueId) -> Option<Quote> {
        let quotes = self.quotes.read().unwrap_or_else(PoisonError::into_inner);
        quotes.get(symbol).and_then(|per_venue| per_venue.get(&venue)).cloned()
    }

    /// Drop every venue's entry for a symbol. Called when the last
    /// subscriber leaves.
    pub fn remove_symbol(&self, symbol: &str) {
        let mut quotes = self
            .quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        quotes.remove(symbol);
    }

    /// Record one round-trip latency sample for a venue.
    pub fn record_latency(&self, venue: VenueId, sample_ms: f64) {
        let mut latency = self
            .latency
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        latency.entry(venue).or_default().record(sample_ms);
    }

    /// Smoothed round-trip latency for a venue, if any sample exists.
    pub fn latency_ms(&self, venue: VenueId) -> Option<f64> {
        let latency = self.latency.read().unwrap_or_else(PoisonError::into_inner);
        latency.get(&venue).and_then(RttTracker::average_ms)
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Ranks venues for a symbol from the current board contents.
pub struct Scorer {
    board: std::sync::Arc<QuoteBoard>,
    config: EngineConfig,
}

impl Scorer {
    pub fn new(board: std::sync::Arc<QuoteBoard>, config: EngineConfig) -> Self {
        Self { board, config }
    }

    /// Comparisons for every venue with a fresh quote, sorted ascending by
    /// composite score (best execution first).
    pub fn get_comparisons(&self, symbol: &str) -> Vec<BrokerComparison> {
        let now = now_ms();
        let fresh: Vec<Quote> = self
            .board
            .snapshot(symbol)
            .into_iter()
            .filter(|q| now.saturating_sub(q.timestamp_ms) <= self.config.quote_stale_ms)
            .collect();
        if fresh.is_empty() {
            return Vec::new();
        }

        // Raw metric triples in quote order. A venue that streams no book
        // scores a zero spread; a venue with no latency sample scores zero
        // latency rather than being excluded.
        let metrics: Vec<(f64, f64, f64)> = fresh
            .iter()
            .map(|q| {
                (
                    q.price,
                    q.spread().unwrap_or(0.0),
                    self.board.latency_ms(q.venue).unwrap_or(0.0),
                )
            })
            .collect();

        let price_range = min_max(metrics.iter().map(|m| m.0));
        let spread_range = min_max(metrics.iter().map(|m| m.1));
        let latency_range = min_max(metrics.iter().map(|m| m.2));

        let weights = self.config.score_weights;
        let mut comparisons: Vec<BrokerComparison> = fresh
            .iter()
            .zip(&metrics)
            .map(|(quote, &(price, spread, latency_ms))| BrokerComparison {
                venue: quote.venue,
                price,
                spread,
                latency_ms,
                fee_rate: self.config.fee_rate(quote.venue),
                score: weights.price * normalize(price, price_range)
                    + weights.spread * normalize(spread, spread_range)
                    + weights.latency * normalize(latency_ms, latency_range),
            })
            .collect();

        comparisons.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.venue.as_str().cmp(b.venue.as_str()))
        });
        comparisons
    }

    /// Best venue for a symbol, or `None` when nothing fresh is quoted.
    pub fn find_best(&self, symbol: &str) -> Option<BrokerComparison> {
        self.get_comparisons(symbol).into_iter().next()
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Min-max normalization; a degenerate range maps everything to 0.
fn normalize(value: f64, (lo, hi): (f64, f64)) -> f64 {
    let range = hi - lo;
    if range <= f64::EPSILON {
        0.0
    } else {
        (value - lo) / range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn quote(venue: VenueId, price: f64, spread: f64) -> Quote {
        Quote {
            symbol: "AAPL".into(),
            venue,
            price,
            bid: Some(price - spread / 2.0),
            ask: Some(price + spread / 2.0),
            volume: None,
            timestamp_ms: now_ms(),
        }
    }

    fn board_with_two_venues() -> Arc<QuoteBoard> {
        let board = Arc::new(QuoteBoard::new());
        // Venue A: worse price and spread, better latency.
        board.update(quote(VenueId::Binance, 150.00, 0.10));
        board.record_latency(VenueId::Binance, 50.0);
        // Venue B: better price and spread, worse latency.
        board.update(quote(VenueId::Kraken, 149.90, 0.05));
        board.record_latency(VenueId::Kraken, 120.0);
        board
    }

    #[test]
    fn scoring_is_deterministic_and_sorted_ascending() {
        let board = board_with_two_venues();
        let scorer = Scorer::new(board, EngineConfig::default());

        let first = scorer.get_comparisons("AAPL");
        assert_eq!(first.len(), 2);
        // B wins price (0.5) and spread (0.3); A wins latency (0.2).
        assert_eq!(first[0].venue, VenueId::Kraken);
        assert!((first[0].score - 0.2).abs() < 1e-9);
        assert!((first[1].score - 0.8).abs() < 1e-9);

        let second = scorer.get_comparisons("AAPL");
        assert_eq!(first, second);
    }

    #[test]
    fn find_best_returns_lowest_score() {
        let board = board_with_two_venues();
        let scorer = Scorer::new(board, EngineConfig::default());
        assert_eq!(scorer.find_best("AAPL").unwrap().venue, VenueId::Kraken);
        assert!(scorer.find_best("MSFT").is_none());
    }

    #[test]
    fn stale_quotes_are_excluded() {
        let board = Arc::new(QuoteBoard::new());
        let mut old = quote(VenueId::Binance, 150.0, 0.1);
        old.timestamp_ms = now_ms().saturating_sub(60_000);
        board.update(old);
        board.update(quote(VenueId::Kraken, 149.9, 0.05));

        let scorer = Scorer::new(board, EngineConfig::default());
        let comparisons = scorer.get_comparisons("AAPL");
        assert_eq!(comparisons.len(), 1);
        assert_eq!(comparisons[0].venue, VenueId::Kraken);
    }

    #[test]
    fn identical_metrics_tie_break_lexically() {
        let board = Arc::new(QuoteBoard::new());
        board.update(quote(VenueId::Okx, 150.0, 0.1));
        board.update(quote(VenueId::Bybit, 150.0, 0.1));

        let scorer = Scorer::new(board, EngineConfig::default());
        let comparisons = scorer.get_comparisons("AAPL");
        // Degenerate ranges: both score 0, "bybit" < "okx".
        assert_eq!(comparisons[0].venue, VenueId::Bybit);
        assert_eq!(comparisons[1].venue, VenueId::Okx);
        assert_eq!(comparisons[0].score, 0.0);
    }

    #[test]
    fn venue_without_latency_sample_still_ranks() {
        let board = board_with_two_venues();
        board.update(quote(VenueId::Okx, 149.95, 0.07));
        // No latency recorded for OKX: it competes with latency 0.

        let scorer = Scorer::new(board, EngineConfig::default());
        let comparisons = scorer.get_comparisons("AAPL");
        assert_eq!(comparisons.len(), 3);
        assert!(comparisons.iter().any(|c| c.venue == VenueId::Okx));
    }

    #[test]
    fn board_overwrites_and_removes() {
        let board = QuoteBoard::new();
        board.update(quote(VenueId::Binance, 150.0, 0.1));
        board.update(quote(VenueId::Binance, 151.0, 0.1));
        assert_eq!(board.latest("AAPL", VenueId::Binance).unwrap().price, 151.0);
        assert_eq!(board.snapshot("AAPL").len(), 1);

        board.remove_symbol("AAPL");
        assert!(board.snapshot("AAPL").is_empty());
    }
}
