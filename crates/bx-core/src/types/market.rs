//! Market data structures — quotes flowing from adapters to the engine.

use serde::{Deserialize, Serialize};

use super::enums::VenueId;

/// The latest observed price for a `(symbol, venue)` pair.
///
/// Overwritten on every tick. Bid/ask/volume are optional because some
/// venues only stream a last-trade price on their lightweight ticker
/// channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Canonical symbol (e.g. `"BTCUSD"`).
    pub symbol: String,
    /// Which venue produced the tick.
    pub venue: VenueId,
    /// Last trade / mid price.
    pub price: f64,
    /// Best bid, if the venue streams it.
    pub bid: Option<f64>,
    /// Best ask, if the venue streams it.
    pub ask: Option<f64>,
    /// 24h or tick volume, if the venue streams it.
    pub volume: Option<f64>,
    /// Venue event time, milliseconds since Unix epoch.
    pub timestamp_ms: u64,
}

impl Quote {
    /// Absolute bid/ask spread, if both sides are present.
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if ask >= bid => Some(ask - bid),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Quote({} {} {:.8}", self.venue, self.symbol, self.price)?;
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            write!(f, " bid={bid:.8} ask={ask:.8}")?;
        }
        write!(f, ")")
    }
}

/// A ranked venue score for one symbol.
///
/// Produced on demand by the scorer from the current quote table; never
/// persisted. **Lower composite score is better.**
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerComparison {
    pub venue: VenueId,
    /// Last observed price.
    pub price: f64,
    /// Absolute bid/ask spread (0 when the venue streams no book).
    pub spread: f64,
    /// Observed round-trip latency to the venue, milliseconds.
    pub latency_ms: f64,
    /// Venue taker-fee rate, for display alongside the ranking.
    pub fee_rate: f64,
    /// Weighted composite of normalized price/spread/latency.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_requires_both_sides() {
        let mut quote = Quote {
            symbol: "BTCUSD".into(),
            venue: VenueId::Binance,
            price: 50_000.0,
            bid: Some(49_999.0),
            ask: Some(50_001.0),
            volume: None,
            timestamp_ms: 0,
        };
        assert_eq!(quote.spread(), Some(2.0));

        quote.ask = None;
        assert_eq!(quote.spread(), None);
    }

    #[test]
    fn crossed_book_yields_no_spread() {
        let quote = Quote {
            symbol: "BTCUSD".into(),
            venue: VenueId::Kraken,
            price: 50_000.0,
            bid: Some(50_002.0),
            ask: Some(50_001.0),
            volume: None,
            timestamp_ms: 0,
        };
        assert_eq!(quote.spread(), None);
    }
}
