//! Enumerations used throughout the broker-aggregation engine.
//!
//! These are the canonical vocabularies: each adapter maps its venue's
//! symbols, sides, and status strings into these enums and back.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Venue identifiers
// ---------------------------------------------------------------------------

/// Supported brokerage/exchange venues.
///
/// The lowercase id string (`"binance"`, `"coinbase"`, …) is the canonical
/// identifier used in credential storage, config, and logs. Lexical order of
/// this id is the documented tie-break for equal composite scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Bitget,
    Bybit,
    Coinbase,
    Gemini,
    Kraken,
    Kucoin,
    Okx,
    Paper,
}

impl VenueId {
    /// All venues, in lexical id order.
    pub const ALL: [VenueId; 9] = [
        VenueId::Binance,
        VenueId::Bitget,
        VenueId::Bybit,
        VenueId::Coinbase,
        VenueId::Gemini,
        VenueId::Kraken,
        VenueId::Kucoin,
        VenueId::Okx,
        VenueId::Paper,
    ];

    /// The canonical lowercase id string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bitget => "bitget",
            Self::Bybit => "bybit",
            Self::Coinbase => "coinbase",
            Self::Gemini => "gemini",
            Self::Kraken => "kraken",
            Self::Kucoin => "kucoin",
            Self::Okx => "okx",
            Self::Paper => "paper",
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VenueId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bitget" => Ok(Self::Bitget),
            "bybit" => Ok(Self::Bybit),
            "coinbase" => Ok(Self::Coinbase),
            "gemini" => Ok(Self::Gemini),
            "kraken" => Ok(Self::Kraken),
            "kucoin" => Ok(Self::Kucoin),
            "okx" => Ok(Self::Okx),
            "paper" => Ok(Self::Paper),
            other => Err(format!("unknown venue id: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Order / trading enums
// ---------------------------------------------------------------------------

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side.
    pub fn flip(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Direction of an open position. Stored separately from the unsigned
/// quantity — a position's quantity never carries a sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Time-in-force for limit/stop orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Day,
}

/// Order status — unified across all venues.
///
/// Each adapter maps its venue vocabulary here (e.g. Binance
/// `PARTIALLY_FILLED` → `PartialFill`, Coinbase `done` → `Filled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    PartialFill,
    Rejected,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::PartialFill => "partial_fill",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_id_roundtrip() {
        for venue in VenueId::ALL {
            let parsed: VenueId = venue.as_str().parse().unwrap();
            assert_eq!(parsed, venue);
        }
        assert!("nasdaq".parse::<VenueId>().is_err());
    }

    #[test]
    fn venue_all_is_lexical() {
        let mut ids: Vec<&str> = VenueId::ALL.iter().map(|v| v.as_str()).collect();
        let sorted = ids.clone();
        ids.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn order_status_serde_vocabulary() {
        let json = serde_json::to_string(&OrderStatus::PartialFill).unwrap();
        assert_eq!(json, "\"partial_fill\"");
    }
}
