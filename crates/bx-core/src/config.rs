//! Engine configuration.
//!
//! The whole engine reads its settings from one JSON config file (or uses
//! [`EngineConfig::default`]). Scoring weights, the staleness window, and
//! the multiplexer timer periods all live here so hosts can tune them
//! without code changes.
//!
//! # Example config
//!
//! ```json
//! {
//!   "score_weights": { "price": 0.5, "spread": 0.3, "latency": 0.2 },
//!   "quote_stale_ms": 10000,
//!   "fallback_interval_ms": 1000,
//!   "reconnect_delay_ms": 5000,
//!   "credential_path": "/var/lib/bx/credentials.json",
//!   "fee_overrides": { "binance": 0.001 }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BxError;
use crate::types::enums::VenueId;

/// Weights of the composite venue score. Lower composite is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of the normalized price component.
    pub price: f64,
    /// Weight of the normalized spread component.
    pub spread: f64,
    /// Weight of the normalized latency component.
    pub latency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            price: 0.5,
            spread: 0.3,
            latency: 0.2,
        }
    }
}

impl ScoreWeights {
    /// Validate the weight set: no negative weights and a positive sum.
    pub fn validate(&self) -> Result<(), BxError> {
        if self.price < 0.0 || self.spread < 0.0 || self.latency < 0.0 {
            return Err(BxError::Config("score weights must be >= 0".into()));
        }
        if self.price + self.spread + self.latency <= 0.0 {
            return Err(BxError::Config("score weights must not all be zero".into()));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Composite score weights.
    pub score_weights: ScoreWeights,

    /// Quotes older than this are excluded from comparisons.
    pub quote_stale_ms: u64,

    /// Period of the synthetic fallback generator.
    pub fallback_interval_ms: u64,

    /// Delay before a closed market-data transport is reopened.
    pub reconnect_delay_ms: u64,

    /// Path of the JSON credential store.
    pub credential_path: PathBuf,

    /// Per-venue taker-fee overrides keyed by venue id. Venues not listed
    /// use their built-in default rate.
    pub fee_overrides: HashMap<String, f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score_weights: ScoreWeights::default(),
            quote_stale_ms: 10_000,
            fallback_interval_ms: 1_000,
            reconnect_delay_ms: 5_000,
            credential_path: PathBuf::from("credentials.json"),
            fee_overrides: HashMap::new(),
        }
    }
}

/// Built-in default taker-fee rates per venue.
fn default_fee(venue: VenueId) -> f64 {
    match venue {
        VenueId::Binance => 0.0010,
        VenueId::Bitget => 0.0010,
        VenueId::Bybit => 0.0010,
        VenueId::Coinbase => 0.0060,
        VenueId::Gemini => 0.0035,
        VenueId::Kraken => 0.0026,
        VenueId::Kucoin => 0.0010,
        VenueId::Okx => 0.0010,
        VenueId::Paper => 0.0,
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, BxError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BxError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| BxError::Config(format!("invalid config: {e}")))?;
        config.score_weights.validate()?;
        Ok(config)
    }

    /// Effective taker-fee rate for a venue (override or built-in default).
    pub fn fee_rate(&self, venue: VenueId) -> f64 {
        self.fee_overrides
            .get(venue.as_str())
            .copied()
            .unwrap_or_else(|| default_fee(venue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_match_contract() {
        let w = ScoreWeights::default();
        assert_eq!((w.price, w.spread, w.latency), (0.5, 0.3, 0.2));
        assert!(w.validate().is_ok());
    }

    #[test]
    fn negative_weight_rejected() {
        let w = ScoreWeights {
            price: -0.1,
            spread: 0.3,
            latency: 0.2,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn fee_override_takes_precedence() {
        let mut config = EngineConfig::default();
        assert_eq!(config.fee_rate(VenueId::Coinbase), 0.0060);

        config.fee_overrides.insert("coinbase".into(), 0.0025);
        assert_eq!(config.fee_rate(VenueId::Coinbase), 0.0025);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "quote_stale_ms": 3000 }"#).unwrap();
        assert_eq!(config.quote_stale_ms, 3_000);
        assert_eq!(config.reconnect_delay_ms, 5_000);
    }
}
