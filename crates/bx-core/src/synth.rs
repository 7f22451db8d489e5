//! Deterministic synthetic pricing.
//!
//! Used wherever a plausible price is needed without a live feed: the
//! paper venue marks unseen symbols with it, and the market-data
//! multiplexer drives its fallback generator off it. The base price is a
//! pure function of the symbol name so restarts and tests see the same
//! numbers.

/// Deterministic per-symbol base price.
///
/// Folds the symbol bytes into a hash and maps it onto a readable
/// 10.00–10009.99 range. Same symbol, same price, every run.
pub fn base_price(symbol: &str) -> f64 {
    let hash = symbol
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
    10.0 + (hash % 1_000_000) as f64 / 100.0
}

/// A bounded random walk around a symbol's base price.
///
/// Each step moves the price by at most ±0.2%, and the walk never drifts
/// more than ±5% from its base. The caller supplies the randomness (a
/// jitter in `[-1, 1]`) so the walk itself stays deterministic and
/// testable.
#[derive(Debug, Clone)]
pub struct SyntheticWalk {
    base: f64,
    last: f64,
}

impl SyntheticWalk {
    pub fn new(symbol: &str) -> Self {
        let base = base_price(symbol);
        Self { base, last: base }
    }

    /// Advance one tick; `jitter` outside `[-1, 1]` is clamped.
    pub fn step(&mut self, jitter: f64) -> f64 {
        let moved = self.last * (1.0 + 0.002 * jitter.clamp(-1.0, 1.0));
        self.last = moved.clamp(self.base * 0.95, self.base * 1.05);
        self.last
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn base(&self) -> f64 {
        self.base
    }
}
