//! Canonical symbol utilities.
//!
//! The engine's canonical symbol form is compact uppercase with no
//! delimiter (`BTCUSD`, `ETHUSDT`, `AAPL`). Venues disagree: Coinbase and
//! KuCoin want `BTC-USD`, Kraken prefixes bitcoin as `XBT`, Gemini wants
//! lowercase. Adapters use [`split_pair`] to rebuild their delimited form
//! from the canonical one.

/// Quote assets recognized when splitting a compact pair, longest first so
/// `USDT` wins over `USD` for `BTCUSDT`.
const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "FDUSD", "TUSD", "USD", "EUR", "GBP", "JPY", "BTC", "ETH",
];

/// Normalize any delimited/lowercase venue symbol into canonical form.
///
/// `"btc-usd"` → `"BTCUSD"`, `"BTC/USDT"` → `"BTCUSDT"`.
pub fn canonical(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Split a canonical compact pair into `(base, quote)` by known-quote
/// suffix. Returns `None` for symbols that are not a recognizable pair
/// (e.g. equities like `AAPL`).
pub fn split_pair(symbol: &str) -> Option<(&str, &str)> {
    for quote in KNOWN_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base, quote));
            }
        }
    }
    None
}

/// Rebuild a delimited venue symbol (`BTC-USD` style) from canonical form.
///
/// Returns `None` when the pair cannot be split.
pub fn delimited(symbol: &str, sep: char) -> Option<String> {
    split_pair(symbol).map(|(base, quote)| format!("{base}{sep}{quote}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strips_delimiters_and_case() {
        assert_eq!(canonical("btc-usd"), "BTCUSD");
        assert_eq!(canonical("BTC/USDT"), "BTCUSDT");
        assert_eq!(canonical("AAPL"), "AAPL");
    }

    #[test]
    fn split_prefers_longest_quote() {
        assert_eq!(split_pair("BTCUSDT"), Some(("BTC", "USDT")));
        assert_eq!(split_pair("BTCUSD"), Some(("BTC", "USD")));
        assert_eq!(split_pair("ETHBTC"), Some(("ETH", "BTC")));
    }

    #[test]
    fn equities_do_not_split() {
        assert_eq!(split_pair("AAPL"), None);
        // A bare quote asset is not a pair either.
        assert_eq!(split_pair("USD"), None);
    }

    #[test]
    fn delimited_rebuilds_venue_form() {
        assert_eq!(delimited("BTCUSD", '-').as_deref(), Some("BTC-USD"));
        assert_eq!(delimited("AAPL", '-'), None);
    }
}
