//! Adapter construction from stored credentials.
//!
//! The connection manager never names a concrete adapter type; it hands a
//! [`Credential`] here and gets back an `Arc<dyn BrokerAdapter>`.

use std::sync::Arc;

use tracing::debug;

use bx_core::credentials::Credential;
use bx_core::error::BxError;
use bx_core::types::enums::VenueId;

use crate::BrokerAdapter;
use crate::binance::BinanceAdapter;
use crate::bitget::BitgetAdapter;
use crate::bybit::BybitAdapter;
use crate::coinbase::CoinbaseAdapter;
use crate::gemini::GeminiAdapter;
use crate::kraken::KrakenAdapter;
use crate::kucoin::KucoinAdapter;
use crate::okx::OkxAdapter;
use crate::paper::PaperAdapter;

/// Build the adapter for `credential.venue`.
///
/// Construction validates key material shape (presence, encoding) but does
/// no network I/O; authentication happens in `connect`.
pub fn create_adapter(credential: &Credential) -> Result<Arc<dyn BrokerAdapter>, BxError> {
    debug!(
        "[registry] building adapter for {} (demo: {})",
        credential.venue, credential.demo
    );
    let adapter: Arc<dyn BrokerAdapter> = match credential.venue {
        VenueId::Binance => Arc::new(BinanceAdapter::new(credential)?),
        VenueId::Bitget => Arc::new(BitgetAdapter::new(credential)?),
        VenueId::Bybit => Arc::new(BybitAdapter::new(credential)?),
        VenueId::Coinbase => Arc::new(CoinbaseAdapter::new(credential)?),
        VenueId::Gemini => Arc::new(GeminiAdapter::new(credential)?),
        VenueId::Kraken => Arc::new(KrakenAdapter::new(credential)?),
        VenueId::Kucoin => Arc::new(KucoinAdapter::new(credential)?),
        VenueId::Okx => Arc::new(OkxAdapter::new(credential)?),
        VenueId::Paper => Arc::new(PaperAdapter::new()),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_credential(venue: VenueId) -> Credential {
        // Base64-shaped secret so Coinbase/Kraken key decoding succeeds.
        Credential::from_key_secret(venue, "key", "a2V5LXNlY3JldA==", true)
    }

    #[test]
    fn builds_every_venue() {
        for venue in VenueId::ALL {
            let mut credential = demo_credential(venue);
            // Venues with an extra credential field.
            credential
                .keys
                .insert("passphrase".to_string(), "phrase".to_string());
            let adapter = create_adapter(&credential).unwrap();
            assert_eq!(adapter.venue(), venue);
            assert!(!adapter.is_connected());
        }
    }

    #[test]
    fn missing_key_material_is_an_error() {
        let empty = Credential {
            venue: VenueId::Binance,
            keys: Default::default(),
            demo: false,
        };
        assert!(create_adapter(&empty).is_err());

        // The paper venue needs no keys at all.
        let paper = Credential {
            venue: VenueId::Paper,
            keys: Default::default(),
            demo: false,
        };
        assert!(create_adapter(&paper).is_ok());
    }
}
