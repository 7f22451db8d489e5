//! Request-signing utilities shared by the venue adapters.
//!
//! Every supported venue signs private requests with an HMAC, but they
//! disagree on digest, key encoding, and output encoding:
//!
//! | Venue            | Digest   | Key            | Output  |
//! |------------------|----------|----------------|---------|
//! | Binance, Bybit   | SHA-256  | UTF-8 secret   | hex     |
//! | OKX, Bitget, KuCoin | SHA-256 | UTF-8 secret | base64  |
//! | Coinbase         | SHA-256  | base64 secret  | base64  |
//! | Gemini           | SHA-384  | UTF-8 secret   | hex     |
//! | Kraken           | SHA-512  | base64 secret  | base64  |

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};

use bx_core::error::BxError;
use bx_core::types::enums::VenueId;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;
type HmacSha512 = Hmac<Sha512>;

/// HMAC-SHA256 as a lowercase hex string (Binance, Bybit).
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC-SHA256 as base64 (OKX, Bitget, KuCoin; Coinbase with a decoded key).
pub fn hmac_sha256_b64(key: &[u8], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    B64.encode(mac.finalize().into_bytes())
}

/// HMAC-SHA384 as a lowercase hex string (Gemini).
pub fn hmac_sha384_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha384::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Kraken's `API-Sign`: base64(HMAC-SHA512(path ‖ SHA256(nonce ‖ postdata)))
/// with the base64-decoded secret as key.
pub fn kraken_sign(
    secret_b64: &str,
    path: &str,
    nonce: &str,
    postdata: &str,
) -> Result<String, BxError> {
    let key = B64.decode(secret_b64).map_err(|e| BxError::Auth {
        venue: VenueId::Kraken,
        reason: format!("secret is not valid base64: {e}"),
    })?;

    let mut sha = Sha256::new();
    sha.update(nonce.as_bytes());
    sha.update(postdata.as_bytes());
    let digest = sha.finalize();

    let mut mac = HmacSha512::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(path.as_bytes());
    mac.update(&digest);
    Ok(B64.encode(mac.finalize().into_bytes()))
}

/// Standard base64 (Gemini payload header).
pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode a base64 API secret (Coinbase), mapping failure to an auth error.
pub fn decode_b64_secret(venue: VenueId, secret_b64: &str) -> Result<Vec<u8>, BxError> {
    B64.decode(secret_b64).map_err(|e| BxError::Auth {
        venue,
        reason: format!("secret is not valid base64: {e}"),
    })
}

/// Build a URL-encoded, HMAC-SHA256–signed query string (Binance style).
///
/// Joins the `(key, value)` pairs with `&`, signs the result, and appends
/// `&signature=<hex>`. `params` must already include `timestamp`.
pub fn build_signed_query(params: &[(&str, &str)], secret: &str) -> String {
    let query: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let signature = hmac_sha256_hex(secret, &query);
    format!("{query}&signature={signature}")
}
