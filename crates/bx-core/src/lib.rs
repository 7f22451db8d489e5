//! # bx-core
//!
//! Core crate for the broker-aggregation engine, providing:
//!
//! - **Types** (`types`) — enums, quote structs, trading structs
//! - **Configuration** (`config`) — JSON engine config deserialization
//! - **Credentials** (`credentials`) — per-venue key material + JSON store
//! - **Error types** (`error`) — domain-specific `BxError` via thiserror
//! - **Symbol utilities** (`symbol`) — canonical pair splitting/formatting
//! - **Synthetic pricing** (`synth`) — deterministic fallback price walks
//! - **WebSocket** (`ws`) — single-shot market-data transport
//! - **Latency** (`latency`) — per-venue round-trip latency tracking
//! - **Time utilities** (`time_util`) — millisecond timestamps
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod credentials;
pub mod error;
pub mod latency;
pub mod logging;
pub mod symbol;
pub mod synth;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use error::BxError;
pub use types::*;
