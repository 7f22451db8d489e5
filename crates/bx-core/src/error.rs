//! Typed error definitions for the broker-aggregation engine.
//!
//! Provides [`BxError`] for domain-specific errors. All variants implement
//! `std::error::Error` via `thiserror`.
//!
//! Propagation policy (see the component contracts in `bx-engine`):
//! adapter-level faults are caught at the router/reconciler boundary and
//! converted to typed results; only manager-level connect/credential
//! operations propagate a `BxError` to the caller.

use thiserror::Error;

use crate::types::enums::VenueId;

/// Domain-specific errors for the broker-aggregation engine.
#[derive(Debug, Error)]
pub enum BxError {
    /// Bad credentials — never retried automatically.
    #[error("authentication failed for {venue}: {reason}")]
    Auth { venue: VenueId, reason: String },

    /// Transport-level failure (socket, TLS, HTTP 5xx). Triggers the
    /// multiplexer's fallback/reconnect path; the manager does not retry.
    #[error("connection error for {venue}: {reason}")]
    Connection { venue: VenueId, reason: String },

    /// No stored credential for the venue.
    #[error("no credentials stored for {0}")]
    NoCredentials(VenueId),

    /// Symbol unsupported by a venue — that venue is excluded, not fatal.
    #[error("{venue} cannot subscribe {symbol}: {reason}")]
    Subscription {
        venue: VenueId,
        symbol: String,
        reason: String,
    },

    /// The router found no quoted/connected venue for the symbol.
    #[error("no venue available for {0}")]
    NoVenueAvailable(String),

    /// Venue response that could not be translated into canonical shapes.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Credential-store read/write error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Order operation fault that is not a business-level rejection
    /// (business rejections are reported as a rejected `OrderResult`).
    #[error("trading error for {venue}: {reason}")]
    Trading { venue: VenueId, reason: String },
}

impl BxError {
    /// Shorthand for a [`BxError::Connection`] from any displayable source.
    pub fn connection(venue: VenueId, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            venue,
            reason: err.to_string(),
        }
    }

    /// Shorthand for a [`BxError::Trading`] from any displayable source.
    pub fn trading(venue: VenueId, err: impl std::fmt::Display) -> Self {
        Self::Trading {
            venue,
            reason: err.to_string(),
        }
    }
}
