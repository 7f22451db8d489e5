//! Credential and connection lifecycle.
//!
//! The manager owns the credential store and the shared venue → adapter
//! map. Connect failures leave the venue disconnected and surface the
//! typed error — user-initiated actions are the one place faults
//! propagate instead of degrading. Nothing here retries automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use bx_core::credentials::{Credential, CredentialStore};
use bx_core::error::BxError;
use bx_core::time_util::elapsed_ms;
use bx_core::types::enums::VenueId;
use bx_venues::{BrokerAdapter, registry};

use crate::scorer::QuoteBoard;

/// Shared venue → adapter map. One live adapter per venue at a time,
/// readable by the multiplexer, router, and reconciler.
pub type ConnectionMap = Arc<RwLock<HashMap<VenueId, Arc<dyn BrokerAdapter>>>>;

/// Stores credentials and drives adapter connect/disconnect.
pub struct ConnectionManager {
    store: Mutex<CredentialStore>,
    connections: ConnectionMap,
    board: Arc<QuoteBoard>,
}

impl ConnectionManager {
    pub fn new(
        store: CredentialStore,
        connections: ConnectionMap,
        board: Arc<QuoteBoard>,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            connections,
            board,
        }
    }

    /// Persist a credential. A live connection for that venue is
    /// transparently reconnected with the new material.
    pub async fn set_credentials(&self, credential: Credential) -> Result<(), BxError> {
        let venue = credential.venue;
        self.store.lock().await.set(credential)?;

        if self.is_connected(venue).await {
            info!("[manager] {venue} credentials replaced while live, reconnecting");
            self.disconnect(venue).await?;
            self.connect(venue).await?;
        }
        Ok(())
    }

    /// Connect a venue using its stored credential. Idempotent while the
    /// session is healthy. The connect round trip seeds the venue's
    /// latency estimate.
    pub async fn connect(&self, venue: VenueId) -> Result<(), BxError> {
        if self.is_connected(venue).await {
            return Ok(());
        }

        let credential = self
            .store
            .lock()
            .await
            .get(venue)
            .cloned()
            .ok_or(BxError::NoCredentials(venue))?;

        let adapter = registry::create_adapter(&credential)?;
        let started = Instant::now();
        // On failure the adapter is dropped and the venue stays out of the
        // connection map.
        adapter.connect().await?;
        let rtt = elapsed_ms(started);

        self.board.record_latency(venue, rtt);
        self.connections.write().await.insert(venue, adapter);
        info!("[manager] {venue} connected ({rtt:.0} ms)");
        Ok(())
    }

    /// Disconnect a venue and remove it from the connection map. A venue
    /// that was never connected is a no-op.
    pub async fn disconnect(&self, venue: VenueId) -> Result<(), BxError> {
        let adapter = self.connections.write().await.remove(&venue);
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.disconnect().await {
                warn!("[manager] {venue} disconnect reported: {e}");
            }
            info!("[manager] {venue} disconnected");
        }
        Ok(())
    }

    /// Pure state query.
    pub async fn is_connected(&self, venue: VenueId) -> bool {
        self.connections
            .read()
            .await
            .get(&venue)
            .is_some_and(|adapter| adapter.is_connected())
    }

    /// The live adapter for a venue, if connected.
    pub async fn adapter(&self, venue: VenueId) -> Option<Arc<dyn BrokerAdapter>> {
        self.connections.read().await.get(&venue).cloned()
    }

    /// Venues with stored credentials (connected or not).
    pub async fn configured_venues(&self) -> Vec<VenueId> {
        self.store.lock().await.venues()
    }
}
