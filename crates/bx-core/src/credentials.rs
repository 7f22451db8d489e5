//! Per-venue credential material and its JSON-file key-value store.
//!
//! The store holds one record — the full `venue → Credential` map — read at
//! startup and rewritten wholesale on every update. Key material is an
//! opaque string map because venues disagree on what a credential is
//! (api key + secret, plus passphrase on OKX/KuCoin/Coinbase).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BxError;
use crate::types::enums::VenueId;

/// Secret material for one venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub venue: VenueId,
    /// Opaque key material (`"api_key"`, `"api_secret"`, `"passphrase"`, …).
    pub keys: HashMap<String, String>,
    /// Demo/live flag — demo steers adapters to testnet endpoints.
    pub demo: bool,
}

impl Credential {
    /// A credential from an api key / secret pair.
    pub fn from_key_secret(
        venue: VenueId,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        demo: bool,
    ) -> Self {
        let mut keys = HashMap::new();
        keys.insert("api_key".to_string(), api_key.into());
        keys.insert("api_secret".to_string(), api_secret.into());
        Self { venue, keys, demo }
    }

    /// Look up one key-material entry.
    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(|s| s.as_str())
    }

    /// Look up a required key-material entry, failing with
    /// [`BxError::Auth`] when absent.
    pub fn require(&self, name: &str) -> Result<&str, BxError> {
        self.key(name).ok_or_else(|| BxError::Auth {
            venue: self.venue,
            reason: format!("credential missing {name}"),
        })
    }
}

/// JSON-file-backed credential store.
///
/// Not shared across threads — owned by the connection manager and mutated
/// only from its task.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    entries: HashMap<VenueId, Credential>,
}

impl CredentialStore {
    /// Open the store, loading the file if it exists. A missing file is an
    /// empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BxError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| BxError::Storage(format!("corrupt credential store: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(BxError::Storage(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self { path, entries })
    }

    /// Stored credential for a venue.
    pub fn get(&self, venue: VenueId) -> Option<&Credential> {
        self.entries.get(&venue)
    }

    /// Replace a venue's credential wholesale and rewrite the file.
    pub fn set(&mut self, credential: Credential) -> Result<(), BxError> {
        let venue = credential.venue;
        self.entries.insert(venue, credential);
        self.flush()?;
        info!("[credentials] stored credential for {venue}");
        Ok(())
    }

    /// Remove a venue's credential and rewrite the file.
    pub fn remove(&mut self, venue: VenueId) -> Result<Option<Credential>, BxError> {
        let removed = self.entries.remove(&venue);
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    /// Venues with stored credentials.
    pub fn venues(&self) -> Vec<VenueId> {
        let mut venues: Vec<VenueId> = self.entries.keys().copied().collect();
        venues.sort_unstable();
        venues
    }

    fn flush(&self) -> Result<(), BxError> {
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| BxError::Storage(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| {
            BxError::Storage(format!("cannot write {}: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bx-credstore-{tag}-{}.json", std::process::id()))
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = CredentialStore::open(temp_store_path("missing")).unwrap();
        assert!(store.venues().is_empty());
    }

    #[test]
    fn set_persists_and_reloads() {
        let path = temp_store_path("roundtrip");
        let cred = Credential::from_key_secret(VenueId::Kraken, "key", "secret", false);

        let mut store = CredentialStore::open(&path).unwrap();
        store.set(cred.clone()).unwrap();

        let reloaded = CredentialStore::open(&path).unwrap();
        assert_eq!(reloaded.get(VenueId::Kraken), Some(&cred));
        assert_eq!(reloaded.get(VenueId::Binance), None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_replaces_wholesale() {
        let path = temp_store_path("replace");
        let mut store = CredentialStore::open(&path).unwrap();

        store
            .set(Credential::from_key_secret(VenueId::Okx, "old", "old", true))
            .unwrap();
        store
            .set(Credential::from_key_secret(VenueId::Okx, "new", "new", false))
            .unwrap();

        let cred = store.get(VenueId::Okx).unwrap();
        assert_eq!(cred.key("api_key"), Some("new"));
        assert!(!cred.demo);

        let _ = std::fs::remove_file(&path);
    }
}
