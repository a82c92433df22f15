// Session persistence
// Keeps the credential bundle in durable storage plus an in-memory copy

use std::sync::{Arc, PoisonError, RwLock};

use super::types::{CredentialBundle, AUTH_DATA_KEY, FIRST_TIME_USE_KEY};
use crate::storage::KeyValueStorage;

/// In-memory view of the persisted bundle
#[derive(Debug, Clone)]
enum CacheSlot {
    /// Storage not read yet
    Cold,
    /// Authoritative for this process (may be "no session")
    Warm(Option<CredentialBundle>),
}

/// Owner of the persisted credential bundle
///
/// Storage failures never escape: reads degrade to "no session" and writes are
/// logged and dropped, in which case the in-memory copy keeps the current
/// process working and only restart survival is lost.
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    cache: RwLock<CacheSlot>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(CacheSlot::Cold),
        }
    }

    /// Current bundle, reading storage on first use
    pub async fn load(&self) -> Option<CredentialBundle> {
        if let CacheSlot::Warm(bundle) = self.snapshot() {
            return bundle;
        }

        let loaded = self.read_persisted().await;

        let mut slot = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            // A save or clear won the race while storage was being read
            CacheSlot::Warm(bundle) => bundle.clone(),
            CacheSlot::Cold => {
                *slot = CacheSlot::Warm(loaded.clone());
                loaded
            }
        }
    }

    /// Persist `bundle` as a full overwrite of the previous one
    pub async fn save(&self, bundle: &CredentialBundle) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) =
            CacheSlot::Warm(Some(bundle.clone()));

        let serialized = match serde_json::to_string(bundle) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to serialize session data: {}", e);
                return;
            }
        };

        if let Err(e) = self.storage.set_item(AUTH_DATA_KEY, &serialized).await {
            tracing::error!("Failed to save session data: {}", e);
        }
    }

    /// Remove the persisted bundle entirely
    pub async fn clear(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = CacheSlot::Warm(None);

        if let Err(e) = self.storage.remove_item(AUTH_DATA_KEY).await {
            tracing::error!("Failed to remove session data: {}", e);
        }
    }

    fn snapshot(&self) -> CacheSlot {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Access token currently held in memory; never touches storage
    ///
    /// Used inside the refresh critical section, which must not suspend.
    pub fn cached_access_token(&self) -> Option<String> {
        match self.snapshot() {
            CacheSlot::Warm(Some(bundle)) => bundle.access_token().map(str::to_string),
            _ => None,
        }
    }

    /// Access token to attach to an outbound request
    pub async fn access_token(&self) -> Option<String> {
        self.load()
            .await
            .and_then(|bundle| bundle.access_token().map(str::to_string))
    }

    /// True until the app records its first use; storage errors count as first use
    pub async fn is_first_time_use(&self) -> bool {
        match self.storage.get_item(FIRST_TIME_USE_KEY).await {
            Ok(marker) => marker.is_none(),
            Err(e) => {
                tracing::error!("Error checking first time use: {}", e);
                true
            }
        }
    }

    pub async fn mark_first_time_used(&self) {
        if let Err(e) = self.storage.set_item(FIRST_TIME_USE_KEY, "false").await {
            tracing::error!("Error setting first time use: {}", e);
        }
    }

    async fn read_persisted(&self) -> Option<CredentialBundle> {
        let raw = match self.storage.get_item(AUTH_DATA_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!("Error reading session data: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                tracing::warn!("Stored session data is unreadable, treating as logged out: {}", e);
                None
            }
        }
    }
}
