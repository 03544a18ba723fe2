//! In-memory provider registry with entity-based selection.

use crate::error::{ProviderError, Result};
use crate::provider::Provider;
use quarry_core::{Entity, ProviderId};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Set of registered providers, keyed by id.
///
/// Providers are stored in an ordered map so that every listing and
/// selection comes back in provider-id order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<BTreeMap<ProviderId, Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider.
    ///
    /// # Errors
    /// Returns `ProviderError::Duplicate` if the id is already taken.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let id = provider.id().clone();
        let mut providers = self
            .providers
            .write()
            .expect("acquire write lock on providers");

        if providers.contains_key(&id) {
            return Err(ProviderError::Duplicate {
                provider_id: id.to_string(),
            });
        }

        info!(provider_id = %id, "registered provider");
        providers.insert(id, provider);
        Ok(())
    }

    /// Get a provider by id.
    ///
    /// # Errors
    /// Returns `ProviderError::NotFound` if no such provider is registered.
    pub fn get(&self, provider_id: &ProviderId) -> Result<Arc<dyn Provider>> {
        let providers = self
            .providers
            .read()
            .expect("acquire read lock on providers");

        providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }

    /// All providers in id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self
            .providers
            .read()
            .expect("acquire read lock on providers");

        providers.values().cloned().collect()
    }

    /// Providers whose locale and sector coverage includes `entity`.
    #[must_use]
    pub fn select_for(&self, entity: &Entity) -> Vec<Arc<dyn Provider>> {
        let providers = self
            .providers
            .read()
            .expect("acquire read lock on providers");

        let selected: Vec<Arc<dyn Provider>> = providers
            .values()
            .filter(|p| p.descriptor().covers(entity))
            .cloned()
            .collect();

        debug!(
            entity_id = %entity.entity_id,
            selected = selected.len(),
            registered = providers.len(),
            "selected providers"
        );

        selected
    }

    /// Number of registered providers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.providers
            .read()
            .expect("acquire read lock on providers")
            .len()
    }

    /// Whether a provider with this id is registered.
    #[must_use]
    pub fn contains(&self, provider_id: &ProviderId) -> bool {
        self.providers
            .read()
            .expect("acquire read lock on providers")
            .contains_key(provider_id)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .providers
            .read()
            .expect("acquire read lock on providers")
            .keys()
            .map(ToString::to_string)
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &ids)
            .finish()
    }
}
