//! Client-side entity caches.
//!
//! Each container owns an [`EntityCache`] mapping keys to shared [`Peer`]s.
//! The [`ContainerRegistry`] of a client owns one cache per container name.

mod peer;
mod store;

pub use peer::Peer;
pub use store::{ChangeListener, Changes, EntityCache};
pub(crate) use store::{DetectedChanges, EntityStore};

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::core::{ConfigError, Entity, EntityKey};

/// Caches of all containers opened by a client.
#[derive(Default)]
pub(crate) struct ContainerRegistry {
    stores: RwLock<IndexMap<String, Arc<dyn EntityStore>>>,
}

impl ContainerRegistry {
    /// Open the cache of `T::CONTAINER`, creating it on first use.
    pub fn open<K: EntityKey, T: Entity>(&self) -> Result<Arc<EntityCache<K, T>>, ConfigError> {
        if K::KIND != T::KEY_KIND {
            return Err(ConfigError::KeyKindMismatch {
                container: T::CONTAINER.to_string(),
                declared: K::KIND,
                actual: T::KEY_KIND,
            });
        }
        let mut stores = self.stores.write();
        let store = stores
            .entry(T::CONTAINER.to_string())
            .or_insert_with(|| Arc::new(EntityCache::<K, T>::new()) as Arc<dyn EntityStore>)
            .clone();
        store
            .into_any()
            .downcast::<EntityCache<K, T>>()
            .map_err(|_| ConfigError::ContainerTypeMismatch(T::CONTAINER.to_string()))
    }

    /// Type-erased cache of a container.
    pub fn get(&self, name: &str) -> Option<Arc<dyn EntityStore>> {
        self.stores.read().get(name).cloned()
    }

    /// All caches in creation order.
    pub fn all(&self) -> Vec<Arc<dyn EntityStore>> {
        self.stores.read().values().cloned().collect()
    }

    /// Clear every cache.
    pub fn reset(&self) {
        for store in self.all() {
            store.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        id: i64,
    }

    impl Entity for Order {
        const CONTAINER: &'static str = "orders";
        const KEY_KIND: KeyKind = KeyKind::Int64;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OtherOrder {
        id: i64,
    }

    impl Entity for OtherOrder {
        const CONTAINER: &'static str = "orders";
        const KEY_KIND: KeyKind = KeyKind::Int64;
    }

    #[test]
    fn test_open_same_cache() {
        let registry = ContainerRegistry::default();
        let a = registry.open::<i64, Order>().unwrap();
        let b = registry.open::<i64, Order>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all().len(), 1);
        assert!(registry.get("orders").is_some());
    }

    #[test]
    fn test_key_kind_mismatch() {
        let registry = ContainerRegistry::default();
        let err = registry.open::<String, Order>().err().unwrap();
        assert_eq!(
            err,
            ConfigError::KeyKindMismatch {
                container: "orders".into(),
                declared: KeyKind::String,
                actual: KeyKind::Int64,
            }
        );
    }

    #[test]
    fn test_type_mismatch() {
        let registry = ContainerRegistry::default();
        registry.open::<i64, Order>().unwrap();
        let err = registry.open::<i64, OtherOrder>().err().unwrap();
        assert_eq!(err, ConfigError::ContainerTypeMismatch("orders".into()));
    }
}
