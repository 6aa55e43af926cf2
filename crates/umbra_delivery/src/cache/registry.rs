//! # Cache Registry
//!
//! Hands out one [`CellCache`] per (world, compression, obfuscated) key.
//! Holds only weak references: a cache lives exactly as long as some session
//! uses it, and the next session to arrive builds a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use umbra_core::{CompressionConfig, WorldId};

use super::CellCache;
use crate::collab::{CellTransform, FeatureGate, WorldProvider};
use crate::worker::WorkerPool;

/// Identity of a shared cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// World the payloads come from.
    pub world: WorldId,
    /// Compression applied to them.
    pub compression: CompressionConfig,
    /// Whether they went through the cell transform.
    pub obfuscated: bool,
}

/// Shared-ownership directory of cell caches.
pub struct CellCacheRegistry {
    pool: Arc<WorkerPool>,
    transform: Option<Arc<dyn CellTransform>>,
    gate: Box<dyn FeatureGate>,
    caches: Mutex<HashMap<CacheKey, Weak<CellCache>>>,
}

impl CellCacheRegistry {
    /// Creates a registry. Worlds the gate enables get transformed payloads
    /// when a transform is given.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        transform: Option<Arc<dyn CellTransform>>,
        gate: Box<dyn FeatureGate>,
    ) -> Self {
        Self {
            pool,
            transform,
            gate,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cache for `world` under `compression`, creating it if no
    /// live one exists.
    pub fn cache_for(&self, world: &Arc<dyn WorldProvider>, compression: CompressionConfig) -> Arc<CellCache> {
        let transform = self
            .transform
            .as_ref()
            .filter(|_| self.gate.is_enabled_for_world(world.id()))
            .cloned();
        let key = CacheKey {
            world: world.id(),
            compression,
            obfuscated: transform.is_some(),
        };

        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(&key).and_then(Weak::upgrade) {
            return cache;
        }

        caches.retain(|_, cache| cache.strong_count() > 0);
        tracing::debug!(
            "Creating cell cache for {} (obfuscated: {})",
            key.world,
            key.obfuscated
        );
        let cache = CellCache::new(Arc::clone(world), compression, transform, Arc::clone(&self.pool));
        caches.insert(key, Arc::downgrade(&cache));
        cache
    }

    /// Caches some session still holds.
    #[must_use]
    pub fn live_caches(&self) -> usize {
        self.caches
            .lock()
            .values()
            .filter(|cache| cache.strong_count() > 0)
            .count()
    }

    /// Sum of hits and misses over every live cache.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.caches
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .fold((0, 0), |(hits, misses), cache| (hits + cache.hits(), misses + cache.misses()))
    }

    /// The pool every cache submits to.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{MockTransform, MockWorld};
    use crate::collab::WorldFeatureGate;

    fn registry(gate: WorldFeatureGate) -> CellCacheRegistry {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let transform: Arc<dyn CellTransform> = Arc::new(MockTransform::new());
        CellCacheRegistry::new(pool, Some(transform), Box::new(gate))
    }

    #[test]
    fn test_same_key_shares_cache() {
        let registry = registry(WorldFeatureGate::disabled());
        let world: Arc<dyn WorldProvider> = Arc::new(MockWorld::new(WorldId(1)));

        let a = registry.cache_for(&world, CompressionConfig::lz4());
        let b = registry.cache_for(&world, CompressionConfig::lz4());
        let c = registry.cache_for(&world, CompressionConfig::raw());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.live_caches(), 2);
        assert!(!a.is_transformed());
    }

    #[test]
    fn test_cache_dies_with_last_user() {
        let registry = registry(WorldFeatureGate::disabled());
        let world: Arc<dyn WorldProvider> = Arc::new(MockWorld::new(WorldId(1)));

        let first = registry.cache_for(&world, CompressionConfig::lz4());
        drop(first);
        assert_eq!(registry.live_caches(), 0);

        let second = registry.cache_for(&world, CompressionConfig::lz4());
        assert_eq!(second.hits() + second.misses(), 0);
        assert_eq!(registry.live_caches(), 1);
    }

    #[test]
    fn test_gate_selects_obfuscated_cache() {
        let registry = registry(WorldFeatureGate::new([WorldId(2)]));
        let plain: Arc<dyn WorldProvider> = Arc::new(MockWorld::new(WorldId(1)));
        let hidden: Arc<dyn WorldProvider> = Arc::new(MockWorld::new(WorldId(2)));

        assert!(!registry.cache_for(&plain, CompressionConfig::lz4()).is_transformed());
        assert!(registry.cache_for(&hidden, CompressionConfig::lz4()).is_transformed());
    }
}
