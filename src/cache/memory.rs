//! In-memory layer cache

use crate::cache::{check_publish, plan_eviction, CacheEntryInfo, CacheKey, LayerCache, PruneReport};
use crate::error::StrataResult;
use crate::layer::{Layer, LayerId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct Slot {
    layer: Arc<Layer>,
    last_used: DateTime<Utc>,
}

/// Process-local cache, one per build in tests
#[derive(Default)]
pub struct MemoryCache {
    slots: RwLock<HashMap<LayerId, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.read().contains_key(&key.fingerprint())
    }
}

impl LayerCache for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> StrataResult<Option<Arc<Layer>>> {
        let fingerprint = key.fingerprint();
        let mut slots = self.slots.write();
        Ok(slots.get_mut(&fingerprint).map(|slot| {
            slot.last_used = Utc::now();
            debug!("Memory cache hit for {}", fingerprint.short());
            Arc::clone(&slot.layer)
        }))
    }

    fn publish(&self, key: &CacheKey, layer: Arc<Layer>) -> StrataResult<Arc<Layer>> {
        let fingerprint = check_publish(key, &layer)?;
        let mut slots = self.slots.write();
        let slot = slots.entry(fingerprint).or_insert_with(|| Slot {
            layer,
            last_used: Utc::now(),
        });
        Ok(Arc::clone(&slot.layer))
    }

    fn entries(&self) -> StrataResult<Vec<CacheEntryInfo>> {
        let slots = self.slots.read();
        let mut entries: Vec<CacheEntryInfo> = slots
            .iter()
            .map(|(fingerprint, slot)| CacheEntryInfo {
                fingerprint: fingerprint.clone(),
                created_by: slot.layer.created_by.clone(),
                size_bytes: slot.layer.size_bytes(),
                created_at: slot.layer.created_at,
                last_used: slot.last_used,
            })
            .collect();
        entries.sort_by(|a, b| a.last_used.cmp(&b.last_used));
        Ok(entries)
    }

    fn remove(&self, fingerprint: &LayerId) -> StrataResult<bool> {
        Ok(self.slots.write().remove(fingerprint).is_some())
    }

    fn clear(&self) -> StrataResult<usize> {
        let mut slots = self.slots.write();
        let count = slots.len();
        slots.clear();
        Ok(count)
    }

    fn prune(&self, max_bytes: u64) -> StrataResult<PruneReport> {
        let entries = self.entries()?;
        let (victims, report) = plan_eviction(&entries, max_bytes);
        let mut slots = self.slots.write();
        for victim in victims {
            slots.remove(&victim);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::layer::{Entry, LayerDelta};

    fn key_and_layer(content: &str) -> (CacheKey, Arc<Layer>) {
        let input = Digest::of_bytes(b"input");
        let key = CacheKey::new(None, "RUN build", input.clone());
        let mut delta = LayerDelta::new();
        delta.insert("out", Entry::file(0o644, content));
        let layer = Layer::new(None, "RUN build".into(), input, delta);
        (key, Arc::new(layer))
    }

    #[test]
    fn lookup_sees_published_layer() {
        let cache = MemoryCache::new();
        let (key, layer) = key_and_layer("a");
        assert!(cache.lookup(&key).unwrap().is_none());

        cache.publish(&key, layer.clone()).unwrap();
        let hit = cache.lookup(&key).unwrap().unwrap();
        assert_eq!(hit.id, layer.id);
    }

    #[test]
    fn publish_rejects_foreign_key() {
        let cache = MemoryCache::new();
        let (key, _) = key_and_layer("a");
        let other = Layer::new(
            None,
            "RUN other".into(),
            Digest::of_bytes(b"input"),
            LayerDelta::new(),
        );
        assert!(cache.publish(&key, Arc::new(other)).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn first_publisher_wins() {
        let cache = MemoryCache::new();
        let (key, first) = key_and_layer("first");
        let (_, second) = key_and_layer("second");

        cache.publish(&key, first.clone()).unwrap();
        let winner = cache.publish(&key, second).unwrap();
        assert_eq!(winner.diff_digest, first.diff_digest);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_publishers_converge() {
        let cache = Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let (key, layer) = key_and_layer(&format!("writer {}", i));
                    cache.publish(&key, layer).unwrap().diff_digest.clone()
                })
            })
            .collect();

        let winners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(winners.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn clear_empties() {
        let cache = MemoryCache::new();
        let (key, layer) = key_and_layer("a");
        cache.publish(&key, layer).unwrap();
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty());
    }
}
