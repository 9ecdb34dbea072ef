// Read-through cache of decoded label metadata. Keys include a fingerprint of
// the labels, so an instance whose labels change is decoded again.
use crate::metrics_defs::{METADATA_CACHE_HIT, METADATA_CACHE_MISS};
use dynamic::Configuration;
use labels::DecodeError;
use moka::sync::Cache;
use shared::counter;
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;
pub const DEFAULT_TTL_SECS: u64 = 60;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    source: String,
    instance: String,
    fingerprint: u64,
}

/// Shared by every discovery source of the process. Safe to use from several
/// tasks at once; concurrent lookups of the same key run the decoder once.
pub struct MetadataCache {
    decoded: Cache<CacheKey, Arc<Configuration>>,
}

impl MetadataCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let decoded = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        MetadataCache { decoded }
    }

    /// Returns the cached decode of `labels`, running `decode` on a miss.
    /// Failed decodes are not cached.
    pub fn get_or_decode<F>(
        &self,
        source: &str,
        instance: &str,
        labels: &BTreeMap<String, String>,
        decode: F,
    ) -> Result<Arc<Configuration>, DecodeError>
    where
        F: FnOnce() -> Result<Configuration, DecodeError>,
    {
        let key = CacheKey {
            source: source.to_string(),
            instance: instance.to_string(),
            fingerprint: fingerprint(labels),
        };

        let mut loaded = false;
        let result = self.decoded.try_get_with(key, || {
            loaded = true;
            decode().map(Arc::new)
        });

        let metric_def = if loaded {
            METADATA_CACHE_MISS
        } else {
            METADATA_CACHE_HIT
        };
        counter!(metric_def).increment(1);

        result.map_err(|e| (*e).clone())
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        MetadataCache::new(DEFAULT_MAX_CAPACITY, Duration::from_secs(DEFAULT_TTL_SECS))
    }
}

fn fingerprint(labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = DefaultHasher::new();
    labels.hash(&mut hasher);
    hasher.finish()
}
