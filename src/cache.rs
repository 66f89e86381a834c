use std::convert::TryFrom;

use bytes::Bytes;
use moka::future::Cache;

/// Stored objects are keyed by their datastore id and location.
pub type CacheKey = (String, String);

/// A cheaply cloneable, byte weighted cache of stored objects.
///
/// Locations are content derived and never rewritten so entries
/// never need invalidating.
#[derive(Clone)]
pub struct ObjectCache(Option<Cache<CacheKey, Bytes>>);

impl ObjectCache {
    /// Creates a new cache holding at most `max_bytes` worth of objects.
    ///
    /// A size of `0` disables caching.
    pub fn new(max_bytes: u64) -> Self {
        if max_bytes == 0 {
            return Self(None);
        }

        let cache = Cache::builder()
            .weigher(|_key: &CacheKey, value: &Bytes| -> u32 {
                u32::try_from(value.len()).unwrap_or(u32::MAX)
            })
            .max_capacity(max_bytes)
            .build();

        Self(Some(cache))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    /// Get a item from the cache if it exists otherwise returns None.
    pub fn get(&self, datastore_id: &str, location: &str) -> Option<Bytes> {
        let cache = self.0.as_ref()?;
        cache.get(&(datastore_id.to_string(), location.to_string()))
    }

    /// Adds an item to the cache, evicting other entries if the cache is full.
    pub async fn set(&self, datastore_id: &str, location: &str, data: Bytes) {
        if let Some(cache) = self.0.as_ref() {
            cache
                .insert((datastore_id.to_string(), location.to_string()), data)
                .await;
        }
    }
}
