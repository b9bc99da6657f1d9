// tessera/src/cache.rs

//! A small bounded cache with per-entry time-to-live.
//!
//! Components that would otherwise keep a process-wide static map (gateway
//! OAuth tokens, per-organization reply-to addresses) own one of these and get
//! it injected, so expiry follows the injected `Clock`.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

struct Entry<V> {
  value: V,
  expires_at: DateTime<Utc>,
  inserted_at: DateTime<Utc>,
}

pub struct TtlCache<K, V> {
  entries: Mutex<HashMap<K, Entry<V>>>,
  ttl: Duration,
  capacity: usize,
  clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
    TtlCache {
      entries: Mutex::new(HashMap::new()),
      ttl,
      capacity: capacity.max(1),
      clock,
    }
  }

  pub fn get(&self, key: &K) -> Option<V> {
    let now = self.clock.now();
    let mut entries = self.entries.lock();
    match entries.get(key) {
      Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    }
  }

  pub fn insert(&self, key: K, value: V) {
    self.insert_with_ttl(key, value, self.ttl);
  }

  /// Inserts with an explicit lifetime, e.g. the `expires_in` of an OAuth token.
  pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
    let now = self.clock.now();
    let mut entries = self.entries.lock();
    if !entries.contains_key(&key) && entries.len() >= self.capacity {
      entries.retain(|_, e| e.expires_at > now);
      if entries.len() >= self.capacity {
        // Still full: evict the oldest entry.
        let oldest = entries
          .iter()
          .min_by_key(|(_, e)| e.inserted_at)
          .map(|(k, _)| k.clone());
        if let Some(oldest) = oldest {
          entries.remove(&oldest);
        }
      }
    }
    entries.insert(
      key,
      Entry {
        value,
        expires_at: now + ttl,
        inserted_at: now,
      },
    );
  }

  pub fn invalidate(&self, key: &K) {
    self.entries.lock().remove(key);
  }

  pub fn clear(&self) {
    self.entries.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TtlCache")
      .field("ttl", &self.ttl)
      .field("capacity", &self.capacity)
      .field("len", &self.entries.lock().len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  #[test]
  fn entries_expire_after_ttl() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache: TtlCache<&str, i32> = TtlCache::new(Duration::seconds(10), 4, clock.clone());
    cache.insert("a", 1);
    assert_eq!(cache.get(&"a"), Some(1));
    clock.advance(Duration::seconds(10));
    assert_eq!(cache.get(&"a"), None);
    assert!(cache.is_empty());
  }

  #[test]
  fn full_cache_evicts_oldest() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache: TtlCache<u8, u8> = TtlCache::new(Duration::minutes(5), 2, clock.clone());
    cache.insert(1, 1);
    clock.advance(Duration::seconds(1));
    cache.insert(2, 2);
    clock.advance(Duration::seconds(1));
    cache.insert(3, 3);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.get(&3), Some(3));
  }
}
