//! Local mirror of remote object dictionary values
//!
//! The cache is written only by the receiver dispatcher (TxPDO payloads, SDO upload responses)
//! and by the SDO client on a confirmed download. Everyone else reads.

use std::collections::HashMap;
use std::time::Duration;

use canmotion_common::ObjectValue;
use tokio::time::Instant;

/// A cached object value together with its validity
///
/// A value with `valid == false` is the last value seen before the entry was invalidated, or a
/// placeholder for an entry which was never read. It must not be treated as the node's current
/// value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheEntry {
    /// Last known value
    pub value: ObjectValue,
    /// True once a read or confirmed write has succeeded, until the entry is invalidated
    pub valid: bool,
    /// When the value was last updated from the bus
    pub updated: Option<Instant>,
}

impl CacheEntry {
    /// An entry which has never been read
    pub fn missing() -> Self {
        Self {
            value: ObjectValue::from(0u32),
            valid: false,
            updated: None,
        }
    }

    /// True if the entry is valid and was updated less than `max_age` before `now`
    pub fn is_fresh(&self, max_age: Duration, now: Instant) -> bool {
        match self.updated {
            Some(updated) if self.valid => now.saturating_duration_since(updated) < max_age,
            _ => false,
        }
    }
}

/// Per node object dictionary cache, keyed by (index, sub index)
#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: HashMap<(u16, u8), CacheEntry>,
}

impl ObjectCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry
    pub fn get(&self, index: u16, sub: u8) -> Option<CacheEntry> {
        self.entries.get(&(index, sub)).copied()
    }

    /// Store a value received from the node, marking it valid
    pub fn store(&mut self, index: u16, sub: u8, value: ObjectValue, now: Instant) {
        self.entries.insert(
            (index, sub),
            CacheEntry {
                value,
                valid: true,
                updated: Some(now),
            },
        );
    }

    /// Mark every entry invalid, keeping the last known values
    ///
    /// Used when the node reports a boot-up, after which its objects hold their defaults again.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.valid = false;
        }
    }

    /// Number of entries, valid or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has ever been cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_store_and_freshness() {
        let mut cache = ObjectCache::new();
        assert_eq!(None, cache.get(0x6064, 0));

        let t0 = Instant::now();
        cache.store(0x6064, 0, ObjectValue::from(1000i32), t0);
        let entry = cache.get(0x6064, 0).unwrap();
        assert!(entry.valid);
        assert_eq!(1000, entry.value.as_i32());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(entry.is_fresh(Duration::from_millis(100), Instant::now()));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!entry.is_fresh(Duration::from_millis(100), Instant::now()));
    }

    #[test]
    fn test_invalidate_keeps_value() {
        let mut cache = ObjectCache::new();
        cache.store(0x6041, 0, ObjectValue::from(0x0637u16), Instant::now());
        cache.invalidate_all();
        let entry = cache.get(0x6041, 0).unwrap();
        assert!(!entry.valid);
        assert_eq!(0x0637, entry.value.as_u32());
        assert!(!entry.is_fresh(Duration::from_secs(10), Instant::now()));
    }

    #[test]
    fn test_missing_entry_is_not_valid() {
        let entry = CacheEntry::missing();
        assert!(!entry.valid);
        assert_eq!(None, entry.updated);
    }
}
