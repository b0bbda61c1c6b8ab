//! In-process memory tier
//!
//! A bounded key → entry table. Inserts that push the table past capacity
//! run an eviction pass (LRU or FIFO) while still holding the write lock,
//! so the scan and the removals see one consistent table.
//!
//! Access statistics live in atomics on each slot: concurrent hits on the
//! same key only need the read lock and never lose increments.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::entry::CacheEntry;
use super::stats::{TierCounters, TierStats};

/// Which entries leave first when the tier is over capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest `last_accessed_at` first
    Lru,
    /// Oldest `created_at` first
    Fifo,
}

impl EvictionPolicy {
    fn as_u8(self) -> u8 {
        match self {
            EvictionPolicy::Lru => 0,
            EvictionPolicy::Fifo => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EvictionPolicy::Fifo,
            _ => EvictionPolicy::Lru,
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(format!("unknown eviction policy '{}' (expected lru or fifo)", other)),
        }
    }
}

/// Stored entry plus its mutable access counters
#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    access_count: AtomicU64,
    last_accessed_ms: AtomicI64,
}

impl Slot {
    fn new(entry: CacheEntry) -> Self {
        let access_count = AtomicU64::new(entry.access_count);
        let last_accessed_ms = AtomicI64::new(entry.last_accessed_at.timestamp_millis());
        Self {
            entry,
            access_count,
            last_accessed_ms,
        }
    }

    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_accessed(&self) -> i64 {
        self.last_accessed_ms.load(Ordering::Relaxed)
    }

    /// Copy of the entry with live counters folded in
    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.access_count = self.access_count.load(Ordering::Relaxed);
        entry.last_accessed_at = Utc
            .timestamp_millis_opt(self.last_accessed())
            .single()
            .unwrap_or(entry.last_accessed_at);
        entry
    }
}

/// Bounded in-process tier
pub struct MemoryTier {
    entries: RwLock<HashMap<String, Arc<Slot>>>,
    max_entries: usize,
    policy: AtomicU8,
    counters: TierCounters,
}

impl MemoryTier {
    pub fn new(max_entries: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            policy: AtomicU8::new(policy.as_u8()),
            counters: TierCounters::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Slot>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Slot>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    pub fn set_policy(&self, policy: EvictionPolicy) {
        self.policy.store(policy.as_u8(), Ordering::Relaxed);
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn counters(&self) -> &TierCounters {
        &self.counters
    }

    /// Live entry for `key`, bumping its access statistics.
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let slot = self.read().get(key).cloned();

        match slot {
            Some(slot) if slot.entry.is_live_at(Utc::now()) => {
                slot.touch();
                self.counters.record_hit();
                Some(slot.snapshot())
            }
            Some(slot) => {
                self.remove_if_same(key, &slot);
                self.counters.record_expirations(1);
                self.counters.record_miss();
                None
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }

    /// Live entry without touching statistics
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.read()
            .get(key)
            .filter(|slot| slot.entry.is_live_at(Utc::now()))
            .map(|slot| slot.snapshot())
    }

    pub fn contains_live(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace `key`, then evict down to capacity.
    /// Returns the number of entries evicted.
    pub fn insert(&self, key: &str, entry: CacheEntry) -> usize {
        let mut table = self.write();
        table.insert(key.to_string(), Arc::new(Slot::new(entry)));
        self.counters.record_write();

        if table.len() <= self.max_entries {
            return 0;
        }
        let evicted = Self::evict_locked(&mut table, self.max_entries, self.policy(), key);
        self.counters.record_evictions(evicted as u64);
        evicted
    }

    /// Remove the oldest entries (by policy) until `table.len() <= max`.
    /// `protect` is the key that triggered the pass; it is never chosen.
    fn evict_locked(
        table: &mut HashMap<String, Arc<Slot>>,
        max: usize,
        policy: EvictionPolicy,
        protect: &str,
    ) -> usize {
        let overage = table.len().saturating_sub(max);
        if overage == 0 {
            return 0;
        }

        let mut candidates: Vec<(String, i64)> = table
            .iter()
            .filter(|(k, _)| k.as_str() != protect)
            .map(|(k, slot)| {
                let rank = match policy {
                    EvictionPolicy::Lru => slot.last_accessed(),
                    EvictionPolicy::Fifo => slot.entry.created_at.timestamp_millis(),
                };
                (k.clone(), rank)
            })
            .collect();
        candidates.sort_by_key(|(_, rank)| *rank);

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(overage) {
            if table.remove(&key).is_some() {
                evicted += 1;
            }
        }

        debug!(evicted = evicted, policy = ?policy, "Memory tier eviction pass");
        evicted
    }

    fn remove_if_same(&self, key: &str, slot: &Arc<Slot>) {
        let mut table = self.write();
        if table.get(key).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false) {
            table.remove(key);
        }
    }

    /// Remove `key`; missing keys are not an error
    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Remove every entry, returning how many were present
    pub fn clear(&self) -> usize {
        let mut table = self.write();
        let n = table.len();
        table.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Keys whose entry is expired at `now` (read lock only)
    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, slot)| !slot.entry.is_live_at(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Remove the given keys if they are still expired. Used by the
    /// background sweep in small batches so the write lock is held briefly.
    pub fn remove_expired_batch(&self, keys: &[String]) -> usize {
        let now = Utc::now();
        let mut table = self.write();
        let mut removed = 0;
        for key in keys {
            let expired = table
                .get(key)
                .map(|slot| !slot.entry.is_live_at(now))
                .unwrap_or(false);
            if expired {
                table.remove(key);
                removed += 1;
            }
        }
        self.counters.record_expirations(removed as u64);
        removed
    }

    /// Remove every entry for which `predicate(key, entry)` holds.
    /// Returns the removed keys.
    pub fn remove_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.write().retain(|key, slot| {
            if predicate(key, &slot.entry) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Live entries, newest first (used for stats and warmup decisions)
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let now = Utc::now();
        let mut out: Vec<(String, CacheEntry)> = self
            .read()
            .iter()
            .filter(|(_, slot)| slot.entry.is_live_at(now))
            .map(|(k, slot)| (k.clone(), slot.snapshot()))
            .collect();
        out.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        out
    }

    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats {
            tier: "memory",
            enabled: true,
            connected: true,
            item_count: self.len(),
            max_items: Some(self.max_entries),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Headers;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    fn entry(ttl: u64) -> CacheEntry {
        CacheEntry::new(json!({"v": 1}), Headers::new(), 200, ttl)
    }

    #[test]
    fn test_insert_and_get() {
        let tier = MemoryTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", entry(60));

        let got = tier.get("a").expect("live entry");
        assert_eq!(got.access_count, 1);
        let got = tier.get("a").expect("live entry");
        assert_eq!(got.access_count, 2);

        let stats = tier.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.item_count, 1);
    }

    #[test]
    fn test_expired_entry_purged_on_read() {
        let tier = MemoryTier::new(10, EvictionPolicy::Lru);
        let mut stale = entry(5);
        stale.created_at = Utc::now() - ChronoDuration::seconds(10);
        stale.last_accessed_at = stale.created_at;
        tier.insert("old", stale);

        assert!(tier.get("old").is_none());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.stats().expirations, 1);
    }

    #[test]
    fn test_lru_eviction_boundary() {
        let tier = MemoryTier::new(3, EvictionPolicy::Lru);
        for key in ["k0", "k1", "k2"] {
            tier.insert(key, entry(60));
            std::thread::sleep(Duration::from_millis(5));
        }

        // k0 becomes most recently used; k1 is now the LRU
        tier.get("k0");
        std::thread::sleep(Duration::from_millis(5));

        let evicted = tier.insert("k3", entry(60));
        assert_eq!(evicted, 1);
        assert_eq!(tier.len(), 3);
        assert!(tier.contains_live("k0"));
        assert!(!tier.contains_live("k1"));
        assert!(tier.contains_live("k2"));
        assert!(tier.contains_live("k3"));
    }

    #[test]
    fn test_fifo_eviction_ignores_access() {
        let tier = MemoryTier::new(2, EvictionPolicy::Fifo);
        tier.insert("first", entry(60));
        std::thread::sleep(Duration::from_millis(5));
        tier.insert("second", entry(60));
        tier.get("first");

        tier.insert("third", entry(60));
        assert!(!tier.contains_live("first"));
        assert!(tier.contains_live("second"));
        assert!(tier.contains_live("third"));
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let tier = MemoryTier::new(5, EvictionPolicy::Lru);
        for i in 0..50 {
            tier.insert(&format!("key-{}", i), entry(60));
            assert!(tier.len() <= 5);
        }
        assert_eq!(tier.stats().evictions, 45);
    }

    #[test]
    fn test_promoted_old_entry_not_evicted_immediately() {
        let tier = MemoryTier::new(1, EvictionPolicy::Fifo);
        tier.insert("fresh", entry(60));

        let mut old = entry(600);
        old.created_at = Utc::now() - ChronoDuration::seconds(100);
        old.last_accessed_at = old.created_at;
        tier.insert("promoted", old);

        assert!(tier.contains_live("promoted"));
        assert!(!tier.contains_live("fresh"));
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = MemoryTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", entry(60));
        tier.insert("b", entry(60));
        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        assert_eq!(tier.clear(), 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_expired_batch_sweep() {
        let tier = MemoryTier::new(10, EvictionPolicy::Lru);
        let mut stale = entry(1);
        stale.created_at = Utc::now() - ChronoDuration::seconds(5);
        stale.last_accessed_at = stale.created_at;
        tier.insert("stale", stale);
        tier.insert("live", entry(60));

        let expired = tier.expired_keys(Utc::now());
        assert_eq!(expired, vec!["stale".to_string()]);
        assert_eq!(tier.remove_expired_batch(&expired), 1);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_remove_where() {
        let tier = MemoryTier::new(10, EvictionPolicy::Lru);
        tier.insert("GET::/a", entry(60));
        tier.insert("GET::/b", entry(60));
        tier.insert("POST::/a", entry(60));

        let mut removed = tier.remove_where(|k, _| k.starts_with("GET::"));
        removed.sort();
        assert_eq!(removed, vec!["GET::/a".to_string(), "GET::/b".to_string()]);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_concurrent_hits_not_lost() {
        let tier = Arc::new(MemoryTier::new(10, EvictionPolicy::Lru));
        tier.insert("hot", entry(60));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tier = Arc::clone(&tier);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tier.get("hot");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tier.peek("hot").unwrap().access_count, 800);
    }

    #[test]
    fn test_policy_parse_and_switch() {
        assert_eq!("LRU".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert_eq!("fifo".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Fifo);
        assert!("random".parse::<EvictionPolicy>().is_err());

        let tier = MemoryTier::new(1, EvictionPolicy::Lru);
        tier.set_policy(EvictionPolicy::Fifo);
        assert_eq!(tier.policy(), EvictionPolicy::Fifo);
    }
}
