//! # Dedup Set
//!
//! Process-wide memory of records already delivered, keyed by id and by the
//! raw entry hash.
//!
//! ```text
//!     ids:    DashMap<id, (seq, hash)>     ◄── the admission gate
//!     hashes: DashMap<hash, seq>           ◄── cheap "seen these bytes" check
//! ```
//!
//! `try_insert` claims the id through the map's entry API, so two workers
//! ingesting the same record cannot both see it as new. Lock order is always
//! `ids` then `hashes`, never both at once.
//!
//! Unbounded unless a capacity is set; over capacity the oldest entries are
//! evicted in one batch down to 70% of capacity.

use super::record::{RawHash, TweetRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Share of capacity kept after an eviction pass.
const EVICT_TO_PERCENT: usize = 70;

/// Concurrent set of seen record ids and raw hashes.
///
/// # Example
///
/// ```rust
/// use tweetpace::DedupSet;
///
/// let dedup = DedupSet::new();
/// assert!(dedup.is_empty());
/// ```
pub struct DedupSet {
    ids: DashMap<String, (u64, RawHash), ahash::RandomState>,
    hashes: DashMap<RawHash, u64, ahash::RandomState>,
    seq: AtomicU64,
    capacity: Option<usize>,
    evicted: AtomicU64,
    evicting: Mutex<()>,
}

impl DedupSet {
    /// Unbounded set.
    pub fn new() -> Self {
        Self {
            ids: DashMap::with_hasher(ahash::RandomState::new()),
            hashes: DashMap::with_hasher(ahash::RandomState::new()),
            seq: AtomicU64::new(0),
            capacity: None,
            evicted: AtomicU64::new(0),
            evicting: Mutex::new(()),
        }
    }

    /// Set that evicts its oldest entries once it holds more than `capacity`
    /// ids. A capacity of zero means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: (capacity > 0).then_some(capacity),
            ..Self::new()
        }
    }

    /// Whether these exact bytes were ingested before.
    pub fn contains_hash(&self, hash: &RawHash) -> bool {
        self.hashes.contains_key(hash)
    }

    /// Whether a record with this id was ingested before.
    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    /// Atomically claims `record`. Returns `false` if its id is already
    /// present, in which case nothing changes.
    pub fn try_insert(&self, record: &TweetRecord) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.ids.entry(record.id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert((seq, record.raw_hash));
            }
        }
        self.hashes.insert(record.raw_hash, seq);

        if matches!(self.capacity, Some(capacity) if self.ids.len() > capacity) {
            self.evict_oldest();
        }
        true
    }

    /// Releases `record` so a later ingest delivers it again.
    pub fn forget(&self, record: &TweetRecord) {
        if let Some((_, (_, hash))) = self.ids.remove(&record.id) {
            self.hashes.remove(&hash);
        }
        self.hashes.remove(&record.raw_hash);
    }

    /// Forgets everything; use between fetch sessions.
    pub fn reset(&self) {
        self.ids.clear();
        self.hashes.clear();
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Configured capacity, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Total ids evicted so far.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn evict_oldest(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        // One evictor at a time; others just carry on inserting.
        let Ok(_guard) = self.evicting.try_lock() else {
            return;
        };

        let target = capacity * EVICT_TO_PERCENT / 100;
        let mut entries: Vec<(u64, String, RawHash)> = self
            .ids
            .iter()
            .map(|entry| (entry.value().0, entry.key().clone(), entry.value().1))
            .collect();
        if entries.len() <= target {
            return;
        }
        entries.sort_unstable_by_key(|(seq, _, _)| *seq);

        let excess = entries.len() - target;
        for (_, id, hash) in entries.into_iter().take(excess) {
            self.ids.remove(&id);
            self.hashes.remove(&hash);
        }
        self.evicted.fetch_add(excess as u64, Ordering::Relaxed);
        info!(
            "Dedup set evicted {} oldest entries ({} remain, capacity {})",
            excess,
            self.ids.len(),
            capacity
        );
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DedupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupSet")
            .field("ids", &self.ids.len())
            .field("hashes", &self.hashes.len())
            .field("capacity", &self.capacity)
            .field("evicted", &self.evicted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    fn record(id: &str) -> TweetRecord {
        TweetRecord {
            id: id.to_string(),
            author_id: "1".to_string(),
            username: None,
            created_at: Utc::now(),
            text: format!("post {}", id),
            engagement_metrics: BTreeMap::new(),
            is_retweet: false,
            is_quote: false,
            raw_hash: RawHash::of(id.as_bytes()),
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_once() {
        let dedup = DedupSet::new();
        let r = record("1");
        assert!(dedup.try_insert(&r));
        assert!(!dedup.try_insert(&r));
        assert!(dedup.contains_id("1"));
        assert!(dedup.contains_hash(&r.raw_hash));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_forget_and_reset() {
        let dedup = DedupSet::new();
        let a = record("a");
        let b = record("b");
        dedup.try_insert(&a);
        dedup.try_insert(&b);

        dedup.forget(&a);
        assert!(!dedup.contains_id("a"));
        assert!(!dedup.contains_hash(&a.raw_hash));
        assert!(dedup.try_insert(&a));

        dedup.reset();
        assert!(dedup.is_empty());
        assert!(!dedup.contains_hash(&b.raw_hash));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dedup = DedupSet::with_capacity(10);
        for i in 0..11 {
            assert!(dedup.try_insert(&record(&i.to_string())));
        }
        // 11 > 10 triggers one pass down to 7.
        assert_eq!(dedup.len(), 7);
        assert_eq!(dedup.evicted(), 4);
        assert!(!dedup.contains_id("0"));
        assert!(!dedup.contains_id("3"));
        assert!(dedup.contains_id("4"));
        assert!(dedup.contains_id("10"));
        assert_eq!(DedupSet::with_capacity(0).capacity(), None);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let dedup = Arc::new(DedupSet::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                thread::spawn(move || {
                    (0..100)
                        .filter(|i| dedup.try_insert(&record(&i.to_string())))
                        .count()
                })
            })
            .collect();

        let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(claimed, 100);
        assert_eq!(dedup.len(), 100);
    }
}
