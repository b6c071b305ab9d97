//! # Dedup
//!
//! Suppression of records whose `DedupKey` was seen within a bounded recency window.
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ConfigError;
use crate::record::{DedupKey, ValidatedRecord};
use crate::stats::ParseStats;

/// Membership set backing a `Deduplicator`.
pub trait DedupStore {
    fn contains(&self, key: &DedupKey) -> bool;
    fn insert(&mut self, key: DedupKey);
    fn remove(&mut self, key: &DedupKey);
}

impl DedupStore for HashSet<DedupKey> {
    fn contains(&self, key: &DedupKey) -> bool {
        HashSet::contains(self, key)
    }

    fn insert(&mut self, key: DedupKey) {
        HashSet::insert(self, key);
    }

    fn remove(&mut self, key: &DedupKey) {
        HashSet::remove(self, key);
    }
}

/// A store the caller keeps a handle to, so dedup state can be inspected, shared or persisted
/// after the pipeline that used it has been consumed.
#[derive(Clone, Debug, Default)]
pub struct SharedDedupStore {
    keys: Arc<Mutex<HashSet<DedupKey>>>,
}

impl SharedDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from keys remembered by a previous run.
    pub fn with_keys(keys: impl IntoIterator<Item = DedupKey>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(keys.into_iter().collect())),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashSet<DedupKey> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<DedupKey>> {
        // A panic elsewhere cannot leave a set half-updated, so the data is still usable.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DedupStore for SharedDedupStore {
    fn contains(&self, key: &DedupKey) -> bool {
        self.lock().contains(key)
    }

    fn insert(&mut self, key: DedupKey) {
        self.lock().insert(key);
    }

    fn remove(&mut self, key: &DedupKey) {
        self.lock().remove(key);
    }
}

/// Wraps a record sequence and drops records whose key is already a member of the store.
/// With a window of `W`, only the last `W` unique keys are remembered; the oldest key is
/// evicted from the queue and the store together once the window overflows.
pub struct Deduplicator<I, S = HashSet<DedupKey>> {
    inner: I,
    store: S,
    window: Option<usize>,
    order: VecDeque<DedupKey>,
    stats: Arc<ParseStats>,
}

impl<I> Deduplicator<I, HashSet<DedupKey>>
where
    I: Iterator<Item = ValidatedRecord>,
{
    /// `window = None` remembers every key seen.
    pub fn new(
        inner: I,
        window: Option<usize>,
        stats: Arc<ParseStats>,
    ) -> Result<Self, ConfigError> {
        Self::with_store(inner, window, HashSet::new(), stats)
    }
}

impl<I, S> Deduplicator<I, S>
where
    I: Iterator<Item = ValidatedRecord>,
    S: DedupStore,
{
    pub fn with_store(
        inner: I,
        window: Option<usize>,
        store: S,
        stats: Arc<ParseStats>,
    ) -> Result<Self, ConfigError> {
        if window == Some(0) {
            return Err(ConfigError::InvalidDedupWindow);
        }

        Ok(Self {
            inner,
            store,
            window,
            order: VecDeque::new(),
            stats,
        })
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn remember(&mut self, key: DedupKey) {
        let Some(window) = self.window else {
            self.store.insert(key);
            return;
        };

        self.order.push_back(key.clone());
        self.store.insert(key);

        if self.order.len() > window {
            if let Some(oldest) = self.order.pop_front() {
                self.store.remove(&oldest);
            }
        }
    }
}

impl<I, S> Iterator for Deduplicator<I, S>
where
    I: Iterator<Item = ValidatedRecord>,
    S: DedupStore,
{
    type Item = ValidatedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = self.inner.next()?;
            let key = record.dedup_key();
            if self.store.contains(&key) {
                continue;
            }

            self.remember(key);
            self.stats.record_unique();
            return Some(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cookie_suffix: u32, banner_id: u8) -> ValidatedRecord {
        ValidatedRecord {
            name: "Alice".to_owned(),
            age: 30,
            banner_id,
            cookie: format!("00000000-0000-0000-0000-{cookie_suffix:012}"),
        }
    }

    fn keys(records: &[ValidatedRecord]) -> Vec<(String, u8)> {
        records
            .iter()
            .map(|r| (r.cookie.clone(), r.banner_id))
            .collect()
    }

    #[test]
    fn test_identical_rows_yield_once() {
        let stats = Arc::new(ParseStats::new());
        let input = vec![record(1, 5), record(1, 5)];

        let out: Vec<_> = Deduplicator::new(input.into_iter(), Some(2), stats.clone())
            .unwrap()
            .collect();

        assert_eq!(out.len(), 1);
        assert_eq!(stats.unique(), 1);
    }

    #[test]
    fn test_same_cookie_different_banner_is_unique() {
        let stats = Arc::new(ParseStats::new());
        let input = vec![record(1, 5), record(1, 6), record(1, 5)];

        let out: Vec<_> = Deduplicator::new(input.into_iter(), None, stats.clone())
            .unwrap()
            .collect();

        assert_eq!(keys(&out), keys(&[record(1, 5), record(1, 6)]));
        assert_eq!(stats.unique(), 2);
    }

    #[test]
    fn test_evicted_key_is_accepted_again() {
        let stats = Arc::new(ParseStats::new());
        // Window of 2: after 1, 2, 3 the key 1 has been evicted.
        let input = vec![record(1, 1), record(2, 1), record(3, 1), record(1, 1), record(3, 1)];

        let out: Vec<_> = Deduplicator::new(input.into_iter(), Some(2), stats.clone())
            .unwrap()
            .collect();

        assert_eq!(
            keys(&out),
            keys(&[record(1, 1), record(2, 1), record(3, 1), record(1, 1)])
        );
        assert_eq!(stats.unique(), 4);
    }

    #[test]
    fn test_duplicate_does_not_refresh_recency() {
        let stats = Arc::new(ParseStats::new());
        // Seeing 1 again must not move it to the back of the queue, so 3 evicts it.
        let input = vec![record(1, 1), record(2, 1), record(1, 1), record(3, 1), record(1, 1)];

        let out: Vec<_> = Deduplicator::new(input.into_iter(), Some(2), stats)
            .unwrap()
            .collect();

        assert_eq!(
            keys(&out),
            keys(&[record(1, 1), record(2, 1), record(3, 1), record(1, 1)])
        );
    }

    #[test]
    fn test_unbounded_window_remembers_everything() {
        let stats = Arc::new(ParseStats::new());
        let mut input: Vec<_> = (0..100).map(|i| record(i, 1)).collect();
        input.extend((0..100).map(|i| record(i, 1)));

        let dedup = Deduplicator::new(input.into_iter(), None, stats.clone()).unwrap();
        assert_eq!(dedup.count(), 100);
        assert_eq!(stats.unique(), 100);
    }

    #[test]
    fn test_window_never_exceeds_size() {
        let stats = Arc::new(ParseStats::new());
        let input: Vec<_> = (0..50).map(|i| record(i, 1)).collect();

        let mut dedup = Deduplicator::new(input.into_iter(), Some(10), stats).unwrap();
        while dedup.next().is_some() {
            assert!(dedup.order.len() <= 10);
        }

        assert_eq!(dedup.into_store().len(), 10);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let result = Deduplicator::new(
            Vec::<ValidatedRecord>::new().into_iter(),
            Some(0),
            Arc::new(ParseStats::new()),
        );
        assert_eq!(result.err(), Some(ConfigError::InvalidDedupWindow));
    }

    #[test]
    fn test_shared_store_sees_evictions() {
        let stats = Arc::new(ParseStats::new());
        let store = SharedDedupStore::with_keys([DedupKey::new(record(9, 9).cookie, 9)]);
        let input = vec![record(9, 9), record(1, 1), record(2, 1), record(3, 1)];

        let out: Vec<_> = Deduplicator::with_store(input.into_iter(), Some(2), store.clone(), stats)
            .unwrap()
            .collect();

        // The pre-seeded key suppresses its record and is never evicted by the window.
        assert_eq!(out.len(), 3);
        let remaining = store.snapshot();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&record(9, 9).dedup_key()));
        assert!(!remaining.contains(&record(1, 1).dedup_key()));
        assert!(remaining.contains(&record(3, 1).dedup_key()));
    }
}
