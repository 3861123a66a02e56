use crate::{EntryKey, Error};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// The set of not-yet-delivered, not-yet-removed entries, ordered by deadline.
///
/// Backed by a `BTreeMap` keyed on `(deadline, sequence)`, so the minimum is
/// always the next entry due and equal deadlines resolve in insertion order.
/// The store hands out the sequence numbers itself; callers never construct an
/// `EntryKey` directly.
pub(crate) struct DeadlineStore<T> {
    entries: BTreeMap<EntryKey, T>,
    /// Monotonic insertion counter, never reused.
    next_sequence: u64,
}

impl<T> DeadlineStore<T> {
    pub fn new() -> Self {
        DeadlineStore {
            entries: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Inserts a value due at `deadline` and returns its key. Entries are
    /// never deduplicated; equal values and deadlines coexist independently.
    pub fn insert(&mut self, value: T, deadline: Instant) -> EntryKey {
        let key = EntryKey::new(deadline, self.next_sequence);
        self.next_sequence += 1;
        self.entries.insert(key, value);
        key
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove(&mut self, key: &EntryKey) -> Result<T, Error> {
        self.entries.remove(key).ok_or(Error::UnknownEntry)
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes and returns the entry with the smallest deadline.
    pub fn pop_first(&mut self) -> Option<(EntryKey, T)> {
        self.entries.pop_first()
    }

    /// The smallest deadline currently in the store, if any.
    pub fn peek_first(&self) -> Option<EntryKey> {
        self.entries.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every entry without yielding any of them.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn now_plus(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut store = DeadlineStore::new();
        store.insert("late", now_plus(30));
        store.insert("early", now_plus(10));
        store.insert("middle", now_plus(20));

        assert_eq!(store.len(), 3);
        assert_eq!(store.pop_first().map(|(_, v)| v), Some("early"));
        assert_eq!(store.pop_first().map(|(_, v)| v), Some("middle"));
        assert_eq!(store.pop_first().map(|(_, v)| v), Some("late"));
        assert_eq!(store.pop_first().map(|(_, v)| v), None);
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let deadline = now_plus(10);
        let mut store = DeadlineStore::new();
        store.insert(1, deadline);
        store.insert(2, deadline);
        store.insert(3, deadline);

        assert_eq!(store.pop_first().map(|(_, v)| v), Some(1));
        assert_eq!(store.pop_first().map(|(_, v)| v), Some(2));
        assert_eq!(store.pop_first().map(|(_, v)| v), Some(3));
    }

    #[test]
    fn remove_returns_the_value() {
        let mut store = DeadlineStore::new();
        let key = store.insert("value", now_plus(10));
        assert!(store.contains(&key));
        assert_eq!(store.remove(&key), Ok("value"));
        assert!(!store.contains(&key));
    }

    #[test]
    fn remove_unknown_key_errors() {
        let mut store = DeadlineStore::new();
        let key = store.insert((), now_plus(10));
        assert_eq!(store.remove(&key), Ok(()));
        assert_eq!(store.remove(&key), Err(Error::UnknownEntry));
    }

    #[test]
    fn identical_values_are_independent_entries() {
        let deadline = now_plus(5);
        let mut store = DeadlineStore::new();
        let a = store.insert("same", deadline);
        let b = store.insert("same", deadline);
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);

        store.remove(&a).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&b));
    }

    #[test]
    fn peek_does_not_remove() {
        let mut store = DeadlineStore::new();
        let key = store.insert("value", now_plus(10));
        assert_eq!(store.peek_first(), Some(key));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_empties_the_store() {
        let mut store = DeadlineStore::new();
        store.insert(1, now_plus(1));
        store.insert(2, now_plus(2));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.peek_first(), None);
    }
}
