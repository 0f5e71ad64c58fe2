#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::must_use_candidate,
)]

//! Monotonic deadlines plus a `VecDeque` of entries ordered by deadline.

use std::collections::vec_deque::Iter;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the monotonic clock since the first call in this process.
///
/// The value never goes backwards, so it is safe to use as a deadline key.
#[must_use]
pub fn now() -> u64 {
    u64::try_from(epoch().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// `now()` plus `dur`, saturating at `u64::MAX`.
#[must_use]
pub fn get_timeout_time(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos())
        .map(|d| d.saturating_add(now()))
        .unwrap_or(u64::MAX)
}

/// The time left until `timestamp`, zero if it already passed.
#[must_use]
pub fn time_left(timestamp: u64) -> Duration {
    Duration::from_nanos(timestamp.saturating_sub(now()))
}

/// All items that share one deadline.
#[derive(Debug, Eq, PartialEq)]
pub struct TimerEntry<T> {
    timestamp: u64,
    inner: VecDeque<T>,
}

impl<T> TimerEntry<T> {
    /// Creates an empty entry for `timestamp`.
    #[must_use]
    pub fn new(timestamp: u64) -> Self {
        TimerEntry {
            timestamp,
            inner: VecDeque::new(),
        }
    }

    /// Returns the number of items due at this deadline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no item is due at this deadline.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the deadline.
    #[must_use]
    pub fn get_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Removes the first item and returns it, or `None` if the entry is empty.
    pub fn pop_front(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Appends an item to the back of the entry.
    pub fn push_back(&mut self, t: T) {
        self.inner.push_back(t);
    }

    /// Removes the first item matching `predicate`.
    pub fn remove_where<F>(&mut self, predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.inner.iter().position(predicate)?;
        self.inner.remove(index)
    }

    /// Returns a front-to-back iterator.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        self.inner.iter()
    }
}

impl<T> IntoIterator for TimerEntry<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Entries kept sorted by ascending deadline.
#[derive(Debug, PartialEq, Eq)]
pub struct TimerList<T>(VecDeque<TimerEntry<T>>);

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        TimerList(VecDeque::new())
    }
}

impl<T> TimerList<T> {
    /// Returns the number of distinct deadlines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Adds `t` under `timestamp`, creating the entry if the deadline is new.
    pub fn insert(&mut self, timestamp: u64, t: T) {
        match self.0.binary_search_by(|x| x.timestamp.cmp(&timestamp)) {
            Ok(index) => self.0[index].push_back(t),
            Err(index) => {
                let mut entry = TimerEntry::new(timestamp);
                entry.push_back(t);
                self.0.insert(index, entry);
            }
        }
    }

    /// Provides a reference to the earliest entry, or `None` if the list is empty.
    #[must_use]
    pub fn front(&self) -> Option<&TimerEntry<T>> {
        self.0.front()
    }

    /// Removes the earliest entry and returns it, or `None` if the list is empty.
    pub fn pop_front(&mut self) -> Option<TimerEntry<T>> {
        self.0.pop_front()
    }

    /// Removes the earliest entry if its deadline is not after `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<TimerEntry<T>> {
        if self.0.front()?.timestamp <= now {
            return self.0.pop_front();
        }
        None
    }

    /// Returns `true` if no entry holds an item.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(TimerEntry::is_empty)
    }

    /// Provides a mutable reference to the entry at exactly `timestamp`.
    pub fn get_entry(&mut self, timestamp: &u64) -> Option<&mut TimerEntry<T>> {
        let index = self
            .0
            .binary_search_by(|x| x.timestamp.cmp(timestamp))
            .ok()?;
        self.0.get_mut(index)
    }

    /// Removes and returns the entry at exactly `timestamp`.
    pub fn remove(&mut self, timestamp: &u64) -> Option<TimerEntry<T>> {
        let index = self
            .0
            .binary_search_by(|x| x.timestamp.cmp(timestamp))
            .ok()?;
        self.0.remove(index)
    }

    /// Removes the first item at `timestamp` matching `predicate`. The entry
    /// goes away with its last item.
    pub fn remove_where<F>(&mut self, timestamp: &u64, predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let entry = self.get_entry(timestamp)?;
        let item = entry.remove_where(predicate)?;
        if entry.is_empty() {
            _ = self.remove(timestamp);
        }
        Some(item)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns a front-to-back iterator.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, TimerEntry<T>> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let first = now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(now() > first);
        assert!(get_timeout_time(Duration::from_secs(1)) > now());
        assert_eq!(time_left(0), Duration::ZERO);
    }

    #[test]
    fn timer_list() {
        let mut list = TimerList::default();
        assert_eq!(list.len(), 0);
        list.insert(1, String::from("data is typed"));
        assert_eq!(list.len(), 1);

        let mut entry = list.pop_front().unwrap();
        assert_eq!(entry.len(), 1);
        let string = entry.pop_front().unwrap();
        assert_eq!(string, String::from("data is typed"));
    }

    #[test]
    fn insert_keeps_deadlines_apart() {
        let mut list = TimerList::default();
        list.insert(30, "c");
        list.insert(10, "a");
        list.insert(20, "b");
        list.insert(10, "a2");
        assert_eq!(list.len(), 3);
        let order: Vec<u64> = list.iter().map(TimerEntry::get_timestamp).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert_eq!(list.get_entry(&10).map(|e| e.len()), Some(2));
        assert!(list.get_entry(&15).is_none());
    }

    #[test]
    fn pop_expired() {
        let mut list = TimerList::default();
        list.insert(5, 1);
        list.insert(50, 2);
        assert!(list.pop_expired(4).is_none());
        let entry = list.pop_expired(10).unwrap();
        assert_eq!(entry.into_iter().collect::<Vec<_>>(), vec![1]);
        assert!(list.pop_expired(10).is_none());
        assert!(list.remove(&50).is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn remove_where() {
        let mut entry = TimerEntry::new(1);
        entry.push_back(1);
        entry.push_back(2);
        assert_eq!(entry.remove_where(|x| *x == 2), Some(2));
        assert_eq!(entry.remove_where(|x| *x == 3), None);
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn remove_item_from_list() {
        let mut list = TimerList::default();
        list.insert(10, 1);
        list.insert(10, 2);
        list.insert(20, 3);
        assert_eq!(list.remove_where(&10, |x| *x == 1), Some(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list.remove_where(&10, |x| *x == 1), None);
        assert_eq!(list.remove_where(&15, |_| true), None);
        assert_eq!(list.remove_where(&10, |x| *x == 2), Some(2));
        assert_eq!(list.len(), 1);
        assert_eq!(list.front().map(TimerEntry::get_timestamp), Some(20));
    }
}
