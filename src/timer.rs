//! Timer store (§4.1), grounded on the original `frame/timestore.hpp`.
//!
//! A flat vector of `(deadline, value)` pairs with a cached minimum deadline.
//! Swap-remove keeps `pop` O(1); a single linear scan handles expiry. This
//! beats a heap for the reactor's typical load: few pending timeouts
//! relative to active objects.

use crate::clock::Instant;

struct Entry<V> {
    deadline: Instant,
    value: V,
}

/// Stores `(deadline, value)` pairs and tracks the minimum deadline.
pub struct TimerStore<V> {
    entries: Vec<Entry<V>>,
    min_deadline: Instant,
}

impl<V> TimerStore<V> {
    pub fn with_capacity(cap: usize) -> Self {
        TimerStore {
            entries: Vec::with_capacity(cap),
            min_deadline: Instant::NEVER,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, returning its index. Updates the cached minimum.
    pub fn push(&mut self, deadline: Instant, value: V) -> usize {
        let idx = self.entries.len();
        if deadline < self.min_deadline {
            self.min_deadline = deadline;
        }
        self.entries.push(Entry { deadline, value });
        idx
    }

    /// Overwrite the deadline at `idx`. Caller is responsible for calling
    /// [`Self::recompute_min`] afterwards if the new deadline might raise
    /// the minimum (lowering it is handled automatically).
    pub fn change(&mut self, idx: usize, deadline: Instant) {
        if deadline < self.min_deadline {
            self.min_deadline = deadline;
        }
        self.entries[idx].deadline = deadline;
    }

    /// Swap-remove the entry at `idx`. If a different entry moved into the
    /// freed slot, `relocate` is called with `(new_index, old_index)`.
    pub fn pop_by_index<F>(&mut self, idx: usize, relocate: F)
    where
        F: FnOnce(usize, usize),
    {
        let old_idx = self.entries.len() - 1;
        self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            relocate(idx, old_idx);
        }
        self.recompute_min();
    }

    /// Single pass over all entries: every entry with `deadline <= now` is
    /// reported via `on_expire(index, &value)` and swap-removed; entries
    /// that moved because of the swap-remove are reported via
    /// `on_relocate(new_index, old_index)`. Recomputes the cached minimum
    /// from survivors.
    pub fn pop_expired<FExpire, FRelocate>(
        &mut self,
        now: Instant,
        mut on_expire: FExpire,
        mut on_relocate: FRelocate,
    ) where
        FExpire: FnMut(usize, &V),
        FRelocate: FnMut(usize, usize),
    {
        let mut i = 0;
        let mut crt_min = Instant::NEVER;
        while i < self.entries.len() {
            if self.entries[i].deadline <= now {
                on_expire(i, &self.entries[i].value);
                let old_idx = self.entries.len() - 1;
                self.entries.swap_remove(i);
                if i < self.entries.len() {
                    on_relocate(i, old_idx);
                }
                // do not advance i: a new entry now occupies slot i
            } else {
                if self.entries[i].deadline < crt_min {
                    crt_min = self.entries[i].deadline;
                }
                i += 1;
            }
        }
        self.min_deadline = crt_min;
    }

    /// Minimum deadline across all entries, or [`Instant::NEVER`] if empty.
    pub fn next(&self) -> Instant {
        self.min_deadline
    }

    fn recompute_min(&mut self) {
        self.min_deadline = self
            .entries
            .iter()
            .map(|e| e.deadline)
            .min()
            .unwrap_or(Instant::NEVER);
    }

    /// The value stored at `idx`. Used by callers that need to fix up their
    /// own back-pointers after a relocation reported by `pop_by_index`.
    pub fn value(&self, idx: usize) -> &V {
        &self.entries[idx].value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_tracks_minimum() {
        let mut ts: TimerStore<&str> = TimerStore::with_capacity(4);
        ts.push(Instant::new(10, 0), "a");
        ts.push(Instant::new(5, 0), "b");
        ts.push(Instant::new(20, 0), "c");
        assert_eq!(ts.next(), Instant::new(5, 0));
    }

    #[test]
    fn empty_store_next_is_never() {
        let ts: TimerStore<u32> = TimerStore::with_capacity(0);
        assert_eq!(ts.next(), Instant::NEVER);
    }

    #[test]
    fn pop_by_index_relocates() {
        let mut ts: TimerStore<u32> = TimerStore::with_capacity(4);
        ts.push(Instant::new(1, 0), 100);
        ts.push(Instant::new(2, 0), 200);
        ts.push(Instant::new(3, 0), 300);
        let mut relocated = None;
        ts.pop_by_index(0, |new_idx, old_idx| relocated = Some((new_idx, old_idx)));
        assert_eq!(relocated, Some((0, 2)));
        assert_eq!(*ts.value(0), 300);
    }

    #[test]
    fn pop_expired_fires_in_one_pass_and_recomputes_min() {
        let mut ts: TimerStore<u32> = TimerStore::with_capacity(4);
        ts.push(Instant::new(1, 0), 1);
        ts.push(Instant::new(2, 0), 2);
        ts.push(Instant::new(10, 0), 3);
        let mut expired = Vec::new();
        ts.pop_expired(
            Instant::new(5, 0),
            |_idx, v| expired.push(*v),
            |_new, _old| {},
        );
        expired.sort();
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(ts.len(), 1);
        assert_eq!(ts.next(), Instant::new(10, 0));
    }

    #[test]
    fn exact_equal_deadline_expires() {
        let mut ts: TimerStore<u32> = TimerStore::with_capacity(1);
        ts.push(Instant::new(5, 0), 42);
        let mut expired = Vec::new();
        ts.pop_expired(Instant::new(5, 0), |_idx, v| expired.push(*v), |_, _| {});
        assert_eq!(expired, vec![42]);
    }
}
