//! Fixed-capacity ring buffer that overwrites the oldest entry when full.
//!
//! Used for bounded telemetry windows (latencies, error history) where only
//! the most recent `capacity` samples matter.

use std::collections::VecDeque;

/// Circular buffer backed by a [`VecDeque`].
///
/// A capacity of zero is clamped to one so `push` always retains the newest
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `value`, returning the evicted oldest item when the buffer was
    /// full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.buf.len() >= self.capacity { self.buf.pop_front() } else { None };
        self.buf.push_back(value);
        evicted
    }

    /// Most recently pushed item.
    #[inline]
    #[must_use]
    pub fn latest(&self) -> Option<&T> {
        self.buf.back()
    }

    /// Oldest retained item.
    #[inline]
    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.buf.front()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity, dropping the oldest items if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
    }

    /// Removes all elements, leaving the capacity unchanged.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Iterates from oldest to newest.
    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buf.iter()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.buf.iter()
    }
}
