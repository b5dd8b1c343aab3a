use std::collections::vec_deque;
use std::collections::VecDeque;

use serde::Serialize;

/// Insertion-ordered sequence holding at most `capacity` items.
///
/// Pushing past capacity evicts from the front, oldest first. Survivors keep
/// their relative order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BoundedCollection<T> {
    #[serde(skip)]
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedCollection<T> {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append and return whatever had to be evicted to stay within capacity.
    pub fn push(&mut self, item: T) -> Vec<T> {
        self.items.push_back(item);
        self.evict_overflow()
    }

    /// Replace the contents, keeping the most recent `capacity` items.
    pub fn replace_all(&mut self, items: impl IntoIterator<Item = T>) {
        self.items = items.into_iter().collect();
        self.evict_overflow();
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> vec_deque::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn find_mut(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.items.iter_mut().find(|item| predicate(item))
    }

    /// The most recent `n` items, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }

    fn evict_overflow(&mut self) -> Vec<T> {
        let overflow = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..overflow).collect()
    }
}

impl<T: Clone> BoundedCollection<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a BoundedCollection<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
