// Lookahead queue and the single-flight guard used by preload ticks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::source::traits::MediaCandidate;

/// Holds the in-flight flag for one preload; cleared on drop.
pub struct PreloadGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PreloadGuard<'a> {
    pub fn try_new(flag: &'a AtomicBool) -> Option<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(Self { flag })
        } else {
            None
        }
    }
}

impl Drop for PreloadGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Why a preload tick did or did not add a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadTick {
    /// Stored; carries the queue length afterwards.
    Stored(usize),
    /// Not playing, hidden, loading, or enough already buffered.
    NotNeeded,
    Full,
    /// Another preload is already in flight.
    Busy,
    /// The cache was cleared or the category changed while resolving.
    Stale,
    Failed(String),
}

/// Bounded FIFO of pre-resolved candidates.
#[derive(Debug)]
pub struct LookaheadQueue {
    items: VecDeque<MediaCandidate>,
    capacity: usize,
}

impl LookaheadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append unless full; a rejected candidate is handed back.
    pub fn push(&mut self, candidate: MediaCandidate) -> Result<usize, MediaCandidate> {
        if self.is_full() {
            return Err(candidate);
        }
        self.items.push_back(candidate);
        Ok(self.items.len())
    }

    pub fn pop(&mut self) -> Option<MediaCandidate> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let first = PreloadGuard::try_new(&flag);
        assert!(first.is_some());
        assert!(PreloadGuard::try_new(&flag).is_none());
        drop(first);
        assert!(PreloadGuard::try_new(&flag).is_some());
    }

    #[test]
    fn test_queue_is_bounded_fifo() {
        let mut queue = LookaheadQueue::new(2);
        assert_eq!(queue.push(MediaCandidate::direct("a")), Ok(1));
        assert_eq!(queue.push(MediaCandidate::direct("b")), Ok(2));
        let rejected = queue.push(MediaCandidate::direct("c")).unwrap_err();
        assert_eq!(rejected.primary_url, "c");
        assert!(queue.is_full());

        assert_eq!(queue.pop().unwrap().primary_url, "a");
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
