//! Message id allocation.
//!
//! Request ids must be nonzero (0 is reserved for server-originated messages)
//! and unique within a connection.  [`MessageIdCounter`] hands them out from an
//! atomic counter so that concurrent callers never observe the same id.

use std::sync::atomic::{AtomicU32, Ordering};

/// Thread-safe, strictly increasing message id generator starting at 1.
///
/// # Example
///
/// ```rust
/// use tactile_core::protocol::sequence::MessageIdCounter;
///
/// let counter = MessageIdCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct MessageIdCounter {
    value: AtomicU32,
}

impl MessageIdCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a counter whose first id is `first`.  A `first` of 0 is bumped to 1.
    pub fn starting_at(first: u32) -> Self {
        Self {
            value: AtomicU32::new(first.max(1)),
        }
    }

    /// Returns the next id and advances the counter.
    ///
    /// On wrap-around the reserved id 0 is skipped.
    pub fn next(&self) -> u32 {
        loop {
            let id = self.value.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Returns the id the next call to [`next`](Self::next) would hand out.
    pub fn peek(&self) -> u32 {
        self.value.load(Ordering::Relaxed).max(1)
    }
}

impl Default for MessageIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_first_id_is_one() {
        // Arrange
        let counter = MessageIdCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let counter = MessageIdCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_wraparound_skips_reserved_zero() {
        // Arrange
        let counter = MessageIdCounter::starting_at(u32::MAX);

        // Act
        let last = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(last, u32::MAX);
        assert_eq!(after_wrap, 1, "0 is reserved and must be skipped");
    }

    #[test]
    fn test_peek_does_not_advance() {
        let counter = MessageIdCounter::starting_at(5);
        assert_eq!(counter.peek(), 5);
        assert_eq!(counter.next(), 5);
        assert_eq!(counter.peek(), 6);
    }

    #[test]
    fn test_concurrent_callers_never_share_an_id() {
        // Arrange
        let counter = Arc::new(MessageIdCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..250).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();
        let ids: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Assert
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 1000);
        assert!(!unique.contains(&0));
    }
}
