//! Per-direction sequence numbering and replay protection.
//!
//! # Why two types? (for beginners)
//!
//! Each direction of a session has its own sequence space:
//!
//! - The **sender** stamps every outgoing message with the next value from its
//!   [`SequenceCounter`]. The first message is `1`.
//! - The **receiver** keeps a [`ReplayGuard`] holding the highest value it has
//!   accepted so far. Anything not strictly greater is a duplicate or arrived
//!   out of order, and is dropped without touching any session state.
//!
//! Both live inside the single task that owns the connection, so neither needs
//! atomics or locks.

/// Monotonic counter for outbound sequence numbers.
///
/// # Examples
///
/// ```rust
/// use kvm_core::protocol::SequenceCounter;
///
/// let mut counter = SequenceCounter::new();
/// assert_eq!(counter.next(), Some(1));
/// assert_eq!(counter.next(), Some(2));
/// assert_eq!(counter.last(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    last: u32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number, or `None` once the 32-bit space is
    /// used up. Wrapping would break the receiver's ordering check, so an
    /// exhausted session must be torn down and re-established instead.
    pub fn next(&mut self) -> Option<u32> {
        let next = self.last.checked_add(1)?;
        self.last = next;
        Some(next)
    }

    /// The most recently issued number (`0` before the first message).
    pub fn last(&self) -> u32 {
        self.last
    }
}

/// Receive-side ordering check.
#[derive(Debug, Default, Clone)]
pub struct ReplayGuard {
    last_seen: u32,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `seq` if it is strictly greater than everything seen so far.
    ///
    /// Returns `false` for duplicates and regressions; the guard is left
    /// unchanged in that case.
    pub fn accept(&mut self, seq: u32) -> bool {
        if seq > self.last_seen {
            self.last_seen = seq;
            true
        } else {
            false
        }
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }
}
