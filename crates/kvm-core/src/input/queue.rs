//! Bounded outbound input queue with mouse-move coalescing.
//!
//! # Drop policy (for beginners)
//!
//! A user can tolerate a pointer that skips a few intermediate positions, but
//! never a lost key release or a click that silently vanishes. The queue
//! therefore sorts events into two classes:
//!
//! - **Pointer moves** (no button edge, no wheel step) are lossy. A new move
//!   replaces a move still waiting at the tail, and when the queue is full the
//!   oldest waiting move is evicted to make room.
//! - **Everything else** (keys, button edges, wheel) is never dropped. When the
//!   queue is full of such events the producer has to wait for the session to
//!   drain it.
//!
//! Order between the events that do get sent is always the capture order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::protocol::InputEvent;

/// How the queue handled a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended at the tail.
    Queued,
    /// Replaced a pointer move waiting at the tail.
    Coalesced,
    /// Appended after evicting the oldest waiting pointer move.
    EvictedOlderMove,
    /// The queue was full of non-droppable events; this pointer move was discarded.
    DroppedMove,
}

/// The event could not be queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The queue is full of non-droppable events. The event is handed back.
    #[error("input queue is full")]
    Full(InputEvent),
    /// The session is gone.
    #[error("input queue is closed")]
    Closed(InputEvent),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub coalesced: u64,
    pub dropped_moves: u64,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<InputEvent>,
    closed: bool,
    stats: QueueStats,
}

/// Shared between one or more producers and the session worker.
#[derive(Debug)]
pub struct InputQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when an event becomes available or the queue closes.
    ready: Notify,
    /// Signalled when space frees up or the queue closes.
    space: Notify,
}

impl InputQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                closed: false,
                stats: QueueStats::default(),
            }),
            capacity,
            ready: Notify::new(),
            space: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Queues `event` without waiting.
    ///
    /// # Errors
    ///
    /// [`PushError::Full`] when a non-droppable event meets a queue holding no
    /// pointer moves, [`PushError::Closed`] after [`close`](Self::close).
    pub fn try_push(&self, event: InputEvent) -> Result<PushOutcome, PushError> {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed(event));
            }
            let outcome = Self::place(&mut state, event, self.capacity)?;
            match outcome {
                PushOutcome::Queued => state.stats.queued += 1,
                PushOutcome::Coalesced => state.stats.coalesced += 1,
                PushOutcome::EvictedOlderMove => {
                    state.stats.queued += 1;
                    state.stats.dropped_moves += 1;
                }
                PushOutcome::DroppedMove => state.stats.dropped_moves += 1,
            }
            outcome
        };
        if outcome != PushOutcome::DroppedMove {
            self.ready.notify_one();
        }
        Ok(outcome)
    }

    fn place(state: &mut QueueState, event: InputEvent, capacity: usize) -> Result<PushOutcome, PushError> {
        let events = &mut state.events;

        if event.is_pointer_move() {
            if let Some(tail) = events.back_mut() {
                if tail.is_pointer_move() {
                    *tail = event;
                    return Ok(PushOutcome::Coalesced);
                }
            }
        }

        if events.len() < capacity {
            events.push_back(event);
            return Ok(PushOutcome::Queued);
        }

        match events.iter().position(InputEvent::is_pointer_move) {
            Some(oldest_move) => {
                events.remove(oldest_move);
                events.push_back(event);
                Ok(PushOutcome::EvictedOlderMove)
            }
            None if event.is_pointer_move() => Ok(PushOutcome::DroppedMove),
            None => Err(PushError::Full(event)),
        }
    }

    /// Queues `event`, waiting for space if the queue is full of
    /// non-droppable events.
    ///
    /// # Errors
    ///
    /// [`PushError::Closed`] if the session closes first.
    pub async fn push(&self, mut event: InputEvent) -> Result<PushOutcome, PushError> {
        loop {
            let space = self.space.notified();
            match self.try_push(event) {
                Err(PushError::Full(returned)) => {
                    event = returned;
                    space.await;
                }
                other => return other,
            }
        }
    }

    /// Removes the oldest event without waiting.
    pub fn try_pop(&self) -> Option<InputEvent> {
        let event = self.lock().events.pop_front();
        if event.is_some() {
            self.space.notify_one();
        }
        event
    }

    /// Waits for the next event. Returns `None` once the queue is closed.
    ///
    /// Cancel-safe: an event is only removed when this future completes.
    pub async fn pop(&self) -> Option<InputEvent> {
        loop {
            let ready = self.ready.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            ready.await;
        }
    }

    /// Closes the queue and discards whatever is still waiting.
    /// Returns how many events were discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            let n = state.events.len();
            state.events.clear();
            n
        };
        self.ready.notify_waiters();
        self.space.notify_waiters();
        discarded
    }
}
