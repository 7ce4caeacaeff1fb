//! Message queues between I/O threads and the frame loop.
//!
//! Two unbounded FIFO queues decouple blocking I/O from the game's
//! single-threaded frame loop: the outbound queue carries serialized state
//! toward the advisor, the inbound queue carries advisor lines and viewer
//! messages toward the frame loop. Producers never block. Consumers either
//! drain what is available (frame loop) or block with an optional timeout
//! (pump writer, startup handshake).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::broadcast::ConnectionId;

/// Where an inbound message came from.
///
/// The frame loop applies every message the same way; origin only decides
/// where a command error is echoed and lets a failed start purge its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A line read from the advisor's stdout. `generation` increments on
    /// every launch so lines from an abandoned attempt can be told apart.
    Advisor { generation: u64 },
    /// A text frame from an overlay viewer.
    Viewer(ConnectionId),
}

/// One inbound item: opaque text plus its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub origin: Origin,
    pub text: String,
}

impl InboundMessage {
    pub fn new(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            origin,
            text: text.into(),
        }
    }
}

/// Frame loop → advisor.
pub type OutboundQueue = MessageQueue<String>;
/// Advisor / viewers → frame loop.
pub type InboundQueue = MessageQueue<InboundMessage>;

/// Unbounded, thread-safe FIFO queue.
///
/// Cloning yields another handle to the same queue. Closing wakes every
/// blocked consumer; after that all pops return `None` and pushes are
/// dropped, which is how the pump writer is interrupted.
#[derive(Debug)]
pub struct MessageQueue<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    // Every mutation is a single VecDeque call, so a poisoned lock still
    // guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Returns `false` (and drops the item) if the queue
    /// has been closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.inner.available.notify_one();
        true
    }

    /// Pop the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Block until an item is available or the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self
                .inner
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout` waiting for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_matching_timeout(timeout, |_| true)
    }

    /// Block for at most `timeout` waiting for the oldest item that satisfies
    /// `matches`. Non-matching items stay queued in their original order.
    pub fn pop_matching_timeout<F>(&self, timeout: Duration, mut matches: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(index) = state.items.iter().position(&mut matches) {
                return state.items.remove(index);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        if state.closed {
            return Vec::new();
        }
        state.items.drain(..).collect()
    }

    /// Keep only the items for which `keep` returns true.
    pub fn retain<F>(&self, keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.lock().items.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Close the queue and wake all blocked consumers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.inner.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn try_pop_on_empty_returns_none() {
        let queue: MessageQueue<String> = MessageQueue::new();
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_another_thread_pushes() {
        let queue = MessageQueue::new();
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push("late".to_string());
        });

        assert_eq!(queue.pop().as_deref(), Some("late"));
        handle.join().unwrap();
    }

    #[test]
    fn pop_timeout_gives_up_after_deadline() {
        let queue: MessageQueue<u32> = MessageQueue::new();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(100)).is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "returned late: {elapsed:?}");
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue: MessageQueue<String> = MessageQueue::new();
        let consumer = queue.clone();

        let handle = thread::spawn(move || consumer.pop());
        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert!(handle.join().unwrap().is_none());
        assert!(queue.is_closed());
        assert!(!queue.push("dropped".to_string()));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_matching_leaves_other_items_in_order() {
        let queue = MessageQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.push(4);

        let even = queue.pop_matching_timeout(Duration::from_millis(10), |n| n % 2 == 0);
        assert_eq!(even, Some(2));
        assert_eq!(queue.drain(), vec![1, 3, 4]);
    }

    #[test]
    fn pop_matching_waits_for_a_match() {
        let queue = MessageQueue::new();
        let producer = queue.clone();
        queue.push("viewer");

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push("advisor");
        });

        let found =
            queue.pop_matching_timeout(Duration::from_secs(2), |item| *item == "advisor");
        handle.join().unwrap();
        assert_eq!(found, Some("advisor"));
        assert_eq!(queue.drain(), vec!["viewer"]);
    }

    #[test]
    fn retain_filters_by_origin() {
        let queue = InboundQueue::new();
        queue.push(InboundMessage::new(Origin::Advisor { generation: 1 }, "old"));
        queue.push(InboundMessage::new(Origin::Viewer(ConnectionId(7)), "cmd"));
        queue.push(InboundMessage::new(Origin::Advisor { generation: 2 }, "new"));

        queue.retain(|m| m.origin != Origin::Advisor { generation: 1 });

        let texts: Vec<_> = queue.drain().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["cmd", "new"]);
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        let queue = MessageQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..100 {
                        queue.push((producer, seq));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let items = queue.drain();
        assert_eq!(items.len(), 400);
        for producer in 0..4 {
            let seqs: Vec<_> = items
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..100).collect::<Vec<_>>());
        }
    }

    proptest! {
        #[test]
        fn pop_order_matches_push_order(items in proptest::collection::vec(".*", 0..64)) {
            let queue = MessageQueue::new();
            for item in &items {
                queue.push(item.clone());
            }
            let mut popped = Vec::new();
            while let Some(item) = queue.try_pop() {
                popped.push(item);
            }
            prop_assert_eq!(popped, items);
        }
    }
}
