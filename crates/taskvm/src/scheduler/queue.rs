//! Per-instance dispatch queue
//!
//! The open/closed flag and the entries live under one lock: the decision to
//! enqueue locally or forward elsewhere is made in the same critical section
//! that closing takes, so a continuation racing with shutdown lands on exactly
//! one side.

use super::Continuation;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Where a posted continuation ended up
#[derive(Debug)]
pub enum Route {
    /// Appended to the open queue
    Queued,
    /// Queue was closed; handed to the forwarder
    Forwarded,
    /// Queue was closed and the forwarder refused it
    Rejected(Continuation),
}

struct QueueState {
    entries: VecDeque<Continuation>,
    open: bool,
    /// Explicit wake without new entries (abort requests)
    notified: bool,
}

/// FIFO of continuations owned by one instance, with a wake signal
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl DispatchQueue {
    /// Create an open, empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                open: true,
                notified: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Append `continuation` if the queue is open, otherwise pass it to
    /// `forward` while the lock is still held.
    ///
    /// `forward` returns the continuation back if it cannot take it; it must
    /// not call into this queue.
    pub fn post_or_forward<F>(&self, continuation: Continuation, forward: F) -> Route
    where
        F: FnOnce(Continuation) -> Result<(), Continuation>,
    {
        let mut state = self.state.lock();
        if state.open {
            state.entries.push_back(continuation);
            self.signal.notify_one();
            return Route::Queued;
        }

        match forward(continuation) {
            Ok(()) => Route::Forwarded,
            Err(continuation) => Route::Rejected(continuation),
        }
    }

    /// Wake the waiting dispatcher without adding an entry
    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.notified = true;
        self.signal.notify_one();
    }

    /// Block until there are entries or an explicit wake, then move every
    /// queued entry into `batch` (appended in FIFO order).
    pub fn wait_and_take(&self, batch: &mut VecDeque<Continuation>) {
        let mut state = self.state.lock();
        while state.entries.is_empty() && !state.notified {
            self.signal.wait(&mut state);
        }
        state.notified = false;
        batch.append(&mut state.entries);
    }

    /// Move every queued entry into `batch` without waiting
    pub fn take(&self, batch: &mut VecDeque<Continuation>) {
        batch.append(&mut self.state.lock().entries);
    }

    /// Close the queue if it holds no entries. Returns whether it is now
    /// closed.
    ///
    /// The emptiness check and the close share the lock, so every entry that
    /// was accepted while open is still handed out by `take`.
    pub fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            return false;
        }
        state.open = false;
        true
    }

    /// Whether local enqueue is still accepted
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue has no entries
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn recording(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Continuation {
        let log = log.clone();
        Continuation::new(move || log.lock().push(value))
    }

    fn never_forward(c: Continuation) -> Result<(), Continuation> {
        Err(c)
    }

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            assert!(matches!(
                queue.post_or_forward(recording(&log, i), never_forward),
                Route::Queued
            ));
        }
        assert_eq!(queue.len(), 5);

        let mut batch = VecDeque::new();
        queue.wait_and_take(&mut batch);
        for c in batch {
            c.run();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_forwards() {
        let queue = DispatchQueue::new();
        assert!(queue.close_if_empty());
        assert!(!queue.is_open());

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        let route = queue.post_or_forward(Continuation::new(|| {}), move |c| {
            sink.lock().push(c);
            Ok(())
        });
        assert!(matches!(route, Route::Forwarded));
        assert_eq!(forwarded.lock().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_returns_rejected() {
        let queue = DispatchQueue::new();
        assert!(queue.close_if_empty());
        let route = queue.post_or_forward(Continuation::new(|| {}), never_forward);
        assert!(matches!(route, Route::Rejected(_)));
    }

    #[test]
    fn test_close_refused_while_entries_remain() {
        let queue = DispatchQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let _ = queue.post_or_forward(recording(&log, i), never_forward);
        }

        assert!(!queue.close_if_empty());
        assert!(queue.is_open());

        let mut batch = VecDeque::new();
        queue.take(&mut batch);
        for c in batch {
            c.run();
        }
        assert!(queue.close_if_empty());
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_notify_wakes_waiter_without_entries() {
        let queue = Arc::new(DispatchQueue::new());
        let q = queue.clone();
        let waiter = thread::spawn(move || {
            let mut batch = VecDeque::new();
            q.wait_and_take(&mut batch);
            batch.len()
        });

        thread::sleep(Duration::from_millis(20));
        queue.notify();
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
