//! Bounded in-memory work queue with rendezvous handoff at capacity zero.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::{QueuedTask, TaskId};

/// FIFO queue between admission and the workers.
///
/// Capacity zero is a rendezvous: an enqueue succeeds only while a
/// dequeuer is parked, so every entry is handed off directly.
pub(crate) struct BoundedQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    items_ready: Notify,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedTask>,
    /// Dequeuers currently parked waiting for an item.
    parked: usize,
    closed: bool,
}

pub(crate) enum EnqueueRejected {
    /// No room under the capacity rule; the entry is handed back.
    Full(QueuedTask),
    /// The queue no longer accepts work; the entry is handed back.
    Closed(QueuedTask),
}

pub(crate) enum Dequeued {
    Entry(QueuedTask),
    /// Closed and empty; the caller should retire.
    Closed,
}

/// Undoes the parked count when a dequeue future is dropped mid-wait,
/// otherwise an abandoned dequeuer would leave phantom rendezvous room.
struct ParkedGuard<'a> {
    queue: &'a BoundedQueue,
    armed: bool,
}

impl ParkedGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.state.lock().parked -= 1;
        }
    }
}

impl BoundedQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::default(),
            items_ready: Notify::new(),
        }
    }

    fn has_room(&self, state: &QueueState) -> bool {
        if self.capacity == 0 {
            state.parked > state.items.len()
        } else {
            state.items.len() < self.capacity
        }
    }

    /// Enqueue without waiting. Full and Closed hand the entry back.
    pub(crate) fn try_enqueue(&self, entry: QueuedTask) -> Result<(), EnqueueRejected> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EnqueueRejected::Closed(entry));
        }
        if !self.has_room(&state) {
            return Err(EnqueueRejected::Full(entry));
        }
        state.items.push_back(entry);
        drop(state);
        self.items_ready.notify_one();
        Ok(())
    }

    /// Take the oldest entry, waiting for one to arrive.
    pub(crate) async fn dequeue(&self) -> Dequeued {
        let mut park: Option<ParkedGuard<'_>> = None;
        loop {
            let notified = self.items_ready.notified();
            tokio::pin!(notified);
            // Register before re-checking state so a wakeup landing between
            // the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.items.pop_front() {
                    if let Some(guard) = park.as_mut() {
                        // Unpark under the same lock as the pop so a producer
                        // never sees phantom rendezvous room.
                        state.parked -= 1;
                        guard.disarm();
                    }
                    return Dequeued::Entry(entry);
                }
                if state.closed {
                    if let Some(guard) = park.as_mut() {
                        state.parked -= 1;
                        guard.disarm();
                    }
                    return Dequeued::Closed;
                }
                // A parked dequeuer is the rendezvous room at capacity zero.
                if park.is_none() {
                    state.parked += 1;
                    park = Some(ParkedGuard {
                        queue: self,
                        armed: true,
                    });
                }
            }
            notified.await;
        }
    }

    /// Stop accepting entries. Pending entries stay dequeueable.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.items_ready.notify_waiters();
    }

    /// Remove every pending entry and return them in FIFO order.
    pub(crate) fn clear(&self) -> Vec<QueuedTask> {
        self.state.lock().items.drain(..).collect()
    }

    /// Purge one entry by id. False when it was no longer queued.
    pub(crate) fn remove(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let before = state.items.len();
        state.items.retain(|entry| entry.id() != id);
        state.items.len() < before
    }

    /// Take the oldest entry without waiting.
    pub(crate) fn pop_oldest(&self) -> Option<QueuedTask> {
        self.state.lock().items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Queued count as observers should see it. An entry staged mid-handoff
    /// at capacity zero is on its way to a worker, not waiting; `len`
    /// reports the raw staging count for retirement checks.
    pub(crate) fn backlog(&self) -> usize {
        self.state.lock().items.len().min(self.capacity)
    }

    /// Closed with nothing left to hand out.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }
}
