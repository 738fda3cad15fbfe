//! Deduplicating, rate limited work queue.
//!
//! Items are level triggered: adding an item that is already pending is a
//! no-op, and adding an item that is being processed marks it to be handed
//! out once more after [`WorkQueue::done`]. A given item is never handed to
//! two callers of [`WorkQueue::get`] at the same time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::*;

pub mod rate_limiter;

pub use rate_limiter::{ExponentialBackoff, FastSlowBackoff, MaxOf, RateLimiter, default_rate_limiter};

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl<T> Eq for Waiting<T> {}
impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Waiting<T> {
    // Reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    /// FIFO of items ready to be handed out; always a subset of `dirty`
    queue: VecDeque<T>,
    /// Items that need processing
    dirty: HashSet<T>,
    /// Items currently held by a `get` caller
    processing: HashSet<T>,
    /// Backoff requeues, earliest first. Entries whose deadline no longer
    /// matches `deadlines` are stale and skipped.
    waiting: BinaryHeap<Waiting<T>>,
    deadlines: HashMap<T, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> QueueState<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            deadlines: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the item became ready to hand out.
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = self.waiting.pop() else { break };
            if self.deadlines.get(&w.item) == Some(&w.ready_at) {
                self.deadlines.remove(&w.item);
                self.insert(w.item);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Display + 'static,
{
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue using [`default_rate_limiter`].
    pub fn with_backoff(base: Duration, max: Duration) -> Self {
        Self::new(default_rate_limiter(base, max))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: T) {
        let ready = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            trace!("queue add {}", item);
            st.insert(item)
        };
        if ready {
            self.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed. An item already waiting keeps the
    /// earlier of the two deadlines.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let ready_at = Instant::now() + delay;
            if st.deadlines.get(&item).is_some_and(|at| *at <= ready_at) {
                return;
            }
            debug!("queue requeue {} in {:?}", item, delay);
            st.seq = st.seq.wrapping_add(1);
            let seq = st.seq;
            st.deadlines.insert(item.clone(), ready_at);
            st.waiting.push(Waiting { ready_at, seq, item });
        }
        // an idle getter may be sleeping towards a later deadline
        self.notify.notify_one();
    }

    /// Requeue after a failure, delayed by the rate limiter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the backoff history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next item. `None` means the queue was shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        // pass the wakeup on for items promoted together
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `item`. If it was added again while being processed it goes
    /// straight back into the queue.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(item);
            if st.dirty.contains(item) && !st.shutting_down {
                st.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            debug!("queue {} changed while processing, requeued", item);
            self.notify.notify_one();
        }
    }

    /// Wake every pending `get` with `None`. Pending items are discarded.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.queue.clear();
            st.dirty.clear();
            st.waiting.clear();
            st.deadlines.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items waiting for their backoff delay.
    pub fn waiting_len(&self) -> usize {
        self.lock().deadlines.len()
    }

    /// Items currently held by workers.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }
}
