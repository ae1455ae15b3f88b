//! # Work Queues
//!
//! Blocking FIFO hand-off between pipeline stages. Each queue can carry a blacklist
//! predicate that is consulted when an item is pushed and again when it is popped, so
//! items of cancelled scans are dropped by whichever side touches them first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::registry::Cancellation;
use crate::scan::ScanScoped;

/// Predicate deciding whether an item belongs to a cancelled scan.
pub type Blacklist<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct QueueState<T> {
    items: VecDeque<Arc<T>>,
    closed: bool,
}

pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    blacklisted: Blacklist<T>,
    len_hint: AtomicUsize,
}

impl<T> WorkQueue<T> {
    /// Queue without a blacklist.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_blacklist(name, Arc::new(|_: &T| false))
    }

    pub fn with_blacklist(name: impl Into<String>, blacklisted: Blacklist<T>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            blacklisted,
            len_hint: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item and wake one waiting consumer.
    ///
    /// Returns `false` when the item was rejected, either because its scan is blacklisted
    /// or because the queue has been closed.
    pub fn push(&self, item: Arc<T>) -> bool {
        if (self.blacklisted)(&item) {
            debug!(
                "queue={} rejected work item due to blacklist size={}",
                self.name,
                self.len()
            );
            return false;
        }
        let mut state = self.lock();
        if state.closed {
            debug!("queue={} closed, dropping work item", self.name);
            return false;
        }
        state.items.push_back(item);
        self.len_hint.store(state.items.len(), Ordering::Relaxed);
        trace!("queue={} added work item size={}", self.name, state.items.len());
        self.ready.notify_one();
        true
    }

    /// Block until a non-blacklisted item is available, oldest first.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Arc<T>> {
        let mut state = self.lock();
        loop {
            if let Some(item) = self.take_next(&mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            trace!("queue={} waiting for work item", self.name);
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`WorkQueue::pop`].
    pub fn try_pop(&self) -> Option<Arc<T>> {
        let mut state = self.lock();
        self.take_next(&mut state)
    }

    /// Approximate number of queued items; not synchronised with concurrent mutation.
    pub fn len(&self) -> usize {
        self.len_hint.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every resident item the blacklist now matches. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|item| !(self.blacklisted)(item));
        self.len_hint.store(state.items.len(), Ordering::Relaxed);
        let dropped = before - state.items.len();
        if dropped > 0 {
            debug!("queue={} purged {} blacklisted work items", self.name, dropped);
        }
        dropped
    }

    /// Stop accepting work and release all blocked consumers once drained.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn take_next(&self, state: &mut QueueState<T>) -> Option<Arc<T>> {
        while let Some(item) = state.items.pop_front() {
            self.len_hint.store(state.items.len(), Ordering::Relaxed);
            if (self.blacklisted)(&item) {
                debug!(
                    "queue={} removed work item rejected due to blacklist size={}",
                    self.name,
                    state.items.len()
                );
                continue;
            }
            trace!("queue={} removed work item size={}", self.name, state.items.len());
            return Some(item);
        }
        None
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ScanScoped + 'static> WorkQueue<T> {
    /// Queue whose blacklist is the shared cancellation registry.
    pub fn with_cancellation(name: impl Into<String>, cancellation: Arc<Cancellation>) -> Self {
        Self::with_blacklist(
            name,
            Arc::new(move |item: &T| cancellation.is_cancelled(item.scan_id())),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::scan::ScanId;

    #[derive(Debug)]
    struct Item(ScanId, u32);

    impl ScanScoped for Item {
        fn scan_id(&self) -> ScanId {
            self.0
        }
    }

    #[test]
    fn pops_in_insertion_order() {
        let queue = WorkQueue::new("test");
        for n in 0..3 {
            assert!(queue.push(Arc::new(Item(1, n))));
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<u32> = (0..3).map(|_| queue.pop().expect("item").1).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn blacklist_applies_on_push_and_pop() {
        let cancellation = Arc::new(Cancellation::new());
        let queue = WorkQueue::with_cancellation("test", cancellation.clone());
        assert!(queue.push(Arc::new(Item(7, 0))));
        assert!(queue.push(Arc::new(Item(8, 1))));
        cancellation.cancel(7);
        cancellation.cancel(7);
        assert!(!queue.push(Arc::new(Item(7, 2))));
        let item = queue.pop().expect("item");
        assert_eq!(item.0, 8);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn purge_drops_resident_items() {
        let cancellation = Arc::new(Cancellation::new());
        let queue = WorkQueue::with_cancellation("test", cancellation.clone());
        queue.push(Arc::new(Item(3, 0)));
        queue.push(Arc::new(Item(4, 1)));
        queue.push(Arc::new(Item(3, 2)));
        cancellation.cancel(3);
        assert_eq!(queue.purge(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn blocking_pop_wakes_on_push_and_close() {
        let queue = Arc::new(WorkQueue::<Item>::new("test"));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let first = queue.pop().map(|item| item.1);
                let second = queue.pop().map(|item| item.1);
                (first, second)
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(Arc::new(Item(1, 9)));
        thread::sleep(Duration::from_millis(20));
        queue.close();
        let (first, second) = consumer.join().expect("consumer");
        assert_eq!(first, Some(9));
        assert_eq!(second, None);
        assert!(!queue.push(Arc::new(Item(1, 10))));
    }
}
