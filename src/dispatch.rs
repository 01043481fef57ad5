//! Event Dispatcher (§4.5): a bounded queue with a dispatcher thread that
//! invokes registered callbacks in arrival order. No crate in the retrieval
//! pack reaches for a third-party ring-buffer or MPMC type for this shape
//! (`std::sync::mpsc` is unbounded), so this is a plain `Mutex<VecDeque>` +
//! `Condvar` with an atomic drop counter, in the spirit of
//! `gawd-ai-sctl`'s SSE broadcast/lagged-drop handling.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Default capacity for the event queue (§4.5).
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// A fixed-capacity FIFO queue with drop-oldest-on-overflow semantics and an
/// atomic counter of how many items have been dropped this way.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    closed: Mutex<bool>,
    pub dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            closed: Mutex::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an item, dropping the oldest pending item (and incrementing
    /// the drop counter) if the queue is already at capacity.
    pub fn push(&self, item: T) {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the queue is closed, in which
    /// case `None` is returned once drained.
    pub fn pop_blocking(&self) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            if *self.closed.lock().unwrap() {
                return None;
            }
            q = self.not_empty.wait(q).unwrap();
        }
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.not_empty.notify_all();
    }

    /// Non-blocking pop, used by live-sample consumers that poll rather
    /// than subscribe.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque handle returned by [`EventDispatcher::subscribe`]; dropping or
/// passing it to [`EventDispatcher::unsubscribe`] removes the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(usize);

type Callback<T> = Box<dyn Fn(&T) + Send + 'static>;

struct Subscriber<T> {
    token: SubscriptionToken,
    callback: Callback<T>,
}

/// Fans out queued items to registered subscribers, in arrival order, on a
/// dedicated thread. A panicking callback is caught and logged; it never
/// kills the dispatcher thread (§4.5).
pub struct EventDispatcher<T: Send + 'static> {
    queue: Arc<BoundedQueue<T>>,
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
    next_token: AtomicUsize,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> EventDispatcher<T> {
    pub fn new(capacity: usize) -> Self {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let subscribers: Arc<Mutex<Vec<Subscriber<T>>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_queue = queue.clone();
        let worker_subscribers = subscribers.clone();
        let worker = std::thread::Builder::new()
            .name("event-dispatcher".to_string())
            .spawn(move || {
                while let Some(item) = worker_queue.pop_blocking() {
                    let subs = worker_subscribers.lock().unwrap();
                    for sub in subs.iter() {
                        let callback = &sub.callback;
                        let item_ref = &item;
                        if catch_unwind(AssertUnwindSafe(|| callback(item_ref))).is_err() {
                            log::error!("event subscriber callback panicked; continuing");
                        }
                    }
                }
            })
            .expect("failed to spawn event-dispatcher thread");

        Self {
            queue,
            subscribers,
            next_token: AtomicUsize::new(0),
            worker: Some(worker),
        }
    }

    pub fn publish(&self, item: T) {
        self.queue.push(item);
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&T) + Send + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().unwrap().push(Subscriber {
            token,
            callback: Box::new(callback),
        });
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscribers.lock().unwrap().retain(|s| s.token != token);
    }
}

impl<T: Send + 'static> Drop for EventDispatcher<T> {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn delivers_in_arrival_order() {
        let dispatcher: EventDispatcher<u32> = EventDispatcher::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        dispatcher.subscribe(move |v: &u32| seen_cb.lock().unwrap().push(*v));

        for i in 0..5 {
            dispatcher.publish(i);
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drop_oldest_on_overflow_increments_counter() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pop_blocking(), Some(2));
        assert_eq!(queue.pop_blocking(), Some(3));
    }

    #[test]
    fn panicking_callback_does_not_kill_dispatcher() {
        let dispatcher: EventDispatcher<u32> = EventDispatcher::new(8);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = calls.clone();
        dispatcher.subscribe(move |_: &u32| {
            calls_cb.fetch_add(1, Ordering::Relaxed);
            panic!("boom");
        });
        dispatcher.publish(1);
        dispatcher.publish(2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
