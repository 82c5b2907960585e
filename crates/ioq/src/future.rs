//! Promise / future pair bridging worker threads into the loop.
//!
//! The promise side publishes a value under a mutex, notifies blocking
//! waiters, and writes one to an event-fd; that write is what lets the
//! event loop observe readiness through the ring (see
//! [`IoQueue::wait`](crate::IoQueue::wait)). The future side either
//! blocks on the condition variable ([`Future::get`]) or is consumed by
//! the loop.

use std::io;
use std::sync::{Arc, Condvar, Mutex};

use crate::eventfd::{EventFd, EventFdFlags};
use crate::queue::IoQueue;

struct Shared<T> {
    value: Mutex<Option<T>>,
    ready_cv: Condvar,
    event_fd: EventFd,
}

/// Producing half. Fulfil it exactly once, from any thread.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half. The event-fd can be read only once, so futures are
/// moved, never cloned.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                value: Mutex::new(None),
                ready_cv: Condvar::new(),
                event_fd: EventFd::new(EventFdFlags::None),
            }),
        }
    }

    /// The matching future. Call this once.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Publish the value and wake every waiter, blocking or looping.
    pub fn set(self, value: T) {
        {
            let mut slot = self.shared.value.lock().unwrap();
            debug_assert!(slot.is_none(), "promise fulfilled twice");
            *slot = Some(value);
        }
        self.shared.ready_cv.notify_all();
        self.shared.event_fd.write(1);
    }
}

impl<T: Send> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Future<T> {
    /// Non-blocking readiness probe.
    pub fn ready(&self) -> bool {
        self.shared.value.lock().unwrap().is_some()
    }

    /// Block the calling thread until the value is published, then take
    /// it.
    pub fn get(self) -> T {
        let mut slot = self.shared.value.lock().unwrap();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.shared.ready_cv.wait(slot).unwrap();
        }
    }

    pub(crate) fn read_event_fd(
        &self,
        io: &IoQueue,
    ) -> impl std::future::Future<Output = io::Result<u64>> + 'static {
        self.shared.event_fd.read(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_then_get() {
        let promise = Promise::new();
        let future = promise.future();
        assert!(!future.ready());
        promise.set(17);
        assert!(future.ready());
        assert_eq!(future.get(), 17);
    }

    #[test]
    fn get_blocks_until_set() {
        let promise = Promise::new();
        let future = promise.future();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            promise.set("done".to_string());
        });
        assert_eq!(future.get(), "done");
        setter.join().unwrap();
    }

    #[test]
    fn loop_side_wait_returns_value() {
        let io = IoQueue::with_capacity(8).unwrap();
        let promise = Promise::new();
        let future = promise.future();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            promise.set(42);
        });
        let got = std::rc::Rc::new(std::cell::Cell::new(0));
        let got2 = std::rc::Rc::clone(&got);
        let io2 = io.clone();
        io.spawn(async move {
            got2.set(io2.wait(future).await);
        });
        io.run();
        setter.join().unwrap();
        assert_eq!(got.get(), 42);
    }

    #[test]
    fn wait_on_already_ready_future() {
        let io = IoQueue::with_capacity(8).unwrap();
        let promise = Promise::new();
        let future = promise.future();
        promise.set(7);
        let io2 = io.clone();
        io.spawn(async move {
            assert_eq!(io2.wait(future).await, 7);
        });
        io.run();
    }
}
