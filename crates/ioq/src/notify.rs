//! One-shot notifications and cross-thread event delivery.
//!
//! [`wait`] arms an event-fd read on the loop and hands back a
//! [`NotifyHandle`] for another thread to fire. Notifying consumes the
//! handle, so it cannot fire twice; a handle that is never notified
//! leaves the read pending forever. [`run_async`] builds on that to run a
//! blocking closure on a detached thread and deliver its result back to
//! the loop. [`EventListener`] is the repeating variant: a lock-free
//! queue drained on the loop every time a producer thread emits.

use std::io;
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::eventfd::{EventFd, EventFdFlags};
use crate::future::Promise;
use crate::queue::IoQueue;

/// Fires a pending [`wait`] exactly once.
///
/// The event-fd is shared with the in-flight read, which keeps it open
/// even after the handle is consumed.
pub struct NotifyHandle {
    event_fd: Arc<EventFd>,
}

impl NotifyHandle {
    /// Wake the waiter. Writes synchronously, so any thread may call
    /// this; consuming `self` is what makes a second call impossible.
    pub fn notify(self, value: u64) {
        self.event_fd.write(value);
    }
}

/// Arm a notification: `callback` runs on the loop with the notified
/// value. Returns `None` when the read could not be queued (ring full).
pub fn wait(
    io: &IoQueue,
    callback: impl FnOnce(io::Result<u64>) + 'static,
) -> Option<NotifyHandle> {
    let event_fd = Arc::new(EventFd::new(EventFdFlags::None));
    let keep = Arc::clone(&event_fd);
    let handle = event_fd.read_cb(io, move |res| {
        let _keep = keep;
        callback(res);
    });
    handle.valid().then(|| NotifyHandle { event_fd })
}

/// Run `func` on a detached thread; `callback` receives its result on
/// the loop. Returns false if the notification could not be armed.
pub fn run_async<R: Send + 'static>(
    io: &IoQueue,
    func: impl FnOnce() -> R + Send + 'static,
    callback: impl FnOnce(io::Result<R>) + 'static,
) -> bool {
    let promise = Promise::new();
    let future = promise.future();
    let Some(handle) = wait(io, move |res| match res {
        Ok(_) => callback(Ok(future.get())),
        Err(e) => callback(Err(e)),
    }) else {
        return false;
    };
    std::thread::spawn(move || {
        promise.set(func());
        handle.notify(1);
    });
    true
}

struct ListenerShared<E> {
    queue: SegQueue<E>,
    event_fd: EventFd,
}

/// Delivers events emitted from any thread to a handler on the loop.
///
/// The listener keeps a read permanently armed, so a loop that owns one
/// runs until the process exits.
pub struct EventListener<E: Send + 'static> {
    shared: Arc<ListenerShared<E>>,
}

impl<E: Send + 'static> EventListener<E> {
    /// Must be constructed on the loop thread.
    pub fn new(io: &IoQueue, handler: impl FnMut(E) + 'static) -> Self {
        let shared = Arc::new(ListenerShared {
            queue: SegQueue::new(),
            event_fd: EventFd::new(EventFdFlags::None),
        });
        poll_queue(io.clone(), Arc::clone(&shared), Box::new(handler));
        Self { shared }
    }

    /// Queue an event and wake the loop. Callable from any thread.
    pub fn emit(&self, event: E) {
        self.shared.queue.push(event);
        self.shared.event_fd.write(1);
    }
}

fn poll_queue<E: Send + 'static>(
    io: IoQueue,
    shared: Arc<ListenerShared<E>>,
    mut handler: Box<dyn FnMut(E)>,
) {
    let rearm = Arc::clone(&shared);
    let on_loop = io.clone();
    shared.event_fd.read_cb(&on_loop, move |res| {
        match res {
            Ok(_) => {
                while let Some(event) = rearm.queue.pop() {
                    handler(event);
                }
            }
            Err(e) => log::error!("reading listener eventfd: {e}"),
        }
        poll_queue(io, rearm, handler);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn notify_fires_callback_once() {
        let io = IoQueue::with_capacity(8).unwrap();
        let got = Rc::new(Cell::new(0u64));
        let got2 = Rc::clone(&got);
        let handle = wait(&io, move |res| got2.set(res.unwrap())).unwrap();
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.notify(9);
        });
        io.run();
        notifier.join().unwrap();
        assert_eq!(got.get(), 9);
    }

    #[test]
    fn run_async_delivers_result_to_loop() {
        let io = IoQueue::with_capacity(8).unwrap();
        let got = Rc::new(Cell::new(0));
        let got2 = Rc::clone(&got);
        let started = run_async(&io, || 6 * 7, move |res| got2.set(res.unwrap()));
        assert!(started);
        io.run();
        assert_eq!(got.get(), 42);
    }
}
