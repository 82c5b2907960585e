//! Multi-producer channel into the loop.
//!
//! Senders push under a mutex and add one to a semaphore event-fd per
//! message; a receiver reads the event-fd through the ring (blocking at
//! kernel level until a message is available to *this* receiver) and then
//! pops exactly one message. The semaphore flavour is what makes several
//! concurrent receivers correct: each send wakes exactly one of them.
//! Order is FIFO per sender; there is no ordering across senders.

use std::collections::VecDeque;
use std::sync::Mutex;

use ioq_core::logging;

use crate::eventfd::{EventFd, EventFdFlags};
use crate::queue::IoQueue;

pub struct Channel<T> {
    messages: Mutex<VecDeque<T>>,
    event_fd: EventFd,
}

impl<T: Send> Channel<T> {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            event_fd: EventFd::new(EventFdFlags::Semaphore),
        }
    }

    /// Queue a message. Callable from any thread.
    pub fn send(&self, msg: T) {
        self.messages.lock().unwrap().push_back(msg);
        self.event_fd.write(1);
    }

    /// Take the next message, suspending until one is available.
    pub fn receive<'a>(&'a self, io: &IoQueue) -> impl std::future::Future<Output = T> + 'a {
        let read = self.event_fd.read(io);
        async move {
            if let Err(e) = read.await {
                logging::fatal(format_args!("reading from channel eventfd: {e}"));
            }
            self.pop()
        }
    }

    fn pop(&self) -> T {
        self.messages
            .lock()
            .unwrap()
            .pop_front()
            .expect("channel woke a receiver without a message")
    }
}

impl<T: Send> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn send_then_receive() {
        let io = IoQueue::with_capacity(8).unwrap();
        let channel = Rc::new(Channel::new());
        channel.send("one".to_string());
        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        let ch = Rc::clone(&channel);
        let io2 = io.clone();
        io.spawn(async move {
            *got2.borrow_mut() = Some(ch.receive(&io2).await);
        });
        io.run();
        assert_eq!(got.borrow().as_deref(), Some("one"));
    }

    #[test]
    fn every_message_received_exactly_once() {
        let io = IoQueue::with_capacity(16).unwrap();
        let channel = Rc::new(Channel::new());
        for msg in ["A", "B", "C"] {
            channel.send(msg.to_string());
        }
        let received = Rc::new(RefCell::new(Vec::new()));
        // Two concurrent receivers; together they drain all three
        // messages, each message going to exactly one of them.
        for count in [2usize, 1usize] {
            let ch = Rc::clone(&channel);
            let io2 = io.clone();
            let sink = Rc::clone(&received);
            io.spawn(async move {
                for _ in 0..count {
                    let msg = ch.receive(&io2).await;
                    sink.borrow_mut().push(msg);
                }
            });
        }
        io.run();
        let mut got = received.borrow().clone();
        got.sort();
        assert_eq!(got, ["A", "B", "C"]);
    }

    #[test]
    fn cross_thread_send_wakes_receiver() {
        let io = IoQueue::with_capacity(8).unwrap();
        let channel = Arc::new(Channel::new());
        let sender = Arc::clone(&channel);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sender.send(123u32);
        });
        let got = Rc::new(std::cell::Cell::new(0u32));
        let got2 = Rc::clone(&got);
        let ch = Arc::clone(&channel);
        let io2 = io.clone();
        io.spawn(async move {
            got2.set(ch.receive(&io2).await);
        });
        io.run();
        producer.join().unwrap();
        assert_eq!(got.get(), 123);
    }
}
