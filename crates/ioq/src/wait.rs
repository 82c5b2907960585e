//! Joining several awaitables.
//!
//! Each added future runs as its own fire-and-forget task; the join value
//! only tracks counters and the caller's waker. [`WaitAll`] resumes the
//! caller once every child has finished, [`WaitAny`] as soon as the first
//! one does. WaitAny does not cancel the stragglers; they keep running on
//! the loop.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::queue::IoQueue;

#[derive(Default)]
struct AllState {
    pending: Cell<usize>,
    waker: RefCell<Option<Waker>>,
}

/// Resolves when every added future has completed. Awaiting with nothing
/// added (or after everything already finished) resolves immediately.
pub struct WaitAll {
    state: Rc<AllState>,
}

impl WaitAll {
    pub fn new() -> Self {
        Self {
            state: Rc::new(AllState::default()),
        }
    }

    pub fn from_iter<I>(io: &IoQueue, futures: I) -> Self
    where
        I: IntoIterator,
        I::Item: Future<Output = ()> + 'static,
    {
        let wait = Self::new();
        for future in futures {
            wait.add(io, future);
        }
        wait
    }

    pub fn add(&self, io: &IoQueue, future: impl Future<Output = ()> + 'static) {
        let state = Rc::clone(&self.state);
        state.pending.set(state.pending.get() + 1);
        io.spawn(async move {
            future.await;
            let left = state.pending.get() - 1;
            state.pending.set(left);
            if left == 0 {
                if let Some(waker) = state.waker.borrow_mut().take() {
                    waker.wake();
                }
            }
        });
    }
}

impl Default for WaitAll {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for WaitAll {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.pending.get() == 0 {
            Poll::Ready(())
        } else {
            *self.state.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[derive(Default)]
struct AnyState {
    started: Cell<usize>,
    winner: Cell<Option<usize>>,
    waker: RefCell<Option<Waker>>,
}

/// Resolves with the index of the first added future to complete.
pub struct WaitAny {
    state: Rc<AnyState>,
}

impl WaitAny {
    pub fn new() -> Self {
        Self {
            state: Rc::new(AnyState::default()),
        }
    }

    pub fn from_iter<I>(io: &IoQueue, futures: I) -> Self
    where
        I: IntoIterator,
        I::Item: Future<Output = ()> + 'static,
    {
        let wait = Self::new();
        for future in futures {
            wait.add(io, future);
        }
        wait
    }

    /// Returns the index this future will report if it finishes first.
    pub fn add(&self, io: &IoQueue, future: impl Future<Output = ()> + 'static) -> usize {
        let index = self.state.started.get();
        self.state.started.set(index + 1);
        let state = Rc::clone(&self.state);
        io.spawn(async move {
            future.await;
            if state.winner.get().is_none() {
                state.winner.set(Some(index));
            }
            if let Some(waker) = state.waker.borrow_mut().take() {
                waker.wake();
            }
        });
        index
    }
}

impl Default for WaitAny {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for WaitAny {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<usize> {
        if let Some(winner) = self.state.winner.get() {
            Poll::Ready(winner)
        } else {
            *self.state.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_all_resumes_once_after_slowest_timer() {
        let io = IoQueue::with_capacity(16).unwrap();
        let io2 = io.clone();
        let resumed = Rc::new(Cell::new(0u32));
        let resumed2 = Rc::clone(&resumed);
        let start = Instant::now();
        io.spawn(async move {
            let wait = WaitAll::from_iter(
                &io2,
                [10u64, 20, 30].map(|ms| {
                    let io = io2.clone();
                    async move {
                        io.timeout(Duration::from_millis(ms)).await;
                    }
                }),
            );
            wait.await;
            resumed2.set(resumed2.get() + 1);
        });
        io.run();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(resumed.get(), 1);
    }

    #[test]
    fn wait_all_with_nothing_added_is_ready() {
        let io = IoQueue::with_capacity(8).unwrap();
        let done = Rc::new(Cell::new(false));
        let done2 = Rc::clone(&done);
        io.spawn(async move {
            WaitAll::new().await;
            done2.set(true);
        });
        io.run();
        assert!(done.get());
    }

    #[test]
    fn wait_any_reports_fastest_index() {
        let io = IoQueue::with_capacity(16).unwrap();
        let io2 = io.clone();
        let winner = Rc::new(Cell::new(usize::MAX));
        let winner2 = Rc::clone(&winner);
        io.spawn(async move {
            let wait = WaitAny::new();
            let slow = io2.clone();
            wait.add(&io2, async move {
                slow.timeout(Duration::from_millis(200)).await;
            });
            let fast = io2.clone();
            wait.add(&io2, async move {
                fast.timeout(Duration::from_millis(20)).await;
            });
            winner2.set(wait.await);
        });
        io.run();
        assert_eq!(winner.get(), 1);
    }
}
