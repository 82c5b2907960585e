//! In-flight operation records and the awaitable adapter.
//!
//! Every issued operation has exactly one [`Completer`] registered under
//! its id while it is in flight. Completion transfers ownership of the
//! completer out of the map and fires it once: a callback completer runs
//! the stored closure, a waiter completer publishes the result into the
//! shared [`OpCell`] and wakes the suspended task.
//!
//! [`Op`] is the awaitable form. It holds the prepared submission entry
//! until first poll and issues it with a waiter completer. If it is
//! dropped before completing, it cancels the operation with handler drop,
//! so a lost race between cancellation and natural completion can never
//! run user code for an abandoned operation.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use io_uring::squeue;

use ioq_core::IoResult;

use crate::queue::{IoQueue, OperationId};

/// Result slot shared between a suspended [`Op`] and its completer.
#[derive(Default)]
pub(crate) struct OpCell {
    result: Cell<Option<IoResult>>,
    waker: RefCell<Option<Waker>>,
}

impl OpCell {
    pub fn result(&self) -> Option<IoResult> {
        self.result.get()
    }
}

/// What to do when an operation completes.
pub(crate) enum Completer {
    /// One-shot completion handler.
    Callback(Box<dyn FnOnce(IoResult)>),
    /// A suspended operation future waiting for the result.
    Waiter(Rc<OpCell>),
}

impl Completer {
    pub fn complete(self, result: IoResult) {
        match self {
            Completer::Callback(callback) => callback(result),
            Completer::Waiter(cell) => {
                cell.result.set(Some(result));
                if let Some(waker) = cell.waker.borrow_mut().take() {
                    waker.wake();
                }
            }
        }
    }
}

enum OpState {
    /// Prepared but not yet handed to the queue.
    Pending(squeue::Entry),
    /// Issued; the cell fills in when the completion arrives.
    InFlight { id: OperationId, cell: Rc<OpCell> },
    /// Result delivered (or the submission was abandoned).
    Done,
}

/// An operation as a future.
///
/// The operation is issued on first poll. Dropping the future while the
/// operation is still in flight cancels it and drops its handler, so no
/// completion can reach this (freed) future afterwards. The lifetime ties
/// any caller-owned buffers to the future.
#[must_use = "operations do nothing unless awaited"]
pub struct Op<'a> {
    io: IoQueue,
    state: OpState,
    _buffers: PhantomData<&'a mut [u8]>,
}

impl<'a> Op<'a> {
    pub(crate) fn new(io: &IoQueue, entry: squeue::Entry) -> Self {
        Self {
            io: io.clone(),
            state: OpState::Pending(entry),
            _buffers: PhantomData,
        }
    }

    /// Issue the operation now instead of on first poll. Used to attach a
    /// linked timeout, which requires the entry to be the most recently
    /// prepared one. Ring full leaves the entry pending for a later retry.
    pub(crate) fn issue_now(&mut self) -> bool {
        if let OpState::Pending(_) = self.state {
            let OpState::Pending(entry) = std::mem::replace(&mut self.state, OpState::Done) else {
                unreachable!()
            };
            let cell = Rc::new(OpCell::default());
            match self.io.issue(entry, Completer::Waiter(Rc::clone(&cell))) {
                Ok(id) => {
                    self.state = OpState::InFlight { id, cell };
                    true
                }
                Err(entry) => {
                    self.state = OpState::Pending(entry);
                    false
                }
            }
        } else {
            matches!(self.state, OpState::InFlight { .. })
        }
    }

    /// Id of the in-flight operation, if it has been issued.
    pub(crate) fn issued_id(&self) -> Option<OperationId> {
        match &self.state {
            OpState::InFlight { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl Future for Op<'_> {
    type Output = IoResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if matches!(this.state, OpState::Done) {
            panic!("operation polled after completion");
        }
        if matches!(this.state, OpState::Pending(_)) && !this.issue_now() {
            // No submission slot; retry once the loop has submitted.
            this.io.park_until_sq_space(cx.waker().clone());
            return Poll::Pending;
        }
        this.poll_in_flight(cx)
    }
}

impl Op<'_> {
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<IoResult> {
        let result = match &self.state {
            OpState::InFlight { cell, .. } => match cell.result() {
                Some(result) => Some(result),
                None => {
                    *cell.waker.borrow_mut() = Some(cx.waker().clone());
                    None
                }
            },
            _ => unreachable!(),
        };
        match result {
            Some(result) => {
                self.state = OpState::Done;
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        if let OpState::InFlight { id, cell } = &self.state {
            if cell.result().is_none() {
                self.io.cancel_id(*id, true);
            }
        }
    }
}
