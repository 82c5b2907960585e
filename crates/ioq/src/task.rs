//! Fire-and-forget tasks.
//!
//! The queue embeds a minimal single-threaded poller: spawned futures live
//! in a slab keyed by task id, wakers push the id onto a ready list, and
//! the event loop polls woken tasks between completions. A spawned task
//! starts executing immediately; once it returns its frame is released,
//! which also drops any embedded operation futures (cancelling whatever
//! they still had in flight).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Task ids woken since the last drain. This is the only executor state a
/// waker touches, so wakers stay `Send + Sync` even though the tasks
/// themselves are thread-local.
pub(crate) type ReadyList = Arc<Mutex<VecDeque<u64>>>;

pub(crate) struct Tasks {
    slab: RefCell<HashMap<u64, TaskFuture>>,
    next_id: Cell<u64>,
    ready: ReadyList,
}

struct TaskWaker {
    id: u64,
    ready: ReadyList,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.lock().unwrap().push_back(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().unwrap().push_back(self.id);
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            slab: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Start a task: poll it once right away, keep it if it suspends.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let mut future: TaskFuture = Box::pin(future);
        if self.poll_task(id, &mut future).is_pending() {
            self.slab.borrow_mut().insert(id, future);
        }
    }

    /// Poll every task woken so far, including ones woken while draining.
    pub fn drain_ready(&self) {
        loop {
            let id = self.ready.lock().unwrap().pop_front();
            let Some(id) = id else { break };
            // Take the future out of the slab while polling so the task
            // can spawn or wake without re-entering the borrow.
            let future = self.slab.borrow_mut().remove(&id);
            let Some(mut future) = future else { continue };
            if self.poll_task(id, &mut future).is_pending() {
                self.slab.borrow_mut().insert(id, future);
            }
        }
    }

    fn poll_task(&self, id: u64, future: &mut TaskFuture) -> Poll<()> {
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(&self.ready),
        }));
        let mut cx = Context::from_waker(&waker);
        future.as_mut().poll(&mut cx)
    }
}
