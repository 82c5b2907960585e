//! The event loop.
//!
//! An [`IoQueue`] owns the ring and the completer map and must stay on one
//! thread. Operations come in two flavours: futures (issued on first poll,
//! cancelled when dropped mid-flight) and `_cb` methods that register a
//! one-shot completion handler and return an [`OperationHandle`].
//!
//! [`IoQueue::run`] drives everything: it polls woken tasks, flushes
//! pending submissions, waits for one completion, and dispatches it to the
//! registered completer. It returns when no operations are outstanding.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use io_uring::{squeue, types};

use ioq_core::logging;
use ioq_core::net::IpAddressPort;
use ioq_core::IoResult;

use crate::completer_map::CompleterMap;
use crate::error::Result;
use crate::op::{Completer, Op};
use crate::task::Tasks;
use crate::uring::Uring;

pub type OperationId = u64;

/// Id of a default-constructed handle; names no operation.
pub const OP_ID_INVALID: OperationId = u64::MAX - 1;
/// Id of submissions whose completion must be discarded (link-timeout
/// sidecars and cancellations).
pub const OP_ID_IGNORE: OperationId = u64::MAX;

struct Inner {
    ring: RefCell<Uring>,
    completers: RefCell<CompleterMap>,
    next_id: Cell<OperationId>,
    tasks: Tasks,
    // Tasks that found the submission queue full; woken once it drains.
    sq_waiters: RefCell<Vec<std::task::Waker>>,
}

/// Handle to the event loop. Cheap to clone; all clones refer to the same
/// loop. Not `Send`.
#[derive(Clone)]
pub struct IoQueue {
    inner: Rc<Inner>,
}

/// Names one in-flight operation. Does not own it; copying is fine.
#[derive(Clone)]
pub struct OperationHandle {
    io: IoQueue,
    id: OperationId,
}

impl OperationHandle {
    pub fn valid(&self) -> bool {
        self.id != OP_ID_INVALID && self.id != OP_ID_IGNORE
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Request cancellation. With `drop_handler` the completion handler is
    /// removed immediately, so no user code runs for this operation no
    /// matter how the race between cancellation and natural completion
    /// resolves.
    pub fn cancel(&self, drop_handler: bool) {
        self.io.cancel_id(self.id, drop_handler);
    }
}

impl IoQueue {
    /// A queue with the default capacity of 1024 entries. Setup failure is
    /// fatal.
    pub fn new() -> Self {
        Self::with_capacity(1024).unwrap_or_else(|e| logging::fatal(e))
    }

    pub fn with_capacity(capacity: u32) -> Result<Self> {
        Self::with_options(capacity, false)
    }

    /// `sq_poll` requests kernel-side submission polling.
    pub fn with_options(capacity: u32, sq_poll: bool) -> Result<Self> {
        let ring = Uring::new(capacity, sq_poll)?;
        let completers = CompleterMap::new(ring.capacity());
        Ok(Self {
            inner: Rc::new(Inner {
                ring: RefCell::new(ring),
                completers: RefCell::new(completers),
                next_id: Cell::new(0),
                tasks: Tasks::new(),
                sq_waiters: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.ring.borrow().capacity()
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.completers.borrow().len()
    }

    /// Start a fire-and-forget task. The task begins executing
    /// immediately and keeps running on the loop after this returns.
    pub fn spawn(&self, future: impl std::future::Future<Output = ()> + 'static) {
        self.inner.tasks.spawn(future);
    }

    /// Drive the loop until no operations are outstanding.
    pub fn run(&self) {
        loop {
            self.inner.tasks.drain_ready();
            if self.inner.completers.borrow().len() == 0 {
                return;
            }
            {
                let mut ring = self.inner.ring.borrow_mut();
                ring.flush_staged();
                if let Err(e) = ring.submit_and_wait(1) {
                    log::error!("submitting entries: {e}");
                    continue;
                }
            }
            // Submitting drained the queue; retry anything that found it
            // full.
            for waker in self.inner.sq_waiters.borrow_mut().drain(..) {
                waker.wake();
            }
            let Some((user_data, res)) = self.inner.ring.borrow_mut().next_completion() else {
                continue;
            };
            if user_data == OP_ID_IGNORE {
                continue;
            }
            // Ownership of the completer transfers out of the map; it fires
            // exactly once. A missing entry means the handler was dropped
            // by cancellation.
            let completer = self.inner.completers.borrow_mut().remove(user_data);
            if let Some(completer) = completer {
                completer.complete(IoResult::from(res));
            }
        }
    }

    fn next_op_id(&self) -> OperationId {
        loop {
            let id = self.inner.next_id.get();
            self.inner.next_id.set(id.wrapping_add(1));
            if id != OP_ID_INVALID && id != OP_ID_IGNORE {
                return id;
            }
        }
    }

    /// Allocate an id, stamp it on the entry, register the completer, and
    /// hold the entry as the most recently prepared one. Gives the entry
    /// back when the submission queue is full.
    pub(crate) fn issue(
        &self,
        entry: squeue::Entry,
        completer: Completer,
    ) -> std::result::Result<OperationId, squeue::Entry> {
        let mut ring = self.inner.ring.borrow_mut();
        ring.flush_staged();
        if ring.space_left() == 0 {
            log::warn!("io_uring full");
            return Err(entry);
        }
        let id = self.next_op_id();
        ring.stage(id, entry.user_data(id));
        drop(ring);
        debug_assert!(self.inner.completers.borrow().get(id).is_none());
        self.inner.completers.borrow_mut().insert(id, completer);
        Ok(id)
    }

    pub(crate) fn issue_callback(
        &self,
        entry: squeue::Entry,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        let id = match self.issue(entry, Completer::Callback(Box::new(callback))) {
            Ok(id) => id,
            Err(_) => OP_ID_INVALID,
        };
        OperationHandle {
            io: self.clone(),
            id,
        }
    }

    /// Queue an entry whose completion carries no handler.
    fn push_ignored(&self, entry: squeue::Entry) -> bool {
        let mut ring = self.inner.ring.borrow_mut();
        ring.flush_staged();
        if ring.space_left() == 0 {
            log::warn!("io_uring full");
            return false;
        }
        ring.stage(OP_ID_IGNORE, entry.user_data(OP_ID_IGNORE));
        true
    }

    pub(crate) fn park_until_sq_space(&self, waker: std::task::Waker) {
        self.inner.sq_waiters.borrow_mut().push(waker);
    }

    pub(crate) fn cancel_id(&self, id: OperationId, drop_handler: bool) {
        if id == OP_ID_INVALID || id == OP_ID_IGNORE {
            return;
        }
        if drop_handler {
            drop(self.inner.completers.borrow_mut().remove(id));
        }
        self.push_ignored(Uring::prepare_async_cancel(id));
    }

    // Awaitable operations. Each returns a future that issues the
    // operation on first poll; dropping it mid-flight cancels the
    // operation with handler drop. Buffers are borrowed for the lifetime
    // of the future.

    pub fn nop(&self) -> Op<'static> {
        Op::new(self, Uring::prepare_nop())
    }

    /// Accept on a listening socket; resolves to the new descriptor.
    pub fn accept(&self, fd: RawFd) -> Op<'static> {
        Op::new(
            self,
            Uring::prepare_accept(fd, std::ptr::null_mut(), std::ptr::null_mut()),
        )
    }

    pub fn connect<'a>(&self, fd: RawFd, addr: &'a libc::sockaddr_in) -> Op<'a> {
        Op::new(
            self,
            Uring::prepare_connect(
                fd,
                (addr as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
        )
    }

    /// Connect to an address given by value.
    pub fn connect_to(
        &self,
        fd: RawFd,
        addr: IpAddressPort,
    ) -> impl std::future::Future<Output = IoResult> + 'static {
        let io = self.clone();
        async move {
            let sa = addr.to_sockaddr();
            io.connect(fd, &sa).await
        }
    }

    pub fn recv<'a>(&self, fd: RawFd, buf: &'a mut [u8]) -> Op<'a> {
        Op::new(
            self,
            Uring::prepare_recv(fd, buf.as_mut_ptr(), buf.len() as u32, 0),
        )
    }

    pub fn send<'a>(&self, fd: RawFd, buf: &'a [u8]) -> Op<'a> {
        Op::new(
            self,
            Uring::prepare_send(fd, buf.as_ptr(), buf.len() as u32, 0),
        )
    }

    pub fn read<'a>(&self, fd: RawFd, buf: &'a mut [u8]) -> Op<'a> {
        Op::new(
            self,
            Uring::prepare_read(fd, buf.as_mut_ptr(), buf.len() as u32, 0),
        )
    }

    pub fn write<'a>(&self, fd: RawFd, buf: &'a [u8]) -> Op<'a> {
        Op::new(
            self,
            Uring::prepare_write(fd, buf.as_ptr(), buf.len() as u32, 0),
        )
    }

    pub fn close(&self, fd: RawFd) -> Op<'static> {
        Op::new(self, Uring::prepare_close(fd))
    }

    pub fn shutdown(&self, fd: RawFd, how: i32) -> Op<'static> {
        Op::new(self, Uring::prepare_shutdown(fd, how))
    }

    pub fn poll_add(&self, fd: RawFd, events: u32) -> Op<'static> {
        Op::new(self, Uring::prepare_poll_add(fd, events))
    }

    pub fn recvmsg<'a>(&self, fd: RawFd, msg: &'a mut libc::msghdr, flags: i32) -> Op<'a> {
        Op::new(self, Uring::prepare_recvmsg(fd, msg, flags as u32))
    }

    pub fn sendmsg<'a>(&self, fd: RawFd, msg: &'a libc::msghdr, flags: i32) -> Op<'a> {
        Op::new(self, Uring::prepare_sendmsg(fd, msg, flags as u32))
    }

    /// Receive one datagram and report its source address.
    ///
    /// Convenience wrapper over `recvmsg`: the msghdr and iovec outlive
    /// this call, so they are kept on the heap until the operation
    /// completes. Use `recvmsg` directly if that allocation matters.
    pub fn recvfrom<'a>(
        &self,
        fd: RawFd,
        buf: &'a mut [u8],
        flags: i32,
    ) -> impl std::future::Future<Output = (IoResult, Option<IpAddressPort>)> + 'a {
        let io = self.clone();
        async move {
            let mut record = MsgRecord::new(buf.as_mut_ptr(), buf.len(), None);
            let res = io.recvmsg(fd, &mut record.msg, flags).await;
            let addr = (res.is_ok()
                && record.msg.msg_namelen as usize >= std::mem::size_of::<libc::sockaddr_in>())
            .then(|| IpAddressPort::from_sockaddr(&record.addr));
            (res, addr)
        }
    }

    /// Send one datagram to `dest`. Same heap note as [`recvfrom`](Self::recvfrom).
    pub fn sendto<'a>(
        &self,
        fd: RawFd,
        buf: &'a [u8],
        flags: i32,
        dest: IpAddressPort,
    ) -> impl std::future::Future<Output = IoResult> + 'a {
        let io = self.clone();
        async move {
            let record = MsgRecord::new(buf.as_ptr() as *mut u8, buf.len(), Some(dest));
            io.sendmsg(fd, &record.msg, flags).await
        }
    }

    /// A bare timeout; completes with `ETIME` on expiry.
    pub fn timeout(
        &self,
        duration: Duration,
    ) -> impl std::future::Future<Output = IoResult> + 'static {
        let io = self.clone();
        async move {
            // The kernel reads the timespec through the entry's pointer at
            // submission, after this frame has suspended. Box it and keep
            // the box until the operation is over.
            let ts = Box::new(timespec_from(duration));
            let result = Op::new(
                &io,
                Uring::prepare_timeout(&*ts, types::TimeoutFlags::empty()),
            )
            .await;
            drop(ts);
            result
        }
    }

    /// A timeout against an absolute instant.
    pub fn timeout_at(
        &self,
        deadline: Instant,
    ) -> impl std::future::Future<Output = IoResult> + 'static {
        let io = self.clone();
        async move {
            let ts = Box::new(timespec_until(deadline));
            let result = Op::new(&io, Uring::prepare_timeout(&*ts, types::TimeoutFlags::ABS)).await;
            drop(ts);
            result
        }
    }

    /// Bound `op` by a timeout. Resolves with the operation's own result:
    /// `ECANCELED` if the timeout fired first, the normal outcome
    /// otherwise.
    ///
    /// The operation is issued here so that its submission entry is still
    /// the most recently prepared one, which is what lets the kernel-level
    /// link be established. An operation that was already submitted
    /// earlier cannot be linked any more; it gets an independent timeout
    /// that requests cancellation on expiry instead.
    pub fn with_timeout<'a>(
        &self,
        duration: Duration,
        mut op: Op<'a>,
    ) -> impl std::future::Future<Output = IoResult> + 'a {
        let io = self.clone();
        async move {
            // Boxed for the same reason as in `timeout`: the link-timeout
            // entry keeps pointing at the timespec after this frame
            // suspends.
            let ts = Box::new(timespec_from(duration));
            let issued = op.issue_now();
            let mut fallback_timer = None;
            if issued && io.inner.ring.borrow().staged_user_data() == op.issued_id() {
                let entry = Uring::prepare_link_timeout(&*ts, types::TimeoutFlags::empty())
                    .user_data(OP_ID_IGNORE);
                if !io.inner.ring.borrow_mut().link_staged(entry) {
                    log::warn!("no room to link timeout; operation runs unbounded");
                }
            } else if let Some(id) = op.issued_id() {
                let io2 = io.clone();
                fallback_timer = Some(io.timeout_cb(duration, move |res| {
                    if res.errno() == Some(libc::ETIME) {
                        io2.cancel_id(id, false);
                    }
                }));
            }
            let result = op.await;
            // The operation settled; a still-pending fallback timer has
            // nothing left to bound.
            if let Some(timer) = fallback_timer {
                timer.cancel(true);
            }
            drop(ts);
            result
        }
    }

    /// Resolve a [`Future`](crate::future::Future) on the loop by reading
    /// its event-fd through the ring. The promise side may be fulfilled
    /// from any thread.
    pub fn wait<T: Send + 'static>(
        &self,
        future: crate::future::Future<T>,
    ) -> impl std::future::Future<Output = T> + 'static {
        let io = self.clone();
        async move {
            if future.ready() {
                return future.get();
            }
            match future.read_event_fd(&io).await {
                Ok(value) => debug_assert_eq!(value, 1),
                Err(e) => logging::fatal(format_args!("reading from future eventfd: {e}")),
            }
            future.get()
        }
    }

    // Callback flavours. The handler is invoked exactly once with the
    // operation's result, unless the handler is dropped by cancellation.
    // An invalid returned handle means the submission queue was full; the
    // caller may retry.

    pub fn nop_cb(&self, callback: impl FnOnce(IoResult) + 'static) -> OperationHandle {
        self.issue_callback(Uring::prepare_nop(), callback)
    }

    pub fn accept_cb(
        &self,
        fd: RawFd,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(
            Uring::prepare_accept(fd, std::ptr::null_mut(), std::ptr::null_mut()),
            callback,
        )
    }

    pub fn close_cb(&self, fd: RawFd, callback: impl FnOnce(IoResult) + 'static) -> OperationHandle {
        self.issue_callback(Uring::prepare_close(fd), callback)
    }

    pub fn shutdown_cb(
        &self,
        fd: RawFd,
        how: i32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_shutdown(fd, how), callback)
    }

    pub fn poll_add_cb(
        &self,
        fd: RawFd,
        events: u32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_poll_add(fd, events), callback)
    }

    pub fn timeout_cb(
        &self,
        duration: Duration,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        let ts = Box::new(timespec_from(duration));
        let entry = Uring::prepare_timeout(&*ts, types::TimeoutFlags::empty());
        self.issue_callback(entry, move |res| {
            drop(ts);
            callback(res);
        })
    }

    /// # Safety
    /// `buf` must stay valid for `len` bytes until the callback fires or
    /// the handler is dropped and the operation's cancellation completes.
    pub unsafe fn recv_cb(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_recv(fd, buf, len, 0), callback)
    }

    /// # Safety
    /// Same contract as [`recv_cb`](Self::recv_cb).
    pub unsafe fn send_cb(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_send(fd, buf, len, 0), callback)
    }

    /// # Safety
    /// Same contract as [`recv_cb`](Self::recv_cb).
    pub unsafe fn read_cb(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_read(fd, buf, len, 0), callback)
    }

    /// # Safety
    /// Same contract as [`recv_cb`](Self::recv_cb).
    pub unsafe fn write_cb(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_write(fd, buf, len, 0), callback)
    }

    /// # Safety
    /// `msg` and everything it points to must stay valid until the
    /// callback fires or the dropped handler's cancellation completes.
    pub unsafe fn recvmsg_cb(
        &self,
        fd: RawFd,
        msg: *mut libc::msghdr,
        flags: i32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_recvmsg(fd, msg, flags as u32), callback)
    }

    /// # Safety
    /// Same contract as [`recvmsg_cb`](Self::recvmsg_cb).
    pub unsafe fn sendmsg_cb(
        &self,
        fd: RawFd,
        msg: *const libc::msghdr,
        flags: i32,
        callback: impl FnOnce(IoResult) + 'static,
    ) -> OperationHandle {
        self.issue_callback(Uring::prepare_sendmsg(fd, msg, flags as u32), callback)
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap-pinned msghdr record for the datagram convenience wrappers. The
/// msghdr points into the record itself, so it lives behind a box.
struct MsgRecord {
    addr: libc::sockaddr_in,
    iov: libc::iovec,
    msg: libc::msghdr,
}

impl MsgRecord {
    fn new(buf: *mut u8, len: usize, dest: Option<IpAddressPort>) -> Box<Self> {
        let mut record = Box::new(Self {
            addr: unsafe { std::mem::zeroed() },
            iov: libc::iovec {
                iov_base: buf.cast(),
                iov_len: len,
            },
            msg: unsafe { std::mem::zeroed() },
        });
        if let Some(dest) = dest {
            record.addr = dest.to_sockaddr();
        }
        record.msg.msg_name = (&mut record.addr as *mut libc::sockaddr_in).cast();
        record.msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        record.msg.msg_iov = &mut record.iov;
        record.msg.msg_iovlen = 1;
        record
    }
}

fn timespec_from(duration: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

// Absolute ring timeouts are against CLOCK_MONOTONIC.
fn timespec_until(deadline: Instant) -> types::Timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    let delta = deadline.saturating_duration_since(Instant::now());
    let nsec = now.tv_nsec as u64 + delta.subsec_nanos() as u64;
    types::Timespec::new()
        .sec(now.tv_sec as u64 + delta.as_secs() + nsec / 1_000_000_000)
        .nsec((nsec % 1_000_000_000) as u32)
}
