//! # ioq — completion-driven async I/O on io_uring
//!
//! A Linux-only, single-threaded event loop over the kernel's submission /
//! completion ring. Operations are issued on an [`IoQueue`]; each one can be
//! consumed either through a completion callback or by awaiting a future
//! whose drop cancels the in-flight operation.
//!
//! ```ignore
//! let io = IoQueue::new();
//! let listener = ioq_core::net::create_tcp_listen_socket(&addr, 128)?;
//! io.spawn(async move {
//!     let fd = io2.accept(listener.raw()).await.into_result()?;
//!     // ...
//! });
//! io.run();
//! ```
//!
//! Worker threads never touch the ring. They reach the loop through the
//! narrow cross-thread surface: writing an [`EventFd`], fulfilling a
//! [`Promise`], or sending on a [`Channel`].

pub mod channel;
mod completer_map;
mod error;
pub mod eventfd;
pub mod future;
pub mod notify;
mod op;
pub mod queue;
mod task;
pub mod threadpool;
pub mod uring;
pub mod wait;

pub use channel::Channel;
pub use error::{QueueError, Result};
pub use eventfd::{EventFd, EventFdFlags};
pub use future::{Future, Promise};
pub use notify::{EventListener, NotifyHandle};
pub use op::Op;
pub use queue::{IoQueue, OperationHandle, OperationId};
pub use threadpool::ThreadPool;
pub use wait::{WaitAll, WaitAny};

pub use ioq_core::{logging, net, Fd, IoResult, Pipe};
