//! Event-fd: the kernel counter used as a wakeup primitive.
//!
//! Writes are synchronous syscalls and may come from any thread; reads go
//! through the ring and therefore belong to the loop thread. A read
//! transfers exactly eight bytes. The default flavour returns the
//! accumulated counter and resets it; the semaphore flavour returns one
//! and decrements, blocking at zero, so at most one waiter wakes per
//! increment.

use std::io;

use ioq_core::logging;
use ioq_core::{Fd, IoResult};

use crate::queue::{IoQueue, OperationHandle};
use crate::uring::Uring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFdFlags {
    None,
    Semaphore,
}

pub struct EventFd {
    fd: Fd,
}

impl EventFd {
    /// Create a new counter. Creation failure is unrecoverable.
    pub fn new(flags: EventFdFlags) -> Self {
        let raw_flags = match flags {
            EventFdFlags::None => 0,
            EventFdFlags::Semaphore => libc::EFD_SEMAPHORE,
        };
        let fd = unsafe { libc::eventfd(0, raw_flags | libc::EFD_CLOEXEC) };
        if fd < 0 {
            logging::fatal(format_args!(
                "creating eventfd: {}",
                io::Error::last_os_error()
            ));
        }
        Self { fd: Fd::new(fd) }
    }

    pub fn fd(&self) -> &Fd {
        &self.fd
    }

    /// Increment the counter by `v`. Callable from any thread. A failed
    /// write would strand whoever is waiting on the read side, so it is
    /// fatal.
    pub fn write(&self, v: u64) {
        let bytes = v.to_ne_bytes();
        let ret = unsafe {
            libc::write(
                self.fd.raw(),
                bytes.as_ptr().cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret != std::mem::size_of::<u64>() as isize {
            logging::fatal(format_args!(
                "writing to eventfd: {}",
                io::Error::last_os_error()
            ));
        }
    }

    /// Read the counter through the ring. Completes once the counter is
    /// non-zero.
    pub fn read(&self, io: &IoQueue) -> impl std::future::Future<Output = io::Result<u64>> + 'static {
        let fd = self.fd.raw();
        let io = io.clone();
        async move {
            let mut buf = [0u8; 8];
            match io.read(fd, &mut buf).await.into_result() {
                Ok(n) => {
                    debug_assert_eq!(n as usize, buf.len());
                    Ok(u64::from_ne_bytes(buf))
                }
                Err(e) => Err(e),
            }
        }
    }

    /// Callback flavour of [`read`](Self::read). The eight-byte read
    /// buffer lives with the operation.
    pub fn read_cb(
        &self,
        io: &IoQueue,
        callback: impl FnOnce(io::Result<u64>) + 'static,
    ) -> OperationHandle {
        let mut buf = Box::new([0u8; 8]);
        let entry = Uring::prepare_read(self.fd.raw(), buf.as_mut_ptr(), 8, 0);
        io.issue_callback(entry, move |res: IoResult| match res.into_result() {
            Ok(n) => {
                debug_assert_eq!(n as usize, 8);
                callback(Ok(u64::from_ne_bytes(*buf)));
            }
            Err(e) => callback(Err(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_read_returns_accumulated_count() {
        let io = IoQueue::with_capacity(8).unwrap();
        let event = EventFd::new(EventFdFlags::None);
        event.write(2);
        event.write(1);
        let io2 = io.clone();
        let read = event.read(&io2);
        io.spawn(async move {
            assert_eq!(read.await.unwrap(), 3);
        });
        io.run();
    }

    #[test]
    fn semaphore_read_decrements_by_one() {
        let io = IoQueue::with_capacity(8).unwrap();
        let event = EventFd::new(EventFdFlags::Semaphore);
        event.write(2);
        let first = event.read(&io);
        let second = event.read(&io);
        io.spawn(async move {
            assert_eq!(first.await.unwrap(), 1);
            assert_eq!(second.await.unwrap(), 1);
        });
        io.run();
    }

    #[test]
    fn cross_thread_write_wakes_reader() {
        let io = IoQueue::with_capacity(8).unwrap();
        let event = std::sync::Arc::new(EventFd::new(EventFdFlags::None));
        let writer = std::sync::Arc::clone(&event);
        let read = event.read(&io);
        io.spawn(async move {
            assert_eq!(read.await.unwrap(), 7);
        });
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            writer.write(7);
        });
        io.run();
        handle.join().unwrap();
    }

    #[test]
    fn callback_read_delivers_value() {
        let io = IoQueue::with_capacity(8).unwrap();
        let event = EventFd::new(EventFdFlags::None);
        event.write(5);
        let got = std::rc::Rc::new(std::cell::Cell::new(0u64));
        let got2 = std::rc::Rc::clone(&got);
        let handle = event.read_cb(&io, move |res| got2.set(res.unwrap()));
        assert!(handle.valid());
        io.run();
        assert_eq!(got.get(), 5);
    }
}
