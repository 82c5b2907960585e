//! Thin binding over the kernel submission/completion ring.
//!
//! This wraps [`io_uring::IoUring`] without adding policy: per-opcode entry
//! builders mirroring the kernel vocabulary, a staging slot for the most
//! recently prepared entry, and the submit/peek surface the event loop
//! drives. Not thread-safe; two threads racing on completion consumption
//! would require delaying the head advance until all in-flight handlers
//! finish, which is deliberately not supported.

use std::io;
use std::os::unix::io::RawFd;

use io_uring::{opcode, squeue, types, IoUring};

use crate::error::{QueueError, Result};

/// The ring plus a single staged (prepared but not yet pushed) entry.
///
/// Entries cannot be mutated once pushed onto the submission queue, so the
/// most recent one is held back here. That keeps its flags writable long
/// enough to link a timeout onto it. The slot is flushed when the next
/// entry is staged and at the top of every loop iteration.
pub struct Uring {
    ring: IoUring,
    staged: Option<(u64, squeue::Entry)>,
}

impl Uring {
    /// Set up a ring with the given capacity (a power of two in
    /// [1, 4096]) and optionally kernel-side submission polling.
    ///
    /// The no-drop and submit-stable completion semantics are required;
    /// their absence is an error.
    pub fn new(capacity: u32, sq_poll: bool) -> Result<Self> {
        if !capacity.is_power_of_two() || capacity > 4096 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        let mut builder = IoUring::builder();
        if sq_poll {
            builder.setup_sqpoll(2000);
        }
        let ring = builder
            .build(capacity)
            .map_err(|e| QueueError::Setup(e.raw_os_error().unwrap_or(-1)))?;
        if !ring.params().is_feature_nodrop() {
            return Err(QueueError::MissingFeature("IORING_FEAT_NODROP"));
        }
        if !ring.params().is_feature_submit_stable() {
            return Err(QueueError::MissingFeature("IORING_FEAT_SUBMIT_STABLE"));
        }
        Ok(Self { ring, staged: None })
    }

    pub fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }

    /// Free submission slots, counting the staged entry as occupied.
    pub fn space_left(&mut self) -> usize {
        let staged = usize::from(self.staged.is_some());
        let sq = self.ring.submission();
        sq.capacity() - sq.len() - staged
    }

    /// Hold back an entry as the most recently prepared one. The caller
    /// must have checked [`space_left`](Self::space_left) first.
    pub fn stage(&mut self, user_data: u64, entry: squeue::Entry) {
        debug_assert!(self.staged.is_none());
        self.staged = Some((user_data, entry));
    }

    pub fn staged_user_data(&self) -> Option<u64> {
        self.staged.as_ref().map(|(user_data, _)| *user_data)
    }

    /// Push the staged entry onto the submission queue.
    pub fn flush_staged(&mut self) {
        if let Some((_, entry)) = self.staged.take() {
            // A slot was reserved when the entry was staged.
            unsafe { self.ring.submission().push(&entry) }.expect("reserved slot vanished");
        }
    }

    /// Push the staged entry with the link flag set, immediately followed
    /// by `timeout` (a link-timeout entry). Returns false and leaves the
    /// staged entry untouched if there is no staged entry or no room for
    /// the timeout.
    pub fn link_staged(&mut self, timeout: squeue::Entry) -> bool {
        if self.staged.is_none() || self.space_left() < 1 {
            return false;
        }
        let (_, entry) = self.staged.take().unwrap();
        let entry = entry.flags(squeue::Flags::IO_LINK);
        unsafe {
            let mut sq = self.ring.submission();
            sq.push(&entry).expect("reserved slot vanished");
            sq.push(&timeout).expect("checked slot vanished");
        }
        true
    }

    /// Flush pending submissions to the kernel. With submission polling
    /// enabled this only enters the kernel when the poller needs a wakeup.
    pub fn submit(&mut self) -> io::Result<usize> {
        self.ring.submit()
    }

    /// Flush pending submissions and wait until at least `want`
    /// completions are available.
    pub fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        self.ring.submit_and_wait(want)
    }

    /// Take the next completion, if any, advancing the completion head.
    pub fn next_completion(&mut self) -> Option<(u64, i32)> {
        self.ring
            .completion()
            .next()
            .map(|cqe| (cqe.user_data(), cqe.result()))
    }

    // Entry builders, one per opcode. Inputs map 1:1 onto the kernel
    // interface; user_data is stamped by the caller.

    pub fn prepare_nop() -> squeue::Entry {
        opcode::Nop::new().build()
    }

    pub fn prepare_read(fd: RawFd, buf: *mut u8, count: u32, offset: u64) -> squeue::Entry {
        opcode::Read::new(types::Fd(fd), buf, count).offset(offset).build()
    }

    pub fn prepare_write(fd: RawFd, buf: *const u8, count: u32, offset: u64) -> squeue::Entry {
        opcode::Write::new(types::Fd(fd), buf, count).offset(offset).build()
    }

    pub fn prepare_readv(
        fd: RawFd,
        iov: *const libc::iovec,
        iovcnt: u32,
        offset: u64,
    ) -> squeue::Entry {
        opcode::Readv::new(types::Fd(fd), iov, iovcnt).offset(offset).build()
    }

    pub fn prepare_writev(
        fd: RawFd,
        iov: *const libc::iovec,
        iovcnt: u32,
        offset: u64,
    ) -> squeue::Entry {
        opcode::Writev::new(types::Fd(fd), iov, iovcnt).offset(offset).build()
    }

    pub fn prepare_fsync(fd: RawFd, datasync: bool) -> squeue::Entry {
        let flags = if datasync {
            types::FsyncFlags::DATASYNC
        } else {
            types::FsyncFlags::empty()
        };
        opcode::Fsync::new(types::Fd(fd)).flags(flags).build()
    }

    pub fn prepare_poll_add(fd: RawFd, events: u32) -> squeue::Entry {
        opcode::PollAdd::new(types::Fd(fd), events).build()
    }

    pub fn prepare_poll_remove(user_data: u64) -> squeue::Entry {
        opcode::PollRemove::new(user_data).build()
    }

    pub fn prepare_sync_file_range(
        fd: RawFd,
        offset: u64,
        nbytes: u32,
        flags: u32,
    ) -> squeue::Entry {
        opcode::SyncFileRange::new(types::Fd(fd), nbytes)
            .offset(offset)
            .flags(flags)
            .build()
    }

    pub fn prepare_sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: u32) -> squeue::Entry {
        opcode::SendMsg::new(types::Fd(fd), msg).flags(flags).build()
    }

    pub fn prepare_recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: u32) -> squeue::Entry {
        opcode::RecvMsg::new(types::Fd(fd), msg).flags(flags).build()
    }

    pub fn prepare_timeout(ts: *const types::Timespec, flags: types::TimeoutFlags) -> squeue::Entry {
        opcode::Timeout::new(ts).flags(flags).build()
    }

    pub fn prepare_timeout_remove(user_data: u64) -> squeue::Entry {
        opcode::TimeoutRemove::new(user_data).build()
    }

    pub fn prepare_link_timeout(
        ts: *const types::Timespec,
        flags: types::TimeoutFlags,
    ) -> squeue::Entry {
        opcode::LinkTimeout::new(ts).flags(flags).build()
    }

    pub fn prepare_accept(
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    ) -> squeue::Entry {
        opcode::Accept::new(types::Fd(fd), addr, addrlen)
            .flags(libc::SOCK_CLOEXEC)
            .build()
    }

    pub fn prepare_async_cancel(user_data: u64) -> squeue::Entry {
        opcode::AsyncCancel::new(user_data).build()
    }

    pub fn prepare_connect(
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> squeue::Entry {
        opcode::Connect::new(types::Fd(fd), addr, addrlen).build()
    }

    pub fn prepare_openat(
        dirfd: RawFd,
        pathname: *const libc::c_char,
        flags: i32,
        mode: u32,
    ) -> squeue::Entry {
        opcode::OpenAt::new(types::Fd(dirfd), pathname)
            .flags(flags)
            .mode(mode)
            .build()
    }

    pub fn prepare_openat2(
        dirfd: RawFd,
        pathname: *const libc::c_char,
        how: *const types::OpenHow,
    ) -> squeue::Entry {
        opcode::OpenAt2::new(types::Fd(dirfd), pathname, how).build()
    }

    pub fn prepare_close(fd: RawFd) -> squeue::Entry {
        opcode::Close::new(types::Fd(fd)).build()
    }

    pub fn prepare_statx(
        dirfd: RawFd,
        pathname: *const libc::c_char,
        flags: i32,
        mask: u32,
        statxbuf: *mut types::statx,
    ) -> squeue::Entry {
        opcode::Statx::new(types::Fd(dirfd), pathname, statxbuf)
            .flags(flags)
            .mask(mask)
            .build()
    }

    pub fn prepare_send(fd: RawFd, buf: *const u8, len: u32, flags: i32) -> squeue::Entry {
        opcode::Send::new(types::Fd(fd), buf, len).flags(flags).build()
    }

    pub fn prepare_recv(fd: RawFd, buf: *mut u8, len: u32, flags: i32) -> squeue::Entry {
        opcode::Recv::new(types::Fd(fd), buf, len).flags(flags).build()
    }

    pub fn prepare_epoll_ctl(
        epfd: RawFd,
        fd: RawFd,
        op: i32,
        event: *mut libc::epoll_event,
    ) -> squeue::Entry {
        opcode::EpollCtl::new(types::Fd(epfd), types::Fd(fd), op, event as *const _).build()
    }

    pub fn prepare_shutdown(fd: RawFd, how: i32) -> squeue::Entry {
        opcode::Shutdown::new(types::Fd(fd), how).build()
    }

    pub fn prepare_renameat(
        olddirfd: RawFd,
        oldpath: *const libc::c_char,
        newdirfd: RawFd,
        newpath: *const libc::c_char,
        flags: u32,
    ) -> squeue::Entry {
        opcode::RenameAt::new(types::Fd(olddirfd), oldpath, types::Fd(newdirfd), newpath)
            .flags(flags)
            .build()
    }

    pub fn prepare_unlinkat(
        dirfd: RawFd,
        pathname: *const libc::c_char,
        flags: i32,
    ) -> squeue::Entry {
        opcode::UnlinkAt::new(types::Fd(dirfd), pathname)
            .flags(flags)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_capacity() {
        assert!(matches!(
            Uring::new(3, false),
            Err(QueueError::InvalidCapacity(3))
        ));
        assert!(matches!(
            Uring::new(8192, false),
            Err(QueueError::InvalidCapacity(8192))
        ));
    }

    #[test]
    fn setup_reports_capacity() {
        let mut ring = Uring::new(16, false).unwrap();
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.space_left(), 16);
    }

    #[test]
    fn staged_entry_occupies_a_slot() {
        let mut ring = Uring::new(4, false).unwrap();
        ring.stage(1, Uring::prepare_nop().user_data(1));
        assert_eq!(ring.space_left(), 3);
        assert_eq!(ring.staged_user_data(), Some(1));
        ring.flush_staged();
        assert_eq!(ring.space_left(), 3);
        assert_eq!(ring.staged_user_data(), None);
    }

    #[test]
    fn nop_round_trip() {
        let mut ring = Uring::new(4, false).unwrap();
        ring.stage(7, Uring::prepare_nop().user_data(7));
        ring.flush_staged();
        ring.submit_and_wait(1).unwrap();
        let (user_data, res) = ring.next_completion().unwrap();
        assert_eq!(user_data, 7);
        assert_eq!(res, 0);
        assert!(ring.next_completion().is_none());
    }

    #[test]
    fn fills_up() {
        let mut ring = Uring::new(2, false).unwrap();
        ring.stage(1, Uring::prepare_nop().user_data(1));
        ring.flush_staged();
        ring.stage(2, Uring::prepare_nop().user_data(2));
        assert_eq!(ring.space_left(), 0);
        ring.flush_staged();
        ring.submit_and_wait(2).unwrap();
        assert!(ring.next_completion().is_some());
        assert!(ring.next_completion().is_some());
        assert_eq!(ring.space_left(), 2);
    }
}
