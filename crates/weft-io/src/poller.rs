//! Thin epoll wrapper
//!
//! Every registration is edge-triggered and carries its fd as user data.
//! Errors come back as `Errno`; retry policy (EINTR) belongs to the caller.

use crate::event::EventMask;
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> Result<Self, Errno> {
        // Safety: plain syscall, result checked
        let fd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // Safety: fd is freshly created and owned by nobody else
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: events | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        // Safety: ev outlives the call
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        Errno::result(ret).map(drop)
    }

    /// Register `fd`, which must not be registered yet
    pub fn add(&self, fd: RawFd, mask: EventMask) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask.bits())
    }

    /// Replace the interest set of a registered `fd`
    pub fn modify(&self, fd: RawFd, mask: EventMask) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask.bits())
    }

    pub fn delete(&self, fd: RawFd) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Shrink the interest set to `remaining`, deregistering when empty
    pub fn rearm(&self, fd: RawFd, remaining: EventMask) -> Result<(), Errno> {
        if remaining.is_empty() {
            self.delete(fd)
        } else {
            self.modify(fd, remaining)
        }
    }

    /// Wait up to `timeout_ms`; returns how many leading entries were filled
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize, Errno> {
        // Safety: the kernel writes at most events.len() entries
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        Errno::result(n).map(|n| n as usize)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

/// Zeroed buffer for `Poller::wait`
pub(crate) fn event_buffer(len: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; len]
}
