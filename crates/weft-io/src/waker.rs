//! Self-pipe used to interrupt `epoll_wait`

use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> Result<Self, Errno> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds has room for both ends
        Errno::result(unsafe {
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        })?;
        // Safety: both descriptors are new and unowned
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// Read end, registered for `Read` with the poller
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    #[cfg(test)]
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Make the read end readable
    ///
    /// A full pipe already guarantees a wakeup, so EAGAIN is ignored.
    pub fn wake(&self) {
        let byte = b'T';
        // Safety: one byte from a live buffer
        let ret = unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
        match Errno::result(ret) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => weft_core::kerror!("waker write failed: {}", e),
        }
    }

    /// Consume every pending wake byte
    ///
    /// Registration is edge-triggered; leftover bytes would suppress the
    /// next edge.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            // Safety: reads into a live stack buffer
            let ret = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            match Errno::result(ret) {
                Ok(0) | Err(Errno::EAGAIN) => return total,
                Ok(n) => total += n as usize,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    weft_core::kerror!("waker drain failed: {}", e);
                    return total;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_then_drain() {
        let waker = Waker::new().unwrap();
        assert_eq!(waker.drain(), 0);
        waker.wake();
        waker.wake();
        assert_eq!(waker.drain(), 2);
        assert_eq!(waker.drain(), 0);
    }

    #[test]
    fn test_wake_on_full_pipe_is_silent() {
        let waker = Waker::new().unwrap();
        // Default pipe capacity is 64KiB
        for _ in 0..70_000 {
            waker.wake();
        }
        assert!(waker.drain() >= 4096);
    }
}
