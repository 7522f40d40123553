use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// An owned sync file.
///
/// A sync file becomes readable (`POLLIN`) once the work it represents has completed.  Waiting
/// never consumes it; dropping it closes the fd.
#[derive(Debug)]
pub struct SyncFile {
    fd: OwnedFd,
}

impl SyncFile {
    #[must_use]
    pub const fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Blocks until the fence signals.  `None` waits forever.
    ///
    /// Returns `Ok(false)` when the timeout expires first.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    i32::try_from(left.as_millis()).unwrap_or(i32::MAX)
                }
            };

            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            let ret = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
            match ret {
                0 => return Ok(false),
                n if n > 0 => {
                    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "sync file reported an error",
                        ));
                    }
                    return Ok(true);
                }
                _ => {
                    let err = io::Error::last_os_error();
                    if !matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) {
                        return Err(err);
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SyncFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SyncFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for SyncFile {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn eventfd(initval: u32) -> OwnedFd {
        let raw = unsafe { libc::eventfd(initval, libc::EFD_CLOEXEC) };
        assert!(raw >= 0);
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn signaled_fence_returns_immediately() {
        let fence = SyncFile::new(eventfd(1));
        assert!(fence.wait(None).unwrap());
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let fence = SyncFile::new(eventfd(0));
        assert!(!fence.wait(Some(Duration::from_millis(10))).unwrap());
    }
}
