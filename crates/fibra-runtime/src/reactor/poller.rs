//! epoll instance plus an eventfd used to interrupt `epoll_wait`

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use fibra_core::{SchedError, SchedResult, WorkerError};

/// Token reserved for the wakeup eventfd
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

fn check(ret: libc::c_int) -> SchedResult<libc::c_int> {
    Errno::result(ret).map_err(|e| SchedError::Os(e as i32))
}

pub(crate) struct Poller {
    epoll: OwnedFd,
    wakeup: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> SchedResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(WorkerError::PollerSetup(Errno::last() as i32).into());
        }
        // Safety: freshly created and owned by nobody else
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(WorkerError::PollerSetup(Errno::last() as i32).into());
        }
        let wakeup = unsafe { OwnedFd::from_raw_fd(efd) };

        let poller = Self { epoll, wakeup };
        poller
            .ctl(libc::EPOLL_CTL_ADD, poller.wakeup.as_raw_fd(), libc::EPOLLIN as u32, WAKE_TOKEN)
            .map_err(|e| match e {
                SchedError::Os(errno) => WorkerError::PollerSetup(errno).into(),
                other => other,
            })?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> SchedResult<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        check(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) })?;
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32, token: u64) -> SchedResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32, token: u64) -> SchedResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Remove `fd`. A descriptor that was already closed is not an error.
    pub(crate) fn delete(&self, fd: RawFd) -> SchedResult<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Err(SchedError::Os(e)) if e == libc::ENOENT || e == libc::EBADF => Ok(()),
            other => other,
        }
    }

    /// Wait for readiness. An interrupted wait reports zero events.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> SchedResult<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(0),
                e => Err(SchedError::Os(e as i32)),
            };
        }
        Ok(n as usize)
    }

    /// Interrupt a concurrent or upcoming `wait`.
    pub(crate) fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wakeup.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, so a wakeup is pending anyway
        if ret < 0 && Errno::last() != Errno::EAGAIN {
            fibra_core::kwarn!("reactor wakeup write failed: {}", Errno::last());
        }
    }

    pub(crate) fn drain_wakeup(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(
                self.wakeup.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_events(n: usize) -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; n]
    }

    #[test]
    fn test_notify_wakes_wait() {
        let poller = Poller::new().unwrap();
        let mut events = empty_events(4);
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);

        poller.notify();
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!({ events[0].u64 }, WAKE_TOKEN);
        poller.drain_wakeup();
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);
    }

    #[test]
    fn test_pipe_readiness() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }, 0);
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let poller = Poller::new().unwrap();
        poller
            .add(r.as_raw_fd(), (libc::EPOLLIN | libc::EPOLLET) as u32, 42)
            .unwrap();
        let mut events = empty_events(4);
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);

        let byte = 1u8;
        unsafe { libc::write(w.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1) };
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
        assert_eq!({ events[0].u64 }, 42);

        poller.delete(r.as_raw_fd()).unwrap();
        // Already gone
        poller.delete(r.as_raw_fd()).unwrap();
    }
}
