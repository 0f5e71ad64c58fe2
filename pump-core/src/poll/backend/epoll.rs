use crate::poll::backend::{Backend, Readiness, TrackerMap, WAKE_TOKEN};
use crate::poll::tracker::{ChannelTracker, Fd, TrackMode};
use std::io::{Error, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const MAX_EVENTS: usize = 1024;

/// `epoll(7)` with `EPOLLONESHOT` for one-shot trackers and an eventfd for wake-ups.
#[derive(Debug)]
pub struct EpollBackend {
    epfd: OwnedFd,
    waker: OwnedFd,
    events: Mutex<Vec<libc::epoll_event>>,
}

fn cvt(ret: libc::c_int) -> std::io::Result<libc::c_int> {
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[allow(clippy::cast_sign_loss)]
fn interest(tracker: &ChannelTracker) -> u32 {
    let mut flags = 0;
    if tracker.event().wants_read() {
        flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if tracker.event().wants_send() {
        flags |= libc::EPOLLOUT;
    }
    if tracker.mode() == TrackMode::Once {
        flags |= libc::EPOLLONESHOT;
    }
    flags as u32
}

impl EpollBackend {
    /// # Errors
    /// if `epoll_create1` or `eventfd` fail.
    pub fn new() -> std::io::Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        let waker = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        let waker = unsafe { OwnedFd::from_raw_fd(waker) };
        let backend = EpollBackend {
            epfd,
            waker,
            events: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        #[allow(clippy::cast_sign_loss)]
        backend.ctl(
            libc::EPOLL_CTL_ADD,
            backend.waker.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN as u64,
        )?;
        Ok(backend)
    }

    fn ctl(&self, op: libc::c_int, fd: Fd, events: u32, token: u64) -> std::io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        _ = cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    fn drain_waker(&self) {
        let mut value: u64 = 0;
        _ = unsafe {
            libc::read(
                self.waker.as_raw_fd(),
                std::ptr::addr_of_mut!(value).cast(),
                std::mem::size_of::<u64>(),
            )
        };
    }
}

impl Backend for EpollBackend {
    fn install(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            tracker.fd(),
            interest(tracker),
            tracker.id() as u64,
        )
    }

    fn uninstall(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, tracker.fd(), 0, 0) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) => Ok(()),
            other => other,
        }
    }

    fn resume(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            tracker.fd(),
            interest(tracker),
            tracker.id() as u64,
        )
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn poll(
        &self,
        _trackers: &TrackerMap,
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> std::io::Result<()> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.clear();
        let timeout_ms = libc::c_int::try_from(timeout.as_millis().max(1)).unwrap_or(libc::c_int::MAX);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let e = Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }
        unsafe { events.set_len(n as usize) };
        let readable_mask = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
        let writable_mask = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;
        for event in events.iter() {
            let flags = event.events;
            let token = event.u64;
            if token == WAKE_TOKEN as u64 {
                self.drain_waker();
                continue;
            }
            ready.push(Readiness {
                id: token as usize,
                readable: flags & readable_mask != 0,
                writable: flags & writable_mask != 0,
            });
        }
        Ok(())
    }

    fn notify(&self) -> std::io::Result<()> {
        let value: u64 = 1;
        let n = unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let e = Error::last_os_error();
            // the counter is saturated, a wake-up is already pending
            if e.kind() != ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }
}
