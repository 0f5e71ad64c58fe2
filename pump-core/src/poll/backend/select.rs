use crate::poll::backend::{Backend, Readiness, TrackerMap};
use crate::poll::tracker::{ChannelTracker, Fd};
use std::io::{Error, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// `select(2)` over the armed trackers, rebuilt on every wait.
///
/// Registration is bookkeeping only: the descriptor sets come from the tracker
/// map owned by the poller thread, so a disarmed one-shot tracker is simply left
/// out of the next set.
#[derive(Debug)]
pub struct SelectBackend {
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

fn in_range(fd: Fd) -> bool {
    usize::try_from(fd).is_ok_and(|fd| fd < libc::FD_SETSIZE as usize)
}

impl SelectBackend {
    /// # Errors
    /// if the wake-up socket pair cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(SelectBackend { wake_rx, wake_tx })
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

impl Backend for SelectBackend {
    fn install(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        if in_range(tracker.fd()) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidInput,
                format!("fd {} does not fit in an fd_set", tracker.fd()),
            ))
        }
    }

    fn uninstall(&self, _tracker: &ChannelTracker) -> std::io::Result<()> {
        Ok(())
    }

    fn resume(&self, _tracker: &ChannelTracker) -> std::io::Result<()> {
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn poll(
        &self,
        trackers: &TrackerMap,
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> std::io::Result<()> {
        let mut rfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut wfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut rfds);
            libc::FD_ZERO(&mut wfds);
        }
        let waker = self.wake_rx.as_raw_fd();
        unsafe { libc::FD_SET(waker, &mut rfds) };
        let mut max_fd = waker;
        for tracker in trackers.values().filter(|t| t.is_tracking()) {
            let fd = tracker.fd();
            if !in_range(fd) {
                continue;
            }
            if tracker.event().wants_read() {
                unsafe { libc::FD_SET(fd, &mut rfds) };
            }
            if tracker.event().wants_send() {
                unsafe { libc::FD_SET(fd, &mut wfds) };
            }
            max_fd = max_fd.max(fd);
        }
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros() as i32),
        };
        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut rfds,
                &mut wfds,
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if n < 0 {
            let e = Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }
        if n == 0 {
            return Ok(());
        }
        if unsafe { libc::FD_ISSET(waker, &rfds) } {
            self.drain_waker();
        }
        for tracker in trackers.values().filter(|t| t.is_tracking()) {
            let fd = tracker.fd();
            if !in_range(fd) {
                continue;
            }
            let readable = tracker.event().wants_read() && unsafe { libc::FD_ISSET(fd, &rfds) };
            let writable = tracker.event().wants_send() && unsafe { libc::FD_ISSET(fd, &wfds) };
            if readable || writable {
                ready.push(Readiness {
                    id: tracker.id(),
                    readable,
                    writable,
                });
            }
        }
        Ok(())
    }

    fn notify(&self) -> std::io::Result<()> {
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
