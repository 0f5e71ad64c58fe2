use crate::poll::backend::{Backend, Readiness, TrackerMap};
use crate::poll::tracker::{ChannelTracker, TrackMode};
use polling::{Event, Events, PollMode, Poller};
use std::io::ErrorKind;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Readiness through the `polling` crate, which picks epoll, kqueue, event ports
/// or IOCP for the target.
#[derive(Debug)]
pub struct PollingBackend {
    poller: Poller,
    events: Mutex<Events>,
}

fn interest(tracker: &ChannelTracker) -> Event {
    let key = tracker.id();
    match (tracker.event().wants_read(), tracker.event().wants_send()) {
        (true, true) => Event::all(key),
        (false, true) => Event::writable(key),
        _ => Event::readable(key),
    }
}

fn mode(tracker: &ChannelTracker) -> PollMode {
    match tracker.mode() {
        TrackMode::Once => PollMode::Oneshot,
        TrackMode::Persistent => PollMode::Level,
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn borrow(tracker: &ChannelTracker) -> std::os::windows::io::BorrowedSocket<'_> {
            unsafe { std::os::windows::io::BorrowedSocket::borrow_raw(tracker.fd()) }
        }
    } else {
        fn borrow(tracker: &ChannelTracker) -> std::os::fd::BorrowedFd<'_> {
            unsafe { std::os::fd::BorrowedFd::borrow_raw(tracker.fd()) }
        }
    }
}

impl PollingBackend {
    /// # Errors
    /// if the OS poller cannot be created.
    pub fn new() -> std::io::Result<Self> {
        Ok(PollingBackend {
            poller: Poller::new()?,
            events: Mutex::new(Events::new()),
        })
    }
}

impl Backend for PollingBackend {
    fn install(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        // the tracker keeps the descriptor alive until `uninstall`
        unsafe {
            self.poller
                .add_with_mode(tracker.fd(), interest(tracker), mode(tracker))
        }
    }

    fn uninstall(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        match self.poller.delete(borrow(tracker)) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn resume(&self, tracker: &ChannelTracker) -> std::io::Result<()> {
        self.poller
            .modify_with_mode(borrow(tracker), interest(tracker), mode(tracker))
    }

    fn poll(
        &self,
        _trackers: &TrackerMap,
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> std::io::Result<()> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.clear();
        match self.poller.wait(&mut events, Some(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        ready.extend(events.iter().map(|event| Readiness {
            id: event.key,
            readable: event.readable,
            writable: event.writable,
        }));
        Ok(())
    }

    fn notify(&self) -> std::io::Result<()> {
        self.poller.notify()
    }
}
