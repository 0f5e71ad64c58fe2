use crate::poll::channel::ChannelKey;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        /// Native socket handle.
        pub type Fd = std::os::windows::io::RawSocket;

        /// Anything that owns a socket handle.
        pub trait FdSource: Debug + Send + Sync {
            /// The raw handle, valid while `self` is alive.
            fn fd(&self) -> Fd;
        }

        impl<T: std::os::windows::io::AsRawSocket + Debug + Send + Sync> FdSource for T {
            fn fd(&self) -> Fd {
                self.as_raw_socket()
            }
        }
    } else {
        /// Native socket handle.
        pub type Fd = std::os::fd::RawFd;

        /// Anything that owns a socket handle.
        pub trait FdSource: Debug + Send + Sync {
            /// The raw handle, valid while `self` is alive.
            fn fd(&self) -> Fd;
        }

        impl<T: std::os::fd::AsRawFd + Debug + Send + Sync> FdSource for T {
            fn fd(&self) -> Fd {
                self.as_raw_fd()
            }
        }
    }
}

/// Which readiness a tracker waits for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrackEvent {
    Read,
    Send,
    Both,
}

impl TrackEvent {
    #[must_use]
    pub fn wants_read(self) -> bool {
        matches!(self, TrackEvent::Read | TrackEvent::Both)
    }

    #[must_use]
    pub fn wants_send(self) -> bool {
        matches!(self, TrackEvent::Send | TrackEvent::Both)
    }
}

/// Whether a tracker disarms itself after each dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrackMode {
    /// Disarmed after every dispatch until resumed.
    Once,
    /// Stays armed until removed.
    Persistent,
}

/// Lifecycle of a tracker inside its poller.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrackerState {
    /// Not yet seen by a poller thread.
    Unregistered,
    /// Installed and waiting for readiness.
    Armed,
    /// Installed, a one-shot dispatch happened and no resume came in yet.
    Disarmed,
    /// Removed from its poller. Terminal.
    Removed,
}

impl TrackerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TrackerState::Unregistered,
            1 => TrackerState::Armed,
            2 => TrackerState::Disarmed,
            _ => TrackerState::Removed,
        }
    }
}

impl Display for TrackerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

static TRACKER_ID: AtomicUsize = AtomicUsize::new(1);

/// Describes how a poller watches one channel.
///
/// The tracker refers to its channel only through a registry key. When created
/// with [`ChannelTracker::new`] it also holds a share of the socket, which the
/// poller drops once the tracker is uninstalled, so the descriptor cannot be
/// closed while the backend still watches it.
#[derive(Debug)]
pub struct ChannelTracker {
    id: usize,
    key: ChannelKey,
    fd: Fd,
    event: TrackEvent,
    mode: TrackMode,
    state: AtomicU8,
    // serializes backend registration changes against removal
    registration: Mutex<()>,
    fd_holder: Mutex<Option<Arc<dyn FdSource>>>,
}

impl ChannelTracker {
    /// A tracker that shares ownership of `source`.
    #[must_use]
    pub fn new(
        key: ChannelKey,
        source: Arc<dyn FdSource>,
        event: TrackEvent,
        mode: TrackMode,
    ) -> Self {
        let fd = source.fd();
        Self::build(key, fd, Some(source), event, mode)
    }

    /// A tracker for a descriptor owned elsewhere.
    #[must_use]
    pub fn borrowed(key: ChannelKey, fd: Fd, event: TrackEvent, mode: TrackMode) -> Self {
        Self::build(key, fd, None, event, mode)
    }

    fn build(
        key: ChannelKey,
        fd: Fd,
        fd_holder: Option<Arc<dyn FdSource>>,
        event: TrackEvent,
        mode: TrackMode,
    ) -> Self {
        ChannelTracker {
            id: TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            key,
            fd,
            event,
            mode,
            state: AtomicU8::new(TrackerState::Unregistered as u8),
            registration: Mutex::new(()),
            fd_holder: Mutex::new(fd_holder),
        }
    }

    /// Unique per process, used as the backend token.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    #[must_use]
    pub fn fd(&self) -> Fd {
        self.fd
    }

    #[must_use]
    pub fn event(&self) -> TrackEvent {
        self.event
    }

    #[must_use]
    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `true` while armed.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.state() == TrackerState::Armed
    }

    #[must_use]
    pub fn has_fd_ownership(&self) -> bool {
        self.fd_holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn change_state(&self, from: TrackerState, to: TrackerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_removed(&self) {
        self.state
            .store(TrackerState::Removed as u8, Ordering::Release);
    }

    /// Run `update` against the backend registration unless the tracker was
    /// uninstalled already. Uninstalling waits for a running update.
    pub(crate) fn while_installed<R>(&self, update: impl FnOnce() -> R) -> Option<R> {
        let _registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() == TrackerState::Removed {
            return None;
        }
        Some(update())
    }

    /// Run `uninstall` and mark the tracker removed, once. Afterwards neither a
    /// queued resume nor a late dispatch touches the descriptor again, which
    /// may already be registered by a successor tracker.
    pub(crate) fn uninstall_with(&self, uninstall: impl FnOnce()) -> bool {
        let _registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() == TrackerState::Removed {
            return false;
        }
        uninstall();
        self.mark_removed();
        true
    }

    pub(crate) fn release_fd(&self) -> Option<Arc<dyn FdSource>> {
        self.fd_holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
