use crate::poll::tracker::ChannelTracker;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;
mod portable;
#[cfg(unix)]
mod select;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
pub use portable::PollingBackend;
#[cfg(unix)]
pub use select::SelectBackend;

/// Token reserved for the wake-up source of a backend.
pub(crate) const WAKE_TOKEN: usize = usize::MAX;

/// Installed trackers of one poller, keyed by tracker id.
pub type TrackerMap = HashMap<usize, Arc<ChannelTracker>>;

/// One readiness notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Readiness {
    /// Id of the tracker that became ready.
    pub id: usize,
    /// Readable, hung up or failed.
    pub readable: bool,
    /// Writable, hung up or failed.
    pub writable: bool,
}

/// An OS readiness facility.
///
/// `install`, `uninstall` and `notify` may be called from any thread; `resume`
/// and `poll` are only called from the poller thread. One-shot trackers must not
/// be reported again after a notification until `resume` is called.
pub trait Backend: Debug + Send + Sync {
    /// Start watching the descriptor of `tracker`.
    ///
    /// # Errors
    /// if the OS refuses the registration.
    fn install(&self, tracker: &ChannelTracker) -> std::io::Result<()>;

    /// Stop watching the descriptor. Unknown descriptors are not an error.
    ///
    /// # Errors
    /// if the OS call fails for another reason.
    fn uninstall(&self, tracker: &ChannelTracker) -> std::io::Result<()>;

    /// Re-arm a one-shot tracker.
    ///
    /// # Errors
    /// if the OS call fails.
    fn resume(&self, tracker: &ChannelTracker) -> std::io::Result<()>;

    /// Wait up to `timeout` and append what became ready to `ready`.
    ///
    /// # Errors
    /// if the wait call fails; interrupted waits return `Ok`.
    fn poll(
        &self,
        trackers: &TrackerMap,
        timeout: Duration,
        ready: &mut Vec<Readiness>,
    ) -> std::io::Result<()>;

    /// Make a blocked or the next `poll` return early.
    ///
    /// # Errors
    /// if the wake-up source cannot be signalled.
    fn notify(&self) -> std::io::Result<()>;
}

/// The readiness facility a service uses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BackendKind {
    /// `select(2)`, limited to descriptors below `FD_SETSIZE`.
    Select,
    /// `epoll(7)`, Linux only.
    Epoll,
    /// The `polling` crate: epoll, kqueue, event ports or IOCP.
    Polling,
}

impl Default for BackendKind {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                BackendKind::Epoll
            } else {
                BackendKind::Polling
            }
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl BackendKind {
    /// Create a fresh backend instance.
    ///
    /// # Errors
    /// if the kind is not available on this platform or the OS refuses.
    pub fn create(self) -> std::io::Result<Box<dyn Backend>> {
        match self {
            BackendKind::Select => {
                cfg_if::cfg_if! {
                    if #[cfg(unix)] {
                        Ok(Box::new(SelectBackend::new()?))
                    } else {
                        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "select backend needs unix"))
                    }
                }
            }
            BackendKind::Epoll => {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        Ok(Box::new(EpollBackend::new()?))
                    } else {
                        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "epoll backend needs linux"))
                    }
                }
            }
            BackendKind::Polling => Ok(Box::new(PollingBackend::new()?)),
        }
    }
}
