use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

mod queue;

pub use queue::TimerQueue;

/// Lifecycle of a [`Timer`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerState {
    /// Created, never queued.
    Init,
    /// Queued and waiting for its deadline.
    Started,
    /// The callback is running.
    Pending,
    /// Fired for the last time or stopped. Terminal.
    Stopped,
}

impl TimerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TimerState::Init,
            1 => TimerState::Started,
            2 => TimerState::Pending,
            _ => TimerState::Stopped,
        }
    }
}

impl Display for TimerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

type TimerCallback = Box<dyn Fn() + Send + Sync>;

/// A one-shot or repeating timeout.
///
/// Callbacks run on the timer thread and must stay short; transports only post
/// a channel event from them.
pub struct Timer {
    state: AtomicU8,
    timeout: Duration,
    repeated: bool,
    overtime: AtomicU64,
    queue: OnceLock<Weak<TimerQueue>>,
    callback: TimerCallback,
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .field("repeated", &self.repeated)
            .field("overtime", &self.overtime.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Timer {
    pub fn new<F>(timeout: Duration, repeated: bool, callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Timer {
            state: AtomicU8::new(TimerState::Init as u8),
            timeout,
            repeated,
            overtime: AtomicU64::new(0),
            queue: OnceLock::new(),
            callback: Box::new(callback),
        })
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        TimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == TimerState::Started
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    /// Deadline on the [`pump_timer::now`] clock.
    #[must_use]
    pub fn overtime(&self) -> u64 {
        self.overtime.load(Ordering::Acquire)
    }

    /// Prevent any further firing and leave the queue. A running callback
    /// finishes.
    pub fn stop(self: &Arc<Self>) {
        self.state
            .store(TimerState::Stopped as u8, Ordering::Release);
        if let Some(queue) = self.queue.get().and_then(Weak::upgrade) {
            queue.remove_timer(self);
        }
    }

    fn change_state(&self, from: TimerState, to: TimerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Init` -> `Started` on `queue`, computing the deadline.
    pub(crate) fn arm(&self, queue: &Arc<TimerQueue>) -> bool {
        if !self.change_state(TimerState::Init, TimerState::Started) {
            return false;
        }
        _ = self.queue.set(Arc::downgrade(queue));
        self.overtime.store(
            pump_timer::get_timeout_time(self.timeout),
            Ordering::Release,
        );
        true
    }

    /// Run the callback once, then either re-queue or finish.
    pub(crate) fn handle_timeout(self: &Arc<Self>, queue: &TimerQueue) {
        if !self.change_state(TimerState::Started, TimerState::Pending) {
            return;
        }
        (self.callback)();
        if self.repeated && self.change_state(TimerState::Pending, TimerState::Started) {
            self.overtime.store(
                pump_timer::get_timeout_time(self.timeout),
                Ordering::Release,
            );
            if !queue.restart_timer(self) {
                self.stop();
            }
        } else {
            _ = self.change_state(TimerState::Pending, TimerState::Stopped);
        }
    }
}
