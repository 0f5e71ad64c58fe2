use crate::poll::backend::{Backend, Readiness, TrackerMap};
use crate::poll::channel::{ChannelEvent, ChannelKey, ChannelRegistry, EventKind};
use crate::poll::tracker::{ChannelTracker, TrackEvent, TrackMode, TrackerState};
use crossbeam_deque::{Injector, Steal};
use std::fmt::{Debug, Display, Formatter};
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Readiness facilities.
pub mod backend;

/// Channels and their registry.
pub mod channel;

/// Channel trackers.
pub mod tracker;


/// The two pollers every service runs.
#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PollerId {
    /// Read readiness, accepts and handshake reads.
    Read = 0,
    /// Send readiness, connects and posted channel events.
    Send = 1,
}

impl PollerId {
    /// Both ids, in index order.
    pub const ALL: [PollerId; 2] = [PollerId::Read, PollerId::Send];

    /// Index into the poller array.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Display for PollerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Debug)]
enum TrackerEvent {
    Install(Arc<ChannelTracker>),
    Remove(Arc<ChannelTracker>),
    Resume(Arc<ChannelTracker>),
}

#[derive(Debug)]
struct PollerShared {
    name: String,
    running: AtomicBool,
    notified: AtomicBool,
    poll_timeout: Duration,
    backend: Box<dyn Backend>,
    registry: Arc<ChannelRegistry>,
    tracker_events: Injector<TrackerEvent>,
    channel_events: Injector<(ChannelKey, ChannelEvent)>,
    tracker_count: AtomicUsize,
}

/// A readiness loop on its own thread.
///
/// Producers on any thread push tracker and channel events into lock-free
/// queues; only the worker thread consumes them, and the tracker map lives on
/// that thread's stack, so it has exactly one writer.
#[derive(Debug)]
pub struct Poller {
    shared: Arc<PollerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn Backend>,
        registry: Arc<ChannelRegistry>,
        poll_timeout: Duration,
    ) -> Self {
        Poller {
            shared: Arc::new(PollerShared {
                name: name.into(),
                running: AtomicBool::new(false),
                notified: AtomicBool::new(false),
                poll_timeout,
                backend,
                registry,
                tracker_events: Injector::new(),
                channel_events: Injector::new(),
                tracker_count: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get_name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of trackers installed as of the last loop iteration.
    #[must_use]
    pub fn tracker_count(&self) -> usize {
        self.shared.tracker_count.load(Ordering::Acquire)
    }

    /// Spawn the worker thread.
    ///
    /// # Errors
    /// if already started or the thread cannot be spawned.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some()
            || self
                .shared
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already started", self.shared.name),
            ));
        }
        let shared = self.shared.clone();
        match std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Ask the loop to exit; see [`Poller::wait_stopped`].
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.wake();
        }
    }

    /// Block until the worker thread exited. Returns at once when called from
    /// the worker itself.
    pub fn wait_stopped(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                crate::error!("{} worker panicked", self.shared.name);
            }
        }
    }

    /// Install `tracker`.
    ///
    /// The backend registration happens on the calling thread so its failure can
    /// be reported; the map insertion is queued for the worker. Returns `false`
    /// if the poller is not running, the tracker was used before, or the OS
    /// refused the descriptor.
    pub fn add_channel_tracker(&self, tracker: &Arc<ChannelTracker>) -> bool {
        let shared = &self.shared;
        if !self.is_running() || tracker.state() != TrackerState::Unregistered {
            return false;
        }
        shared
            .tracker_events
            .push(TrackerEvent::Install(tracker.clone()));
        if let Err(e) = shared.backend.install(tracker) {
            crate::warn!(
                "{} install tracker {} of {} failed: {e}",
                shared.name,
                tracker.id(),
                tracker.key()
            );
            shared
                .tracker_events
                .push(TrackerEvent::Remove(tracker.clone()));
            shared.wake();
            return false;
        }
        shared.wake();
        true
    }

    /// Uninstall `tracker`. Calling it again is harmless.
    pub fn remove_channel_tracker(&self, tracker: &Arc<ChannelTracker>) {
        let shared = &self.shared;
        if !tracker.uninstall_with(|| shared.uninstall_backend(tracker)) {
            return;
        }
        if self.is_running() {
            // the worker drops it from the map and lets go of the descriptor
            shared
                .tracker_events
                .push(TrackerEvent::Remove(tracker.clone()));
            shared.wake();
        } else {
            drop(tracker.release_fd());
        }
    }

    /// Re-arm a one-shot tracker after it fired. Persistent trackers never
    /// disarm, so this is a no-op for them.
    pub fn resume_channel_tracker(&self, tracker: &Arc<ChannelTracker>) -> bool {
        if !self.is_running() || tracker.state() == TrackerState::Removed {
            return false;
        }
        if tracker.mode() == TrackMode::Persistent {
            return true;
        }
        self.shared
            .tracker_events
            .push(TrackerEvent::Resume(tracker.clone()));
        self.shared.wake();
        true
    }

    /// Run the handler of the channel under `key` on this poller's thread.
    pub fn push_channel_event(&self, key: ChannelKey, event: ChannelEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        self.shared.channel_events.push((key, event));
        self.shared.wake();
        true
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
        self.wait_stopped();
    }
}

impl PollerShared {
    fn wake(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.backend.notify() {
                crate::warn!("{} wake up failed: {e}", self.name);
            }
        }
    }

    fn run(&self) {
        crate::info!("{} started", self.name);
        let mut trackers = TrackerMap::new();
        let mut ready: Vec<Readiness> = Vec::new();
        while self.running.load(Ordering::Acquire) {
            // an RMW, so a racing wake either sees it and signals or is seen
            // by the drain below
            _ = self.notified.swap(false, Ordering::AcqRel);
            self.handle_tracker_events(&mut trackers);
            self.handle_channel_events();
            ready.clear();
            if let Err(e) = self.backend.poll(&trackers, self.poll_timeout, &mut ready) {
                crate::warn!("{} wait failed, retrying: {e}", self.name);
                std::thread::sleep(self.poll_timeout);
                continue;
            }
            for readiness in &ready {
                self.dispatch(&mut trackers, readiness);
            }
        }
        self.handle_tracker_events(&mut trackers);
        for (_, tracker) in trackers.drain() {
            self.uninstall(&tracker);
        }
        self.tracker_count.store(0, Ordering::Release);
        crate::info!("{} stopped", self.name);
    }

    fn uninstall_backend(&self, tracker: &ChannelTracker) {
        if let Err(e) = self.backend.uninstall(tracker) {
            crate::warn!("{} uninstall tracker {} failed: {e}", self.name, tracker.id());
        }
    }

    fn uninstall(&self, tracker: &ChannelTracker) {
        _ = tracker.uninstall_with(|| self.uninstall_backend(tracker));
        drop(tracker.release_fd());
    }

    fn handle_tracker_events(&self, trackers: &mut TrackerMap) {
        loop {
            match self.tracker_events.steal() {
                Steal::Success(event) => self.handle_tracker_event(trackers, event),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        self.tracker_count.store(trackers.len(), Ordering::Release);
    }

    fn handle_tracker_event(&self, trackers: &mut TrackerMap, event: TrackerEvent) {
        match event {
            TrackerEvent::Install(tracker) => {
                if tracker.change_state(TrackerState::Unregistered, TrackerState::Armed) {
                    _ = trackers.insert(tracker.id(), tracker);
                }
            }
            TrackerEvent::Remove(tracker) => {
                _ = trackers.remove(&tracker.id());
                self.uninstall(&tracker);
            }
            TrackerEvent::Resume(tracker) => {
                if !trackers.contains_key(&tracker.id()) {
                    return;
                }
                _ = tracker.while_installed(|| {
                    if tracker.change_state(TrackerState::Disarmed, TrackerState::Armed) {
                        if let Err(e) = self.backend.resume(&tracker) {
                            crate::warn!("{} resume tracker {} failed: {e}", self.name, tracker.id());
                        }
                    }
                });
            }
        }
    }

    fn handle_channel_events(&self) {
        // events posted by the handlers below wait for the next iteration
        let mut budget = self.channel_events.len();
        while budget > 0 {
            match self.channel_events.steal() {
                Steal::Success((key, event)) => {
                    budget -= 1;
                    if let Some(channel) = self.registry.get(key) {
                        channel.handle_event(EventKind::Channel(event));
                    }
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    fn dispatch(&self, trackers: &mut TrackerMap, readiness: &Readiness) {
        let tracker = if let Some(tracker) = trackers.get(&readiness.id) {
            tracker.clone()
        } else {
            // the OS registration can race ahead of the queued install
            self.handle_tracker_events(trackers);
            match trackers.get(&readiness.id) {
                Some(tracker) => tracker.clone(),
                None => return,
            }
        };
        if tracker.mode() == TrackMode::Once
            && !tracker.change_state(TrackerState::Armed, TrackerState::Disarmed)
        {
            return;
        }
        if tracker.mode() == TrackMode::Persistent && !tracker.is_tracking() {
            return;
        }
        let Some(channel) = self.registry.get(tracker.key()) else {
            _ = trackers.remove(&tracker.id());
            self.uninstall(&tracker);
            return;
        };
        match tracker.event() {
            TrackEvent::Read => channel.handle_event(EventKind::Read),
            TrackEvent::Send => channel.handle_event(EventKind::Send),
            TrackEvent::Both => {
                let neither = !readiness.readable && !readiness.writable;
                if readiness.readable || neither {
                    channel.handle_event(EventKind::Read);
                }
                if readiness.writable || neither {
                    channel.handle_event(EventKind::Send);
                }
            }
        }
    }
}
