use crate::address::Address;
use crate::error::ErrorCode;
use crate::poll::channel::{Channel, ChannelEvent, ChannelKey};
use crate::poll::tracker::{ChannelTracker, FdSource, TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::transport::{ReadMode, TransportState, TransportType};
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

/// State every channel kind carries: lifecycle, addresses, the service it runs
/// in, its registry key and its trackers.
#[derive(Debug)]
pub(crate) struct TransportBase {
    ty: TransportType,
    state: AtomicU8,
    key: OnceLock<ChannelKey>,
    service: OnceLock<Weak<Service>>,
    local: RwLock<Address>,
    remote: RwLock<Address>,
    pending_opts: AtomicUsize,
    suspended: AtomicBool,
    trackers: [Mutex<Option<Arc<ChannelTracker>>>; 2],
}

/// Counts one in-flight call; see [`TransportBase::wait_operations`].
pub(crate) struct OperationGuard<'b>(&'b AtomicUsize);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransportBase {
    pub(crate) fn new(ty: TransportType, local: Address, remote: Address) -> Self {
        TransportBase {
            ty,
            state: AtomicU8::new(TransportState::Inited as u8),
            key: OnceLock::new(),
            service: OnceLock::new(),
            local: RwLock::new(local),
            remote: RwLock::new(remote),
            pending_opts: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
            trackers: [Mutex::new(None), Mutex::new(None)],
        }
    }

    pub(crate) fn get_type(&self) -> TransportType {
        self.ty
    }

    pub(crate) fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// CAS `from` -> `to`. Only the winner runs the side effects of the transition.
    pub(crate) fn change_state(&self, from: TransportState, to: TransportState) -> bool {
        // SeqCst pairs with the operation counter: a stop that wins here either
        // sees a racing sender's count or that sender sees the new state
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_state(&self, to: TransportState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        matches!(
            self.state(),
            TransportState::Started | TransportState::Paused
        )
    }

    /// Remember an event that arrived before the channel could handle it.
    pub(crate) fn set_suspended(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// `true` once for every [`TransportBase::set_suspended`].
    pub(crate) fn take_suspended(&self) -> bool {
        self.suspended.swap(false, Ordering::AcqRel)
    }

    /// Park an event seen while `Starting` (or `Paused`). Returns `true` if the
    /// channel reached `Started` meanwhile and the caller must re-arm itself.
    pub(crate) fn suspend(&self) -> bool {
        self.set_suspended();
        self.state() == TransportState::Started && self.take_suspended()
    }

    /// Wait out a concurrent `start`, returning the state it ended in.
    pub(crate) fn wait_started(&self) -> TransportState {
        let backoff = Backoff::new();
        loop {
            let state = self.state();
            if state != TransportState::Starting {
                return state;
            }
            backoff.snooze();
        }
    }

    pub(crate) fn local_address(&self) -> Address {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_local_address(&self, address: Address) {
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = address;
    }

    pub(crate) fn remote_address(&self) -> Address {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_remote_address(&self, address: Address) {
        *self.remote.write().unwrap_or_else(PoisonError::into_inner) = address;
    }

    pub(crate) fn service(&self) -> Option<Arc<Service>> {
        self.service.get().and_then(Weak::upgrade)
    }

    pub(crate) fn key(&self) -> Option<ChannelKey> {
        self.key.get().copied()
    }

    /// Bind to `service` and enter its registry. Only the first call has effect.
    pub(crate) fn register(&self, service: &Arc<Service>, channel: Channel) -> crate::Result<ChannelKey> {
        if !service.is_running() {
            return Err(ErrorCode::Unstarted);
        }
        if self.service.set(Arc::downgrade(service)).is_err() {
            return Err(ErrorCode::Invalid);
        }
        let key = service.registry().register(channel);
        _ = self.key.set(key);
        Ok(key)
    }

    /// Leave the registry. Late events for the key are dropped from now on.
    pub(crate) fn unregister(&self) {
        if let (Some(service), Some(key)) = (self.service(), self.key()) {
            _ = service.registry().unregister(key);
        }
    }

    pub(crate) fn operation(&self) -> OperationGuard<'_> {
        _ = self.pending_opts.fetch_add(1, Ordering::SeqCst);
        OperationGuard(&self.pending_opts)
    }

    /// Spin, then yield, until no call holds an [`OperationGuard`].
    pub(crate) fn wait_operations(&self) {
        let backoff = Backoff::new();
        while self.pending_opts.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }
    }

    /// Create a tracker for `source` and install it on poller `id`.
    pub(crate) fn add_tracker(
        &self,
        id: PollerId,
        source: Arc<dyn FdSource>,
        event: TrackEvent,
        mode: TrackMode,
    ) -> crate::Result<()> {
        let service = self.service().ok_or(ErrorCode::Unstarted)?;
        let key = self.key().ok_or(ErrorCode::Unstarted)?;
        let tracker = Arc::new(ChannelTracker::new(key, source, event, mode));
        let mut slot = self.trackers[id.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(ErrorCode::Invalid);
        }
        if !service.add_channel_tracker(&tracker, id) {
            return Err(ErrorCode::Fault);
        }
        *slot = Some(tracker);
        Ok(())
    }

    pub(crate) fn resume_tracker(&self, id: PollerId) -> bool {
        let Some(service) = self.service() else {
            return false;
        };
        let tracker = self.trackers[id.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracker.is_some_and(|tracker| service.resume_channel_tracker(&tracker, id))
    }

    pub(crate) fn remove_tracker(&self, id: PollerId) {
        let tracker = self.trackers[id.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(tracker), Some(service)) = (tracker, self.service()) {
            service.remove_channel_tracker(&tracker, id);
        }
    }

    pub(crate) fn remove_trackers(&self) {
        for id in PollerId::ALL {
            self.remove_tracker(id);
        }
    }

    /// Have the send poller deliver `event` to this channel.
    pub(crate) fn post_event(&self, event: ChannelEvent) -> bool {
        match (self.service(), self.key()) {
            (Some(service), Some(key)) => service.post_channel_event(key, event),
            _ => false,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ReadState {
    /// Waiting for `read_continue`.
    None = 0,
    /// A read is armed.
    Pending,
    /// Reading ended for good.
    Invalid,
}

/// Read mode plus the small state machine that keeps a read armed at most once.
#[derive(Debug)]
pub(crate) struct ReadControl {
    mode: OnceLock<ReadMode>,
    state: AtomicU8,
}

impl Default for ReadControl {
    fn default() -> Self {
        ReadControl {
            mode: OnceLock::new(),
            state: AtomicU8::new(ReadState::None as u8),
        }
    }
}

impl ReadControl {
    pub(crate) fn start(&self, mode: ReadMode) {
        _ = self.mode.set(mode);
        self.state.store(ReadState::Pending as u8, Ordering::Release);
    }

    pub(crate) fn mode(&self) -> Option<ReadMode> {
        self.mode.get().copied()
    }

    fn change(&self, from: ReadState, to: ReadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the armed read. In loop mode the read stays armed.
    pub(crate) fn begin(&self) -> bool {
        match self.mode() {
            Some(ReadMode::Loop) => self.state.load(Ordering::Acquire) == ReadState::Pending as u8,
            Some(ReadMode::Once) => self.change(ReadState::Pending, ReadState::None),
            None => false,
        }
    }

    /// Give back a claim that delivered nothing.
    pub(crate) fn abandon(&self) {
        if self.mode() == Some(ReadMode::Once) {
            _ = self.change(ReadState::None, ReadState::Pending);
        }
    }

    /// Whether the handler re-arms the read itself after a delivery.
    pub(crate) fn rearms(&self) -> bool {
        self.mode() == Some(ReadMode::Loop)
    }

    /// Arm the next read in once mode.
    pub(crate) fn arm(&self) -> crate::Result<()> {
        if self.mode() != Some(ReadMode::Once) {
            return Err(ErrorCode::Invalid);
        }
        if self.change(ReadState::None, ReadState::Pending) {
            Ok(())
        } else if self.state.load(Ordering::Acquire) == ReadState::Invalid as u8 {
            Err(ErrorCode::Unstarted)
        } else {
            Err(ErrorCode::Again)
        }
    }

    pub(crate) fn invalidate(&self) {
        self.state.store(ReadState::Invalid as u8, Ordering::Release);
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_mode_arms_at_most_once() {
        let read = ReadControl::default();
        assert!(!read.begin());
        read.start(ReadMode::Once);
        assert!(read.begin());
        assert!(!read.begin());
        assert!(!read.rearms());
        assert_eq!(read.arm(), Ok(()));
        assert_eq!(read.arm(), Err(ErrorCode::Again));
        assert!(read.begin());
        read.abandon();
        assert!(read.begin());
        read.invalidate();
        assert_eq!(read.arm(), Err(ErrorCode::Unstarted));
    }

    #[test]
    fn loop_mode_stays_armed() {
        let read = ReadControl::default();
        read.start(ReadMode::Loop);
        assert!(read.begin());
        assert!(read.begin());
        assert!(read.rearms());
        assert_eq!(read.arm(), Err(ErrorCode::Invalid));
        read.invalidate();
        assert!(!read.begin());
    }

    fn base() -> TransportBase {
        TransportBase::new(
            TransportType::TcpTransport,
            Address::from(std::net::SocketAddr::from(([127, 0, 0, 1], 1))),
            Address::from(std::net::SocketAddr::from(([127, 0, 0, 1], 2))),
        )
    }

    #[test]
    fn suspension_is_taken_once() {
        let base = base();
        assert!(!base.take_suspended());
        base.set_suspended();
        assert!(base.take_suspended());
        assert!(!base.take_suspended());
        assert!(!base.suspend());
        base.set_state(TransportState::Started);
        assert!(base.take_suspended());
        assert!(base.suspend());
        assert!(!base.take_suspended());
    }

    #[test]
    fn operations_are_counted() {
        let base = base();
        {
            let _first = base.operation();
            let _second = base.operation();
            assert_eq!(base.pending_opts.load(Ordering::Acquire), 2);
        }
        base.wait_operations();
        assert_eq!(base.state(), TransportState::Inited);
        assert!(base.change_state(TransportState::Inited, TransportState::Starting));
        assert!(!base.change_state(TransportState::Inited, TransportState::Starting));
        base.set_state(TransportState::Paused);
        assert!(base.is_started());
        assert_eq!(base.wait_started(), TransportState::Paused);
    }
}
