use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::{is_would_block, FlowTcp, FlowTcpAcceptor};
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::tracker::{TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::time::Timer;
use crate::transport::base::TransportBase;
use crate::transport::tcp::TcpTransport;
use crate::transport::{AcceptorCallbacks, TransportState, TransportType};
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

/// Pause before listening again after an accept failed, e.g. out of
/// descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listens on one address and hands every accepted connection out as an
/// unstarted [`TcpTransport`].
pub struct TcpAcceptor {
    base: TransportBase,
    flow: RwLock<Option<Arc<FlowTcpAcceptor>>>,
    callbacks: OnceLock<AcceptorCallbacks<Self, TcpTransport>>,
}

impl Debug for TcpAcceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

/// Open the listener of an acceptor on `service`.
pub(crate) fn open_listener(
    base: &TransportBase,
    service: &Arc<Service>,
    channel: Channel,
) -> crate::Result<Arc<FlowTcpAcceptor>> {
    let flow = FlowTcpAcceptor::init(&base.local_address(), service.config().get_listen_backlog())
        .map_err(|e| {
            crate::warn!("listen on {} failed: {e}", base.local_address());
            ErrorCode::Fault
        })?;
    if let Ok(local) = flow.local_address() {
        base.set_local_address(local);
    }
    let flow = Arc::new(flow);
    _ = base.register(service, channel)?;
    base.add_tracker(PollerId::Read, flow.source(), TrackEvent::Read, TrackMode::Once)?;
    Ok(flow)
}

/// Accept until the backlog is drained, passing each connection to `accepted`.
/// Returns `false` if accepting failed and should only be retried later.
pub(crate) fn accept_all(
    mut accept: impl FnMut() -> std::io::Result<(Arc<TcpStream>, Address, Address)>,
    mut accepted: impl FnMut(Arc<TcpStream>, Address, Address),
) -> bool {
    loop {
        match accept() {
            Ok((stream, local, remote)) => accepted(stream, local, remote),
            Err(e) if is_would_block(&e) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                crate::warn!("accept failed: {e}");
                return false;
            }
        }
    }
}

/// Watch the listener again, at once if the backlog was `drained`, otherwise
/// once [`ACCEPT_RETRY_DELAY`] passed.
pub(crate) fn rearm_listener(base: &TransportBase, drained: bool) {
    if drained {
        _ = base.resume_tracker(PollerId::Read);
        return;
    }
    let (Some(service), Some(key)) = (base.service(), base.key()) else {
        return;
    };
    let weak = Arc::downgrade(&service);
    let timer = Timer::new(ACCEPT_RETRY_DELAY, false, move || {
        if let Some(service) = weak.upgrade() {
            _ = service.post_channel_event(key, ChannelEvent::Read);
        }
    });
    if !service.start_timer(&timer) {
        _ = base.resume_tracker(PollerId::Read);
    }
}

impl TcpAcceptor {
    /// An acceptor that listens on `listen` once started.
    #[must_use]
    pub fn create(listen: Address) -> Arc<Self> {
        let remote = listen.clone();
        Arc::new(TcpAcceptor {
            base: TransportBase::new(TransportType::TcpAcceptor, listen, remote),
            flow: RwLock::new(None),
            callbacks: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn get_type(&self) -> TransportType {
        self.base.get_type()
    }

    #[must_use]
    pub fn get_state(&self) -> TransportState {
        self.base.state()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.base.state() == TransportState::Started
    }

    /// The listening address, with the port the OS picked once started.
    #[must_use]
    pub fn get_local_address(&self) -> Address {
        self.base.local_address()
    }

    /// Listen and begin accepting.
    ///
    /// # Errors
    /// `Invalid` if started before, `Unstarted` if the service is not running,
    /// `Fault` if the address cannot be listened on.
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        callbacks: AcceptorCallbacks<Self, TcpTransport>,
    ) -> crate::Result<()> {
        if !self
            .base
            .change_state(TransportState::Inited, TransportState::Starting)
        {
            return Err(ErrorCode::Invalid);
        }
        if self.callbacks.set(callbacks).is_err() {
            self.base.set_state(TransportState::Error);
            return Err(ErrorCode::Invalid);
        }
        match open_listener(&self.base, service, Channel::TcpAcceptor(self.clone())) {
            Ok(flow) => {
                *self.flow.write().unwrap_or_else(PoisonError::into_inner) = Some(flow);
            }
            Err(e) => {
                self.close();
                self.base.set_state(TransportState::Error);
                return Err(e);
            }
        }
        self.base.set_state(TransportState::Started);
        if self.base.take_suspended() {
            _ = self.base.resume_tracker(PollerId::Read);
        }
        Ok(())
    }

    /// Stop accepting; the stopped callback runs on the send poller.
    pub fn stop(&self) {
        if self.base.wait_started() == TransportState::Started
            && self
                .base
                .change_state(TransportState::Started, TransportState::Stopping)
        {
            _ = self.base.post_event(ChannelEvent::Interrupt);
        }
    }

    fn on_accept(self: &Arc<Self>) {
        match self.base.state() {
            TransportState::Started => {}
            TransportState::Starting => {
                if self.base.suspend() {
                    _ = self.base.resume_tracker(PollerId::Read);
                }
                return;
            }
            _ => return,
        }
        let flow = self
            .flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (Some(flow), Some(callbacks)) = (flow, self.callbacks.get()) else {
            return;
        };
        let drained = accept_all(
            || flow.accept(),
            |stream, local, remote| match FlowTcp::init(stream) {
                Ok(flow) => {
                    (callbacks.accepted)(self, TcpTransport::with_flow(flow, local, remote));
                }
                Err(e) => {
                    crate::warn!("accepted socket from {remote} unusable: {e}");
                }
            },
        );
        rearm_listener(&self.base, drained);
    }

    fn close(&self) {
        self.base.remove_trackers();
        drop(self.flow.write().unwrap_or_else(PoisonError::into_inner).take());
        self.base.unregister();
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        match event {
            EventKind::Read => self.on_accept(),
            EventKind::Channel(ChannelEvent::Read) => {
                if self.base.state() == TransportState::Started {
                    _ = self.base.resume_tracker(PollerId::Read);
                }
            }
            EventKind::Channel(ChannelEvent::Interrupt) => {
                if self
                    .base
                    .change_state(TransportState::Stopping, TransportState::Stopped)
                {
                    self.close();
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.stopped)(self);
                    }
                }
            }
            EventKind::Send | EventKind::Channel(_) => {}
        }
    }
}
