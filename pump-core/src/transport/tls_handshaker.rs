use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::FlowTls;
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::tracker::{FdSource, TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::time::Timer;
use crate::tls::{HandshakeStatus, TlsEngine, TlsSession};
use crate::transport::base::TransportBase;
use crate::transport::{TransportState, TransportType};
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

type Notify = Box<dyn Fn(&Arc<TlsHandshaker>) + Send + Sync>;

/// Callbacks of a [`TlsHandshaker`].
pub struct HandshakerCallbacks {
    pub(crate) handshaked: Box<dyn Fn(&Arc<TlsHandshaker>, bool) + Send + Sync>,
    pub(crate) stopped: Notify,
}

impl HandshakerCallbacks {
    pub fn new<H, S>(handshaked: H, stopped: S) -> Self
    where
        H: Fn(&Arc<TlsHandshaker>, bool) + Send + Sync + 'static,
        S: Fn(&Arc<TlsHandshaker>) + Send + Sync + 'static,
    {
        HandshakerCallbacks {
            handshaked: Box::new(handshaked),
            stopped: Box::new(stopped),
        }
    }
}

impl Debug for HandshakerCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakerCallbacks").finish_non_exhaustive()
    }
}

/// Runs the TLS handshake on a connected socket.
///
/// Each step arms the read or the send tracker, whichever the session asks
/// for. On success `handshaked(true)` runs and the owner takes the session out
/// with [`TlsHandshaker::unbind_flow`]; failure and timeout report
/// `handshaked(false)`.
pub struct TlsHandshaker {
    base: TransportBase,
    stream: Arc<TcpStream>,
    session: Mutex<Option<Box<dyn TlsSession>>>,
    timer: Mutex<Option<Arc<Timer>>>,
    callbacks: OnceLock<HandshakerCallbacks>,
}

impl Debug for TlsHandshaker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandshaker")
            .field("base", &self.base)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl TlsHandshaker {
    #[must_use]
    pub fn create(stream: Arc<TcpStream>, local: Address, remote: Address) -> Arc<Self> {
        Arc::new(TlsHandshaker {
            base: TransportBase::new(TransportType::TlsHandshaker, local, remote),
            stream,
            session: Mutex::new(None),
            timer: Mutex::new(None),
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
    pub fn get_local_address(&self) -> Address {
        self.base.local_address()
    }

    #[must_use]
    pub fn get_remote_address(&self) -> Address {
        self.base.remote_address()
    }

    /// Open a session with `engine` and run the first handshake step. A
    /// `timeout` of `None` leaves the deadline to the owner.
    ///
    /// # Errors
    /// `Invalid` if started before, `Fault` if no session can be created or a
    /// tracker cannot be installed.
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        engine: &dyn TlsEngine,
        is_client: bool,
        timeout: Option<Duration>,
        callbacks: HandshakerCallbacks,
    ) -> crate::Result<()> {
        if !self
            .base
            .change_state(TransportState::Inited, TransportState::Starting)
        {
            return Err(ErrorCode::Invalid);
        }
        if let Err(e) = self.open(service, engine, is_client, callbacks) {
            crate::warn!("{} start failed: {e}", self.get_type());
            self.close();
            self.base.set_state(TransportState::Error);
            return Err(e);
        }
        self.base.set_state(TransportState::Started);
        if let Some(timeout) = timeout {
            if !self.arm_timer(service, timeout)
                && self
                    .base
                    .change_state(TransportState::Started, TransportState::Error)
            {
                self.close();
                return Err(ErrorCode::Fault);
            }
        }
        self.process_handshake();
        Ok(())
    }

    /// Only armed once `Started`; a timeout never finds the handshaker still
    /// starting.
    fn arm_timer(self: &Arc<Self>, service: &Service, timeout: Duration) -> bool {
        let handshaker = Arc::downgrade(self);
        let timer = Timer::new(timeout, false, move || {
            if let Some(handshaker) = handshaker.upgrade() {
                _ = handshaker.base.post_event(ChannelEvent::Timeout);
            }
        });
        if !service.start_timer(&timer) {
            return false;
        }
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        if self.base.state() != TransportState::Started {
            self.stop_timer();
        }
        true
    }

    fn stop_timer(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.stop();
        }
    }

    fn open(
        self: &Arc<Self>,
        service: &Arc<Service>,
        engine: &dyn TlsEngine,
        is_client: bool,
        callbacks: HandshakerCallbacks,
    ) -> crate::Result<()> {
        if self.stream.set_nonblocking(true).is_err() {
            return Err(ErrorCode::Fault);
        }
        let session = engine
            .create_session(self.stream.clone(), is_client)
            .map_err(|e| {
                crate::warn!("create tls session failed: {e}");
                ErrorCode::Fault
            })?;
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        if self.callbacks.set(callbacks).is_err() {
            return Err(ErrorCode::Invalid);
        }
        _ = self
            .base
            .register(service, Channel::Handshaker(self.clone()))?;
        let source: Arc<dyn FdSource> = self.stream.clone();
        self.base
            .add_tracker(PollerId::Read, source.clone(), TrackEvent::Read, TrackMode::Once)?;
        self.base
            .add_tracker(PollerId::Send, source, TrackEvent::Send, TrackMode::Once)
    }

    /// Take the session out as a flow for the transport that continues the
    /// connection. Only available after a successful handshake.
    #[must_use]
    pub fn unbind_flow(&self) -> Option<FlowTls> {
        if self.base.state() != TransportState::Finished {
            return None;
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|session| FlowTls::init(self.stream.clone(), session))
    }

    /// Abort the handshake; the stopped callback runs on the send poller.
    pub fn stop(&self) {
        if self.base.wait_started() == TransportState::Started
            && self
                .base
                .change_state(TransportState::Started, TransportState::Stopping)
        {
            _ = self.base.post_event(ChannelEvent::Interrupt);
        }
    }

    fn process_handshake(self: &Arc<Self>) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if self.base.state() != TransportState::Started {
            return;
        }
        let Some(active) = session.as_mut() else {
            return;
        };
        match active.handshake() {
            HandshakeStatus::Ok => {
                drop(session);
                if self
                    .base
                    .change_state(TransportState::Started, TransportState::Finished)
                {
                    self.close();
                    self.report(true);
                }
            }
            HandshakeStatus::WantsRead => {
                _ = self.base.resume_tracker(PollerId::Read);
            }
            HandshakeStatus::WantsSend => {
                _ = self.base.resume_tracker(PollerId::Send);
            }
            HandshakeStatus::Error => {
                drop(session);
                if self
                    .base
                    .change_state(TransportState::Started, TransportState::Error)
                {
                    self.close();
                    self.report(false);
                }
            }
        }
    }

    fn report(self: &Arc<Self>, ok: bool) {
        if let Some(callbacks) = self.callbacks.get() {
            (callbacks.handshaked)(self, ok);
        }
    }

    fn close(&self) {
        self.stop_timer();
        self.base.remove_trackers();
        self.base.unregister();
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        match event {
            EventKind::Read | EventKind::Send => self.process_handshake(),
            EventKind::Channel(ChannelEvent::Timeout) => {
                if self
                    .base
                    .change_state(TransportState::Started, TransportState::Timeouting)
                {
                    crate::debug!("handshake with {} timed out", self.get_remote_address());
                    self.close();
                    self.base.set_state(TransportState::Timeouted);
                    self.report(false);
                }
            }
            EventKind::Channel(ChannelEvent::Interrupt) => {
                if self
                    .base
                    .change_state(TransportState::Stopping, TransportState::Stopped)
                {
                    self.close();
                    drop(
                        self.session
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take(),
                    );
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.stopped)(self);
                    }
                }
            }
            EventKind::Channel(ChannelEvent::Read) => {}
        }
    }
}
