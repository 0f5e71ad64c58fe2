use crate::address::Address;
use crate::error::ErrorCode;
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::PollerId;
use crate::service::Service;
use crate::tls::TlsEngine;
use crate::transport::tcp_dialer::{wait_dialed, Connector};
use crate::transport::tls::TlsTransport;
use crate::transport::tls_handshaker::{HandshakerCallbacks, TlsHandshaker};
use crate::transport::{DialerCallbacks, TransportState, TransportType};
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

/// Connects to a remote address, runs a client side handshake and reports the
/// result as an unstarted [`TlsTransport`].
///
/// One deadline covers both the connect and the handshake.
pub struct TlsDialer {
    connector: Connector,
    engine: Arc<dyn TlsEngine>,
    handshaker: Mutex<Option<Arc<TlsHandshaker>>>,
    callbacks: OnceLock<DialerCallbacks<Self, TlsTransport>>,
}

impl Debug for TlsDialer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("connector", &self.connector)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl TlsDialer {
    #[must_use]
    pub fn create(
        local: Address,
        remote: Address,
        engine: Arc<dyn TlsEngine>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(TlsDialer {
            connector: Connector::new(TransportType::TlsDialer, local, remote, timeout),
            engine,
            handshaker: Mutex::new(None),
            callbacks: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn get_type(&self) -> TransportType {
        self.connector.base.get_type()
    }

    #[must_use]
    pub fn get_state(&self) -> TransportState {
        self.connector.base.state()
    }

    #[must_use]
    pub fn get_local_address(&self) -> Address {
        self.connector.base.local_address()
    }

    #[must_use]
    pub fn get_remote_address(&self) -> Address {
        self.connector.base.remote_address()
    }

    /// Start connecting.
    ///
    /// # Errors
    /// see [`TcpDialer::start`](crate::transport::tcp_dialer::TcpDialer::start).
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        callbacks: DialerCallbacks<Self, TlsTransport>,
    ) -> crate::Result<()> {
        let base = &self.connector.base;
        if !base.change_state(TransportState::Inited, TransportState::Starting) {
            return Err(ErrorCode::Invalid);
        }
        if self.callbacks.set(callbacks).is_err() {
            base.set_state(TransportState::Error);
            return Err(ErrorCode::Invalid);
        }
        if let Err(e) = self
            .connector
            .open(service, Channel::TlsDialer(self.clone()))
        {
            crate::warn!("dial {} failed: {e}", base.remote_address());
            self.close();
            base.set_state(TransportState::Error);
            return Err(e);
        }
        base.set_state(TransportState::Started);
        if let Err(e) = self.connector.arm_timer(service) {
            if base.change_state(TransportState::Started, TransportState::Error) {
                self.close();
                return Err(e);
            }
        }
        if base.take_suspended() {
            _ = base.resume_tracker(PollerId::Send);
        }
        Ok(())
    }

    /// Abort the dial, handshake included; the stopped callback runs on the
    /// send poller.
    pub fn stop(&self) {
        let base = &self.connector.base;
        _ = base.wait_started();
        if base.change_state(TransportState::Started, TransportState::Stopping)
            || base.change_state(TransportState::Handshaking, TransportState::Stopping)
        {
            _ = base.post_event(ChannelEvent::Interrupt);
        }
    }

    /// Dial and block until the handshake finished, failed or `timeout`
    /// passed.
    #[must_use]
    pub fn dial_sync(
        service: &Arc<Service>,
        local: Address,
        remote: Address,
        engine: Arc<dyn TlsEngine>,
        timeout: Duration,
    ) -> Option<Arc<TlsTransport>> {
        let dialer = TlsDialer::create(local, remote, engine, timeout);
        let (tx, rx) = crossbeam_channel::bounded::<Option<Arc<TlsTransport>>>(1);
        let timeouted = tx.clone();
        let callbacks = DialerCallbacks::new(
            move |_: &Arc<TlsDialer>, transport: Option<Arc<TlsTransport>>, ok: bool| {
                _ = tx.try_send(if ok { transport } else { None });
            },
            move |_: &Arc<TlsDialer>| {
                _ = timeouted.try_send(None);
            },
            |_: &Arc<TlsDialer>| {},
        );
        dialer.start(service, callbacks).ok()?;
        wait_dialed(&rx, timeout).unwrap_or_else(|| {
            dialer.stop();
            None
        })
    }

    fn on_connected(self: &Arc<Self>) {
        let base = &self.connector.base;
        match base.state() {
            TransportState::Started => {}
            TransportState::Starting => {
                if base.suspend() {
                    _ = base.resume_tracker(PollerId::Send);
                }
                return;
            }
            _ => return,
        }
        match self.connector.connected() {
            Ok(stream) => {
                if base.change_state(TransportState::Started, TransportState::Handshaking) {
                    self.connector.release();
                    self.handshake(stream);
                }
            }
            Err(e) => {
                crate::debug!("dial {} failed: {e}", base.remote_address());
                self.fail(TransportState::Started);
            }
        }
    }

    fn handshake(self: &Arc<Self>, stream: Arc<TcpStream>) {
        let base = &self.connector.base;
        let Some(service) = base.service() else {
            self.fail(TransportState::Handshaking);
            return;
        };
        let handshaker =
            TlsHandshaker::create(stream, base.local_address(), base.remote_address());
        *self.handshaker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handshaker.clone());
        let dialer = Arc::downgrade(self);
        let callbacks = HandshakerCallbacks::new(
            move |handshaker, ok| {
                if let Some(dialer) = dialer.upgrade() {
                    dialer.on_handshaked(handshaker, ok);
                }
            },
            |_| {},
        );
        if handshaker
            .start(&service, self.engine.as_ref(), true, None, callbacks)
            .is_err()
        {
            self.fail(TransportState::Handshaking);
        }
    }

    fn on_handshaked(self: &Arc<Self>, handshaker: &Arc<TlsHandshaker>, ok: bool) {
        if !ok {
            self.fail(TransportState::Handshaking);
            return;
        }
        let base = &self.connector.base;
        if !base.change_state(TransportState::Handshaking, TransportState::Finished) {
            return;
        }
        let flow = handshaker.unbind_flow();
        self.close();
        let Some(callbacks) = self.callbacks.get() else {
            return;
        };
        match flow {
            Some(flow) => {
                let transport =
                    TlsTransport::create(flow, base.local_address(), base.remote_address());
                (callbacks.dialed)(self, Some(transport), true);
            }
            None => (callbacks.dialed)(self, None, false),
        }
    }

    /// Report a failed dial if the dialer was still in `from`.
    fn fail(self: &Arc<Self>, from: TransportState) {
        if self
            .connector
            .base
            .change_state(from, TransportState::Error)
        {
            self.close();
            if let Some(callbacks) = self.callbacks.get() {
                (callbacks.dialed)(self, None, false);
            }
        }
    }

    fn close(&self) {
        if let Some(handshaker) = self
            .handshaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handshaker.stop();
        }
        self.connector.close(true);
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        let base = &self.connector.base;
        match event {
            EventKind::Send => self.on_connected(),
            EventKind::Channel(ChannelEvent::Timeout) => {
                if base.change_state(TransportState::Started, TransportState::Timeouting)
                    || base.change_state(TransportState::Handshaking, TransportState::Timeouting)
                {
                    crate::debug!("dial {} timed out", base.remote_address());
                    self.close();
                    base.set_state(TransportState::Timeouted);
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.timeouted)(self);
                    }
                }
            }
            EventKind::Channel(ChannelEvent::Interrupt) => {
                if base.change_state(TransportState::Stopping, TransportState::Stopped) {
                    self.close();
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.stopped)(self);
                    }
                }
            }
            EventKind::Read | EventKind::Channel(ChannelEvent::Read) => {}
        }
    }
}
