use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::FlowTcpAcceptor;
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::PollerId;
use crate::service::Service;
use crate::tls::TlsEngine;
use crate::transport::base::TransportBase;
use crate::transport::tcp_acceptor::{accept_all, open_listener, rearm_listener};
use crate::transport::tls::TlsTransport;
use crate::transport::tls_handshaker::{HandshakerCallbacks, TlsHandshaker};
use crate::transport::{AcceptorCallbacks, TransportState, TransportType};
use dashmap::DashMap;
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

/// Listens on one address, runs a server side handshake on every accepted
/// connection and hands the finished ones out as unstarted [`TlsTransport`]s.
///
/// Connections whose handshake fails or exceeds the handshake timeout are
/// dropped silently.
pub struct TlsAcceptor {
    base: TransportBase,
    engine: Arc<dyn TlsEngine>,
    handshake_timeout: Duration,
    flow: RwLock<Option<Arc<FlowTcpAcceptor>>>,
    handshakers: DashMap<usize, Arc<TlsHandshaker>>,
    callbacks: OnceLock<AcceptorCallbacks<Self, TlsTransport>>,
}

impl Debug for TlsAcceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("base", &self.base)
            .field("engine", &self.engine)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("handshaking", &self.handshakers.len())
            .finish_non_exhaustive()
    }
}

fn handshaker_id(handshaker: &Arc<TlsHandshaker>) -> usize {
    Arc::as_ptr(handshaker) as usize
}

impl TlsAcceptor {
    #[must_use]
    pub fn create(
        listen: Address,
        engine: Arc<dyn TlsEngine>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        let remote = listen.clone();
        Arc::new(TlsAcceptor {
            base: TransportBase::new(TransportType::TlsAcceptor, listen, remote),
            engine,
            handshake_timeout,
            flow: RwLock::new(None),
            handshakers: DashMap::new(),
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

    #[must_use]
    pub fn get_local_address(&self) -> Address {
        self.base.local_address()
    }

    /// Number of handshakes in flight.
    #[must_use]
    pub fn handshaking_count(&self) -> usize {
        self.handshakers.len()
    }

    /// Listen and begin accepting.
    ///
    /// # Errors
    /// see [`TcpAcceptor::start`](crate::transport::tcp_acceptor::TcpAcceptor::start).
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        callbacks: AcceptorCallbacks<Self, TlsTransport>,
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
        match open_listener(&self.base, service, Channel::TlsAcceptor(self.clone())) {
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

    /// Stop accepting and abort every handshake in flight; the stopped
    /// callback runs on the send poller.
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
        let (Some(flow), Some(service)) = (flow, self.base.service()) else {
            return;
        };
        let drained = accept_all(
            || flow.accept(),
            |stream, local, remote| self.handshake(&service, stream, local, remote),
        );
        rearm_listener(&self.base, drained);
    }

    fn handshake(
        self: &Arc<Self>,
        service: &Arc<Service>,
        stream: Arc<TcpStream>,
        local: Address,
        remote: Address,
    ) {
        let handshaker = TlsHandshaker::create(stream, local, remote);
        _ = self
            .handshakers
            .insert(handshaker_id(&handshaker), handshaker.clone());
        let acceptor = Arc::downgrade(self);
        let on_stopped: Weak<Self> = acceptor.clone();
        let callbacks = HandshakerCallbacks::new(
            move |handshaker, ok| {
                if let Some(acceptor) = acceptor.upgrade() {
                    acceptor.on_handshaked(handshaker, ok);
                }
            },
            move |handshaker| {
                if let Some(acceptor) = on_stopped.upgrade() {
                    _ = acceptor.handshakers.remove(&handshaker_id(handshaker));
                }
            },
        );
        if let Err(e) = handshaker.start(
            service,
            self.engine.as_ref(),
            false,
            Some(self.handshake_timeout),
            callbacks,
        ) {
            crate::warn!("handshake with {} not started: {e}", handshaker.get_remote_address());
            _ = self.handshakers.remove(&handshaker_id(&handshaker));
        }
    }

    fn on_handshaked(self: &Arc<Self>, handshaker: &Arc<TlsHandshaker>, ok: bool) {
        _ = self.handshakers.remove(&handshaker_id(handshaker));
        if !ok || self.base.state() != TransportState::Started {
            return;
        }
        let Some(flow) = handshaker.unbind_flow() else {
            return;
        };
        let transport = TlsTransport::create(
            flow,
            handshaker.get_local_address(),
            handshaker.get_remote_address(),
        );
        if let Some(callbacks) = self.callbacks.get() {
            (callbacks.accepted)(self, transport);
        }
    }

    fn close(&self) {
        self.base.remove_trackers();
        drop(self.flow.write().unwrap_or_else(PoisonError::into_inner).take());
        let handshakers: Vec<Arc<TlsHandshaker>> = self
            .handshakers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handshaker in handshakers {
            handshaker.stop();
        }
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
