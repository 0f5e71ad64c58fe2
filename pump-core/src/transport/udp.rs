use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::{is_would_block, FlowUdp};
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::tracker::{TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::transport::base::{ReadControl, TransportBase};
use crate::transport::{ReadMode, TransportState, TransportType, UdpCallbacks};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Datagram transport bound to one local address.
///
/// Sends go straight to the socket; a full socket buffer is reported as
/// `Again` instead of being queued.
pub struct UdpTransport {
    base: TransportBase,
    read: ReadControl,
    flow: RwLock<Option<Arc<FlowUdp>>>,
    callbacks: OnceLock<UdpCallbacks<Self>>,
    read_buf: Mutex<Vec<u8>>,
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("base", &self.base)
            .field("read", &self.read)
            .finish_non_exhaustive()
    }
}

impl UdpTransport {
    /// A transport that binds `local` when started.
    #[must_use]
    pub fn create(local: Address) -> Arc<Self> {
        let remote = local.clone();
        Arc::new(UdpTransport {
            base: TransportBase::new(TransportType::UdpTransport, local, remote),
            read: ReadControl::default(),
            flow: RwLock::new(None),
            callbacks: OnceLock::new(),
            read_buf: Mutex::new(Vec::new()),
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
        self.base.is_started()
    }

    /// The bound address. After `start` this carries the port the OS picked.
    #[must_use]
    pub fn get_local_address(&self) -> Address {
        self.base.local_address()
    }

    fn flow(&self) -> Option<Arc<FlowUdp>> {
        self.flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind and begin receiving in `mode`.
    ///
    /// # Errors
    /// `Invalid` if started before, `Unstarted` if the service is not running,
    /// `Fault` if the socket cannot be bound or tracked.
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        mode: ReadMode,
        callbacks: UdpCallbacks<Self>,
    ) -> crate::Result<()> {
        if !self
            .base
            .change_state(TransportState::Inited, TransportState::Starting)
        {
            return Err(ErrorCode::Invalid);
        }
        if let Err(e) = self.open(service, mode, callbacks) {
            crate::warn!("{} start failed: {e}", self.get_type());
            self.close();
            self.base.set_state(TransportState::Error);
            return Err(e);
        }
        self.base.set_state(TransportState::Started);
        if self.base.take_suspended() {
            _ = self.base.resume_tracker(PollerId::Read);
        }
        Ok(())
    }

    fn open(
        self: &Arc<Self>,
        service: &Arc<Service>,
        mode: ReadMode,
        callbacks: UdpCallbacks<Self>,
    ) -> crate::Result<()> {
        let flow = FlowUdp::init(&self.base.local_address()).map_err(|e| {
            crate::warn!("bind {} failed: {e}", self.base.local_address());
            ErrorCode::Fault
        })?;
        if let Ok(local) = flow.local_address() {
            self.base.set_local_address(local);
        }
        let flow = Arc::new(flow);
        *self.flow.write().unwrap_or_else(PoisonError::into_inner) = Some(flow.clone());
        if self.callbacks.set(callbacks).is_err() {
            return Err(ErrorCode::Invalid);
        }
        *self.read_buf.lock().unwrap_or_else(PoisonError::into_inner) =
            vec![0; service.config().get_udp_buffer_size()];
        self.read.start(mode);
        _ = self
            .base
            .register(service, Channel::UdpTransport(self.clone()))?;
        self.base
            .add_tracker(PollerId::Read, flow.source(), TrackEvent::Read, TrackMode::Once)
    }

    /// Send one datagram to `to`.
    ///
    /// # Errors
    /// `Unstarted` unless started or paused, `Again` if the socket buffer is full,
    /// `Abort` on a socket error.
    pub fn send_to(&self, data: &[u8], to: &Address) -> crate::Result<()> {
        let _guard = self.base.operation();
        if !self.base.is_started() {
            return Err(ErrorCode::Unstarted);
        }
        let flow = self.flow().ok_or(ErrorCode::Unstarted)?;
        match flow.send_to(data, to) {
            Ok(_) => Ok(()),
            Err(e) if is_would_block(&e) => Err(ErrorCode::Again),
            Err(_) => Err(ErrorCode::Abort),
        }
    }

    /// Arm the next read in [`ReadMode::Once`].
    ///
    /// # Errors
    /// see [`StreamTransport::read_continue`](crate::transport::stream::StreamTransport::read_continue).
    pub fn read_continue(&self) -> crate::Result<()> {
        let _guard = self.base.operation();
        if !self.base.is_started() {
            return Err(ErrorCode::Unstarted);
        }
        self.read.arm()?;
        _ = self.base.resume_tracker(PollerId::Read);
        Ok(())
    }

    /// Stop delivering datagrams until [`UdpTransport::restart`]. Sending
    /// keeps working.
    ///
    /// # Errors
    /// `Invalid` unless started.
    pub fn pause(&self) -> crate::Result<()> {
        if self
            .base
            .change_state(TransportState::Started, TransportState::Paused)
        {
            Ok(())
        } else {
            Err(ErrorCode::Invalid)
        }
    }

    /// Resume after [`UdpTransport::pause`], picking up a read that arrived
    /// meanwhile.
    ///
    /// # Errors
    /// `Invalid` unless paused.
    pub fn restart(&self) -> crate::Result<()> {
        if !self
            .base
            .change_state(TransportState::Paused, TransportState::Started)
        {
            return Err(ErrorCode::Invalid);
        }
        if self.base.take_suspended() {
            _ = self.base.resume_tracker(PollerId::Read);
        }
        Ok(())
    }

    fn enter_stopping(&self) -> bool {
        loop {
            match self.base.wait_started() {
                state @ (TransportState::Started | TransportState::Paused) => {
                    if self.base.change_state(state, TransportState::Stopping) {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Stop receiving; the stopped callback runs on the send poller.
    pub fn stop(&self) {
        if !self.enter_stopping() {
            return;
        }
        self.base.wait_operations();
        self.read.invalidate();
        _ = self.base.post_event(ChannelEvent::Interrupt);
    }

    /// Datagrams are never queued, so this is [`UdpTransport::stop`].
    pub fn force_stop(&self) {
        self.stop();
    }

    fn on_read(self: &Arc<Self>) {
        match self.base.state() {
            TransportState::Started => {}
            TransportState::Starting | TransportState::Paused => {
                if self.base.suspend() {
                    _ = self.base.resume_tracker(PollerId::Read);
                }
                return;
            }
            _ => return,
        }
        if !self.read.begin() {
            return;
        }
        let (Some(flow), Some(callbacks)) = (self.flow(), self.callbacks.get()) else {
            return;
        };
        let mut buf = self.read_buf.lock().unwrap_or_else(PoisonError::into_inner);
        match flow.read_from(&mut buf) {
            Ok((n, from)) => {
                (callbacks.read_from)(self, &buf[..n], &from);
                drop(buf);
                if self.read.rearms() {
                    _ = self.base.resume_tracker(PollerId::Read);
                }
            }
            Err(e) => {
                drop(buf);
                if !is_would_block(&e) {
                    crate::debug!("{} receive failed: {e}", self.get_local_address());
                }
                self.read.abandon();
                _ = self.base.resume_tracker(PollerId::Read);
            }
        }
    }

    fn close(&self) {
        self.read.invalidate();
        self.base.remove_trackers();
        drop(self.flow.write().unwrap_or_else(PoisonError::into_inner).take());
        self.base.unregister();
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        match event {
            EventKind::Read | EventKind::Channel(ChannelEvent::Read) => self.on_read(),
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
            EventKind::Send | EventKind::Channel(ChannelEvent::Timeout) => {}
        }
    }
}
