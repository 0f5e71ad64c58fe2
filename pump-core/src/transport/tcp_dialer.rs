use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::{FlowCode, FlowTcpDialer};
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::tracker::{TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::time::Timer;
use crate::transport::base::TransportBase;
use crate::transport::tcp::TcpTransport;
use crate::transport::{DialerCallbacks, TransportState, TransportType};
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

/// Extra time a synchronous dial waits beyond the connect timeout.
const SYNC_DIAL_GRACE: Duration = Duration::from_millis(500);

/// Wait for the outcome of a dial started with `timeout`. `None` when nothing
/// was reported in time.
pub(crate) fn wait_dialed<T>(
    rx: &crossbeam_channel::Receiver<Option<Arc<T>>>,
    timeout: Duration,
) -> Option<Option<Arc<T>>> {
    if timeout.is_zero() {
        rx.recv().ok()
    } else {
        rx.recv_timeout(timeout + SYNC_DIAL_GRACE).ok()
    }
}

/// The connect phase shared by the TCP and TLS dialers.
#[derive(Debug)]
pub(crate) struct Connector {
    pub(crate) base: TransportBase,
    timeout: Duration,
    flow: RwLock<Option<Arc<FlowTcpDialer>>>,
    timer: Mutex<Option<Arc<Timer>>>,
}

impl Connector {
    pub(crate) fn new(ty: TransportType, local: Address, remote: Address, timeout: Duration) -> Self {
        Connector {
            base: TransportBase::new(ty, local, remote),
            timeout,
            flow: RwLock::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Bind, register `channel`, start connecting, then watch for writability.
    pub(crate) fn open(&self, service: &Arc<Service>, channel: Channel) -> crate::Result<()> {
        let flow = FlowTcpDialer::init(&self.base.local_address()).map_err(|e| {
            crate::warn!("bind {} failed: {e}", self.base.local_address());
            ErrorCode::Fault
        })?;
        let flow = Arc::new(flow);
        *self.flow.write().unwrap_or_else(PoisonError::into_inner) = Some(flow.clone());
        _ = self.base.register(service, channel)?;
        if flow.want_to_connect(&self.base.remote_address()) != FlowCode::Ok {
            return Err(ErrorCode::Fault);
        }
        self.base
            .add_tracker(PollerId::Send, flow.source(), TrackEvent::Send, TrackMode::Once)
    }

    /// Arm the dial deadline. Called once the dialer left `Starting`, so the
    /// timeout always finds it `Started` or past it. A zero timeout waits for
    /// the OS.
    pub(crate) fn arm_timer(&self, service: &Arc<Service>) -> crate::Result<()> {
        if self.timeout.is_zero() {
            return Ok(());
        }
        let key = self.base.key().ok_or(ErrorCode::Unstarted)?;
        let weak = Arc::downgrade(service);
        let timer = Timer::new(self.timeout, false, move || {
            if let Some(service) = weak.upgrade() {
                _ = service.post_channel_event(key, ChannelEvent::Timeout);
            }
        });
        if !service.start_timer(&timer) {
            return Err(ErrorCode::Fault);
        }
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        // the dial may have ended before the timer was stored
        if !matches!(
            self.base.state(),
            TransportState::Started | TransportState::Handshaking
        ) {
            self.stop_timer();
        }
        Ok(())
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

    /// Result of the connect once the socket turned writable. On success the
    /// addresses are updated and a stream on the connection is returned.
    pub(crate) fn connected(&self) -> std::io::Result<Arc<TcpStream>> {
        let flow = self
            .flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let (local, remote) = flow.connect()?;
        self.base.set_local_address(local);
        self.base.set_remote_address(remote);
        flow.unbind_stream()
    }

    /// Stop watching the socket and let go of it. The connection itself stays
    /// open for whoever took its stream.
    pub(crate) fn release(&self) {
        self.base.remove_trackers();
        drop(self.flow.write().unwrap_or_else(PoisonError::into_inner).take());
    }

    /// Stop the timer, release the socket and leave the registry. `abort`
    /// shuts the connection down as well.
    pub(crate) fn close(&self, abort: bool) {
        self.stop_timer();
        if abort {
            if let Some(flow) = self
                .flow
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                flow.shutdown();
            }
        }
        self.release();
        self.base.unregister();
    }
}

/// Connects to a remote address without blocking and reports the result as a
/// started-to-be [`TcpTransport`].
pub struct TcpDialer {
    connector: Connector,
    callbacks: OnceLock<DialerCallbacks<Self, TcpTransport>>,
}

impl Debug for TcpDialer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

impl TcpDialer {
    /// A dialer from `local` to `remote`. A zero `timeout` waits for the OS.
    #[must_use]
    pub fn create(local: Address, remote: Address, timeout: Duration) -> Arc<Self> {
        Arc::new(TcpDialer {
            connector: Connector::new(TransportType::TcpDialer, local, remote, timeout),
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

    /// Start connecting. The outcome arrives through `callbacks`.
    ///
    /// # Errors
    /// `Invalid` if started before, `Unstarted` if the service is not running,
    /// `Fault` if the socket cannot be bound or tracked.
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        callbacks: DialerCallbacks<Self, TcpTransport>,
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
            .open(service, Channel::TcpDialer(self.clone()))
        {
            crate::warn!("dial {} failed: {e}", base.remote_address());
            self.connector.close(true);
            base.set_state(TransportState::Error);
            return Err(e);
        }
        base.set_state(TransportState::Started);
        if let Err(e) = self.connector.arm_timer(service) {
            if base.change_state(TransportState::Started, TransportState::Error) {
                self.connector.close(true);
                return Err(e);
            }
        }
        if base.take_suspended() {
            _ = base.resume_tracker(PollerId::Send);
        }
        Ok(())
    }

    /// Abort the dial; the stopped callback runs on the send poller.
    pub fn stop(&self) {
        let base = &self.connector.base;
        if base.wait_started() == TransportState::Started
            && base.change_state(TransportState::Started, TransportState::Stopping)
        {
            _ = base.post_event(ChannelEvent::Interrupt);
        }
    }

    /// Dial and block until connected, failed or `timeout` passed.
    #[must_use]
    pub fn dial_sync(
        service: &Arc<Service>,
        local: Address,
        remote: Address,
        timeout: Duration,
    ) -> Option<Arc<TcpTransport>> {
        let dialer = TcpDialer::create(local, remote, timeout);
        let (tx, rx) = crossbeam_channel::bounded::<Option<Arc<TcpTransport>>>(1);
        let timeouted = tx.clone();
        let callbacks = DialerCallbacks::new(
            move |_: &Arc<TcpDialer>, transport: Option<Arc<TcpTransport>>, ok: bool| {
                _ = tx.try_send(if ok { transport } else { None });
            },
            move |_: &Arc<TcpDialer>| {
                _ = timeouted.try_send(None);
            },
            |_: &Arc<TcpDialer>| {},
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
        let Some(callbacks) = self.callbacks.get() else {
            return;
        };
        match self.connector.connected() {
            Ok(stream) => {
                if !base.change_state(TransportState::Started, TransportState::Finished) {
                    return;
                }
                self.connector.close(false);
                match TcpTransport::create(stream) {
                    Ok(transport) => (callbacks.dialed)(self, Some(transport), true),
                    Err(e) => {
                        crate::warn!("dialed socket unusable: {e}");
                        (callbacks.dialed)(self, None, false);
                    }
                }
            }
            Err(e) => {
                if base.change_state(TransportState::Started, TransportState::Error) {
                    crate::debug!("dial {} failed: {e}", base.remote_address());
                    self.connector.close(true);
                    (callbacks.dialed)(self, None, false);
                }
            }
        }
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        let base = &self.connector.base;
        match event {
            EventKind::Send => self.on_connected(),
            EventKind::Channel(ChannelEvent::Timeout) => {
                if base.change_state(TransportState::Started, TransportState::Timeouting) {
                    self.connector.close(true);
                    base.set_state(TransportState::Timeouted);
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.timeouted)(self);
                    }
                }
            }
            EventKind::Channel(ChannelEvent::Interrupt) => {
                if base.change_state(TransportState::Stopping, TransportState::Stopped) {
                    self.connector.close(true);
                    if let Some(callbacks) = self.callbacks.get() {
                        (callbacks.stopped)(self);
                    }
                }
            }
            EventKind::Read | EventKind::Channel(ChannelEvent::Read) => {}
        }
    }
}
