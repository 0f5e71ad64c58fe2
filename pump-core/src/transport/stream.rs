use crate::address::Address;
use crate::error::ErrorCode;
use crate::flow::{is_would_block, FlowCode, StreamFlow};
use crate::poll::channel::{Channel, ChannelEvent, EventKind};
use crate::poll::tracker::{TrackEvent, TrackMode};
use crate::poll::PollerId;
use crate::service::Service;
use crate::transport::base::{ReadControl, TransportBase};
use crate::transport::{ReadMode, TransportCallbacks, TransportState, TransportType};
use bytes::Bytes;
use crossbeam_deque::{Injector, Steal};
use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// A flow a [`StreamTransport`] can run over.
pub trait StreamKind: StreamFlow + Sized {
    const TYPE: TransportType;

    /// Wrap the transport into its registry entry.
    fn channel(transport: Arc<StreamTransport<Self>>) -> Channel;
}

/// Connected byte stream transport.
///
/// Any thread may call [`StreamTransport::send`]; buffers go through a
/// lock-free queue and exactly one thread at a time owns the flush of the queue
/// head. The caller that moves the queue from empty to non-empty becomes that
/// owner and sends inline; whoever completes a buffer moves on to the next one,
/// and an incomplete buffer is finished from the send poller once the socket
/// turns writable.
pub struct StreamTransport<F: StreamKind> {
    base: TransportBase,
    read: ReadControl,
    init_flow: Mutex<Option<F>>,
    flow: RwLock<Option<Arc<F>>>,
    callbacks: OnceLock<TransportCallbacks<Self>>,
    read_buf: Mutex<Vec<u8>>,
    send_queue: Injector<Bytes>,
    send_queue_size: AtomicUsize,
    pending_send_size: AtomicUsize,
    sending_len: AtomicUsize,
}

impl<F: StreamKind> Debug for StreamTransport<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("base", &self.base)
            .field("read", &self.read)
            .field("send_queue_size", &self.send_queue_size)
            .field("pending_send_size", &self.pending_send_size)
            .finish_non_exhaustive()
    }
}

impl<F: StreamKind> StreamTransport<F> {
    pub(crate) fn with_flow(flow: F, local: Address, remote: Address) -> Arc<Self> {
        Arc::new(StreamTransport {
            base: TransportBase::new(F::TYPE, local, remote),
            read: ReadControl::default(),
            init_flow: Mutex::new(Some(flow)),
            flow: RwLock::new(None),
            callbacks: OnceLock::new(),
            read_buf: Mutex::new(Vec::new()),
            send_queue: Injector::new(),
            send_queue_size: AtomicUsize::new(0),
            pending_send_size: AtomicUsize::new(0),
            sending_len: AtomicUsize::new(0),
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

    /// `true` while started or paused.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.base.is_started()
    }

    #[must_use]
    pub fn get_local_address(&self) -> Address {
        self.base.local_address()
    }

    #[must_use]
    pub fn get_remote_address(&self) -> Address {
        self.base.remote_address()
    }

    #[must_use]
    pub fn get_read_mode(&self) -> Option<ReadMode> {
        self.read.mode()
    }

    /// Bytes accepted by [`StreamTransport::send`] and not yet written.
    #[must_use]
    pub fn get_pending_send_size(&self) -> usize {
        self.pending_send_size.load(Ordering::Acquire)
    }

    fn flow(&self) -> Option<Arc<F>> {
        self.flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register with `service` and begin reading in `mode`.
    ///
    /// # Errors
    /// `Invalid` if started before, `Unstarted` if the service is not running,
    /// `Fault` if a tracker cannot be installed. On failure the transport ends
    /// in [`TransportState::Error`].
    pub fn start(
        self: &Arc<Self>,
        service: &Arc<Service>,
        mode: ReadMode,
        callbacks: TransportCallbacks<Self>,
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
        // a TLS session may hold plaintext that arrived with the handshake
        let unread = self.flow().is_some_and(|flow| flow.has_unread_data());
        if self.base.take_suspended() || unread {
            self.resume_read();
        }
        Ok(())
    }

    fn open(
        self: &Arc<Self>,
        service: &Arc<Service>,
        mode: ReadMode,
        callbacks: TransportCallbacks<Self>,
    ) -> crate::Result<()> {
        let flow = self
            .init_flow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(Arc::new)
            .ok_or(ErrorCode::Invalid)?;
        *self.flow.write().unwrap_or_else(PoisonError::into_inner) = Some(flow.clone());
        if self.callbacks.set(callbacks).is_err() {
            return Err(ErrorCode::Invalid);
        }
        *self.read_buf.lock().unwrap_or_else(PoisonError::into_inner) =
            vec![0; service.config().get_read_buffer_size()];
        self.read.start(mode);
        _ = self.base.register(service, F::channel(self.clone()))?;
        self.base
            .add_tracker(PollerId::Read, flow.source(), TrackEvent::Read, TrackMode::Once)?;
        self.base
            .add_tracker(PollerId::Send, flow.source(), TrackEvent::Send, TrackMode::Once)
    }

    /// Queue `data` for sending.
    ///
    /// # Errors
    /// `Unstarted` unless started or paused, `Invalid` for an empty buffer.
    pub fn send(self: &Arc<Self>, data: impl Into<Bytes>) -> crate::Result<()> {
        let _guard = self.base.operation();
        if !self.base.is_started() {
            return Err(ErrorCode::Unstarted);
        }
        let buf = data.into();
        if buf.is_empty() {
            return Err(ErrorCode::Invalid);
        }
        _ = self.pending_send_size.fetch_add(buf.len(), Ordering::AcqRel);
        self.send_queue.push(buf);
        if self.send_queue_size.fetch_add(1, Ordering::AcqRel) == 0 {
            self.send_next();
        }
        Ok(())
    }

    /// Arm the next read in [`ReadMode::Once`].
    ///
    /// # Errors
    /// `Invalid` in loop mode, `Again` if a read is already armed, `Unstarted`
    /// after the transport stopped.
    pub fn read_continue(self: &Arc<Self>) -> crate::Result<()> {
        let _guard = self.base.operation();
        if !self.base.is_started() {
            return Err(ErrorCode::Unstarted);
        }
        self.read.arm()?;
        self.resume_read();
        Ok(())
    }

    /// Stop delivering reads until [`StreamTransport::restart`].
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

    /// Resume after [`StreamTransport::pause`].
    ///
    /// # Errors
    /// `Invalid` unless paused.
    pub fn restart(self: &Arc<Self>) -> crate::Result<()> {
        if !self
            .base
            .change_state(TransportState::Paused, TransportState::Started)
        {
            return Err(ErrorCode::Invalid);
        }
        if self.base.take_suspended() {
            self.resume_read();
        }
        Ok(())
    }

    fn enter_stopping(&self) -> bool {
        loop {
            match self.base.wait_started() {
                state @ (TransportState::Started
                | TransportState::Paused
                | TransportState::Disconnecting) => {
                    if self.base.change_state(state, TransportState::Stopping) {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Stop gracefully: reading ends at once, queued data is still sent, then
    /// the stopped callback runs on the send poller.
    pub fn stop(self: &Arc<Self>) {
        if !self.enter_stopping() {
            return;
        }
        self.base.wait_operations();
        self.read.invalidate();
        self.base.remove_tracker(PollerId::Read);
        fence(Ordering::SeqCst);
        if self.send_queue_size.load(Ordering::Acquire) == 0 {
            _ = self.base.post_event(ChannelEvent::Interrupt);
        } else if let Some(flow) = self.flow() {
            flow.shutdown(Shutdown::Read);
        }
    }

    /// Stop at once, dropping queued data.
    pub fn force_stop(self: &Arc<Self>) {
        if !self.enter_stopping() {
            return;
        }
        self.read.invalidate();
        if let Some(flow) = self.flow() {
            flow.shutdown(Shutdown::Both);
        }
        _ = self.base.post_event(ChannelEvent::Interrupt);
    }

    fn try_disconnect(&self) -> bool {
        if self
            .base
            .change_state(TransportState::Started, TransportState::Disconnecting)
            || self
                .base
                .change_state(TransportState::Paused, TransportState::Disconnecting)
        {
            self.read.invalidate();
            _ = self.base.post_event(ChannelEvent::Interrupt);
            return true;
        }
        false
    }

    fn on_flow_failed(&self) {
        if !self.try_disconnect() && self.base.state() == TransportState::Stopping {
            _ = self.base.post_event(ChannelEvent::Interrupt);
        }
    }

    fn pop_send(&self) -> Option<Bytes> {
        loop {
            match self.send_queue.steal() {
                Steal::Success(buf) => return Some(buf),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Account the buffer just completed. `true` if another one is queued.
    fn sent_one(&self) -> bool {
        let len = self.sending_len.load(Ordering::Acquire);
        _ = self
            .pending_send_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_sub(len))
            });
        if self.send_queue_size.fetch_sub(1, Ordering::AcqRel) > 1 {
            return true;
        }
        fence(Ordering::SeqCst);
        if self.base.state() == TransportState::Stopping {
            _ = self.base.post_event(ChannelEvent::Interrupt);
        }
        false
    }

    fn send_next(self: &Arc<Self>) {
        let Some(flow) = self.flow() else {
            return;
        };
        while let Some(buf) = self.pop_send() {
            self.sending_len.store(buf.len(), Ordering::Release);
            match flow.want_to_send(buf) {
                FlowCode::Ok => {
                    if !self.sent_one() {
                        return;
                    }
                }
                FlowCode::Again => {
                    _ = self.base.resume_tracker(PollerId::Send);
                    return;
                }
                FlowCode::NoData | FlowCode::Abort => {
                    self.on_flow_failed();
                    return;
                }
            }
        }
    }

    fn on_send(self: &Arc<Self>) {
        let Some(flow) = self.flow() else {
            return;
        };
        match flow.send() {
            FlowCode::Ok => {
                if self.sent_one() {
                    self.send_next();
                }
            }
            FlowCode::Again => {
                _ = self.base.resume_tracker(PollerId::Send);
            }
            // nothing in flight, a stale readiness
            FlowCode::NoData => {}
            FlowCode::Abort => self.on_flow_failed(),
        }
    }

    fn resume_read(&self) {
        let Some(flow) = self.flow() else {
            return;
        };
        if flow.has_unread_data() {
            _ = self.base.post_event(ChannelEvent::Read);
        } else {
            _ = self.base.resume_tracker(PollerId::Read);
        }
    }

    fn on_read(self: &Arc<Self>) {
        match self.base.state() {
            TransportState::Started => {}
            TransportState::Starting | TransportState::Paused => {
                if self.base.suspend() {
                    self.resume_read();
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
        match flow.read(&mut buf) {
            Ok(0) => {
                drop(buf);
                self.on_flow_failed();
            }
            Ok(n) => {
                (callbacks.read)(self, &buf[..n]);
                drop(buf);
                if self.read.rearms() {
                    self.resume_read();
                }
            }
            Err(e) if is_would_block(&e) || e.kind() == ErrorKind::Interrupted => {
                drop(buf);
                self.read.abandon();
                _ = self.base.resume_tracker(PollerId::Read);
            }
            Err(_) => {
                drop(buf);
                self.on_flow_failed();
            }
        }
    }

    fn close(&self) {
        self.read.invalidate();
        self.base.remove_trackers();
        let flow = self
            .flow
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flow) = flow {
            flow.shutdown(Shutdown::Both);
        }
        while self.pop_send().is_some() {}
        self.pending_send_size.store(0, Ordering::Release);
        self.base.unregister();
    }

    fn on_interrupt(self: &Arc<Self>) {
        if self
            .base
            .change_state(TransportState::Disconnecting, TransportState::Disconnected)
        {
            self.close();
            if let Some(callbacks) = self.callbacks.get() {
                (callbacks.disconnected)(self);
            }
        } else if self
            .base
            .change_state(TransportState::Stopping, TransportState::Stopped)
        {
            self.close();
            if let Some(callbacks) = self.callbacks.get() {
                (callbacks.stopped)(self);
            }
        }
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: EventKind) {
        match event {
            EventKind::Read | EventKind::Channel(ChannelEvent::Read) => self.on_read(),
            EventKind::Send => self.on_send(),
            EventKind::Channel(ChannelEvent::Interrupt) => self.on_interrupt(),
            EventKind::Channel(ChannelEvent::Timeout) => {}
        }
    }
}
