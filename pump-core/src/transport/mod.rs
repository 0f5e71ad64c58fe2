use crate::address::Address;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub(crate) mod base;

/// Generic stream transport shared by TCP and TLS.
pub mod stream;

/// Plain TCP transport.
pub mod tcp;

/// TCP listener.
pub mod tcp_acceptor;

/// Non-blocking TCP connect.
pub mod tcp_dialer;

/// TLS transport.
pub mod tls;

/// TLS listener.
pub mod tls_acceptor;

/// Non-blocking TCP connect followed by a TLS handshake.
pub mod tls_dialer;

/// Drives one TLS handshake.
pub mod tls_handshaker;

/// Datagram transport.
pub mod udp;

#[cfg(test)]
mod tests;

/// Kinds of channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportType {
    TcpTransport,
    TlsTransport,
    UdpTransport,
    TcpAcceptor,
    TlsAcceptor,
    TcpDialer,
    TlsDialer,
    TlsHandshaker,
}

impl Display for TransportType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Lifecycle shared by transports, acceptors, dialers and handshakers. Each
/// kind uses the subset that applies to it.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportState {
    Inited = 0,
    Starting,
    Started,
    Paused,
    Stopping,
    Stopped,
    Disconnecting,
    Disconnected,
    Timeouting,
    Timeouted,
    Handshaking,
    Finished,
    Error,
}

impl TransportState {
    const ALL: [TransportState; 13] = [
        TransportState::Inited,
        TransportState::Starting,
        TransportState::Started,
        TransportState::Paused,
        TransportState::Stopping,
        TransportState::Stopped,
        TransportState::Disconnecting,
        TransportState::Disconnected,
        TransportState::Timeouting,
        TransportState::Timeouted,
        TransportState::Handshaking,
        TransportState::Finished,
        TransportState::Error,
    ];

    pub(crate) fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(TransportState::Error)
    }
}

impl Display for TransportState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// How a transport delivers received data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadMode {
    /// Deliver one buffer, then wait for `read_continue`.
    Once,
    /// Keep delivering until stopped.
    Loop,
}

impl Display for ReadMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

type Notify<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

/// Callbacks of a stream transport. All of them run on poller threads.
pub struct TransportCallbacks<T> {
    pub(crate) read: Box<dyn Fn(&Arc<T>, &[u8]) + Send + Sync>,
    pub(crate) disconnected: Notify<T>,
    pub(crate) stopped: Notify<T>,
}

impl<T> TransportCallbacks<T> {
    pub fn new<R, D, S>(read: R, disconnected: D, stopped: S) -> Self
    where
        R: Fn(&Arc<T>, &[u8]) + Send + Sync + 'static,
        D: Fn(&Arc<T>) + Send + Sync + 'static,
        S: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        TransportCallbacks {
            read: Box::new(read),
            disconnected: Box::new(disconnected),
            stopped: Box::new(stopped),
        }
    }
}

impl<T> Debug for TransportCallbacks<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}

/// Callbacks of a datagram transport.
pub struct UdpCallbacks<T> {
    pub(crate) read_from: Box<dyn Fn(&Arc<T>, &[u8], &Address) + Send + Sync>,
    pub(crate) stopped: Notify<T>,
}

impl<T> UdpCallbacks<T> {
    pub fn new<R, S>(read_from: R, stopped: S) -> Self
    where
        R: Fn(&Arc<T>, &[u8], &Address) + Send + Sync + 'static,
        S: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        UdpCallbacks {
            read_from: Box::new(read_from),
            stopped: Box::new(stopped),
        }
    }
}

impl<T> Debug for UdpCallbacks<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpCallbacks").finish_non_exhaustive()
    }
}

/// Callbacks of an acceptor producing transports of type `C`.
pub struct AcceptorCallbacks<T, C> {
    pub(crate) accepted: Box<dyn Fn(&Arc<T>, Arc<C>) + Send + Sync>,
    pub(crate) stopped: Notify<T>,
}

impl<T, C> AcceptorCallbacks<T, C> {
    pub fn new<A, S>(accepted: A, stopped: S) -> Self
    where
        A: Fn(&Arc<T>, Arc<C>) + Send + Sync + 'static,
        S: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        AcceptorCallbacks {
            accepted: Box::new(accepted),
            stopped: Box::new(stopped),
        }
    }
}

impl<T, C> Debug for AcceptorCallbacks<T, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorCallbacks").finish_non_exhaustive()
    }
}

/// Callbacks of a dialer producing transports of type `C`.
///
/// `dialed` gets the transport and `true` on success, `None` and `false` on
/// failure. `timeouted` replaces `dialed` when the connect timer fired first.
pub struct DialerCallbacks<T, C> {
    pub(crate) dialed: Box<dyn Fn(&Arc<T>, Option<Arc<C>>, bool) + Send + Sync>,
    pub(crate) timeouted: Notify<T>,
    pub(crate) stopped: Notify<T>,
}

impl<T, C> DialerCallbacks<T, C> {
    pub fn new<D, O, S>(dialed: D, timeouted: O, stopped: S) -> Self
    where
        D: Fn(&Arc<T>, Option<Arc<C>>, bool) + Send + Sync + 'static,
        O: Fn(&Arc<T>) + Send + Sync + 'static,
        S: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        DialerCallbacks {
            dialed: Box::new(dialed),
            timeouted: Box::new(timeouted),
            stopped: Box::new(stopped),
        }
    }
}

impl<T, C> Debug for DialerCallbacks<T, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialerCallbacks").finish_non_exhaustive()
    }
}
