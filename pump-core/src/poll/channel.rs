use crate::transport::tcp::TcpTransport;
use crate::transport::tcp_acceptor::TcpAcceptor;
use crate::transport::tcp_dialer::TcpDialer;
use crate::transport::tls::TlsTransport;
use crate::transport::tls_acceptor::TlsAcceptor;
use crate::transport::tls_dialer::TlsDialer;
use crate::transport::tls_handshaker::TlsHandshaker;
use crate::transport::udp::UdpTransport;
use crate::transport::TransportType;
use dashmap::DashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registry key of a channel. Trackers and queued channel events hold this
/// instead of the channel itself; once the entry is removed the key resolves to
/// nothing and late events are dropped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelKey(u64);

impl ChannelKey {
    /// Build a key from its raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        ChannelKey(raw)
    }

    /// The raw value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events a channel can post to itself through a poller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelEvent {
    /// Finish a stop or disconnect on the poller thread.
    Interrupt,
    /// A connect or handshake timer fired.
    Timeout,
    /// Plaintext is already buffered in the TLS session, read it without waiting
    /// for socket readiness.
    Read,
}

/// What a poller hands to a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
    /// The descriptor is readable, or failed.
    Read,
    /// The descriptor is writable, or failed.
    Send,
    /// A posted channel event.
    Channel(ChannelEvent),
}

/// Every entity that can be registered with a poller.
#[derive(Debug, Clone)]
pub enum Channel {
    TcpTransport(Arc<TcpTransport>),
    TlsTransport(Arc<TlsTransport>),
    UdpTransport(Arc<UdpTransport>),
    TcpAcceptor(Arc<TcpAcceptor>),
    TlsAcceptor(Arc<TlsAcceptor>),
    TcpDialer(Arc<TcpDialer>),
    TlsDialer(Arc<TlsDialer>),
    Handshaker(Arc<TlsHandshaker>),
    #[cfg(test)]
    Recorder(Arc<crate::poll::tests::Recorder>),
}

impl Channel {
    /// Run the handler of this channel, on the calling poller thread.
    pub fn handle_event(&self, event: EventKind) {
        match self {
            Channel::TcpTransport(t) => t.on_event(event),
            Channel::TlsTransport(t) => t.on_event(event),
            Channel::UdpTransport(t) => t.on_event(event),
            Channel::TcpAcceptor(t) => t.on_event(event),
            Channel::TlsAcceptor(t) => t.on_event(event),
            Channel::TcpDialer(t) => t.on_event(event),
            Channel::TlsDialer(t) => t.on_event(event),
            Channel::Handshaker(t) => t.on_event(event),
            #[cfg(test)]
            Channel::Recorder(p) => p.on_event(event),
        }
    }

    /// The kind of transport behind this channel.
    #[must_use]
    pub fn transport_type(&self) -> Option<TransportType> {
        match self {
            Channel::TcpTransport(_) => Some(TransportType::TcpTransport),
            Channel::TlsTransport(_) => Some(TransportType::TlsTransport),
            Channel::UdpTransport(_) => Some(TransportType::UdpTransport),
            Channel::TcpAcceptor(_) => Some(TransportType::TcpAcceptor),
            Channel::TlsAcceptor(_) => Some(TransportType::TlsAcceptor),
            Channel::TcpDialer(_) => Some(TransportType::TcpDialer),
            Channel::TlsDialer(_) => Some(TransportType::TlsDialer),
            Channel::Handshaker(_) => Some(TransportType::TlsHandshaker),
            #[cfg(test)]
            Channel::Recorder(_) => None,
        }
    }
}

/// Maps keys to live channels.
#[derive(Debug)]
pub struct ChannelRegistry {
    next: AtomicU64,
    channels: DashMap<ChannelKey, Channel>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        ChannelRegistry {
            next: AtomicU64::new(1),
            channels: DashMap::new(),
        }
    }
}

impl ChannelRegistry {
    /// Store `channel` under a fresh key.
    pub fn register(&self, channel: Channel) -> ChannelKey {
        let key = ChannelKey(self.next.fetch_add(1, Ordering::Relaxed));
        _ = self.channels.insert(key, channel);
        key
    }

    /// A clone of the channel under `key`. The map guard is released before
    /// returning so handlers may unregister themselves.
    #[must_use]
    pub fn get(&self, key: ChannelKey) -> Option<Channel> {
        self.channels.get(&key).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, key: ChannelKey) -> Option<Channel> {
        self.channels.remove(&key).map(|(_, channel)| channel)
    }

    #[must_use]
    pub fn contains(&self, key: ChannelKey) -> bool {
        self.channels.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel, breaking any reference the registry keeps alive.
    pub fn clear(&self) {
        self.channels.clear();
    }
}
