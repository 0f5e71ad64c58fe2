use crate::address::Address;
use crate::flow::FlowTls;
use crate::poll::channel::Channel;
use crate::transport::stream::{StreamKind, StreamTransport};
use crate::transport::TransportType;
use std::sync::Arc;

/// Stream transport over a TLS session. Created by the TLS dialer and acceptor
/// once the handshake completed; stopping it gracefully sends a close notify.
pub type TlsTransport = StreamTransport<FlowTls>;

impl StreamKind for FlowTls {
    const TYPE: TransportType = TransportType::TlsTransport;

    fn channel(transport: Arc<TlsTransport>) -> Channel {
        Channel::TlsTransport(transport)
    }
}

impl StreamTransport<FlowTls> {
    pub(crate) fn create(flow: FlowTls, local: Address, remote: Address) -> Arc<Self> {
        Self::with_flow(flow, local, remote)
    }
}
