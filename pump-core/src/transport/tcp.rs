use crate::address::Address;
use crate::flow::FlowTcp;
use crate::poll::channel::Channel;
use crate::transport::stream::{StreamKind, StreamTransport};
use crate::transport::TransportType;
use std::net::TcpStream;
use std::sync::Arc;

/// Stream transport over plain TCP.
pub type TcpTransport = StreamTransport<FlowTcp>;

impl StreamKind for FlowTcp {
    const TYPE: TransportType = TransportType::TcpTransport;

    fn channel(transport: Arc<TcpTransport>) -> Channel {
        Channel::TcpTransport(transport)
    }
}

impl StreamTransport<FlowTcp> {
    /// Wrap a connected stream. Nothing happens on it before `start`.
    ///
    /// # Errors
    /// if the addresses cannot be read or the socket options cannot be set.
    pub fn create(stream: Arc<TcpStream>) -> std::io::Result<Arc<Self>> {
        let local = Address::from(stream.local_addr()?);
        let remote = Address::from(stream.peer_addr()?);
        Ok(Self::with_flow(FlowTcp::init(stream)?, local, remote))
    }
}
