use crate::address::Address;
use crate::poll::tracker::FdSource;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::UdpSocket;
use std::sync::Arc;

/// Datagram flow. Every send and receive is a whole datagram, so nothing is queued.
#[derive(Debug)]
pub struct FlowUdp {
    socket: Arc<UdpSocket>,
}

impl FlowUdp {
    /// Open a non-blocking socket bound to `bind`.
    ///
    /// # Errors
    /// if the socket cannot be created or bound.
    pub fn init(bind: &Address) -> std::io::Result<Self> {
        let addr = bind.socket_addr();
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        Ok(FlowUdp {
            socket: Arc::new(UdpSocket::from(socket)),
        })
    }

    /// Receive one datagram.
    ///
    /// # Errors
    /// `WouldBlock` when nothing is queued, or the socket error.
    pub fn read_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, Address)> {
        self.socket
            .recv_from(buf)
            .map(|(n, from)| (n, Address::from(from)))
    }

    /// Send one datagram.
    ///
    /// # Errors
    /// `WouldBlock` when the socket buffer is full, or the socket error.
    pub fn send_to(&self, buf: &[u8], to: &Address) -> std::io::Result<usize> {
        self.socket.send_to(buf, to.socket_addr())
    }

    /// The bound address, with the port the OS picked.
    ///
    /// # Errors
    /// if the socket is gone.
    pub fn local_address(&self) -> std::io::Result<Address> {
        self.socket.local_addr().map(Address::from)
    }

    #[must_use]
    pub fn source(&self) -> Arc<dyn FdSource> {
        self.socket.clone()
    }
}
