use crate::address::Address;
use crate::poll::tracker::FdSource;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// Listening socket.
#[derive(Debug)]
pub struct FlowTcpAcceptor {
    listener: Arc<TcpListener>,
}

impl FlowTcpAcceptor {
    /// Bind and listen on `listen` with `backlog`.
    ///
    /// # Errors
    /// if the socket cannot be created, bound or put into listening state.
    pub fn init(listen: &Address, backlog: i32) -> std::io::Result<Self> {
        let addr = listen.socket_addr();
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;
        Ok(FlowTcpAcceptor {
            listener: Arc::new(TcpListener::from(socket)),
        })
    }

    /// Accept one pending connection. Returns the stream with its local and
    /// remote address.
    ///
    /// # Errors
    /// `WouldBlock` when the backlog is empty, or the socket error.
    pub fn accept(&self) -> std::io::Result<(Arc<TcpStream>, Address, Address)> {
        let (stream, remote) = self.listener.accept()?;
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;
        Ok((Arc::new(stream), Address::from(local), Address::from(remote)))
    }

    /// The bound address, with the port the OS picked.
    ///
    /// # Errors
    /// if the socket is gone.
    pub fn local_address(&self) -> std::io::Result<Address> {
        self.listener.local_addr().map(Address::from)
    }

    #[must_use]
    pub fn source(&self) -> Arc<dyn FdSource> {
        self.listener.clone()
    }
}
