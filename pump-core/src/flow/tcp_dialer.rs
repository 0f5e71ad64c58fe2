use crate::address::Address;
use crate::flow::{is_in_progress, FlowCode};
use crate::poll::tracker::FdSource;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{Error, ErrorKind};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};

/// Non-blocking connect.
///
/// An error reported synchronously by `connect(2)` is kept and returned by
/// [`FlowTcpDialer::connect`] once the socket signals writability, so every
/// outcome reaches the dialer the same way.
#[derive(Debug)]
pub struct FlowTcpDialer {
    socket: Arc<Socket>,
    connect_error: Mutex<Option<Error>>,
}

fn to_address(addr: &SockAddr) -> std::io::Result<Address> {
    addr.as_socket()
        .map(Address::from)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "not an ip endpoint"))
}

impl FlowTcpDialer {
    /// Create a non-blocking socket bound to `bind`.
    ///
    /// # Errors
    /// if the socket cannot be created or bound.
    pub fn init(bind: &Address) -> std::io::Result<Self> {
        let addr = bind.socket_addr();
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        Ok(FlowTcpDialer {
            socket: Arc::new(socket),
            connect_error: Mutex::new(None),
        })
    }

    /// Start connecting to `remote`.
    pub fn want_to_connect(&self, remote: &Address) -> FlowCode {
        match self.socket.connect(&SockAddr::from(remote.socket_addr())) {
            Ok(()) => FlowCode::Ok,
            Err(e) if is_in_progress(&e) => FlowCode::Ok,
            Err(e) => {
                *self
                    .connect_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e);
                FlowCode::Ok
            }
        }
    }

    /// Check the result of the connect after writability fired.
    /// Returns the local and remote address on success.
    ///
    /// # Errors
    /// the connect failure.
    pub fn connect(&self) -> std::io::Result<(Address, Address)> {
        if let Some(e) = self
            .connect_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(e);
        }
        if let Some(e) = self.socket.take_error()? {
            return Err(e);
        }
        let remote = to_address(&self.socket.peer_addr()?)?;
        let local = to_address(&self.socket.local_addr()?)?;
        Ok((local, remote))
    }

    /// A stream on a duplicate of the connected descriptor, for the transport
    /// that takes over the connection.
    ///
    /// # Errors
    /// if the descriptor cannot be duplicated.
    pub fn unbind_stream(&self) -> std::io::Result<Arc<TcpStream>> {
        Ok(Arc::new(TcpStream::from(self.socket.try_clone()?)))
    }

    pub fn shutdown(&self) {
        _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    #[must_use]
    pub fn source(&self) -> Arc<dyn FdSource> {
        self.socket.clone()
    }
}
