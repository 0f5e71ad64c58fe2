use crate::poll::tracker::FdSource;
use bytes::Bytes;
use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::sync::Arc;

mod tcp;
mod tcp_acceptor;
mod tcp_dialer;
mod tls;
mod udp;

pub use tcp::FlowTcp;
pub use tcp_acceptor::FlowTcpAcceptor;
pub use tcp_dialer::FlowTcpDialer;
pub use tls::FlowTls;
pub use udp::FlowUdp;

/// Outcome of one non-blocking flow operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlowCode {
    /// Done.
    Ok,
    /// Would block, wait for the next readiness.
    Again,
    /// Nothing was queued.
    NoData,
    /// The socket failed or the peer closed.
    Abort,
}

impl Display for FlowCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A connected byte stream with one pending outgoing buffer.
///
/// The read path and the send path may run on different threads at the same
/// time; they touch disjoint state.
pub trait StreamFlow: Debug + Send + Sync + 'static {
    /// Read once. `Ok(0)` is an orderly close, `WouldBlock` means no data yet.
    ///
    /// # Errors
    /// on socket failure or would-block.
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Take `buf` and send as much as the socket accepts. `Again` leaves the
    /// remainder queued for [`StreamFlow::send`].
    fn want_to_send(&self, buf: Bytes) -> FlowCode;

    /// Continue flushing the queued remainder. `NoData` if nothing is queued.
    fn send(&self) -> FlowCode;

    /// `true` while a remainder is queued.
    fn has_data_to_send(&self) -> bool;

    /// `true` if decoded data is buffered above the socket.
    fn has_unread_data(&self) -> bool {
        false
    }

    /// Shut one or both directions down. Errors are ignored.
    fn shutdown(&self, how: Shutdown);

    /// A share of the socket for trackers.
    fn source(&self) -> Arc<dyn FdSource>;
}

pub(crate) fn is_would_block(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
}

pub(crate) fn is_in_progress(e: &std::io::Error) -> bool {
    if is_would_block(e) {
        return true;
    }
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            e.raw_os_error() == Some(libc::EINPROGRESS)
        } else {
            false
        }
    }
}
