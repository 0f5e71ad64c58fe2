use std::fmt::{Debug, Display, Formatter};
use std::net::TcpStream;
use std::sync::Arc;

mod rustls_engine;

pub use rustls_engine::RustlsEngine;

/// Outcome of one handshake step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeStatus {
    /// The handshake completed.
    Ok,
    /// Wait until the socket is readable, then call again.
    WantsRead,
    /// Wait until the socket is writable, then call again.
    WantsSend,
    /// The handshake failed.
    Error,
}

impl Display for HandshakeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Credentials able to open TLS sessions over connected sockets.
pub trait TlsEngine: Debug + Send + Sync {
    /// Open a session over `stream`.
    ///
    /// # Errors
    /// if the engine has no credentials for the requested side.
    fn create_session(
        &self,
        stream: Arc<TcpStream>,
        is_client: bool,
    ) -> std::io::Result<Box<dyn TlsSession>>;
}

/// One TLS connection driven by non-blocking socket I/O.
///
/// Every method returns `WouldBlock` instead of waiting.
pub trait TlsSession: Debug + Send {
    fn handshake(&mut self) -> HandshakeStatus;

    /// Decrypted bytes. `Ok(0)` once the peer closed.
    ///
    /// # Errors
    /// `WouldBlock` when no full record arrived yet, or the session failure.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Encrypt and queue `buf`, then try to write the records out. Returns how
    /// much plaintext was taken.
    ///
    /// # Errors
    /// `WouldBlock` when earlier records could not be written yet.
    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Write out queued records.
    ///
    /// # Errors
    /// `WouldBlock` or the socket failure.
    fn flush(&mut self) -> std::io::Result<()>;

    /// Decrypted bytes are buffered and the socket will not signal them.
    fn has_unread_data(&mut self) -> bool;

    /// Encrypted records wait to be written.
    fn has_unsent_data(&self) -> bool;

    /// Queue a close notification and try to write it.
    fn close(&mut self);
}
