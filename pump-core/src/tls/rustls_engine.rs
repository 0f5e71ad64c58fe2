use crate::tls::{HandshakeStatus, TlsEngine, TlsSession};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use std::fmt::{Debug, Formatter};
use std::io::{BufReader, Error, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

fn tls_error(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Error {
    Error::new(ErrorKind::InvalidData, e)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_certs(pem: &[u8]) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "no certificate found"));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> std::io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))?
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "no private key found"))
}

/// [`TlsEngine`] backed by rustls with the ring provider.
///
/// One engine carries client credentials, server credentials or both.
pub struct RustlsEngine {
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    server: Option<Arc<ServerConfig>>,
}

impl Debug for RustlsEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("client", &self.client.as_ref().map(|(_, name)| name))
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl RustlsEngine {
    /// Server credentials from a DER chain and key.
    ///
    /// # Errors
    /// if rustls rejects the key or chain.
    pub fn server_from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> std::io::Result<Self> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_error)?;
        Ok(RustlsEngine {
            client: None,
            server: Some(Arc::new(config)),
        })
    }

    /// Server credentials from PEM buffers.
    ///
    /// # Errors
    /// if the PEM holds no certificate or key, or rustls rejects them.
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> std::io::Result<Self> {
        Self::server_from_der(read_certs(cert_pem)?, read_key(key_pem)?)
    }

    /// Server credentials from PEM files.
    ///
    /// # Errors
    /// if a file cannot be read or holds bad credentials.
    pub fn server_from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<Self> {
        Self::server_from_pem(&std::fs::read(cert_path)?, &std::fs::read(key_path)?)
    }

    /// Client credentials trusting `roots`, verifying the server as `server_name`.
    ///
    /// # Errors
    /// if a root is malformed or `server_name` is no valid name.
    pub fn client_from_der(
        roots: Vec<CertificateDer<'static>>,
        server_name: &str,
    ) -> std::io::Result<Self> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store.add(root).map_err(tls_error)?;
        }
        let name = ServerName::try_from(server_name.to_owned()).map_err(tls_error)?;
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(store)
            .with_no_client_auth();
        Ok(RustlsEngine {
            client: Some((Arc::new(config), name)),
            server: None,
        })
    }

    /// Client credentials trusting the PEM encoded `ca_pem`.
    ///
    /// # Errors
    /// see [`RustlsEngine::client_from_der`].
    pub fn client_from_pem(ca_pem: &[u8], server_name: &str) -> std::io::Result<Self> {
        Self::client_from_der(read_certs(ca_pem)?, server_name)
    }

    /// Client credentials trusting the PEM file at `ca_path`.
    ///
    /// # Errors
    /// if the file cannot be read or holds bad certificates.
    pub fn client_from_pem_file(
        ca_path: impl AsRef<Path>,
        server_name: &str,
    ) -> std::io::Result<Self> {
        Self::client_from_pem(&std::fs::read(ca_path)?, server_name)
    }

    /// Add the server side of `other` to this engine.
    #[must_use]
    pub fn with_server(mut self, other: RustlsEngine) -> Self {
        self.server = other.server.or(self.server);
        self
    }
}

impl TlsEngine for RustlsEngine {
    fn create_session(
        &self,
        stream: Arc<TcpStream>,
        is_client: bool,
    ) -> std::io::Result<Box<dyn TlsSession>> {
        let conn = if is_client {
            let (config, name) = self
                .client
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::Unsupported, "no client credentials"))?;
            Connection::Client(ClientConnection::new(config.clone(), name.clone()).map_err(tls_error)?)
        } else {
            let config = self
                .server
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::Unsupported, "no server credentials"))?;
            Connection::Server(ServerConnection::new(config.clone()).map_err(tls_error)?)
        };
        Ok(Box::new(RustlsSession { stream, conn }))
    }
}

#[derive(Debug)]
struct RustlsSession {
    stream: Arc<TcpStream>,
    conn: Connection,
}

impl RustlsSession {
    fn write_records(&mut self) -> std::io::Result<()> {
        let mut io = &*self.stream;
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut io)? == 0 {
                return Err(Error::from(ErrorKind::WriteZero));
            }
        }
        Ok(())
    }

    /// Pull records from the socket. `Ok(false)` on end of stream.
    fn read_records(&mut self) -> std::io::Result<bool> {
        let mut io = &*self.stream;
        if self.conn.read_tls(&mut io)? == 0 {
            return Ok(false);
        }
        if let Err(e) = self.conn.process_new_packets() {
            // the alert is best effort
            _ = self.write_records();
            return Err(tls_error(e));
        }
        Ok(true)
    }
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self) -> HandshakeStatus {
        loop {
            match self.write_records() {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return HandshakeStatus::WantsSend,
                Err(_) => return HandshakeStatus::Error,
            }
            if !self.conn.is_handshaking() {
                return HandshakeStatus::Ok;
            }
            match self.read_records() {
                Ok(true) => {}
                Ok(false) => return HandshakeStatus::Error,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return HandshakeStatus::WantsRead,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return HandshakeStatus::Error,
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if !self.read_records()? {
                return Ok(0);
            }
            // key updates and the like
            match self.write_records() {
                Err(e) if e.kind() != ErrorKind::WouldBlock => return Err(e),
                _ => {}
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_records()?;
        let n = self.conn.writer().write(buf)?;
        match self.write_records() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e),
            _ => Ok(n),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.write_records()
    }

    fn has_unread_data(&mut self) -> bool {
        self.conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }

    fn has_unsent_data(&self) -> bool {
        self.conn.wants_write()
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
        _ = self.write_records();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn engines() -> std::io::Result<(RustlsEngine, RustlsEngine)> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .map_err(tls_error)?;
        let server = RustlsEngine::server_from_pem(
            certified.cert.pem().as_bytes(),
            certified.key_pair.serialize_pem().as_bytes(),
        )?;
        let client = RustlsEngine::client_from_der(vec![certified.cert.der().clone()], "localhost")?;
        Ok((server, client))
    }

    fn drive(session: &mut dyn TlsSession) -> HandshakeStatus {
        for _ in 0..1000 {
            match session.handshake() {
                HandshakeStatus::WantsRead | HandshakeStatus::WantsSend => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                status => return status,
            }
        }
        HandshakeStatus::Error
    }

    #[test]
    fn missing_credentials() -> std::io::Result<()> {
        let (server, client) = engines()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let stream = Arc::new(TcpStream::connect(listener.local_addr()?)?);
        assert!(server.create_session(stream.clone(), true).is_err());
        assert!(client.create_session(stream, false).is_err());
        assert!(RustlsEngine::server_from_pem(b"", b"").is_err());
        Ok(())
    }

    #[test]
    fn handshake_and_exchange() -> std::io::Result<()> {
        let (server, client) = engines()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client_stream = Arc::new(TcpStream::connect(listener.local_addr()?)?);
        let (server_stream, _) = listener.accept()?;
        let server_stream = Arc::new(server_stream);
        client_stream.set_nonblocking(true)?;
        server_stream.set_nonblocking(true)?;

        let mut server_session = server.create_session(server_stream, false)?;
        let handle = std::thread::spawn(move || {
            let status = drive(server_session.as_mut());
            (status, server_session)
        });
        let mut client_session = client.create_session(client_stream, true)?;
        assert_eq!(drive(client_session.as_mut()), HandshakeStatus::Ok);
        let (status, mut server_session) = handle.join().expect("server thread");
        assert_eq!(status, HandshakeStatus::Ok);

        assert_eq!(client_session.send(b"ping")?, 4);
        client_session.flush()?;
        let mut buf = [0u8; 16];
        let mut n = 0;
        for _ in 0..1000 {
            match server_session.read(&mut buf) {
                Ok(read) => {
                    n = read;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        assert_eq!(&buf[..n], b"ping");
        assert!(!server_session.has_unread_data());
        Ok(())
    }
}
