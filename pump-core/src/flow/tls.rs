use crate::flow::{is_would_block, FlowCode, StreamFlow};
use crate::poll::tracker::FdSource;
use crate::tls::TlsSession;
use bytes::{Buf, Bytes};
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

/// TLS flow over a session whose handshake already completed.
#[derive(Debug)]
pub struct FlowTls {
    stream: Arc<TcpStream>,
    session: Mutex<Box<dyn TlsSession>>,
    pending: Mutex<Option<Bytes>>,
}

impl FlowTls {
    #[must_use]
    pub fn init(stream: Arc<TcpStream>, session: Box<dyn TlsSession>) -> Self {
        FlowTls {
            stream,
            session: Mutex::new(session),
            pending: Mutex::new(None),
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Box<dyn TlsSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, pending: &mut Option<Bytes>) -> FlowCode {
        let Some(buf) = pending.as_mut() else {
            return FlowCode::NoData;
        };
        let mut session = self.session();
        while buf.has_remaining() {
            match session.send(buf.chunk()) {
                Ok(0) => return FlowCode::Again,
                Ok(n) => buf.advance(n),
                Err(e) if is_would_block(&e) => return FlowCode::Again,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return FlowCode::Abort,
            }
        }
        if session.has_unsent_data() {
            match session.flush() {
                Ok(()) => {}
                Err(e) if is_would_block(&e) => return FlowCode::Again,
                Err(_) => return FlowCode::Abort,
            }
        }
        *pending = None;
        FlowCode::Ok
    }
}

impl StreamFlow for FlowTls {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.session().read(buf)
    }

    fn want_to_send(&self, buf: Bytes) -> FlowCode {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(pending.is_none(), "previous buffer not flushed");
        *pending = Some(buf);
        self.flush(&mut pending)
    }

    fn send(&self) -> FlowCode {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush(&mut pending)
    }

    fn has_data_to_send(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn has_unread_data(&self) -> bool {
        self.session().has_unread_data()
    }

    fn shutdown(&self, how: Shutdown) {
        if how != Shutdown::Read {
            self.session().close();
        }
        _ = self.stream.shutdown(how);
    }

    fn source(&self) -> Arc<dyn FdSource> {
        self.stream.clone()
    }
}
