use crate::flow::{is_would_block, FlowCode, StreamFlow};
use crate::poll::tracker::FdSource;
use bytes::{Buf, Bytes};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

/// Plain TCP flow.
#[derive(Debug)]
pub struct FlowTcp {
    stream: Arc<TcpStream>,
    pending: Mutex<Option<Bytes>>,
}

impl FlowTcp {
    /// Bind the flow to a connected stream, switching it to non-blocking and no-delay.
    ///
    /// # Errors
    /// if the socket options cannot be applied.
    pub fn init(stream: Arc<TcpStream>) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(FlowTcp {
            stream,
            pending: Mutex::new(None),
        })
    }

    fn flush(&self, pending: &mut Option<Bytes>) -> FlowCode {
        let Some(buf) = pending.as_mut() else {
            return FlowCode::NoData;
        };
        while buf.has_remaining() {
            match (&*self.stream).write(buf.chunk()) {
                Ok(0) => return FlowCode::Abort,
                Ok(n) => buf.advance(n),
                Err(e) if is_would_block(&e) => return FlowCode::Again,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return FlowCode::Abort,
            }
        }
        *pending = None;
        FlowCode::Ok
    }
}

impl StreamFlow for FlowTcp {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&*self.stream).read(buf)
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

    fn shutdown(&self, how: Shutdown) {
        _ = self.stream.shutdown(how);
    }

    fn source(&self) -> Arc<dyn FdSource> {
        self.stream.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn partial_send_is_resumed() -> std::io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (mut server, _) = listener.accept()?;
        let flow = FlowTcp::init(Arc::new(client))?;
        assert_eq!(flow.send(), FlowCode::NoData);

        // large enough to fill both socket buffers
        let payload = Bytes::from(vec![7u8; 32 * 1024 * 1024]);
        let mut code = flow.want_to_send(payload.clone());
        assert_ne!(code, FlowCode::Abort);
        assert_eq!(code == FlowCode::Again, flow.has_data_to_send());

        let mut received = Vec::with_capacity(payload.len());
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < payload.len() {
            let n = server.read(&mut buf)?;
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
            if code == FlowCode::Again {
                code = flow.send();
            }
        }
        assert_eq!(code, FlowCode::Ok);
        assert!(!flow.has_data_to_send());
        assert_eq!(received, payload);
        Ok(())
    }

    #[test]
    fn read_zero_on_close() -> std::io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        let flow = FlowTcp::init(Arc::new(client))?;
        let mut buf = [0u8; 16];
        let e = flow.read(&mut buf).unwrap_err();
        assert!(is_would_block(&e));
        drop(server);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(flow.read(&mut buf)?, 0);
        Ok(())
    }
}
