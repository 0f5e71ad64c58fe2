use std::fmt::{Debug, Display, Formatter};
use std::io::{Error, ErrorKind};

/// Errors returned synchronously by transport, acceptor and dialer calls.
///
/// Failures that happen later on a poller thread are never returned, they arrive
/// through the callbacks instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    /// Bad arguments or the object is in the wrong state for the call.
    Invalid,
    /// The object was not started yet or is already stopped.
    Unstarted,
    /// Transient condition, retry later.
    Again,
    /// Unrecoverable internal failure such as a tracker registration error.
    Fault,
    /// The socket failed or the peer went away.
    Abort,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for ErrorCode {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        let kind = match code {
            ErrorCode::Invalid => ErrorKind::InvalidInput,
            ErrorCode::Unstarted => ErrorKind::NotConnected,
            ErrorCode::Again => ErrorKind::WouldBlock,
            ErrorCode::Fault => ErrorKind::Other,
            ErrorCode::Abort => ErrorKind::ConnectionAborted,
        };
        Error::new(kind, code)
    }
}

/// Result alias used by the public transport API.
pub type Result<T> = std::result::Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_io_error() {
        let e: Error = ErrorCode::Again.into();
        assert_eq!(e.kind(), ErrorKind::WouldBlock);
        assert_eq!(e.to_string(), "Again");
        let e: Error = ErrorCode::Abort.into();
        assert_eq!(e.kind(), ErrorKind::ConnectionAborted);
    }
}
