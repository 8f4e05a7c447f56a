use std::io;

/// Errors produced by the connection engine.
///
/// Transport faults (`Io`, `ConnectionReset`, `Expired`) end one connection
/// only. Protocol-contract violations are not represented here: they are bugs
/// in a handler implementation and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The peer stopped sending while a read still needed bytes.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The connection was force-closed by the maintenance sweep or a shutdown.
    #[error("connection expired")]
    Expired,

    /// A channel buffered more than the fatal multiple of the socket buffer.
    #[error("channel `{name}` overflowed with {buffered} unread bytes")]
    ChannelOverflow { name: String, buffered: usize },

    #[error("channel `{0}` is not ready for more uploads")]
    ChannelBusy(String),

    #[error("malformed channel frame")]
    MalformedFrame,

    #[error("handler pool is exhausted")]
    PoolExhausted,

    /// The listener was stopped and cannot be started again.
    #[error("listener is shut down")]
    ShuttingDown,
}

/// Shorthand used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// `true` for faults that only mean the remote side went away.
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionReset | Error::Expired => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    pub(crate) fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(err) => Some(err.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod errors_tests {
    use super::*;

    #[test]
    fn disconnect_kinds() {
        #[rustfmt::skip]
        let cases = [
            (Error::ConnectionReset,                                  true),
            (Error::Expired,                                          true),
            (io::Error::from(io::ErrorKind::BrokenPipe).into(),       true),
            (io::Error::from(io::ErrorKind::UnexpectedEof).into(),    true),
            (io::Error::from(io::ErrorKind::PermissionDenied).into(), false),
            (Error::MalformedFrame,                                   false),
            (Error::PoolExhausted,                                    false),
        ];

        for (err, expected) in cases {
            assert_eq!(err.is_disconnect(), expected, "{err}");
        }
    }

    #[test]
    fn display() {
        let err = Error::ChannelOverflow {
            name: "video".into(),
            buffered: 42,
        };
        assert_eq!(err.to_string(), "channel `video` overflowed with 42 unread bytes");

        let err = Error::from(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.to_string().starts_with("i/o error: "));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse));
        assert_eq!(Error::ShuttingDown.io_kind(), None);
    }
}
