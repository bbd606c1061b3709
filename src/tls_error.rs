use std::io;

/// Errors surfaced by a TLS channel, both as application-visible error events
/// and as the failure value of write/close/unwrap completions.
///
/// The same error frequently fails many completions at once, so it is `Clone`
/// and carries engine details as rendered strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The engine rejected the handshake (protocol error, bad certificate, ...).
    Handshake(String),
    /// The engine failed while exchanging close_notify alerts.
    Shutdown(String),
    /// Decrypting inbound records failed.
    Read(String),
    /// Encrypting outbound plaintext failed.
    Write(String),
    /// The underlying transport failed while sending ciphertext.
    Transport(String),
    /// The transport went away without a close_notify exchange.
    UncleanShutdown,
    /// The orderly shutdown did not finish within the configured timeout.
    ShutdownTimedOut,
    /// An event arrived in a state that cannot process it.
    InvalidState(&'static str),
    /// The requested close mode is not supported.
    UnsupportedOperation,
    /// The channel is already closed (or closing).
    AlreadyClosed,
    /// A buffered write was still outstanding when TLS was removed.
    WriteAfterUnwrap,
    /// The peer certificate does not match the expected identity.
    HostnameMismatch(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Handshake(e) => write!(f, "TLS handshake failed: {e}"),
            ChannelError::Shutdown(e) => write!(f, "TLS shutdown failed: {e}"),
            ChannelError::Read(e) => write!(f, "TLS read failed: {e}"),
            ChannelError::Write(e) => write!(f, "TLS write failed: {e}"),
            ChannelError::Transport(e) => write!(f, "transport error: {e}"),
            ChannelError::UncleanShutdown => {
                write!(f, "transport closed without a TLS close_notify (unclean shutdown)")
            }
            ChannelError::ShutdownTimedOut => write!(f, "clean TLS shutdown timed out"),
            ChannelError::InvalidState(reason) => write!(f, "invalid channel state: {reason}"),
            ChannelError::UnsupportedOperation => write!(f, "unsupported operation"),
            ChannelError::AlreadyClosed => write!(f, "channel already closed"),
            ChannelError::WriteAfterUnwrap => {
                write!(f, "write was still buffered when TLS was removed")
            }
            ChannelError::HostnameMismatch(e) => write!(f, "certificate identity mismatch: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        let kind = match err {
            ChannelError::UncleanShutdown => io::ErrorKind::UnexpectedEof,
            ChannelError::ShutdownTimedOut => io::ErrorKind::TimedOut,
            ChannelError::AlreadyClosed | ChannelError::WriteAfterUnwrap => {
                io::ErrorKind::BrokenPipe
            }
            ChannelError::UnsupportedOperation => io::ErrorKind::Unsupported,
            ChannelError::InvalidState(_) => io::ErrorKind::Other,
            ChannelError::Transport(_) => io::ErrorKind::ConnectionAborted,
            ChannelError::Handshake(_)
            | ChannelError::Shutdown(_)
            | ChannelError::Read(_)
            | ChannelError::Write(_)
            | ChannelError::HostnameMismatch(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let e: io::Error = ChannelError::UncleanShutdown.into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error = ChannelError::ShutdownTimedOut.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = ChannelError::Handshake("bad record mac".into()).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
        assert!(e.to_string().contains("bad record mac"));
    }

    #[test]
    fn test_display_is_distinct() {
        assert_ne!(
            ChannelError::UncleanShutdown.to_string(),
            ChannelError::ShutdownTimedOut.to_string()
        );
        assert_ne!(
            ChannelError::AlreadyClosed.to_string(),
            ChannelError::WriteAfterUnwrap.to_string()
        );
    }
}
