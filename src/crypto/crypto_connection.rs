// Engine adapter around a single rustls connection
//
// All ciphertext moves through the connection's NetworkBio; the adapter never
// touches a socket. Each operation reports one of three outcomes so the
// channel can treat handshake, shutdown, read and write steps uniformly.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, trace};
use rustls::pki_types::{CertificateDer, ServerName};

use super::cert_verify::VerificationCallback;
use super::identity::validate_identity;
use crate::network_bio::NetworkBio;
use crate::tls_context::TlsContext;
use crate::tls_error::ChannelError;

/// Plaintext is decrypted into the receive buffer in chunks of this size.
const READ_CHUNK_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug)]
pub enum AsyncOperationResult<T> {
    /// More network I/O is needed before the operation can make progress.
    Incomplete,
    Complete(T),
    Failed(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The peer sent close_notify; no more plaintext will arrive.
    ZeroReturn,
    Tls(rustls::Error),
    Io(io::ErrorKind, String),
    /// The connection has not been started (no handshake step yet).
    NotStarted,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ZeroReturn => write!(f, "peer closed the TLS session"),
            EngineError::Tls(e) => write!(f, "{e}"),
            EngineError::Io(kind, msg) => write!(f, "{msg} ({kind:?})"),
            EngineError::NotStarted => write!(f, "TLS connection not started"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rustls::Error> for EngineError {
    fn from(e: rustls::Error) -> Self {
        EngineError::Tls(e)
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e.kind(), e.to_string())
    }
}

struct EngineCore {
    conn: rustls::Connection,
    close_notify_sent: bool,
    peer_closed: bool,
}

pub struct CryptoConnection {
    context: Arc<TlsContext>,
    bio: NetworkBio,
    role: Option<Role>,
    expected_hostname: Option<String>,
    peer_address: Option<IpAddr>,
    verification_callback: Option<VerificationCallback>,
    core: Option<EngineCore>,
}

impl CryptoConnection {
    pub fn new(context: Arc<TlsContext>) -> Self {
        Self {
            context,
            bio: NetworkBio::new(),
            role: None,
            expected_hostname: None,
            peer_address: None,
            verification_callback: None,
            core: None,
        }
    }

    fn ensure_not_started(&self, what: &str) -> io::Result<()> {
        if self.core.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot set {what} after the connection has started"),
            ));
        }
        Ok(())
    }

    pub fn set_role(&mut self, role: Role) -> io::Result<()> {
        self.ensure_not_started("role")?;
        if self.role.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "role is already set",
            ));
        }
        self.role = Some(role);
        Ok(())
    }

    pub fn set_expected_hostname(&mut self, hostname: &str) -> io::Result<()> {
        self.ensure_not_started("expected hostname")?;
        if self.role != Some(Role::Client) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "expected hostname is only valid for client connections",
            ));
        }
        if self.expected_hostname.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "expected hostname is already set",
            ));
        }
        ServerName::try_from(hostname).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid hostname {hostname}: {e}"),
            )
        })?;
        self.expected_hostname = Some(hostname.to_string());
        Ok(())
    }

    pub fn set_verification_callback(&mut self, callback: VerificationCallback) -> io::Result<()> {
        self.ensure_not_started("verification callback")?;
        if self.verification_callback.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "verification callback is already set",
            ));
        }
        self.verification_callback = Some(callback);
        Ok(())
    }

    /// Records the transport's remote address, used for SNI-less clients and
    /// identity checks when no hostname is set.
    pub fn set_peer_address(&mut self, peer_address: Option<IpAddr>) {
        self.peer_address = peer_address;
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn expected_hostname(&self) -> Option<&str> {
        self.expected_hostname.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.core.is_some()
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.core.is_some() {
            return Ok(());
        }
        let role = self.role.ok_or_else(|| {
            EngineError::Io(io::ErrorKind::InvalidInput, "role is not set".to_string())
        })?;
        let callback = self.verification_callback.as_ref();

        let mut conn: rustls::Connection = match role {
            Role::Client => {
                let server_name = match self.expected_hostname {
                    Some(ref hostname) => ServerName::try_from(hostname.clone())
                        .map_err(|e| EngineError::Io(io::ErrorKind::InvalidInput, e.to_string()))?,
                    // IP server names never produce an SNI extension.
                    None => ServerName::IpAddress(
                        self.peer_address
                            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
                            .into(),
                    ),
                };
                let config = self.context.client_config(callback)?;
                rustls::ClientConnection::new(config, server_name)?.into()
            }
            Role::Server => {
                let config = self.context.server_config(callback)?;
                rustls::ServerConnection::new(config)?.into()
            }
        };
        conn.set_buffer_limit(None);

        debug!("Started {role:?} TLS connection");
        self.core = Some(EngineCore {
            conn,
            close_notify_sent: false,
            peer_closed: false,
        });
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut EngineCore, &mut NetworkBio), EngineError> {
        self.bio.clear_retry_flags();
        self.start()?;
        match self.core {
            Some(ref mut core) => Ok((core, &mut self.bio)),
            None => Err(EngineError::NotStarted),
        }
    }

    pub fn receive_from_network(&mut self, data: &[u8]) {
        self.bio.receive_from_network(data);
    }

    pub fn take_outbound_ciphertext(&mut self) -> Option<bytes::Bytes> {
        self.bio.take_outbound_ciphertext()
    }

    pub fn evacuate_unconsumed_inbound(&mut self) -> Option<bytes::Bytes> {
        self.bio.evacuate_unconsumed_inbound()
    }

    pub fn do_handshake(&mut self) -> AsyncOperationResult<()> {
        let (core, bio) = match self.parts() {
            Ok(parts) => parts,
            Err(e) => return AsyncOperationResult::Failed(e),
        };

        while core.conn.is_handshaking() {
            match feed_one_record(core, bio) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // Last gasp: the alert describing the failure, if any.
                    let _ = flush_output(&mut core.conn, bio);
                    return AsyncOperationResult::Failed(e);
                }
            }
        }

        if let Err(e) = flush_output(&mut core.conn, bio) {
            return AsyncOperationResult::Failed(e);
        }

        if core.conn.is_handshaking() {
            trace!("Handshake incomplete, waiting for more data");
            AsyncOperationResult::Incomplete
        } else {
            AsyncOperationResult::Complete(())
        }
    }

    pub fn do_shutdown(&mut self) -> AsyncOperationResult<()> {
        let (core, bio) = match self.parts() {
            Ok(parts) => parts,
            Err(e) => return AsyncOperationResult::Failed(e),
        };

        if !core.close_notify_sent {
            debug!("Sending close_notify");
            core.conn.send_close_notify();
            core.close_notify_sent = true;
        }

        let mut discard = [0u8; 4096];
        while !core.peer_closed {
            loop {
                match core.conn.reader().read(&mut discard) {
                    Ok(0) => {
                        core.peer_closed = true;
                        break;
                    }
                    Ok(n) => trace!("Discarding {n} plaintext bytes received during shutdown"),
                    Err(_) => break,
                }
            }
            if core.peer_closed {
                break;
            }
            match feed_one_record(core, bio) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let _ = flush_output(&mut core.conn, bio);
                    return AsyncOperationResult::Failed(e);
                }
            }
        }

        if let Err(e) = flush_output(&mut core.conn, bio) {
            return AsyncOperationResult::Failed(e);
        }

        if core.peer_closed {
            AsyncOperationResult::Complete(())
        } else {
            AsyncOperationResult::Incomplete
        }
    }

    /// Decrypts all buffered ciphertext into `out`.
    ///
    /// Returns the number of plaintext bytes appended, `Incomplete` if none
    /// were available, or `Failed(ZeroReturn)` once the peer has closed.
    pub fn read_plaintext(&mut self, out: &mut BytesMut) -> AsyncOperationResult<usize> {
        let (core, bio) = match self.parts() {
            Ok(parts) => parts,
            Err(e) => return AsyncOperationResult::Failed(e),
        };

        let mut total = 0;
        loop {
            let start = out.len();
            out.resize(start + READ_CHUNK_SIZE, 0);
            let result = core.conn.reader().read(&mut out[start..]);
            match result {
                Ok(0) => {
                    out.truncate(start);
                    if total > 0 {
                        return AsyncOperationResult::Complete(total);
                    }
                    core.peer_closed = true;
                    return AsyncOperationResult::Failed(EngineError::ZeroReturn);
                }
                Ok(n) => {
                    out.truncate(start + n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    out.truncate(start);
                    match feed_one_record(core, bio) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            let _ = flush_output(&mut core.conn, bio);
                            return AsyncOperationResult::Failed(e);
                        }
                    }
                }
                Err(e) => {
                    out.truncate(start);
                    return AsyncOperationResult::Failed(e.into());
                }
            }
        }

        // Reading may have produced protocol responses (key updates).
        if let Err(e) = flush_output(&mut core.conn, bio) {
            return AsyncOperationResult::Failed(e);
        }

        if total > 0 {
            AsyncOperationResult::Complete(total)
        } else {
            AsyncOperationResult::Incomplete
        }
    }

    /// Encrypts all of `data`. The outbound side never applies backpressure,
    /// so a successful call always consumes the whole input.
    pub fn write_plaintext(&mut self, data: &[u8]) -> AsyncOperationResult<usize> {
        if data.is_empty() {
            return AsyncOperationResult::Complete(0);
        }

        let (core, bio) = match self.parts() {
            Ok(parts) => parts,
            Err(e) => return AsyncOperationResult::Failed(e),
        };

        if core.conn.is_handshaking() {
            return AsyncOperationResult::Incomplete;
        }
        if core.close_notify_sent {
            return AsyncOperationResult::Failed(EngineError::Io(
                io::ErrorKind::BrokenPipe,
                "close_notify already sent".to_string(),
            ));
        }

        let written = match core.conn.writer().write(data) {
            Ok(n) => n,
            Err(e) => return AsyncOperationResult::Failed(e.into()),
        };
        assert_eq!(
            written,
            data.len(),
            "TLS engine accepted a partial write with an unlimited buffer"
        );

        if let Err(e) = flush_output(&mut core.conn, bio) {
            return AsyncOperationResult::Failed(e);
        }
        AsyncOperationResult::Complete(written)
    }

    pub fn is_handshaking(&self) -> bool {
        match self.core {
            Some(ref core) => core.conn.is_handshaking(),
            None => true,
        }
    }

    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        let core = self.core.as_ref()?;
        if core.conn.is_handshaking() {
            return None;
        }
        core.conn.alpn_protocol().map(|p| p.to_vec())
    }

    pub fn negotiated_protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.core.as_ref()?.conn.protocol_version()
    }

    pub fn negotiated_cipher_suite(&self) -> Option<rustls::CipherSuite> {
        self.core
            .as_ref()?
            .conn
            .negotiated_cipher_suite()
            .map(|suite| suite.suite())
    }

    pub fn peer_certificate_chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        let certs = self.core.as_ref()?.conn.peer_certificates()?;
        Some(certs.iter().map(|c| c.clone().into_owned()).collect())
    }

    pub fn peer_leaf_certificate(&self) -> Option<CertificateDer<'static>> {
        let certs = self.core.as_ref()?.conn.peer_certificates()?;
        certs.first().map(|c| c.clone().into_owned())
    }

    /// The SNI name a client asked for, server side only.
    pub fn server_name(&self) -> Option<String> {
        match self.core.as_ref()?.conn {
            rustls::Connection::Server(ref conn) => conn.server_name().map(|s| s.to_string()),
            rustls::Connection::Client(_) => None,
        }
    }

    pub fn validate_hostname(&self, peer_address: Option<IpAddr>) -> Result<(), ChannelError> {
        let leaf = self.peer_leaf_certificate().ok_or_else(|| {
            ChannelError::HostnameMismatch("peer presented no certificate".to_string())
        })?;
        validate_identity(
            self.expected_hostname.as_deref(),
            peer_address.or(self.peer_address),
            &leaf,
        )
    }
}

fn flush_output(conn: &mut rustls::Connection, bio: &mut NetworkBio) -> Result<(), EngineError> {
    while conn.wants_write() {
        conn.write_tls(&mut bio.writer())?;
    }
    Ok(())
}

/// Feeds at most one record worth of ciphertext into the engine.
///
/// Returns `Ok(false)` when the BIO had nothing left to read.
fn feed_one_record(core: &mut EngineCore, bio: &mut NetworkBio) -> Result<bool, EngineError> {
    match core.conn.read_tls(&mut bio.reader()) {
        Ok(0) => return Ok(false),
        Ok(n) => trace!("Fed {n} ciphertext bytes to engine"),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let io_state = core.conn.process_new_packets()?;
    if io_state.peer_has_closed() {
        core.peer_closed = true;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{client_context, server_context, TestIdentity};

    fn shuttle(from: &mut CryptoConnection, to: &mut CryptoConnection) -> bool {
        match from.take_outbound_ciphertext() {
            Some(data) => {
                to.receive_from_network(&data);
                true
            }
            None => false,
        }
    }

    fn connected_pair() -> (CryptoConnection, CryptoConnection) {
        let identity = TestIdentity::generate(&["localhost"]);
        let mut client = CryptoConnection::new(client_context(&identity, None));
        client.set_role(Role::Client).unwrap();
        client.set_expected_hostname("localhost").unwrap();
        let mut server = CryptoConnection::new(server_context(&identity, None));
        server.set_role(Role::Server).unwrap();

        for _ in 0..10 {
            let client_result = client.do_handshake();
            shuttle(&mut client, &mut server);
            let server_result = server.do_handshake();
            shuttle(&mut server, &mut client);
            if matches!(client_result, AsyncOperationResult::Complete(()))
                && matches!(server_result, AsyncOperationResult::Complete(()))
            {
                return (client, server);
            }
        }
        panic!("handshake did not complete");
    }

    #[test]
    fn test_setters_rejected_after_start() {
        let identity = TestIdentity::generate(&["localhost"]);
        let mut client = CryptoConnection::new(client_context(&identity, None));
        assert!(client.set_expected_hostname("localhost").is_err());
        client.set_role(Role::Client).unwrap();
        assert!(client.set_role(Role::Server).is_err());
        client.set_expected_hostname("localhost").unwrap();
        assert!(client.set_expected_hostname("other").is_err());

        assert!(matches!(
            client.do_handshake(),
            AsyncOperationResult::Incomplete
        ));
        assert!(client.take_outbound_ciphertext().is_some());
        assert!(client
            .set_verification_callback(Arc::new(|preverify, _| preverify))
            .is_err());
    }

    #[test]
    fn test_zero_length_write_skips_engine() {
        let identity = TestIdentity::generate(&["localhost"]);
        let mut client = CryptoConnection::new(client_context(&identity, None));
        assert!(matches!(
            client.write_plaintext(&[]),
            AsyncOperationResult::Complete(0)
        ));
        assert!(!client.is_started());
    }

    #[test]
    fn test_plaintext_round_trip_and_zero_return() {
        let (mut client, mut server) = connected_pair();
        assert!(client.negotiated_protocol_version().is_some());
        assert!(client.negotiated_cipher_suite().is_some());
        assert_eq!(server.server_name().as_deref(), Some("localhost"));
        assert!(client.validate_hostname(None).is_ok());

        assert!(matches!(
            client.write_plaintext(b"hello, world!"),
            AsyncOperationResult::Complete(13)
        ));
        shuttle(&mut client, &mut server);

        let mut buf = BytesMut::new();
        assert!(matches!(
            server.read_plaintext(&mut buf),
            AsyncOperationResult::Complete(13)
        ));
        assert_eq!(&buf[..], b"hello, world!");
        assert!(matches!(
            server.read_plaintext(&mut buf),
            AsyncOperationResult::Incomplete
        ));

        assert!(matches!(
            client.do_shutdown(),
            AsyncOperationResult::Incomplete
        ));
        shuttle(&mut client, &mut server);
        assert!(matches!(
            server.read_plaintext(&mut buf),
            AsyncOperationResult::Failed(EngineError::ZeroReturn)
        ));
        assert!(matches!(
            server.do_shutdown(),
            AsyncOperationResult::Complete(())
        ));
        shuttle(&mut server, &mut client);
        assert!(matches!(
            client.do_shutdown(),
            AsyncOperationResult::Complete(())
        ));
    }

    #[test]
    fn test_handshake_failure_is_reported() {
        let identity = TestIdentity::generate(&["localhost"]);
        let other = TestIdentity::generate(&["localhost"]);
        // Client trusts a different root than the one the server presents.
        let mut client = CryptoConnection::new(client_context(&other, None));
        client.set_role(Role::Client).unwrap();
        client.set_expected_hostname("localhost").unwrap();
        let mut server = CryptoConnection::new(server_context(&identity, None));
        server.set_role(Role::Server).unwrap();

        let mut failed = false;
        for _ in 0..10 {
            if let AsyncOperationResult::Failed(EngineError::Tls(_)) = client.do_handshake() {
                failed = true;
                break;
            }
            shuttle(&mut client, &mut server);
            server.do_handshake();
            shuttle(&mut server, &mut client);
        }
        assert!(failed);
        // The alert is left for the transport.
        assert!(client.take_outbound_ciphertext().is_some());
    }
}
