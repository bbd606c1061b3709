//! Helpers shared by unit tests: certificates, contexts and an in-memory
//! client/server channel pair.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

use crate::completion::{Completion, CompletionResult};
use crate::config::{ChannelOptions, PemSource, TlsConfiguration, TrustRoots};
use crate::crypto::Role;
use crate::tls_channel::{ChannelAction, TimerId, TlsChannel};
use crate::tls_context::TlsContext;
use crate::tls_error::ChannelError;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A test CA and a leaf certificate it signed.
pub struct TestIdentity {
    pub ca_pem: String,
    pub leaf_pem: String,
    pub key_pem: String,
}

impl TestIdentity {
    pub fn generate(names: &[&str]) -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tls-channel test CA");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let leaf_params = CertificateParams::new(names).unwrap();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            leaf_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        }
    }

    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.leaf_pem, self.ca_pem)
    }
}

fn client_configuration(trust: &TestIdentity, alpn: &[&str]) -> TlsConfiguration {
    TlsConfiguration {
        trust_roots: TrustRoots::Certificates {
            certificates: vec![PemSource::Data(trust.ca_pem.clone())].into(),
        },
        alpn_protocols: alpn
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into(),
        ..Default::default()
    }
}

fn server_configuration(identity: &TestIdentity, alpn: &[&str]) -> TlsConfiguration {
    TlsConfiguration {
        certificate_chain: Some(PemSource::Data(identity.chain_pem())),
        private_key: Some(PemSource::Data(identity.key_pem.clone())),
        alpn_protocols: alpn
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into(),
        ..Default::default()
    }
}

/// Client context trusting `trust`'s CA.
pub fn client_context(trust: &TestIdentity, alpn: Option<&[&str]>) -> Arc<TlsContext> {
    let config = client_configuration(trust, alpn.unwrap_or(&[]));
    Arc::new(TlsContext::new(config, Role::Client).unwrap())
}

/// Server context presenting `identity`.
pub fn server_context(identity: &TestIdentity, alpn: Option<&[&str]>) -> Arc<TlsContext> {
    let config = server_configuration(identity, alpn.unwrap_or(&[]));
    Arc::new(TlsContext::new(config, Role::Server).unwrap())
}

/// Records completion results by name, in firing order.
#[derive(Clone, Default)]
pub struct CompletionLog(Arc<Mutex<Vec<(String, CompletionResult)>>>);

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion(&self, name: &str) -> Completion {
        let log = self.0.clone();
        let name = name.to_string();
        Completion::new(move |result| log.lock().push((name, result)))
    }

    pub fn results(&self) -> Vec<(String, CompletionResult)> {
        self.0.lock().clone()
    }

    pub fn result_of(&self, name: &str) -> Option<CompletionResult> {
        self.0
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, result)| result.clone())
    }
}

/// One side of a [`ChannelPair`], with everything its transport observed.
pub struct Endpoint {
    pub channel: TlsChannel,
    /// Application-directed actions, in order.
    pub events: Vec<ChannelAction>,
    pub timers: Vec<TimerId>,
    pub read_requests: usize,
    pub transport_closed: bool,
    pub inactive_notified: bool,
    pub detached: Option<Option<Bytes>>,
    /// While set, nothing is delivered to this side.
    pub paused: bool,
    pub inbox: VecDeque<Bytes>,
}

impl Endpoint {
    fn new(channel: TlsChannel) -> Self {
        Self {
            channel,
            events: vec![],
            timers: vec![],
            read_requests: 0,
            transport_closed: false,
            inactive_notified: false,
            detached: None,
            paused: false,
            inbox: VecDeque::new(),
        }
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChannelAction::DataReceived(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn received_concat(&self) -> Bytes {
        let mut all = BytesMut::new();
        for data in self.received() {
            all.extend_from_slice(&data);
        }
        all.freeze()
    }

    pub fn errors(&self) -> Vec<ChannelError> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChannelAction::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn handshakes_completed(&self) -> usize {
        self.negotiated_protocols().len()
    }

    pub fn negotiated_protocols(&self) -> Vec<Option<Vec<u8>>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChannelAction::HandshakeCompleted {
                    negotiated_protocol,
                } => Some(negotiated_protocol.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdowns_completed(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ChannelAction::ShutdownCompleted))
            .count()
    }

    pub fn writability_changes(&self) -> Vec<bool> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChannelAction::WritabilityChanged(writable) => Some(*writable),
                _ => None,
            })
            .collect()
    }

    /// Runs the transport side of every queued action. Returns whether any
    /// action was handled.
    fn drain(&mut self, peer_inbox: &mut VecDeque<Bytes>) -> bool {
        let mut progressed = false;
        while let Some(action) = self.channel.poll_action() {
            progressed = true;
            match action {
                ChannelAction::Send { data, batch } => {
                    if !self.transport_closed {
                        peer_inbox.push_back(data);
                    }
                    if let Some(batch) = batch {
                        self.channel.write_completed(batch, Ok(()));
                    }
                }
                ChannelAction::FlushTransport => {}
                ChannelAction::CloseTransport { completion } => {
                    self.transport_closed = true;
                    if let Some(completion) = completion {
                        completion.succeed();
                    }
                }
                ChannelAction::RequestRead => self.read_requests += 1,
                ChannelAction::ScheduleTimeout { id, .. } => self.timers.push(id),
                ChannelAction::CancelTimeout { id } => self.timers.retain(|t| *t != id),
                ChannelAction::Detach { leftover } => self.detached = Some(leftover),
                event => self.events.push(event),
            }
        }
        progressed
    }

    /// Delivers queued bytes, or the transport going away once nothing is left.
    fn deliver(&mut self, peer_closed: bool, fragment_size: Option<usize>) -> bool {
        if self.paused || self.detached.is_some() {
            return false;
        }

        if !self.inbox.is_empty() {
            let mut data = BytesMut::new();
            for chunk in self.inbox.drain(..) {
                data.extend_from_slice(&chunk);
            }
            if self.transport_closed {
                return true;
            }
            match fragment_size {
                Some(size) => {
                    for fragment in data.chunks(size) {
                        self.channel.bytes_received(fragment);
                        self.channel.read_complete();
                    }
                }
                None => {
                    self.channel.bytes_received(&data);
                    self.channel.read_complete();
                }
            }
            return true;
        }

        if (peer_closed || self.transport_closed) && !self.inactive_notified {
            self.inactive_notified = true;
            self.transport_closed = true;
            self.channel.transport_inactive();
            return true;
        }

        false
    }
}

/// A client and server channel connected through in-memory queues. Sends
/// complete successfully as soon as they are queued.
pub struct ChannelPair {
    pub client: Endpoint,
    pub server: Endpoint,
    pub fragment_size: Option<usize>,
}

impl ChannelPair {
    pub fn new(identity: &TestIdentity) -> Self {
        Self::build(identity, identity, Some("localhost"), &[], |_| {})
    }

    pub fn with_options(identity: &TestIdentity, configure: impl Fn(&mut ChannelOptions)) -> Self {
        Self::build(identity, identity, Some("localhost"), &[], configure)
    }

    pub fn with_alpn(identity: &TestIdentity, alpn: &[&str]) -> Self {
        Self::build(identity, identity, Some("localhost"), alpn, |_| {})
    }

    /// Client trusting `client_trust`'s CA, server presenting `server_identity`.
    pub fn with_identities(
        client_trust: &TestIdentity,
        server_identity: &TestIdentity,
        hostname: Option<&str>,
        configure: impl Fn(&mut ChannelOptions),
    ) -> Self {
        Self::build(client_trust, server_identity, hostname, &[], configure)
    }

    fn build(
        client_trust: &TestIdentity,
        server_identity: &TestIdentity,
        hostname: Option<&str>,
        alpn: &[&str],
        configure: impl Fn(&mut ChannelOptions),
    ) -> Self {
        init_logging();

        let mut client_config = client_configuration(client_trust, alpn);
        configure(&mut client_config.channel);
        let mut server_config = server_configuration(server_identity, alpn);
        configure(&mut server_config.channel);

        let client_context = Arc::new(TlsContext::new(client_config, Role::Client).unwrap());
        let server_context = Arc::new(TlsContext::new(server_config, Role::Server).unwrap());

        Self {
            client: Endpoint::new(TlsChannel::client(client_context, hostname).unwrap()),
            server: Endpoint::new(TlsChannel::server(server_context).unwrap()),
            fragment_size: None,
        }
    }

    /// Activates both transports and runs until nothing moves.
    pub fn connect(&mut self) {
        self.client.channel.transport_active(None);
        self.server.channel.transport_active(None);
        self.pump();
    }

    /// Handles queued actions on both sides without delivering anything.
    pub fn drain_actions(&mut self) {
        self.client.drain(&mut self.server.inbox);
        self.server.drain(&mut self.client.inbox);
    }

    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            progressed |= self.client.drain(&mut self.server.inbox);
            progressed |= self.server.drain(&mut self.client.inbox);
            progressed |= self
                .server
                .deliver(self.client.transport_closed, self.fragment_size);
            progressed |= self
                .client
                .deliver(self.server.transport_closed, self.fragment_size);
            if !progressed {
                break;
            }
        }
    }
}
