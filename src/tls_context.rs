//! Shared, validated TLS settings from which channels are created.
//!
//! A context is built once from a [`TlsConfiguration`] and shared read-only
//! (behind an `Arc`) by every channel spawned from it. The rustls configs are
//! built up front; a channel with its own verification callback gets a copy
//! with the verifier wrapped.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};

use crate::config::{
    load_certificates, load_private_key, load_trust_root_certificates, ChannelOptions,
    RenegotiationPolicy, TlsConfiguration, TlsVersion, VerificationMode,
};
use crate::crypto::{CallbackClientVerifier, CallbackServerVerifier, Role, VerificationCallback};
use crate::rustls_util::{
    build_crypto_provider, build_root_store, get_disabled_verifier, get_root_cert_store,
    ChainOnlyVerifier, KeyLogToFile,
};

/// Setting `key_log_file` to this value logs to the file named by `SSLKEYLOGFILE`.
const KEY_LOG_FROM_ENV: &str = "env";

pub struct TlsContext {
    role: Role,
    config: TlsConfiguration,
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    roots: Arc<RootCertStore>,
    explicit_roots: bool,
    key_log: Option<Arc<dyn rustls::KeyLog>>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    client_config: Option<Arc<ClientConfig>>,
    server_config: Option<Arc<ServerConfig>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("role", &self.role)
            .field("verification", &self.config.verification)
            .finish_non_exhaustive()
    }
}

fn invalid_input(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.into())
}

fn protocol_versions(
    minimum: Option<TlsVersion>,
    maximum: Option<TlsVersion>,
) -> std::io::Result<Vec<&'static SupportedProtocolVersion>> {
    let minimum = minimum.unwrap_or(TlsVersion::Tls12);
    let maximum = maximum.unwrap_or(TlsVersion::Tls13);
    if minimum > maximum {
        return Err(invalid_input(format!(
            "minimum_version {minimum:?} is greater than maximum_version {maximum:?}"
        )));
    }

    let mut versions = vec![];
    if minimum <= TlsVersion::Tls13 && maximum >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if minimum <= TlsVersion::Tls12 && maximum >= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    Ok(versions)
}

impl TlsContext {
    pub fn new(config: TlsConfiguration, role: Role) -> std::io::Result<Self> {
        let options = &config.channel;
        if options.low_watermark > options.high_watermark {
            return Err(invalid_input(format!(
                "low_watermark ({}) must not exceed high_watermark ({})",
                options.low_watermark, options.high_watermark
            )));
        }
        if options.receive_buffer_size == 0 {
            return Err(invalid_input("receive_buffer_size must be positive"));
        }

        match (role, config.renegotiation) {
            (_, RenegotiationPolicy::None) => {}
            (Role::Server, policy) => {
                debug!("Renegotiation policy {policy:?} forced to none for server contexts");
            }
            (Role::Client, policy) => {
                warn!("Renegotiation policy {policy:?} is not supported and will be ignored");
            }
        }

        let provider = build_crypto_provider(config.cipher_suites.as_deref())?;
        let versions = protocol_versions(config.minimum_version, config.maximum_version)?;

        let (roots, explicit_roots) = match load_trust_root_certificates(&config.trust_roots)? {
            Some(certs) => (Arc::new(build_root_store(certs)?), true),
            None => (get_root_cert_store(), false),
        };

        let key_log: Option<Arc<dyn rustls::KeyLog>> = match config.key_log_file.as_deref() {
            None => None,
            Some(KEY_LOG_FROM_ENV) => Some(Arc::new(rustls::KeyLogFile::new())),
            Some(path) => {
                warn!("Logging TLS session secrets to {path}");
                Some(Arc::new(KeyLogToFile::open(path)?))
            }
        };

        let identity = match (&config.certificate_chain, &config.private_key) {
            (Some(chain), Some(key)) => Some((load_certificates(chain)?, load_private_key(key)?)),
            (None, None) => None,
            _ => {
                return Err(invalid_input(
                    "certificate_chain and private_key must be set together",
                ));
            }
        };
        if role == Role::Server && identity.is_none() {
            return Err(invalid_input(
                "server contexts require certificate_chain and private_key",
            ));
        }

        let mut context = Self {
            role,
            config,
            provider,
            versions,
            roots,
            explicit_roots,
            key_log,
            identity,
            client_config: None,
            server_config: None,
        };

        match role {
            Role::Client => context.client_config = Some(Arc::new(context.build_client_config(None)?)),
            Role::Server => context.server_config = Some(Arc::new(context.build_server_config(None)?)),
        }

        Ok(context)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn configuration(&self) -> &TlsConfiguration {
        &self.config
    }

    pub fn verification(&self) -> VerificationMode {
        self.config.verification
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_timeout_ms)
    }

    pub fn channel_options(&self) -> &ChannelOptions {
        &self.config.channel
    }

    fn server_cert_verifier(
        &self,
        callback: Option<&VerificationCallback>,
    ) -> Arc<dyn rustls::client::danger::ServerCertVerifier> {
        let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> =
            match self.config.verification {
                VerificationMode::None => get_disabled_verifier(),
                VerificationMode::NoHostname | VerificationMode::Full => {
                    Arc::new(ChainOnlyVerifier::new(self.roots.clone(), &self.provider))
                }
            };
        match callback {
            Some(callback) => Arc::new(CallbackServerVerifier::new(verifier, callback.clone())),
            None => verifier,
        }
    }

    fn build_client_config(
        &self,
        callback: Option<&VerificationCallback>,
    ) -> std::io::Result<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| invalid_input(format!("Unusable protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(self.server_cert_verifier(callback));

        let mut config = match self.identity {
            Some((ref certs, ref key)) => builder
                .with_client_auth_cert(certs.clone(), key.clone_key())
                .map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Could not use client certificate: {e}"),
                    )
                })?,
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = self.config.alpn_protocols();
        if let Some(ref key_log) = self.key_log {
            config.key_log = key_log.clone();
        }
        Ok(config)
    }

    fn build_server_config(
        &self,
        callback: Option<&VerificationCallback>,
    ) -> std::io::Result<ServerConfig> {
        let (certs, key) = self
            .identity
            .as_ref()
            .ok_or_else(|| invalid_input("server contexts require a certificate and key"))?;

        let builder = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| invalid_input(format!("Unusable protocol versions: {e}")))?;

        // Client certificates are only requested when trust roots were given.
        let builder = if self.explicit_roots && self.config.verification != VerificationMode::None
        {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(self.roots.clone(), self.provider.clone())
                    .build()
                    .map_err(|e| invalid_input(format!("Could not build client verifier: {e}")))?;
            let verifier: Arc<dyn rustls::server::danger::ClientCertVerifier> = match callback {
                Some(callback) => Arc::new(CallbackClientVerifier::new(verifier, callback.clone())),
                None => verifier,
            };
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad certificate/key: {e}"),
                )
            })?;

        config.alpn_protocols = self.config.alpn_protocols();
        if let Some(ref key_log) = self.key_log {
            config.key_log = key_log.clone();
        }
        Ok(config)
    }

    /// The shared client config, or a private copy when a callback is given.
    pub fn client_config(
        &self,
        callback: Option<&VerificationCallback>,
    ) -> std::io::Result<Arc<ClientConfig>> {
        if self.role != Role::Client {
            return Err(invalid_input("not a client context"));
        }
        match (callback, self.client_config.as_ref()) {
            (None, Some(config)) => Ok(config.clone()),
            _ => Ok(Arc::new(self.build_client_config(callback)?)),
        }
    }

    pub fn server_config(
        &self,
        callback: Option<&VerificationCallback>,
    ) -> std::io::Result<Arc<ServerConfig>> {
        if self.role != Role::Server {
            return Err(invalid_input("not a server context"));
        }
        match (callback, self.server_config.as_ref()) {
            (None, Some(config)) => Ok(config.clone()),
            _ => Ok(Arc::new(self.build_server_config(callback)?)),
        }
    }
}
