use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::sync::OnceLock;

use log::warn;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

pub fn get_crypto_provider() -> Arc<CryptoProvider> {
    static INSTANCE: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Returns the default provider restricted to the named cipher suites.
///
/// `cipher_suites` is a colon-separated list of rustls suite names, for
/// example `TLS13_AES_128_GCM_SHA256:TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`.
pub fn build_crypto_provider(cipher_suites: Option<&str>) -> std::io::Result<Arc<CryptoProvider>> {
    let names = match cipher_suites {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(get_crypto_provider()),
    };

    let base = get_crypto_provider();
    let mut selected = vec![];
    for name in names.split(':').map(str::trim).filter(|s| !s.is_empty()) {
        let suite = rustls::crypto::ring::ALL_CIPHER_SUITES
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Unknown cipher suite: {name}"),
                )
            })?;
        selected.push(*suite);
    }

    if selected.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "cipher_suites selected no usable suites",
        ));
    }

    Ok(Arc::new(CryptoProvider {
        cipher_suites: selected,
        ..(*base).clone()
    }))
}

fn get_supported_algorithms() -> WebPkiSupportedAlgorithms {
    get_crypto_provider().signature_verification_algorithms
}

pub fn get_root_cert_store() -> Arc<RootCertStore> {
    static INSTANCE: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(root_store)
        })
        .clone()
}

pub fn build_root_store(certs: Vec<CertificateDer<'static>>) -> std::io::Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid trust root certificate: {e}"),
            )
        })?;
    }
    if root_store.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "trust_roots contained no certificates",
        ));
    }
    Ok(root_store)
}

/// Accepts any server certificate. Used for `verification: none`.
#[derive(Debug)]
pub struct DisabledVerifier {
    supported_algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

pub fn get_disabled_verifier() -> Arc<DisabledVerifier> {
    static INSTANCE: OnceLock<Arc<DisabledVerifier>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            Arc::new(DisabledVerifier {
                supported_algs: get_supported_algorithms(),
            })
        })
        .clone()
}

/// Verifies that the server chain leads to a trusted root, without checking
/// the server name. Hostname checks, when wanted, run after the handshake.
#[derive(Debug)]
pub struct ChainOnlyVerifier {
    roots: Arc<RootCertStore>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl ChainOnlyVerifier {
    pub fn new(roots: Arc<RootCertStore>, provider: &CryptoProvider) -> Self {
        Self {
            roots,
            supported_algs: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.supported_algs.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Writes session secrets in NSS key log format to a fixed file.
pub struct KeyLogToFile {
    file: Mutex<File>,
}

impl KeyLogToFile {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                std::io::Error::new(e.kind(), format!("Failed to open key log file '{path}': {e}"))
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl std::fmt::Debug for KeyLogToFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyLogToFile")
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl rustls::KeyLog for KeyLogToFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!("{label} {} {}\n", to_hex(client_random), to_hex(secret));
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Failed to write key log: {e}");
        }
    }
}
