//! Per-certificate verification callback support.
//!
//! rustls verifies the peer chain as a whole. These wrappers run the inner
//! verifier first, then hand each certificate of the presented chain to a
//! user callback, root-most first and the leaf last, passing the current
//! verdict in and letting the callback override it.

use std::sync::Arc;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    CertificateVerified,
    Failed,
}

/// The verdict the engine reached before the callback ran.
pub type PreverifyResult = VerificationResult;

pub type VerificationCallback =
    Arc<dyn Fn(PreverifyResult, &CertificateDer<'_>) -> VerificationResult + Send + Sync>;

/// Invokes `callback` once per certificate, intermediates in reverse order
/// and then the leaf. Stops at the first certificate the callback rejects.
pub fn run_chain_callback(
    callback: &VerificationCallback,
    preverify: PreverifyResult,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> VerificationResult {
    for cert in intermediates.iter().rev().chain(std::iter::once(end_entity)) {
        if callback(preverify, cert) == VerificationResult::Failed {
            return VerificationResult::Failed;
        }
    }
    VerificationResult::CertificateVerified
}

fn resolve_verdict(
    preverify: Result<(), rustls::Error>,
    callback: &VerificationCallback,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<(), rustls::Error> {
    let verdict = if preverify.is_ok() {
        VerificationResult::CertificateVerified
    } else {
        VerificationResult::Failed
    };

    match run_chain_callback(callback, verdict, end_entity, intermediates) {
        VerificationResult::CertificateVerified => {
            if let Err(e) = preverify {
                debug!("Verification callback accepted certificate rejected by engine: {e}");
            }
            Ok(())
        }
        VerificationResult::Failed => match preverify {
            Err(e) => Err(e),
            Ok(()) => Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        },
    }
}

pub struct CallbackServerVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    callback: VerificationCallback,
}

impl CallbackServerVerifier {
    pub fn new(inner: Arc<dyn ServerCertVerifier>, callback: VerificationCallback) -> Self {
        Self { inner, callback }
    }
}

impl std::fmt::Debug for CallbackServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServerVerifier")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for CallbackServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let preverify = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map(|_| ());
        resolve_verdict(preverify, &self.callback, end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

pub struct CallbackClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    callback: VerificationCallback,
}

impl CallbackClientVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, callback: VerificationCallback) -> Self {
        Self { inner, callback }
    }
}

impl std::fmt::Debug for CallbackClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackClientVerifier")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let preverify = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)
            .map(|_| ());
        resolve_verdict(preverify, &self.callback, end_entity, intermediates)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
