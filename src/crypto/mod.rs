//! TLS engine adapter.
//!
//! Wraps a rustls connection behind a step-wise interface (handshake,
//! shutdown, read, write) that reports incomplete/complete/failed, plus the
//! certificate verification hooks and identity checks the channel uses.

mod cert_verify;
mod crypto_connection;
mod identity;

pub use cert_verify::{
    run_chain_callback, CallbackClientVerifier, CallbackServerVerifier, PreverifyResult,
    VerificationCallback, VerificationResult,
};
pub use crypto_connection::{AsyncOperationResult, CryptoConnection, EngineError, Role};
pub use identity::validate_identity;
