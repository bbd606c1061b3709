//! TLS channel configuration types.

use serde::{Deserialize, Serialize};

use crate::option_util::NoneOrSome;

pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    #[serde(alias = "tlsv1.2", alias = "1.2")]
    Tls12,
    #[serde(alias = "tlsv1.3", alias = "1.3")]
    Tls13,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Accept any peer certificate.
    None,
    /// Verify the chain against the trust roots but not the peer name.
    #[serde(alias = "no-hostname")]
    NoHostname,
    #[default]
    Full,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenegotiationPolicy {
    #[default]
    None,
    Once,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultTrustRoots {
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TrustRoots {
    Default(DefaultTrustRoots),
    File { file: String },
    Certificates { certificates: NoneOrSome<PemSource> },
}

impl Default for TrustRoots {
    fn default() -> Self {
        TrustRoots::Default(DefaultTrustRoots::Default)
    }
}

impl TrustRoots {
    pub fn is_default(&self) -> bool {
        matches!(self, TrustRoots::Default(_))
    }
}

/// PEM data given either as a file path or inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemSource {
    Path(String),
    Data(String),
}

impl PemSource {
    pub fn from_string(s: String) -> Self {
        if is_inline_pem(&s) {
            PemSource::Data(s)
        } else {
            PemSource::Path(s)
        }
    }
}

pub fn is_inline_pem(s: &str) -> bool {
    s.contains("-----BEGIN")
}

impl<'de> Deserialize<'de> for PemSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PemSource::from_string(s))
    }
}

impl Serialize for PemSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        match self {
            PemSource::Path(s) | PemSource::Data(s) => serializer.serialize_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelOptions {
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_true")]
    pub auto_read: bool,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            auto_read: true,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }
}

fn default_low_watermark() -> usize {
    DEFAULT_LOW_WATERMARK
}

fn default_high_watermark() -> usize {
    DEFAULT_HIGH_WATERMARK
}

fn default_receive_buffer_size() -> usize {
    DEFAULT_RECEIVE_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfiguration {
    #[serde(alias = "min_version", default)]
    pub minimum_version: Option<TlsVersion>,
    #[serde(alias = "max_version", default)]
    pub maximum_version: Option<TlsVersion>,
    #[serde(alias = "ciphers", default)]
    pub cipher_suites: Option<String>,
    #[serde(alias = "cert", default)]
    pub certificate_chain: Option<PemSource>,
    #[serde(alias = "key", default)]
    pub private_key: Option<PemSource>,
    #[serde(default)]
    pub trust_roots: TrustRoots,
    #[serde(default)]
    pub verification: VerificationMode,
    #[serde(alias = "alpn", default)]
    pub alpn_protocols: NoneOrSome<String>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub key_log_file: Option<String>,
    #[serde(default)]
    pub renegotiation: RenegotiationPolicy,
    #[serde(alias = "options", default)]
    pub channel: ChannelOptions,
}

impl Default for TlsConfiguration {
    fn default() -> Self {
        Self {
            minimum_version: None,
            maximum_version: None,
            cipher_suites: None,
            certificate_chain: None,
            private_key: None,
            trust_roots: TrustRoots::default(),
            verification: VerificationMode::default(),
            alpn_protocols: NoneOrSome::Unspecified,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            key_log_file: None,
            renegotiation: RenegotiationPolicy::default(),
            channel: ChannelOptions::default(),
        }
    }
}

impl TlsConfiguration {
    pub fn from_yaml(s: &str) -> std::io::Result<Self> {
        serde_yaml::from_str(s).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse TLS configuration YAML: {e}"),
            )
        })
    }

    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .as_slice()
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }
}
