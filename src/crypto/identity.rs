//! Peer identity checks against the leaf certificate.
//!
//! SAN matching (dNSName, iPAddress and wildcards) is delegated to webpki
//! through rustls. When a certificate carries no dNSName SAN at all, the
//! subject common name is tried as a legacy fallback; there a wildcard is
//! honored only as the complete left-most label over at least two labels.

use std::net::IpAddr;

use rustls::client::verify_server_name;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::ParsedCertificate;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::tls_error::ChannelError;

/// Subject common names, or nothing if the certificate has a dNSName SAN.
fn fallback_common_names(leaf: &CertificateDer<'_>) -> Result<Vec<String>, ChannelError> {
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
        ChannelError::HostnameMismatch(format!("could not parse peer certificate: {e}"))
    })?;

    let san = cert.subject_alternative_name().map_err(|e| {
        ChannelError::HostnameMismatch(format!("invalid subjectAltName extension: {e}"))
    })?;
    if let Some(san) = san {
        if san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(_)))
        {
            return Ok(vec![]);
        }
    }

    Ok(cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok().map(str::to_string))
        .collect())
}

fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = normalize(pattern);
    let hostname = normalize(hostname);
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            // "*.com" style patterns are never honored.
            if suffix.split('.').count() < 2 || suffix.contains('*') {
                return false;
            }
            match hostname.split_once('.') {
                Some((first, rest)) => !first.is_empty() && rest == suffix,
                None => false,
            }
        }
        None => !pattern.contains('*') && pattern == hostname,
    }
}

/// Checks the leaf certificate against the expected hostname, or against the
/// peer address when no hostname is known.
pub fn validate_identity(
    expected_hostname: Option<&str>,
    peer_address: Option<IpAddr>,
    leaf: &CertificateDer<'_>,
) -> Result<(), ChannelError> {
    let server_name = match (expected_hostname, peer_address) {
        (Some(hostname), _) => ServerName::try_from(hostname).map_err(|e| {
            ChannelError::HostnameMismatch(format!("invalid expected hostname {hostname}: {e}"))
        })?,
        (None, Some(ip)) => ServerName::IpAddress(ip.into()),
        (None, None) => {
            return Err(ChannelError::HostnameMismatch(
                "no expected hostname or peer address to validate".to_string(),
            ))
        }
    };

    let parsed = ParsedCertificate::try_from(leaf).map_err(|e| {
        ChannelError::HostnameMismatch(format!("could not parse peer certificate: {e}"))
    })?;
    let err = match verify_server_name(&parsed, &server_name) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    if let ServerName::DnsName(ref dns) = server_name {
        let hostname = dns.as_ref();
        if fallback_common_names(leaf)?
            .iter()
            .any(|cn| dns_name_matches(cn, hostname))
        {
            return Ok(());
        }
    }

    Err(ChannelError::HostnameMismatch(format!(
        "certificate is not valid for {}: {err}",
        server_name.to_str()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn cert_for(names: &[&str]) -> CertificateDer<'static> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let key = rcgen::generate_simple_self_signed(names).unwrap();
        key.cert.der().clone()
    }

    fn cert_with_common_name(cn: &str) -> CertificateDer<'static> {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    #[test]
    fn test_common_name_wildcard_rules() {
        assert!(dns_name_matches("*.example.com", "www.example.com"));
        assert!(dns_name_matches("*.Example.COM", "WWW.example.com."));
        assert!(!dns_name_matches("*.example.com", "example.com"));
        assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
        assert!(!dns_name_matches("*.com", "example.com"));
        assert!(!dns_name_matches("w*.example.com", "www.example.com"));
        assert!(dns_name_matches("example.com.", "example.com"));
    }

    #[test]
    fn test_validate_dns_san() {
        let cert = cert_for(&["example.com", "*.example.net"]);
        assert!(validate_identity(Some("example.com"), None, &cert).is_ok());
        assert!(validate_identity(Some("EXAMPLE.com"), None, &cert).is_ok());
        assert!(validate_identity(Some("api.example.net"), None, &cert).is_ok());
        assert!(validate_identity(Some("a.b.example.net"), None, &cert).is_err());
        assert!(matches!(
            validate_identity(Some("example.org"), None, &cert),
            Err(ChannelError::HostnameMismatch(_))
        ));
    }

    #[test]
    fn test_validate_ip_san() {
        let cert = cert_for(&["127.0.0.1"]);
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_identity(Some("127.0.0.1"), None, &cert).is_ok());
        assert!(validate_identity(None, Some(local), &cert).is_ok());
        assert!(validate_identity(None, Some("10.0.0.1".parse().unwrap()), &cert).is_err());
        assert!(validate_identity(None, None, &cert).is_err());
    }

    #[test]
    fn test_common_name_fallback_without_dns_san() {
        let cert = cert_with_common_name("legacy.example.com");
        assert!(validate_identity(Some("legacy.example.com"), None, &cert).is_ok());
        assert!(validate_identity(Some("other.example.com"), None, &cert).is_err());

        // A dNSName SAN disables the fallback.
        let cert = cert_for(&["example.com"]);
        assert_eq!(fallback_common_names(&cert).unwrap(), Vec::<String>::new());
    }
}
