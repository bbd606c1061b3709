//! PEM handling - resolving file paths to inline data and parsing certificates and keys.

use log::debug;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::types::{PemSource, TlsConfiguration, TrustRoots};

/// Replaces every PEM file path in the configuration with the file's contents.
///
/// Returns the converted configuration and the number of files loaded.
pub async fn convert_pem_paths(
    mut config: TlsConfiguration,
) -> std::io::Result<(TlsConfiguration, usize)> {
    let mut load_count = 0usize;

    if let Some(ref mut source) = config.certificate_chain {
        load_count += inline_pem_source(source).await?;
    }
    if let Some(ref mut source) = config.private_key {
        load_count += inline_pem_source(source).await?;
    }

    match config.trust_roots {
        TrustRoots::File { ref file } => {
            let data = read_pem_to_string(file).await?;
            load_count += 1;
            config.trust_roots = TrustRoots::Certificates {
                certificates: vec![PemSource::Data(data)].into(),
            };
        }
        TrustRoots::Certificates {
            ref mut certificates,
        } => {
            let mut sources = std::mem::take(certificates).into_vec();
            for source in sources.iter_mut() {
                load_count += inline_pem_source(source).await?;
            }
            *certificates = sources.into();
        }
        TrustRoots::Default(_) => {}
    }

    Ok((config, load_count))
}

async fn inline_pem_source(source: &mut PemSource) -> std::io::Result<usize> {
    match source {
        PemSource::Path(path) => {
            let data = read_pem_to_string(path).await?;
            *source = PemSource::Data(data);
            Ok(1)
        }
        PemSource::Data(_) => Ok(0),
    }
}

async fn read_pem_to_string(path: &str) -> std::io::Result<String> {
    debug!("Reading PEM file: {path}");
    tokio::fs::read_to_string(path).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("Failed to read PEM file '{path}': {e}"))
    })
}

/// Returns the PEM bytes of a source, reading the file synchronously if needed.
fn pem_bytes(source: &PemSource) -> std::io::Result<Vec<u8>> {
    match source {
        PemSource::Data(data) => Ok(data.as_bytes().to_vec()),
        PemSource::Path(path) => {
            debug!("Reading PEM file: {path}");
            std::fs::read(path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("Failed to read PEM file '{path}': {e}"))
            })
        }
    }
}

pub fn load_certificates(source: &PemSource) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let bytes = pem_bytes(source)?;
    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Could not parse certificate PEM: {e}"),
            )
        })?;
    if certs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "PEM data contained no certificates",
        ));
    }
    Ok(certs)
}

pub fn load_private_key(source: &PemSource) -> std::io::Result<PrivateKeyDer<'static>> {
    let bytes = pem_bytes(source)?;
    PrivateKeyDer::from_pem_slice(&bytes).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Could not parse private key PEM: {e}"),
        )
    })
}

/// Collects every certificate named by an explicit trust root setting.
pub fn load_trust_root_certificates(
    trust_roots: &TrustRoots,
) -> std::io::Result<Option<Vec<CertificateDer<'static>>>> {
    match trust_roots {
        TrustRoots::Default(_) => Ok(None),
        TrustRoots::File { file } => {
            load_certificates(&PemSource::Path(file.clone())).map(Some)
        }
        TrustRoots::Certificates { certificates } => {
            let mut all = vec![];
            for source in certificates.as_slice() {
                all.extend(load_certificates(source)?);
            }
            Ok(Some(all))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestIdentity;

    #[test]
    fn test_load_inline_pem() {
        let identity = TestIdentity::generate(&["localhost"]);
        let chain = load_certificates(&PemSource::Data(identity.chain_pem())).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(load_private_key(&PemSource::Data(identity.key_pem.clone())).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_certificates(&PemSource::Path("/nonexistent/cert.pem".into())).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_garbage_pem() {
        assert!(load_certificates(&PemSource::Data("-----BEGIN nothing".into())).is_err());
    }

    #[tokio::test]
    async fn test_convert_pem_paths() {
        let identity = TestIdentity::generate(&["localhost"]);
        let dir = std::env::temp_dir().join(format!("tls-channel-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("chain.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, identity.chain_pem()).unwrap();
        std::fs::write(&key_path, &identity.key_pem).unwrap();

        let config = TlsConfiguration {
            certificate_chain: Some(PemSource::Path(cert_path.to_string_lossy().into())),
            private_key: Some(PemSource::Path(key_path.to_string_lossy().into())),
            trust_roots: TrustRoots::File {
                file: cert_path.to_string_lossy().into(),
            },
            ..Default::default()
        };

        let (converted, count) = convert_pem_paths(config).await.unwrap();
        assert_eq!(count, 3);
        assert!(matches!(converted.certificate_chain, Some(PemSource::Data(_))));
        assert!(matches!(converted.private_key, Some(PemSource::Data(_))));
        let roots = load_trust_root_certificates(&converted.trust_roots)
            .unwrap()
            .unwrap();
        assert_eq!(roots.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
