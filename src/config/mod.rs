//! Configuration for TLS channels.
//!
//! This module provides:
//! - [`types`]: configuration types (versions, trust roots, verification, channel options)
//! - [`pem`]: PEM file handling and certificate/key loading
//!
//! The main entry point is [`load_config`], which reads a YAML file and
//! inlines every PEM file it references.

mod pem;
mod types;

pub use pem::{convert_pem_paths, load_certificates, load_private_key, load_trust_root_certificates};
pub use types::*;

/// Loads a TLS configuration file and resolves its PEM paths.
pub async fn load_config(config_filename: &str) -> std::io::Result<TlsConfiguration> {
    let config_bytes = match tokio::fs::read(config_filename).await {
        Ok(b) => b,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {config_filename}: {e}"),
            ));
        }
    };

    let config_str = match String::from_utf8(config_bytes) {
        Ok(s) => s,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {config_filename} as UTF8: {e}"),
            ));
        }
    };

    let config = TlsConfiguration::from_yaml(&config_str)?;
    let (config, load_count) = convert_pem_paths(config).await?;
    if load_count > 0 {
        log::debug!("Loaded {load_count} PEM file(s) for {config_filename}");
    }
    Ok(config)
}
