//! rustls client configuration for `ssl://` and `mqtts://` brokers

use super::connection::TransportError;
use crate::config::TlsSection;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn tls_error(context: &str, path: &Path, error: impl std::fmt::Display) -> TransportError {
    TransportError::TlsConfig(format!("{context} {}: {error}", path.display()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| tls_error("Failed to open certificate", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("Failed to parse certificate", path, e))?;

    if certs.is_empty() {
        return Err(tls_error("No certificates found in", path, "empty PEM"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| tls_error("Failed to open private key", path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("Failed to parse private key", path, e))?
        .ok_or_else(|| tls_error("No private key found in", path, "empty PEM"))
}

/// Build a rustls `ClientConfig`
///
/// Trusts the configured CA file, or the webpki roots when none is given,
/// and presents a client certificate when both certificate and key are set.
pub fn build_tls_config(settings: Option<&TlsSection>) -> Result<ClientConfig, TransportError> {
    let mut root_store = RootCertStore::empty();

    match settings.and_then(|s| s.ca_cert.as_deref()) {
        Some(ca_path) => {
            for cert in load_certs(ca_path)? {
                root_store
                    .add(cert)
                    .map_err(|e| tls_error("Failed to add CA certificate", ca_path, e))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let client_auth = settings.and_then(|s| match (&s.client_cert, &s.client_key) {
        (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
        _ => None,
    });

    match client_auth {
        Some((cert_path, key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error("Failed to configure client certificate", cert_path, e))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_roots_without_settings() {
        assert!(build_tls_config(None).is_ok());
        assert!(build_tls_config(Some(&TlsSection::default())).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let settings = TlsSection {
            ca_cert: Some(PathBuf::from("/nonexistent/safewatch-ca.pem")),
            ..TlsSection::default()
        };

        let result = build_tls_config(Some(&settings));
        assert!(matches!(result, Err(TransportError::TlsConfig(_))));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let settings = TlsSection {
            ca_cert: Some(file.path().to_path_buf()),
            ..TlsSection::default()
        };

        let result = build_tls_config(Some(&settings));
        assert!(matches!(result, Err(TransportError::TlsConfig(_))));
    }
}
