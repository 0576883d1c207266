//! TLS acceptor built from [`TlsConfig`].

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds the acceptor, verifying client certificates when configured.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
    let client_ca = match (config.require_client_cert, &config.client_ca_path) {
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for client certificate verification".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ServerError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ServerError::TlsConfig(format!("cannot open {} file {:?}: {}", what, path, e))
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = open(path, "cert")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificate found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tls(cert: Option<&str>, key: Option<&str>, require_client_cert: bool) -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_path: cert.map(Into::into),
            key_path: key.map(Into::into),
            require_client_cert,
            client_ca_path: None,
        }
    }

    fn error_text(config: &TlsConfig) -> String {
        match create_tls_acceptor(config) {
            Err(e) => e.to_string(),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_missing_paths() {
        assert!(error_text(&tls(None, Some("/k.pem"), false)).contains("cert_path not set"));
        assert!(error_text(&tls(Some("/c.pem"), None, false)).contains("key_path not set"));
    }

    #[test]
    fn test_client_verification_needs_ca() {
        let config = tls(Some("/nonexistent/c.pem"), Some("/nonexistent/k.pem"), true);
        assert!(error_text(&config).contains("client_ca_path not set"));
    }

    #[test]
    fn test_unreadable_files() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open cert"));
        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open key"));
    }

    #[test]
    fn test_files_without_pem_items() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a pem file").unwrap();
        assert!(load_private_key(file.path())
            .unwrap_err()
            .to_string()
            .contains("no private key"));
        assert!(load_certs(file.path())
            .unwrap_err()
            .to_string()
            .contains("no certificate"));
    }
}
