use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{self, ServerConfig};

/// Errors that can occur while building the TLS server config.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to open {0}")]
    FileIo(PathBuf, #[source] std::io::Error),
    #[error("failed to read certificate PEM")]
    CertPem(#[source] std::io::Error),
    #[error("failed to parse private key PEM")]
    KeyPem(#[source] std::io::Error),
    #[error("no private keys found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("failed to build server config")]
    ServerConfig(#[source] rustls::Error),
}

/// Builds a rustls server config from PEM cert-chain and key files. Devices
/// authenticate with their tokens, so no client certificates are requested.
pub fn server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig, TlsError> {
    let cert_handle =
        File::open(cert_file).map_err(|err| TlsError::FileIo(cert_file.to_path_buf(), err))?;
    let mut cert_reader = BufReader::new(cert_handle);
    let cert_chain: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertPem)?;

    let key_handle =
        File::open(key_file).map_err(|err| TlsError::FileIo(key_file.to_path_buf(), err))?;
    let mut key_reader = BufReader::new(key_handle);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(TlsError::KeyPem)?
        .ok_or_else(|| TlsError::NoPrivateKey(key_file.to_path_buf()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(TlsError::ServerConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = server_config(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::FileIo(_, _)));
    }
}
