//! Self-signed TLS material for channel scenarios.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// A throwaway server certificate: PEM files on disk for the acceptor and
/// a client connector that trusts exactly this certificate.
pub struct TestCert {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
    pub connector: TlsConnector,
}

/// Generates a self-signed certificate for `localhost`.
pub fn self_signed() -> Result<TestCert> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("generating certificate")?;

    let mut cert_file = NamedTempFile::new()?;
    cert_file.write_all(certified.cert.pem().as_bytes())?;
    let mut key_file = NamedTempFile::new()?;
    key_file.write_all(certified.key_pair.serialize_pem().as_bytes())?;

    let mut roots = RootCertStore::empty();
    roots
        .add(certified.cert.der().clone())
        .context("trusting test certificate")?;
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TestCert {
        cert_file,
        key_file,
        connector: TlsConnector::from(Arc::new(client_config)),
    })
}

/// The SNI name matching [`self_signed`].
pub fn server_name() -> ServerName<'static> {
    ServerName::try_from("localhost").expect("static server name")
}
