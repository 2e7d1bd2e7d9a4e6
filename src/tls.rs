//! TLS server configuration: load certificates from PEM files, build the acceptor
//! and rotate it on SIGHUP.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Build a rustls ServerConfig from PEM certificate and key file paths.
/// With `ca_file`, client certificates signed by that CA are verified when
/// presented; clients without a certificate are still accepted.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let builder = rustls::ServerConfig::builder();
    let builder = match ca_file {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs_from_file(ca)? {
                roots.add(cert).context("Add CA certificate to root store")?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("Build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let config = builder
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

pub fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

/// PKCS#8 first, then traditional RSA.
pub fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Check that cert and key files exist and are readable (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file, ca_file)?;
    Ok(())
}

/// PEM paths the acceptor is (re)built from.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

impl TlsFiles {
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        validate_tls_files(&self.cert_file, &self.key_file, self.ca_file.as_deref())?;
        let config = load_server_config_from_files(&self.cert_file, &self.key_file, self.ca_file.as_deref())?;
        Ok(TlsAcceptor::from(config))
    }

    /// Rebuild the acceptor and swap it in. On error the current acceptor stays.
    pub fn reload(&self, swap: &ArcSwap<TlsAcceptor>) -> Result<()> {
        let acceptor = self.build_acceptor()?;
        swap.store(Arc::new(acceptor));
        info!(cert = %self.cert_file, "TLS certificates reloaded");
        Ok(())
    }
}

/// Reload certificates from the same files each time the process receives SIGHUP.
#[cfg(unix)]
pub fn spawn_sighup_reload(files: TlsFiles, swap: Arc<ArcSwap<TlsAcceptor>>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangups = signal(SignalKind::hangup()).context("Install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            if let Err(e) = files.reload(&swap) {
                error!("Failed to reload TLS certificates: {:#}", e);
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn spawn_sighup_reload(_files: TlsFiles, _swap: Arc<ArcSwap<TlsAcceptor>>) -> Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    pub(crate) fn test_files() -> TlsFiles {
        TlsFiles {
            cert_file: fixture("server.pem"),
            key_file: fixture("server.key"),
            ca_file: None,
        }
    }

    #[test]
    fn test_load_pkcs8_and_rsa_keys() {
        assert!(load_server_config_from_files(&fixture("server.pem"), &fixture("server.key"), None).is_ok());
        assert!(load_server_config_from_files(&fixture("server.pem"), &fixture("server-rsa.key"), None).is_ok());
    }

    #[test]
    fn test_load_with_client_ca() {
        let ca = fixture("ca.pem");
        assert!(load_server_config_from_files(&fixture("server.pem"), &fixture("server.key"), Some(&ca)).is_ok());
    }

    #[test]
    fn test_validate_missing_files() {
        let err = validate_tls_files("/nonexistent/cert.pem", &fixture("server.key"), None).unwrap_err();
        assert!(err.to_string().contains("cert file not found"));
        let err = validate_tls_files(&fixture("server.pem"), "/nonexistent/key.pem", None).unwrap_err();
        assert!(err.to_string().contains("key file not found"));
        let err = validate_tls_files(&fixture("server.pem"), &fixture("server.key"), Some("/nonexistent/ca.pem"))
            .unwrap_err();
        assert!(err.to_string().contains("CA file not found"));
    }

    #[test]
    fn test_empty_pem_files_rejected() {
        let mut empty = NamedTempFile::new().unwrap();
        empty.write_all(b"not a pem\n").unwrap();
        let path = empty.path().to_str().unwrap().to_string();
        assert!(load_certs_from_file(&path).unwrap_err().to_string().contains("No certificates"));
        assert!(load_private_key_from_file(&path).unwrap_err().to_string().contains("No private key"));
    }

    #[test]
    fn test_reload_keeps_old_acceptor_on_error() {
        let files = test_files();
        let swap = ArcSwap::from_pointee(files.build_acceptor().unwrap());
        let before = swap.load_full();
        assert!(files.reload(&swap).is_ok());
        assert!(!Arc::ptr_eq(&before, &swap.load_full()));

        let broken = TlsFiles {
            key_file: "/nonexistent/key.pem".to_string(),
            ..files
        };
        let current = swap.load_full();
        assert!(broken.reload(&swap).is_err());
        assert!(Arc::ptr_eq(&current, &swap.load_full()));
    }
}
