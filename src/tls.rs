//! TLS detection and client context construction.
//!
//! [`probe`] answers "does this endpoint speak TLS?" by attempting a
//! handshake with verification disabled: a completed handshake means yes, a
//! handshake failure (plain-TCP peer) means no, and connection refused or a
//! connect timeout propagate as errors so the caller can skip the candidate.
//!
//! [`TlsSettings`] carries the answer plus the verification policy and
//! builds the one [`rustls::ClientConfig`] used for the control channel and
//! every session connection spawned from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::constants::CONNECT_TIMEOUT;

/// Certificate verifier that accepts anything. Only used for the TLS probe
/// and for `--tls-no-verify`.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client config that skips all verification.
fn permissive_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
        .with_no_client_auth()
}

/// Verification policy and cached client config.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    enabled: bool,
    verify: bool,
    cert_file: Option<PathBuf>,
    config: Option<Arc<ClientConfig>>,
}

impl TlsSettings {
    /// New settings, initially disabled.
    ///
    /// `cert_file` is an optional PEM trust anchor; with `verify` off the
    /// certificate chain and hostname are not checked at all.
    pub fn new(cert_file: Option<PathBuf>, verify: bool) -> Self {
        Self {
            enabled: false,
            verify,
            cert_file,
            config: None,
        }
    }

    /// Enable or disable TLS, rebuilding the client config as needed.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        log::info!("TLS: enabled: {enabled}");
        self.enabled = enabled;
        if !enabled {
            self.config = None;
            return Ok(());
        }
        let config = if self.verify {
            match &self.cert_file {
                Some(path) => {
                    log::info!("TLS: using user-supplied ca-certificate");
                    verified_config(Some(path))?
                }
                None => {
                    log::info!("TLS: using built-in ca-certificates");
                    verified_config(None)?
                }
            }
        } else {
            log::warn!("TLS: skipping certificate verification!!!");
            permissive_config()
        };
        self.config = Some(Arc::new(config));
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    /// The client config; present iff TLS is enabled.
    pub fn config(&self) -> Option<Arc<ClientConfig>> {
        self.config.clone()
    }
}

/// Build a verifying client config, optionally trusting only `cert_file`.
fn verified_config(cert_file: Option<&Path>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    match cert_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("cannot read certificate {}", path.display()))?;
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut pem.as_slice())
                    .collect::<std::result::Result<_, _>>()
                    .with_context(|| format!("cannot parse certificate {}", path.display()))?;
            anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
            for cert in certs {
                roots
                    .add(cert)
                    .with_context(|| format!("invalid certificate in {}", path.display()))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Determine whether the endpoint speaks TLS.
///
/// `Ok(true)` on a completed handshake, `Ok(false)` when the peer answers
/// but the handshake fails (plain TCP), `Err` when the TCP connect itself
/// is refused or times out.
pub async fn probe(host: &str, port: u16) -> Result<bool> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .context("connect timeout")?
        .context("connect failed")?;

    let connector = TlsConnector::from(Arc::new(permissive_config()));
    let Ok(server_name) = ServerName::try_from(host.to_string()) else {
        // Not a name TLS can target; the candidate cannot be a TLS server.
        return Ok(false);
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream)).await {
        Ok(Ok(_)) => Ok(true),
        // Handshake failed or the peer never answered the ClientHello:
        // assume a plain-TCP server.
        Ok(Err(_)) | Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn disabled_settings_have_no_config() {
        let settings = TlsSettings::new(None, true);
        assert!(!settings.enabled());
        assert!(settings.config().is_none());
    }

    #[test]
    fn enabling_without_verify_builds_permissive_config() {
        let mut settings = TlsSettings::new(None, false);
        settings.set_enabled(true).unwrap();
        assert!(settings.enabled());
        assert!(settings.config().is_some());
    }

    #[test]
    fn enabling_with_builtin_roots() {
        let mut settings = TlsSettings::new(None, true);
        settings.set_enabled(true).unwrap();
        assert!(settings.config().is_some());
        settings.set_enabled(false).unwrap();
        assert!(settings.config().is_none());
    }

    #[test]
    fn bad_cert_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a pem").unwrap();
        let mut settings = TlsSettings::new(Some(file.path().to_path_buf()), true);
        assert!(settings.set_enabled(true).is_err());
    }

    #[tokio::test]
    async fn probe_plain_tcp_server_is_false() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and answer with plain text, which can never complete a
            // TLS handshake.
            if let Ok((mut stream, _)) = listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });
        let result = probe("127.0.0.1", addr.port()).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn probe_refused_connection_is_error() {
        // Bind-then-drop to get a port that refuses connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(probe("127.0.0.1", port).await.is_err());
    }
}
