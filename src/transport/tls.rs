//! rustls client configuration.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::TransportError;

static VERIFIED: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static UNVERIFIED: OnceLock<Arc<ClientConfig>> = OnceLock::new();

#[cfg(feature = "tls-aws-lc")]
fn builtin_provider() -> Option<CryptoProvider> {
    Some(rustls::crypto::aws_lc_rs::default_provider())
}

#[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
fn builtin_provider() -> Option<CryptoProvider> {
    Some(rustls::crypto::ring::default_provider())
}

#[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
fn builtin_provider() -> Option<CryptoProvider> {
    None
}

/// Install the built-in crypto provider as the process default, unless one is
/// already installed.
pub(crate) fn install_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }

    if let Some(provider) = builtin_provider() {
        if provider.install_default().is_err() {
            tracing::trace!("crypto provider installed concurrently");
        }
    }
}

fn provider() -> Result<Arc<CryptoProvider>, TransportError> {
    install_provider();
    CryptoProvider::get_default()
        .cloned()
        .ok_or_else(|| TransportError::tls("no rustls crypto provider available"))
}

/// The client configuration for the given verification mode.
///
/// Configurations are built once per process and shared afterwards.
pub(crate) fn client_config(verify: bool) -> Result<Arc<ClientConfig>, TransportError> {
    let cell = if verify { &VERIFIED } else { &UNVERIFIED };
    if let Some(config) = cell.get() {
        return Ok(config.clone());
    }

    let config = Arc::new(build(verify)?);
    Ok(cell.get_or_init(|| config).clone())
}

fn build(verify: bool) -> Result<ClientConfig, TransportError> {
    let provider = provider()?;
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(TransportError::tls)?;

    let mut config = if verify {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            tracing::debug!(%error, "error loading platform certificates");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::trace!(added, ignored, "loaded platform root certificates");

        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        tracing::debug!("tls certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth()
    };

    config.alpn_protocols.push(b"http/1.1".to_vec());
    Ok(config)
}

/// Server name for the TLS handshake.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned()).map_err(TransportError::tls)
}

/// Accepts every certificate. Signatures are still checked so the handshake
/// stays well formed.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
