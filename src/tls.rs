//! TLS client setup for `wss` connections.
//!
//! Certificates are checked against the bundled Mozilla roots from `webpki-roots`, or against a
//! PEM bundle given with [`ClientConfig::with_ca_file`](crate::ClientConfig::with_ca_file).
//! Verification can be switched off, in which case neither the chain nor the peer name is checked.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, RootCertStore, SignatureScheme,
    },
    TlsConnector,
};

/// Verification policy for one TLS upgrade.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    /// Whether the certificate chain and peer name are verified.
    pub verify: bool,
    /// Name sent for SNI and, when verifying, expected in the certificate.
    pub peer_name: String,
    /// PEM bundle replacing the built-in roots.
    pub ca_file: Option<PathBuf>,
}

impl TlsSettings {
    /// Settings for connecting to `peer_name` with verification enabled.
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            verify: true,
            peer_name: peer_name.into(),
            ca_file: None,
        }
    }

    /// Builds a connector applying this policy.
    ///
    /// # Errors
    /// Fails if the CA bundle cannot be read or holds no usable certificate.
    pub async fn connector(&self) -> io::Result<TlsConnector> {
        // define the provider if any, fallback to ring
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(io::Error::other)?;

        let mut config = if self.verify {
            let roots = match &self.ca_file {
                Some(path) => load_ca_file(path).await?,
                None => webpki_root_store(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            #[cfg(feature = "logging")]
            log::warn!("TLS certificate verification disabled for {}", self.peer_name);

            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
                .with_no_client_auth()
        };
        config.alpn_protocols = vec!["http/1.1".into()];

        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Runs the TLS handshake over `stream`.
    ///
    /// # Errors
    /// Fails on an invalid peer name, an unreadable CA bundle, or a failed TLS handshake
    /// (certificate rejection included).
    pub async fn upgrade(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let connector = self.connector().await?;
        let domain = ServerName::try_from(self.peer_name.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;

        connector.connect(domain, stream).await
    }
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Reads a PEM bundle into a root store.
async fn load_ca_file(path: &Path) -> io::Result<RootCertStore> {
    let pem = tokio::fs::read(path).await.map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("reading CA file {}: {err}", path.display()),
        )
    })?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<io::Result<Vec<CertificateDer<'static>>>>()?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    #[cfg(feature = "logging")]
    log::debug!("loaded {added} certificates from {}, ignored {_ignored}", path.display());

    if added == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no usable certificate in {}", path.display()),
        ));
    }

    Ok(roots)
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
