//! Configuração TLS do cliente MQTT.
//!
//! Confia apenas no bundle de CA configurado. Com `skip_verify` a cadeia do
//! servidor não é verificada (modo inseguro para testes); as assinaturas do
//! handshake continuam sendo checadas.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Erros de TLS. Todos são fatais na inicialização.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Falha ao ler CA {path}: {source}")]
    ReadCa {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("PEM inválido em {path}: {source}")]
    InvalidPem {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Carrega os certificados PEM do bundle de CA.
pub fn load_ca_bundle(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::ReadCa {
        path: path.to_path_buf(),
        source,
    })?;

    rustls_pemfile::certs(&mut BufReader::new(bytes.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::InvalidPem {
            path: path.to_path_buf(),
            source,
        })
}

/// Monta a configuração rustls a partir do bundle de CA.
pub fn build_tls_config(ca_file: &Path, skip_verify: bool) -> Result<ClientConfig, TlsError> {
    let certs = load_ca_bundle(ca_file)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        warn!("Nenhum certificado válido em {}", ca_file.display());
    } else {
        info!("CA carregada de {} ({added} certificados)", ca_file.display());
    }
    if ignored > 0 {
        warn!("{ignored} certificados ignorados em {}", ca_file.display());
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if skip_verify {
        warn!("Verificação do certificado do servidor DESATIVADA");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    }

    Ok(config)
}

/// Aceita qualquer certificado de servidor, mas valida as assinaturas do handshake.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        let provider: CryptoProvider = crypto::ring::default_provider();
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
