use crate::credentials::{resolve_passphrase, CredentialProvider};
use crate::error::Error;
use pkcs8::der::pem::{self, PemLabel};
use pkcs8::der::Document;
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client trust store: the server's certificate or the CA that signed it.
pub const TRUST_STORE_FILE: &str = "TrustStore.pem";
/// Server certificate chain.
pub const SERVER_CERT_FILE: &str = "server.pem";
/// Server private key, optionally encrypted (PKCS#8).
pub const SERVER_KEY_FILE: &str = "server.key";

/// Paths of the certificate material inside the certificate directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertMaterial {
    pub trust_store: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

impl CertMaterial {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            trust_store: dir.join(TRUST_STORE_FILE),
            server_cert: dir.join(SERVER_CERT_FILE),
            server_key: dir.join(SERVER_KEY_FILE),
        }
    }
}

pub(crate) fn load_tls_server_config(
    cert_path: &Path,
    key_path: &Path,
    provider: Arc<CryptoProvider>,
    credentials: &dyn CredentialProvider,
) -> Result<ServerConfig, Error> {
    let cert_file = File::open(cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: cert_path.display().to_string(),
        source: e,
    })?;
    let cert_chain: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if cert_chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No certificates found in file".to_string(),
        ));
    }

    let key = load_private_key(key_path, credentials)?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

    Ok(config)
}

/// Builds the client configuration and the verifier used for the explicit
/// post-handshake trust check.
pub(crate) fn load_tls_client_config(
    ca_cert_path: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<(ClientConfig, Arc<WebPkiServerVerifier>), Error> {
    let ca_cert_file = File::open(ca_cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: ca_cert_path.display().to_string(),
        source: e,
    })?;
    let ca_certs: Vec<CertificateDer> = certs(&mut BufReader::new(ca_cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::TlsInvalidCertificate(format!("Failed to parse CA certificates: {e}"))
        })?;

    if ca_certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No CA certificates found in file".to_string(),
        ));
    }

    let mut root_cert_store = RootCertStore::empty();
    for cert in ca_certs {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    let verifier =
        WebPkiServerVerifier::builder_with_provider(Arc::new(root_cert_store), provider.clone())
            .build()
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeferredVerifier {
            inner: verifier.clone(),
        }))
        .with_no_client_auth();

    Ok((config, verifier))
}

/// Checks the peer's certificate chain against the trust store. Runs after
/// the handshake has completed.
pub(crate) fn verify_peer_chain(
    verifier: &WebPkiServerVerifier,
    peer_certs: Option<&[CertificateDer<'static>]>,
    server_name: &ServerName<'_>,
) -> Result<(), Error> {
    let (end_entity, intermediates) = peer_certs
        .and_then(|chain| chain.split_first())
        .ok_or_else(|| {
            Error::CertificateVerification("peer presented no certificate".to_string())
        })?;
    verifier
        .verify_server_cert(end_entity, intermediates, server_name, &[], UnixTime::now())
        .map(|_| ())
        .map_err(|e| Error::CertificateVerification(e.to_string()))
}

// Lets the handshake complete without a trust decision; trust is checked
// separately by `verify_peer_chain`. Handshake signatures are still verified
// against the presented certificate.
#[derive(Debug)]
struct DeferredVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for DeferredVerifier {
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
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ============================================================================
// Private Key Loading
// ============================================================================

fn load_private_key(
    key_path: &Path,
    credentials: &dyn CredentialProvider,
) -> Result<PrivateKeyDer<'static>, Error> {
    check_key_permissions(key_path)?;

    let pem = std::fs::read_to_string(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.display().to_string(),
        source: e,
    })?;

    if is_encrypted_key(&pem) {
        return decrypt_private_key(key_path, &pem, credentials);
    }

    private_key(&mut pem.as_bytes())
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))
}

fn decrypt_private_key(
    key_path: &Path,
    pem: &str,
    credentials: &dyn CredentialProvider,
) -> Result<PrivateKeyDer<'static>, Error> {
    let (passphrase, placeholder) = resolve_passphrase(credentials);
    if placeholder {
        warn!(path = %key_path.display(), "No passphrase configured, trying placeholder passphrase");
    }

    let (_, document) = Document::from_pem(pem)
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse encrypted key: {e}")))?;
    let info = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse encrypted key: {e}")))?;
    let decrypted = info
        .decrypt(passphrase.as_slice())
        .map_err(|e| Error::KeyDecryption {
            path: key_path.display().to_string(),
            reason: e.to_string(),
        })?;

    debug!(path = %key_path.display(), "Decrypted private key");
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

fn is_encrypted_key(pem: &str) -> bool {
    pem::decode_label(pem.as_bytes())
        .is_ok_and(|label| label == EncryptedPrivateKeyInfo::PEM_LABEL)
}

#[cfg(unix)]
fn check_key_permissions(key_path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.display().to_string(),
        source: e,
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Error::KeyPermissions {
            path: key_path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_key_path: &Path) -> Result<(), Error> {
    Ok(())
}
