//! TLS material loading and handshake support for HTTPS/WSS endpoints.
//!
//! Certificates come from a PEM pair on disk, a thumbprint lookup in the
//! local certificate directory, or a throwaway self-signed certificate
//! generated at bind time. Client certificates are requested, never
//! required; validation findings are surfaced on the request instead of
//! failing the handshake.

use crate::endpoint::{Endpoint, TlsMaterial};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, DistinguishedName, PrivateKey, ServerConfig, ServerConnection};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Directory searched for `<thumbprint>.pem` bundles when an endpoint
/// references its certificate by thumbprint. Overridable for tests and
/// containers via `PODE_CERT_STORE`.
const DEFAULT_CERT_STORE: &str = "./certs";

fn cert_store_dir() -> PathBuf {
    std::env::var("PODE_CERT_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERT_STORE))
}

/// The TLS peer certificate as exposed to the request pipeline and the
/// client-certificate authentication scheme.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub der: Vec<u8>,
    /// SHA-1 digest of the DER bytes, uppercase hex.
    pub thumbprint: String,
    pub subject: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Present when the certificate bytes did not parse as X.509.
    pub parse_error: Option<String>,
}

impl ClientCertificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        let thumbprint = hex::encode_upper(Sha1::digest(&der));
        match X509Certificate::from_der(&der) {
            Ok((_, cert)) => {
                let validity = cert.validity();
                let not_before = Utc.timestamp_opt(validity.not_before.timestamp(), 0).single();
                let not_after = Utc.timestamp_opt(validity.not_after.timestamp(), 0).single();
                let subject = cert.subject().to_string();
                Self {
                    der,
                    thumbprint,
                    subject,
                    not_before,
                    not_after,
                    parse_error: None,
                }
            }
            Err(e) => Self {
                der,
                thumbprint,
                subject: String::new(),
                not_before: None,
                not_after: None,
                parse_error: Some(e.to_string()),
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after.map(|t| now > t).unwrap_or(false)
    }

    pub fn is_not_yet_valid(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|t| now < t).unwrap_or(false)
    }
}

/// Accepts any presented client certificate so the pipeline can expose it
/// (and its validation findings) on the request object.
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        if X509Certificate::from_der(&end_entity.0).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ));
        }
        Ok(ClientCertVerified::assertion())
    }
}

fn load_pem_pair(cert_path: &Path, key_path: &Path) -> Result<(Vec<Certificate>, PrivateKey)> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        Error::Tls(format!("cannot open certificate {}: {e}", cert_path.display()))
    })?;
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .map_err(|e| Error::Tls(format!("invalid certificate {}: {e}", cert_path.display())))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| Error::Tls(format!("cannot open key {}: {e}", key_path.display())))?;
    let mut reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| Error::Tls(format!("invalid key {}: {e}", key_path.display())))?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(k)
            | rustls_pemfile::Item::RSAKey(k)
            | rustls_pemfile::Item::ECKey(k) => Some(PrivateKey(k)),
            _ => None,
        })
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key_path.display())))?;

    Ok((certs, key))
}

fn load_by_thumbprint(thumbprint: &str) -> Result<(Vec<Certificate>, PrivateKey)> {
    let store = cert_store_dir();
    let path = store.join(format!("{}.pem", thumbprint.to_uppercase()));
    if !path.is_file() {
        return Err(Error::Tls(format!(
            "no certificate with thumbprint {} in {}",
            thumbprint,
            store.display()
        )));
    }
    // The bundle holds both the certificate chain and the key.
    load_pem_pair(&path, &path)
}

fn generate_self_signed(endpoint: &Endpoint) -> Result<(Vec<Certificate>, PrivateKey)> {
    let mut names = vec!["localhost".to_string()];
    if let Some(host) = endpoint.hostname() {
        names.push(host.to_string());
    }
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| Error::Tls(format!("self-signed generation failed: {e}")))?;
    let der = cert
        .serialize_der()
        .map_err(|e| Error::Tls(format!("self-signed serialization failed: {e}")))?;
    let key = cert.serialize_private_key_der();
    tracing::warn!(endpoint = %endpoint, "using a generated self-signed certificate");
    Ok((vec![Certificate(der)], PrivateKey(key)))
}

/// Build the rustls server configuration for a secure endpoint.
pub fn server_config(endpoint: &Endpoint) -> Result<Arc<ServerConfig>> {
    let (certs, key) = match &endpoint.tls {
        TlsMaterial::None => {
            return Err(Error::Tls(format!(
                "endpoint {endpoint} has no TLS material"
            )))
        }
        TlsMaterial::CertificatePair { cert, key } => load_pem_pair(cert, key)?,
        TlsMaterial::Thumbprint(thumbprint) => load_by_thumbprint(thumbprint)?,
        TlsMaterial::SelfSigned => generate_self_signed(endpoint)?,
    };

    let builder = ServerConfig::builder().with_safe_defaults();
    let config = if endpoint.allow_client_certificate {
        builder
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| Error::Tls(format!("invalid TLS material for {endpoint}: {e}")))?;

    Ok(Arc::new(config))
}

/// Drive the handshake to completion on a blocking socket and return the
/// TLS session plus the peer certificate, when one was presented.
pub fn handshake<S: Read + Write>(
    config: Arc<ServerConfig>,
    mut socket: S,
) -> Result<(rustls::StreamOwned<ServerConnection, S>, Option<ClientCertificate>)> {
    let mut conn = ServerConnection::new(config)
        .map_err(|e| Error::Tls(format!("tls session setup failed: {e}")))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut socket)
            .map_err(|e| Error::Tls(format!("tls handshake failed: {e}")))?;
    }

    let peer = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| ClientCertificate::from_der(cert.0.clone()));

    Ok((rustls::StreamOwned::new(conn, socket), peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Protocol;

    #[test]
    fn self_signed_material_builds_a_config() {
        let endpoint = Endpoint::new(Protocol::Https, "127.0.0.1", 8443)
            .unwrap()
            .with_tls(TlsMaterial::SelfSigned);
        assert!(server_config(&endpoint).is_ok());
    }

    #[test]
    fn client_cert_parses_validity() {
        let generated = rcgen::generate_simple_self_signed(vec!["client".to_string()]).unwrap();
        let der = generated.serialize_der().unwrap();
        let cert = ClientCertificate::from_der(der);
        assert!(cert.parse_error.is_none());
        assert_eq!(cert.thumbprint.len(), 40);
        let now = Utc::now();
        assert!(!cert.is_expired(now));
        assert!(!cert.is_not_yet_valid(now));
    }

    #[test]
    fn garbage_der_keeps_thumbprint_and_error() {
        let cert = ClientCertificate::from_der(vec![1, 2, 3]);
        assert!(cert.parse_error.is_some());
        assert_eq!(cert.thumbprint.len(), 40);
    }

    #[test]
    fn missing_thumbprint_is_a_tls_error() {
        let endpoint = Endpoint::new(Protocol::Https, "127.0.0.1", 8443)
            .unwrap()
            .with_tls(TlsMaterial::Thumbprint("DEADBEEF".into()));
        let err = server_config(&endpoint).unwrap_err();
        assert!(err.to_string().contains("thumbprint"));
    }
}
