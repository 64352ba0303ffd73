//! # TLS + Identity Handler
//!
//! Builds the mutually-authenticated rustls configurations out of the SSL
//! keystore and truststore, and applies the zone identity policy once a
//! handshake completes.
//!
//! Peers identify with X.500 legal names embedded in certificate
//! subjects, not DNS names, so both verifiers replace hostname
//! verification with full chain validation against the zone root (the
//! same rules as [`crate::x509::validate_chain_at`]); TLS signature
//! checks stay with the rustls crypto provider. After the handshake the
//! channel extracts the peer's leaf, parses the legal name, and enforces
//! the optional allow-list. An empty allow-list rejects every peer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, OtherError,
    ServerConfig, SignatureScheme,
};
use thiserror::Error;

use zoneport_common::LegalName;

use crate::credential_store::{CredentialStore, StoreError};
use crate::registration::{
    CLIENT_TLS_ALIAS, ROOT_CA_ALIAS, SSL_KEYSTORE_FILE, TRUSTSTORE_FILE,
};
use crate::x509::{self, X509Error};

/// Error type for TLS setup and peer identity policy.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("credential store failure: {0}")]
    Store(#[from] StoreError),
    #[error("TLS configuration invalid: {0}")]
    Config(String),
    #[error("peer presented no certificate")]
    NoPeerCertificate,
    #[error("peer chain untrusted: {0}")]
    PeerChainUntrusted(String),
    #[error("peer identity {0} not in the allow-list")]
    UnexpectedPeerIdentity(LegalName),
}

/// Private key, presented chain, and trusted root loaded from disk.
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub trusted_root_der: Vec<u8>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        TlsMaterial {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            trusted_root_der: self.trusted_root_der.clone(),
        }
    }
}

impl TlsMaterial {
    /// Load the transport identity from the SSL keystore and the zone
    /// root from the truststore under `certificates_dir`.
    pub fn load(
        certificates_dir: &Path,
        key_store_password: &str,
        key_password: &str,
        trust_store_password: &str,
    ) -> Result<Self, TlsError> {
        let ssl = CredentialStore::load(
            certificates_dir.join(SSL_KEYSTORE_FILE),
            key_store_password.as_bytes(),
        )?;
        let (key_der, chain) = ssl.key_entry(CLIENT_TLS_ALIAS, key_password.as_bytes())?;

        let trust = CredentialStore::load(
            certificates_dir.join(TRUSTSTORE_FILE),
            trust_store_password.as_bytes(),
        )?;
        let trusted_root_der = trust.certificate(ROOT_CA_ALIAS)?;

        Ok(TlsMaterial {
            cert_chain: chain.into_iter().map(CertificateDer::from).collect(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            trusted_root_der,
        })
    }

    /// The local leaf certificate DER.
    pub fn leaf_der(&self) -> Option<&[u8]> {
        self.cert_chain.first().map(|c| c.as_ref())
    }
}

/// Chain verifier for both handshake directions: validates the presented
/// chain against the zone root and skips hostname checks.
#[derive(Debug)]
struct ZonePeerVerifier {
    trusted_root_der: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ZonePeerVerifier {
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref().to_vec());
        chain.extend(intermediates.iter().map(|c| c.as_ref().to_vec()));
        x509::validate_chain_at(&self.trusted_root_der, &chain, now.as_secs() as i64)
            .map_err(certificate_error)
    }
}

fn certificate_error(error: X509Error) -> rustls::Error {
    let kind = match error {
        X509Error::Expired => CertificateError::Expired,
        X509Error::NotYetValid => CertificateError::NotValidYet,
        X509Error::ChainDoesNotTerminateAtRoot => CertificateError::UnknownIssuer,
        X509Error::SignatureInvalid => CertificateError::BadSignature,
        other => CertificateError::Other(OtherError(Arc::new(other))),
    };
    rustls::Error::InvalidCertificate(kind)
}

impl ServerCertVerifier for ZonePeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for ZonePeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates, now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// rustls client configuration: mutual TLS with zone chain validation.
pub fn client_config(material: &TlsMaterial) -> Result<ClientConfig, TlsError> {
    let provider = provider();
    let verifier = Arc::new(ZonePeerVerifier {
        trusted_root_der: material.trusted_root_der.clone(),
        algorithms: provider.signature_verification_algorithms,
    });
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(material.cert_chain.clone(), material.key.clone_key())
        .map_err(|e| TlsError::Config(e.to_string()))
}

/// rustls server configuration: client certificates are mandatory.
pub fn server_config(material: &TlsMaterial) -> Result<ServerConfig, TlsError> {
    let provider = provider();
    let verifier = Arc::new(ZonePeerVerifier {
        trusted_root_der: material.trusted_root_der.clone(),
        algorithms: provider.signature_verification_algorithms,
    });
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())
        .map_err(|e| TlsError::Config(e.to_string()))
}

/// SNI placeholder; verification never consults it.
pub fn peer_server_name() -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from("zone.peer".to_string())
        .map_err(|e| TlsError::Config(format!("bad placeholder server name: {}", e)))
}

/// The peer identity established by a completed handshake.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub cert_der: Vec<u8>,
    pub legal_name: LegalName,
}

/// Apply the post-handshake identity policy: a peer certificate must be
/// present, carry a parseable legal name, and pass the allow-list.
pub fn authorise_peer(
    peer_certs: Option<&[CertificateDer<'_>]>,
    allow_list: Option<&HashSet<LegalName>>,
) -> Result<PeerIdentity, TlsError> {
    let certs = match peer_certs {
        Some(certs) if !certs.is_empty() => certs,
        _ => return Err(TlsError::NoPeerCertificate),
    };
    let cert_der = certs[0].as_ref().to_vec();
    let legal_name = x509::subject_legal_name(&cert_der)
        .map_err(|e| TlsError::PeerChainUntrusted(e.to_string()))?;
    if let Some(allow) = allow_list {
        if !allow.contains(&legal_name) {
            return Err(TlsError::UnexpectedPeerIdentity(legal_name));
        }
    }
    Ok(PeerIdentity {
        cert_der,
        legal_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::{create_certificate, create_self_signed_ca, ZoneKeyPair};
    use std::time::Duration;
    use zoneport_common::{CertRole, SignatureScheme as Scheme};

    fn material_for(name: &LegalName) -> TlsMaterial {
        let root_name = LegalName::new("Zone Root", "Zurich", "CH").unwrap();
        let root_key = ZoneKeyPair::generate(Scheme::EcdsaP256Sha256).unwrap();
        let root = create_self_signed_ca(
            &root_name,
            CertRole::RootCa,
            &root_key,
            Duration::from_secs(86_400 * 3650),
        )
        .unwrap();
        let node_key = ZoneKeyPair::generate(Scheme::EcdsaP256Sha256).unwrap();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &root,
            &root_key,
            name,
            &node_key,
            Duration::from_secs(86_400 * 365),
        )
        .unwrap();
        let tls_key = ZoneKeyPair::generate(Scheme::EcdsaP256Sha256).unwrap();
        let tls_cert = create_certificate(
            CertRole::Tls,
            &node_ca,
            &node_key,
            name,
            &tls_key,
            Duration::from_secs(86_400 * 365),
        )
        .unwrap();
        TlsMaterial {
            cert_chain: vec![
                CertificateDer::from(tls_cert),
                CertificateDer::from(node_ca),
                CertificateDer::from(root.clone()),
            ],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(tls_key.pkcs8_der())),
            trusted_root_der: root,
        }
    }

    fn alice() -> LegalName {
        LegalName::new("Alice Corp", "London", "GB").unwrap()
    }

    #[test]
    fn test_configs_build_from_material() {
        let material = material_for(&alice());
        client_config(&material).unwrap();
        server_config(&material).unwrap();
    }

    #[test]
    fn test_authorise_peer_without_allow_list() {
        let material = material_for(&alice());
        let identity = authorise_peer(Some(&material.cert_chain), None).unwrap();
        assert_eq!(identity.legal_name, alice());
        assert_eq!(identity.cert_der, material.cert_chain[0].as_ref());
    }

    #[test]
    fn test_authorise_peer_allow_list_hit_and_miss() {
        let material = material_for(&alice());
        let mut allow = HashSet::new();
        allow.insert(alice());
        assert!(authorise_peer(Some(&material.cert_chain), Some(&allow)).is_ok());

        let mut other = HashSet::new();
        other.insert(LegalName::new("Charlie", "Oslo", "NO").unwrap());
        assert!(matches!(
            authorise_peer(Some(&material.cert_chain), Some(&other)),
            Err(TlsError::UnexpectedPeerIdentity(_))
        ));
    }

    #[test]
    fn test_empty_allow_list_rejects_everyone() {
        let material = material_for(&alice());
        let empty = HashSet::new();
        assert!(matches!(
            authorise_peer(Some(&material.cert_chain), Some(&empty)),
            Err(TlsError::UnexpectedPeerIdentity(_))
        ));
    }

    #[test]
    fn test_missing_peer_certificate() {
        assert!(matches!(
            authorise_peer(None, None),
            Err(TlsError::NoPeerCertificate)
        ));
        assert!(matches!(
            authorise_peer(Some(&[]), None),
            Err(TlsError::NoPeerCertificate)
        ));
    }
}
