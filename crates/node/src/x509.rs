//! # X.509 Toolkit
//!
//! Key generation, certificate and CSR construction, and chain validation
//! for the zone trust hierarchy.
//!
//! ## Responsibilities
//!
//! - Generating keypairs for the configured signature scheme
//! - Building self-signed CAs, child CAs, TLS leaves, and identity
//!   certificates with role-appropriate key usages and path constraints
//! - Building and parsing PKCS#10 certificate signing requests
//! - Validating a leaf→root chain against a trusted root certificate
//!
//! Certificate construction uses the `rcgen` crate; parsing and signature
//! verification use `x509-parser`. Every certificate issued here carries the
//! zone role extension (a single-byte DER INTEGER under a private-enterprise
//! OID) so that chain validation can enforce who may issue whom.
//!
//! ## Validity Window Derivation
//!
//! A child certificate's window is clamped into its issuer's:
//! `start = max(now, issuer.not_before)`, `end = min(now + requested,
//! issuer.not_after)`. An empty resulting window is an error rather than a
//! silently short-lived certificate.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use zoneport_common::{CertRole, LegalName, SignatureScheme};

/// Dotted OID of the zone role extension.
const ROLE_EXTENSION_OID: [u64; 9] = [1, 3, 6, 1, 4, 1, 50530, 1, 1];
/// String form used when matching parsed extensions.
const ROLE_EXTENSION_OID_STR: &str = "1.3.6.1.4.1.50530.1.1";
/// Dotted OID of the PKCS#9 emailAddress attribute.
const EMAIL_ADDRESS_OID: [u64; 7] = [1, 2, 840, 113549, 1, 9, 1];
const EMAIL_ADDRESS_OID_STR: &str = "1.2.840.113549.1.9.1";

const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_COUNTRY: &str = "2.5.4.6";
const OID_LOCALITY: &str = "2.5.4.7";
const OID_STATE: &str = "2.5.4.8";
const OID_ORGANISATION: &str = "2.5.4.10";
const OID_ORGANISATIONAL_UNIT: &str = "2.5.4.11";

/// Error type for toolkit operations.
///
/// Chain validation failures name the first offending link; no key material
/// is carried in any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X509Error {
    /// The chain is empty or its final certificate is not the trusted root.
    ChainDoesNotTerminateAtRoot,
    /// A link is not signed by its successor.
    SignatureInvalid,
    /// A certificate's validity window has not started yet.
    NotYetValid,
    /// A certificate's validity window has ended.
    Expired,
    /// A certificate's role is inconsistent with its position or usages.
    RoleMismatch(String),
    /// A derived validity window would be empty.
    NoValidityOverlap,
    /// DER or X.509 structure could not be parsed.
    Parse(String),
    /// Key or certificate generation failed.
    Generation(String),
}

impl fmt::Display for X509Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            X509Error::ChainDoesNotTerminateAtRoot => {
                write!(f, "certificate chain does not terminate at the trusted root")
            }
            X509Error::SignatureInvalid => write!(f, "certificate signature invalid"),
            X509Error::NotYetValid => write!(f, "certificate not yet valid"),
            X509Error::Expired => write!(f, "certificate expired"),
            X509Error::RoleMismatch(msg) => write!(f, "certificate role mismatch: {}", msg),
            X509Error::NoValidityOverlap => {
                write!(f, "requested validity window does not overlap the issuer's")
            }
            X509Error::Parse(msg) => write!(f, "X.509 parse error: {}", msg),
            X509Error::Generation(msg) => write!(f, "certificate generation failed: {}", msg),
        }
    }
}

impl std::error::Error for X509Error {}

/// A keypair of a configured signature scheme.
///
/// Wraps an `rcgen::KeyPair` so that callers deal in schemes and PKCS#8 DER
/// rather than in rcgen algorithm statics.
pub struct ZoneKeyPair {
    inner: KeyPair,
    scheme: SignatureScheme,
}

impl ZoneKeyPair {
    /// Generate a fresh keypair for the given scheme.
    pub fn generate(scheme: SignatureScheme) -> Result<Self, X509Error> {
        let alg = match scheme {
            SignatureScheme::EcdsaP256Sha256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            SignatureScheme::Ed25519 => &rcgen::PKCS_ED25519,
        };
        let inner =
            KeyPair::generate_for(alg).map_err(|e| X509Error::Generation(e.to_string()))?;
        Ok(Self { inner, scheme })
    }

    /// Reconstruct a keypair from PKCS#8 DER, auto-detecting the scheme.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, X509Error> {
        let inner = KeyPair::try_from(der).map_err(|e| X509Error::Parse(e.to_string()))?;
        let scheme = if inner.is_compatible(&rcgen::PKCS_ED25519) {
            SignatureScheme::Ed25519
        } else {
            SignatureScheme::EcdsaP256Sha256
        };
        Ok(Self { inner, scheme })
    }

    /// The private key, PKCS#8 DER encoded.
    pub fn pkcs8_der(&self) -> Vec<u8> {
        self.inner.serialize_der()
    }

    /// The public half, as SubjectPublicKeyInfo DER.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.inner.public_key_der()
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    fn rcgen(&self) -> &KeyPair {
        &self.inner
    }
}

impl fmt::Debug for ZoneKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material must never reach logs.
        f.debug_struct("ZoneKeyPair")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

fn distinguished_name(name: &LegalName) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    if let Some(cn) = name.common_name() {
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    }
    if let Some(ou) = name.organisational_unit() {
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(ou.to_string()),
        );
    }
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(name.organisation().to_string()),
    );
    dn.push(
        DnType::LocalityName,
        DnValue::Utf8String(name.locality().to_string()),
    );
    if let Some(st) = name.state() {
        dn.push(
            DnType::StateOrProvinceName,
            DnValue::Utf8String(st.to_string()),
        );
    }
    dn.push(
        DnType::CountryName,
        DnValue::Utf8String(name.country().to_string()),
    );
    dn
}

fn role_extension(role: CertRole) -> CustomExtension {
    // Extension value is a DER INTEGER holding the role code.
    CustomExtension::from_oid_content(&ROLE_EXTENSION_OID, vec![0x02, 0x01, role.code()])
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    // Clear the sign bit so the serial is a positive INTEGER.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn apply_role(params: &mut CertificateParams, role: CertRole) {
    params.custom_extensions.push(role_extension(role));
    if role.is_ca() {
        params.is_ca = match role.path_len() {
            Some(n) => IsCa::Ca(BasicConstraints::Constrained(n as u8)),
            None => IsCa::Ca(BasicConstraints::Unconstrained),
        };
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.is_ca = IsCa::ExplicitNoCa;
        match role {
            CertRole::Tls => {
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyEncipherment,
                ];
                params.extended_key_usages = vec![
                    ExtendedKeyUsagePurpose::ServerAuth,
                    ExtendedKeyUsagePurpose::ClientAuth,
                ];
            }
            _ => {
                params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            }
        }
    }
}

fn offset(ts: i64) -> Result<OffsetDateTime, X509Error> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| X509Error::Generation(format!("timestamp out of range: {}", e)))
}

/// Create a self-signed CA certificate over the given keypair.
///
/// Used for the zone root in tests and for the transient self-signed
/// placeholder generated at the start of enrolment. Returns the DER.
pub fn create_self_signed_ca(
    principal: &LegalName,
    role: CertRole,
    keypair: &ZoneKeyPair,
    lifetime: Duration,
) -> Result<Vec<u8>, X509Error> {
    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(principal);
    params.serial_number = Some(random_serial());
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(lifetime.as_secs() as i64);
    apply_role(&mut params, role);
    let cert = params
        .self_signed(keypair.rcgen())
        .map_err(|e| X509Error::Generation(e.to_string()))?;
    Ok(cert.der().to_vec())
}

/// Create a certificate for `subject_key`, signed by the issuer.
///
/// `issuer_der` must be the issuer's certificate; its subject becomes the
/// new certificate's issuer DN and its validity window clamps the child's.
/// Returns the child certificate DER.
pub fn create_certificate(
    role: CertRole,
    issuer_der: &[u8],
    issuer_key: &ZoneKeyPair,
    subject: &LegalName,
    subject_key: &ZoneKeyPair,
    requested_lifetime: Duration,
) -> Result<Vec<u8>, X509Error> {
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| X509Error::Parse(e.to_string()))?;
    let issuer_nb = issuer.validity().not_before.timestamp();
    let issuer_na = issuer.validity().not_after.timestamp();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let start = now.max(issuer_nb);
    let end = (now + requested_lifetime.as_secs() as i64).min(issuer_na);
    if end <= start {
        return Err(X509Error::NoValidityOverlap);
    }

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(subject);
    params.serial_number = Some(random_serial());
    params.not_before = offset(start)?;
    params.not_after = offset(end)?;
    apply_role(&mut params, role);

    // rcgen signs against an issuer `Certificate`; rebuild one carrying the
    // original CA's subject and constraints from its DER.
    let issuer_params = CertificateParams::from_ca_cert_der(&issuer_der.to_vec().into())
        .map_err(|e| X509Error::Parse(e.to_string()))?;
    let issuer_cert = issuer_params
        .self_signed(issuer_key.rcgen())
        .map_err(|e| X509Error::Generation(e.to_string()))?;

    let cert = params
        .signed_by(subject_key.rcgen(), &issuer_cert, issuer_key.rcgen())
        .map_err(|e| X509Error::Generation(e.to_string()))?;
    Ok(cert.der().to_vec())
}

/// Build a PKCS#10 CSR over the keypair. Returns the request DER.
///
/// The subject carries the legal name; the optional email lands in an
/// emailAddress RDN so the doorman can reach the operator.
pub fn create_csr(
    principal: &LegalName,
    email: Option<&str>,
    keypair: &ZoneKeyPair,
) -> Result<Vec<u8>, X509Error> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(principal);
    if let Some(email) = email {
        params.distinguished_name.push(
            DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
            DnValue::Utf8String(email.to_string()),
        );
    }
    let csr = params
        .serialize_request(keypair.rcgen())
        .map_err(|e| X509Error::Generation(e.to_string()))?;
    Ok(csr.der().to_vec())
}

/// The parts of a CSR a registration authority acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCsr {
    pub subject: LegalName,
    /// SubjectPublicKeyInfo DER of the requested key.
    pub public_key_der: Vec<u8>,
    pub email: Option<String>,
}

/// Parse and signature-check a PKCS#10 CSR.
pub fn parse_csr(der: &[u8]) -> Result<ParsedCsr, X509Error> {
    use x509_parser::certification_request::X509CertificationRequest;

    let (_, csr) =
        X509CertificationRequest::from_der(der).map_err(|e| X509Error::Parse(e.to_string()))?;
    csr.verify_signature()
        .map_err(|_| X509Error::SignatureInvalid)?;

    let info = &csr.certification_request_info;
    let subject = legal_name_from_x509(&info.subject)?;
    let mut email = None;
    for attr in info.subject.iter_attributes() {
        if attr.attr_type().to_id_string() == EMAIL_ADDRESS_OID_STR {
            email = attr.as_str().ok().map(|s| s.to_string());
        }
    }
    Ok(ParsedCsr {
        subject,
        public_key_der: info.subject_pki.raw.to_vec(),
        email,
    })
}

/// Reconstruct a [`LegalName`] from a certificate or CSR subject.
pub fn legal_name_from_x509(name: &X509Name<'_>) -> Result<LegalName, X509Error> {
    let mut cn = None;
    let mut ou = None;
    let mut o = None;
    let mut l = None;
    let mut st = None;
    let mut c = None;
    for attr in name.iter_attributes() {
        let value = match attr.as_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        match attr.attr_type().to_id_string().as_str() {
            OID_COMMON_NAME => cn = Some(value),
            OID_ORGANISATIONAL_UNIT => ou = Some(value),
            OID_ORGANISATION => o = Some(value),
            OID_LOCALITY => l = Some(value),
            OID_STATE => st = Some(value),
            OID_COUNTRY => c = Some(value),
            _ => {}
        }
    }
    LegalName::from_attributes(cn, ou, o, l, st, c)
        .map_err(|e| X509Error::Parse(format!("subject is not a legal name: {}", e)))
}

/// Extract the zone role extension, if present.
pub fn certificate_role(cert: &X509Certificate<'_>) -> Option<CertRole> {
    for ext in cert.extensions() {
        if ext.oid.to_id_string() == ROLE_EXTENSION_OID_STR {
            let v = ext.value;
            if v.len() == 3 && v[0] == 0x02 && v[1] == 0x01 {
                return CertRole::from_code(v[2]);
            }
        }
    }
    None
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Validate a leaf→root chain against the trusted root, at the current time.
pub fn validate_chain(trusted_root_der: &[u8], chain: &[Vec<u8>]) -> Result<(), X509Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    validate_chain_at(trusted_root_der, chain, now)
}

/// Validate a leaf→root chain against the trusted root.
///
/// Checks, in order:
/// 1. the chain is non-empty and its last certificate is bit-identical to
///    the trusted root;
/// 2. every certificate is within its validity window at `now_unix`;
/// 3. every link is signed by its successor (the root by itself) and each
///    link's issuer DN equals its successor's subject DN;
/// 4. roles are consistent: a link's role must admit its issuer's role, and
///    every issuing certificate must carry `keyCertSign`.
pub fn validate_chain_at(
    trusted_root_der: &[u8],
    chain: &[Vec<u8>],
    now_unix: i64,
) -> Result<(), X509Error> {
    if chain.is_empty() {
        return Err(X509Error::ChainDoesNotTerminateAtRoot);
    }
    let last = chain.len() - 1;
    if chain[last] != trusted_root_der {
        return Err(X509Error::ChainDoesNotTerminateAtRoot);
    }

    let mut parsed = Vec::with_capacity(chain.len());
    for der in chain {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| X509Error::Parse(e.to_string()))?;
        parsed.push(cert);
    }

    for cert in &parsed {
        let nb = cert.validity().not_before.timestamp();
        let na = cert.validity().not_after.timestamp();
        if now_unix < nb {
            return Err(X509Error::NotYetValid);
        }
        if now_unix > na {
            return Err(X509Error::Expired);
        }
    }

    for i in 0..parsed.len() {
        let cert = &parsed[i];
        let issuer = if i < last { &parsed[i + 1] } else { &parsed[last] };

        if cert.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(X509Error::SignatureInvalid);
        }
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|_| X509Error::SignatureInvalid)?;

        if i < last {
            let issuer_ku_ok = issuer
                .key_usage()
                .ok()
                .flatten()
                .map(|ku| ku.value.key_cert_sign())
                .unwrap_or(false);
            if !issuer_ku_ok {
                return Err(X509Error::RoleMismatch(
                    "issuing certificate lacks keyCertSign".to_string(),
                ));
            }
        }

        if let (Some(role), Some(issuer_role)) =
            (certificate_role(cert), certificate_role(issuer))
        {
            let ok = if i == last {
                role == CertRole::RootCa
            } else {
                role.permitted_issuers().contains(&issuer_role)
            };
            if !ok {
                return Err(X509Error::RoleMismatch(format!(
                    "{} may not be issued by {}",
                    role, issuer_role
                )));
            }
        }
    }

    Ok(())
}

/// Parse a certificate subject straight from DER.
pub fn subject_legal_name(der: &[u8]) -> Result<LegalName, X509Error> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| X509Error::Parse(e.to_string()))?;
    legal_name_from_x509(cert.subject())
}
