//! Certificate role taxonomy.
//!
//! Every zone certificate carries a role in a custom extension; the role
//! decides which key usages the certificate may carry and whether it may
//! act as a CA. Role codes are stable wire values and must not be reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a certificate plays inside the zone trust hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertRole {
    /// The zone trust anchor.
    RootCa,
    /// Doorman-operated intermediate between root and node CAs.
    IntermediateCa,
    /// The per-node signing certificate issued at enrolment (a.k.a. client CA).
    NodeCa,
    /// Transport-only TLS leaf, signed by the node CA.
    Tls,
    /// A well-known legal identity.
    LegalIdentity,
    /// A confidential (unpublished) legal identity.
    ConfidentialLegalIdentity,
    /// An identity owned by a distributed service rather than a single node.
    ServiceIdentity,
}

impl CertRole {
    /// Stable single-byte code used in the role extension.
    pub fn code(self) -> u8 {
        match self {
            CertRole::RootCa => 1,
            CertRole::IntermediateCa => 2,
            CertRole::NodeCa => 3,
            CertRole::Tls => 4,
            CertRole::LegalIdentity => 5,
            CertRole::ConfidentialLegalIdentity => 6,
            CertRole::ServiceIdentity => 7,
        }
    }

    /// Decodes a role extension byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CertRole::RootCa),
            2 => Some(CertRole::IntermediateCa),
            3 => Some(CertRole::NodeCa),
            4 => Some(CertRole::Tls),
            5 => Some(CertRole::LegalIdentity),
            6 => Some(CertRole::ConfidentialLegalIdentity),
            7 => Some(CertRole::ServiceIdentity),
            _ => None,
        }
    }

    /// Whether certificates with this role sign other certificates.
    pub fn is_ca(self) -> bool {
        matches!(
            self,
            CertRole::RootCa | CertRole::IntermediateCa | CertRole::NodeCa
        )
    }

    /// Path length constraint for CA roles. The root may sign one further
    /// CA tier; intermediates and node CAs only sign end entities.
    pub fn path_len(self) -> Option<u32> {
        match self {
            CertRole::RootCa => Some(1),
            CertRole::IntermediateCa | CertRole::NodeCa => Some(0),
            _ => None,
        }
    }

    /// Roles a certificate with this role is allowed to be issued by.
    /// The root is self-issued and so allows itself.
    pub fn permitted_issuers(self) -> &'static [CertRole] {
        match self {
            CertRole::RootCa => &[CertRole::RootCa],
            CertRole::IntermediateCa => &[CertRole::RootCa],
            CertRole::NodeCa => &[CertRole::IntermediateCa, CertRole::RootCa],
            CertRole::Tls
            | CertRole::LegalIdentity
            | CertRole::ConfidentialLegalIdentity
            | CertRole::ServiceIdentity => &[CertRole::NodeCa],
        }
    }
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertRole::RootCa => "ROOT_CA",
            CertRole::IntermediateCa => "INTERMEDIATE_CA",
            CertRole::NodeCa => "NODE_CA",
            CertRole::Tls => "TLS",
            CertRole::LegalIdentity => "LEGAL_IDENTITY",
            CertRole::ConfidentialLegalIdentity => "CONFIDENTIAL_LEGAL_IDENTITY",
            CertRole::ServiceIdentity => "SERVICE_IDENTITY",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_codes_round_trip() {
        for role in [
            CertRole::RootCa,
            CertRole::IntermediateCa,
            CertRole::NodeCa,
            CertRole::Tls,
            CertRole::LegalIdentity,
            CertRole::ConfidentialLegalIdentity,
            CertRole::ServiceIdentity,
        ] {
            assert_eq!(CertRole::from_code(role.code()), Some(role));
        }
        assert_eq!(CertRole::from_code(0), None);
        assert_eq!(CertRole::from_code(8), None);
    }

    #[test]
    fn test_ca_roles_have_path_len() {
        assert_eq!(CertRole::RootCa.path_len(), Some(1));
        assert_eq!(CertRole::NodeCa.path_len(), Some(0));
        assert_eq!(CertRole::Tls.path_len(), None);
        assert!(CertRole::NodeCa.is_ca());
        assert!(!CertRole::Tls.is_ca());
    }

    #[test]
    fn test_tls_must_be_issued_by_node_ca() {
        assert_eq!(CertRole::Tls.permitted_issuers(), &[CertRole::NodeCa]);
        assert!(CertRole::NodeCa
            .permitted_issuers()
            .contains(&CertRole::IntermediateCa));
    }
}
