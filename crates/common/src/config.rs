//! Node configuration loader using TOML and serde.
//! All transport tunables live in one typed value object passed into
//! constructors; nothing reads configuration from process globals.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::legal_name::{LegalName, LegalNameError};

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid legal name in configuration: {0}")]
    LegalName(#[from] LegalNameError),
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

/// Signature scheme used for freshly generated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureScheme {
    /// ECDSA over secp256r1 with SHA-256. The default TLS scheme.
    #[default]
    EcdsaP256Sha256,
    /// Ed25519.
    Ed25519,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_outbound_buffer() -> usize {
    256
}

/// Configuration consumed by enrolment and the peer channel.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// The node's own X.500 legal name, e.g. `"O=Alice Corp, L=London, C=GB"`.
    pub my_legal_name: String,

    /// Optional contact e-mail embedded in the certificate signing request.
    pub email_address: Option<String>,

    /// Directory holding the keystores, truststore, and request-id file.
    pub certificates_directory: PathBuf,

    /// Password protecting the node and SSL keystores.
    pub key_store_password: String,

    /// Password protecting the truststore.
    pub trust_store_password: String,

    /// Base URL of the doorman, e.g. `"https://doorman.zone.example:8080"`.
    /// Required for enrolment, unused afterwards.
    pub doorman_url: Option<String>,

    /// Peer legal names a client channel accepts. Absent means any
    /// chain-valid peer is accepted; present-but-empty rejects every peer.
    pub allowed_remote_legal_names: Option<Vec<String>>,

    /// Seconds between doorman polls while a request is pending.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Optional upper bound on total enrolment duration, in seconds.
    pub enrolment_timeout_secs: Option<u64>,

    /// Scheme used for newly generated TLS keys.
    #[serde(default)]
    pub tls_signature_scheme: SignatureScheme,

    /// When set, every AMQP performative sent or received is logged.
    #[serde(default)]
    pub frame_trace: bool,

    /// Bound on the client channel's buffered outbound queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl NodeConfig {
    /// Load configuration from a TOML file path.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path.as_ref())?;
        let cfg: NodeConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate field values that serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.legal_name()?;
        self.allow_list()?;
        if self.key_store_password.is_empty() {
            return Err(ConfigError::Invalid(
                "key_store_password must not be empty".to_string(),
            ));
        }
        if self.trust_store_password.is_empty() {
            return Err(ConfigError::Invalid(
                "trust_store_password must not be empty".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The node's own legal name, parsed.
    pub fn legal_name(&self) -> Result<LegalName, ConfigError> {
        Ok(self.my_legal_name.parse::<LegalName>()?)
    }

    /// The parsed allow-list. `Ok(None)` means accept any chain-valid peer.
    pub fn allow_list(&self) -> Result<Option<HashSet<LegalName>>, ConfigError> {
        match &self.allowed_remote_legal_names {
            None => Ok(None),
            Some(names) => {
                let mut set = HashSet::with_capacity(names.len());
                for name in names {
                    set.insert(name.parse::<LegalName>()?);
                }
                Ok(Some(set))
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn enrolment_timeout(&self) -> Option<Duration> {
        self.enrolment_timeout_secs.map(Duration::from_secs)
    }
}
