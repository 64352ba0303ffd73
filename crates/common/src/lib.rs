//! # Zoneport Common Crate
//!
//! Shared types for the zoneport peer transport.
//!
//! ## Modules
//! - `legal_name`: X.500 legal names used as peer identities
//! - `role`: certificate role taxonomy and key-usage policy
//! - `config`: node configuration management

pub mod config;
pub mod legal_name;
pub mod role;

pub use config::{ConfigError, NodeConfig, SignatureScheme};
pub use legal_name::{LegalName, LegalNameError};
pub use role::CertRole;
