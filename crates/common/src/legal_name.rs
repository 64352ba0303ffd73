//! # Legal Names
//!
//! Provides [`LegalName`], the X.500 distinguished name that identifies a
//! peer inside a compatibility zone.
//!
//! ## Shape
//!
//! | Attribute | Key | Mandatory |
//! |-----------|-----|-----------|
//! | Common name | `CN` | no |
//! | Organisational unit | `OU` | no |
//! | Organisation | `O` | yes |
//! | Locality | `L` | yes |
//! | State | `ST` | no |
//! | Country | `C` | yes (ISO 3166-1 alpha-2) |
//!
//! The canonical string rendering lists attributes in the order above,
//! comma-separated (`CN=Alice Corp, O=Alice Corp, L=London, C=GB`). Parsing
//! and rendering round-trip exactly; the rendering is what gets embedded in
//! certificate subjects and compared against channel allow-lists.
//!
//! ## Determinism
//!
//! Parsing, rendering, equality, and hashing are pure functions of the
//! attribute values. No locale-dependent casing is applied.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length accepted for any single attribute value.
const MAX_ATTRIBUTE_LEN: usize = 128;

/// Error type for legal name construction and parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegalNameError {
    /// A mandatory attribute (O, L, or C) is absent.
    #[error("missing mandatory attribute {0}")]
    MissingAttribute(&'static str),
    /// An attribute value is empty or whitespace-only.
    #[error("attribute {0} must not be empty")]
    EmptyAttribute(&'static str),
    /// An attribute value exceeds the maximum length or contains a comma.
    #[error("attribute {0} has an invalid value")]
    InvalidAttribute(&'static str),
    /// Country is not a two-letter upper-case ISO 3166-1 code.
    #[error("country must be a two-letter upper-case code, got {0:?}")]
    InvalidCountry(String),
    /// A `key=value` pair used an unrecognised key.
    #[error("unrecognised attribute key {0:?}")]
    UnknownKey(String),
    /// The same key appeared twice.
    #[error("duplicate attribute key {0:?}")]
    DuplicateKey(String),
    /// A component was not of the form `key=value`.
    #[error("malformed attribute component {0:?}")]
    MalformedComponent(String),
}

/// An X.500 legal name: the asserted identity of a zone member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegalName {
    common_name: Option<String>,
    organisational_unit: Option<String>,
    organisation: String,
    locality: String,
    state: Option<String>,
    country: String,
}

impl LegalName {
    /// Builds a legal name from the three mandatory attributes.
    pub fn new(
        organisation: impl Into<String>,
        locality: impl Into<String>,
        country: impl Into<String>,
    ) -> Result<Self, LegalNameError> {
        let name = Self {
            common_name: None,
            organisational_unit: None,
            organisation: organisation.into(),
            locality: locality.into(),
            state: None,
            country: country.into(),
        };
        name.validate()?;
        Ok(name)
    }

    /// Returns a copy with the common name set.
    pub fn with_common_name(mut self, cn: impl Into<String>) -> Result<Self, LegalNameError> {
        self.common_name = Some(cn.into());
        self.validate()?;
        Ok(self)
    }

    /// Returns a copy with the organisational unit set.
    pub fn with_organisational_unit(
        mut self,
        ou: impl Into<String>,
    ) -> Result<Self, LegalNameError> {
        self.organisational_unit = Some(ou.into());
        self.validate()?;
        Ok(self)
    }

    /// Returns a copy with the state/province set.
    pub fn with_state(mut self, st: impl Into<String>) -> Result<Self, LegalNameError> {
        self.state = Some(st.into());
        self.validate()?;
        Ok(self)
    }

    /// Assembles a legal name from already-parsed attribute values.
    ///
    /// Used when reconstructing the name out of a certificate subject.
    pub fn from_attributes(
        common_name: Option<String>,
        organisational_unit: Option<String>,
        organisation: Option<String>,
        locality: Option<String>,
        state: Option<String>,
        country: Option<String>,
    ) -> Result<Self, LegalNameError> {
        let name = Self {
            common_name,
            organisational_unit,
            organisation: organisation.ok_or(LegalNameError::MissingAttribute("O"))?,
            locality: locality.ok_or(LegalNameError::MissingAttribute("L"))?,
            state,
            country: country.ok_or(LegalNameError::MissingAttribute("C"))?,
        };
        name.validate()?;
        Ok(name)
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn organisational_unit(&self) -> Option<&str> {
        self.organisational_unit.as_deref()
    }

    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    pub fn locality(&self) -> &str {
        &self.locality
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    fn validate(&self) -> Result<(), LegalNameError> {
        check_value("O", &self.organisation)?;
        check_value("L", &self.locality)?;
        if let Some(cn) = &self.common_name {
            check_value("CN", cn)?;
        }
        if let Some(ou) = &self.organisational_unit {
            check_value("OU", ou)?;
        }
        if let Some(st) = &self.state {
            check_value("ST", st)?;
        }
        let c = &self.country;
        if c.len() != 2 || !c.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(LegalNameError::InvalidCountry(c.clone()));
        }
        Ok(())
    }
}

fn check_value(key: &'static str, value: &str) -> Result<(), LegalNameError> {
    if value.trim().is_empty() {
        return Err(LegalNameError::EmptyAttribute(key));
    }
    if value.len() > MAX_ATTRIBUTE_LEN || value.contains(',') || value.contains('=') {
        return Err(LegalNameError::InvalidAttribute(key));
    }
    if value != value.trim() {
        return Err(LegalNameError::InvalidAttribute(key));
    }
    Ok(())
}

impl fmt::Display for LegalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_attr = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            if first {
                first = false;
                write!(f, "{}={}", key, value)
            } else {
                write!(f, ", {}={}", key, value)
            }
        };
        if let Some(cn) = &self.common_name {
            write_attr(f, "CN", cn)?;
        }
        if let Some(ou) = &self.organisational_unit {
            write_attr(f, "OU", ou)?;
        }
        write_attr(f, "O", &self.organisation)?;
        write_attr(f, "L", &self.locality)?;
        if let Some(st) = &self.state {
            write_attr(f, "ST", st)?;
        }
        write_attr(f, "C", &self.country)?;
        Ok(())
    }
}

impl FromStr for LegalName {
    type Err = LegalNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cn = None;
        let mut ou = None;
        let mut o = None;
        let mut l = None;
        let mut st = None;
        let mut c = None;

        for component in s.split(',') {
            let component = component.trim();
            if component.is_empty() {
                return Err(LegalNameError::MalformedComponent(component.to_string()));
            }
            let (key, value) = component
                .split_once('=')
                .ok_or_else(|| LegalNameError::MalformedComponent(component.to_string()))?;
            let value = value.trim().to_string();
            let slot = match key.trim() {
                "CN" => &mut cn,
                "OU" => &mut ou,
                "O" => &mut o,
                "L" => &mut l,
                "ST" => &mut st,
                "C" => &mut c,
                other => return Err(LegalNameError::UnknownKey(other.to_string())),
            };
            if slot.is_some() {
                return Err(LegalNameError::DuplicateKey(key.trim().to_string()));
            }
            *slot = Some(value);
        }

        Self::from_attributes(cn, ou, o, l, st, c)
    }
}
