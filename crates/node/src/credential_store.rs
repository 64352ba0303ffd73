//! # Credential Store
//!
//! Password-protected on-disk container mapping aliases to either a
//! private-key-plus-chain entry or a trusted certificate.
//!
//! ## Container Format
//!
//! ```text
//! ┌──────────┬───────────┬────────────┬───────────────────────────┐
//! │ magic 8B │ salt 16B  │ nonce 12B  │ AES-256-GCM(payload)      │
//! └──────────┴───────────┴────────────┴───────────────────────────┘
//! ```
//!
//! The store key is `SHA3-256(salt ‖ password)`; the payload is a JSON
//! document of entries with DER fields hex-encoded. Key entries wrap the
//! PKCS#8 private key in a second AES-256-GCM layer under the entry
//! password, so the store password and key passwords stay separate at the
//! interface even when callers choose to make them equal.
//!
//! ## Durability
//!
//! Saves are atomic: the document is written to `<path>.tmp`, flushed and
//! synced, then renamed over the target. A crash mid-save leaves the
//! previous store intact.
//!
//! ## Error Mapping
//!
//! - Outer GCM authentication failure ⇒ [`StoreError::BadPassword`]
//! - Inner GCM failure on a key entry ⇒ [`StoreError::BadPassword`]
//! - Bad magic, truncated header, malformed JSON ⇒ [`StoreError::StoreCorrupt`]
//! - Unknown alias ⇒ [`StoreError::AliasMissing`]

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// File magic identifying a zoneport credential store.
const STORE_MAGIC: &[u8; 8] = b"ZPSTORE1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Error type for credential store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The file exists but is not a readable store.
    StoreCorrupt(String),
    /// Decryption failed; wrong store or entry password.
    BadPassword,
    /// The requested alias is not present.
    AliasMissing(String),
    /// Underlying file I/O failure.
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::StoreCorrupt(msg) => write!(f, "credential store corrupt: {}", msg),
            StoreError::BadPassword => write!(f, "credential store password incorrect"),
            StoreError::AliasMissing(alias) => write!(f, "alias not found: {}", alias),
            StoreError::Io(e) => write!(f, "credential store I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// One aliased entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Entry {
    /// A private key (inner-encrypted PKCS#8) plus its certificate chain.
    Key {
        /// nonce ‖ ciphertext of the PKCS#8 DER, under the entry password.
        sealed_key: String,
        /// Entry salt for the inner key derivation.
        salt: String,
        /// Leaf-first chain, hex DER.
        chain: Vec<String>,
    },
    /// A bare trusted certificate, hex DER.
    Trusted { cert: String },
}

/// A password-protected credential store bound to a file path.
pub struct CredentialStore {
    path: PathBuf,
    entries: BTreeMap<String, Entry>,
}

fn derive_key(salt: &[u8], password: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(salt);
    hasher.update(password);
    hasher.finalize().into()
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::StoreCorrupt("encryption failure".to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_sealed(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
    if sealed.len() < NONCE_LEN {
        return Err(StoreError::StoreCorrupt("sealed blob too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::BadPassword)
}

fn decode_hex(field: &str) -> Result<Vec<u8>, StoreError> {
    hex::decode(field).map_err(|e| StoreError::StoreCorrupt(format!("bad hex field: {}", e)))
}

impl CredentialStore {
    /// Load an existing store.
    pub fn load(path: impl AsRef<Path>, password: &[u8]) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        if raw.len() < STORE_MAGIC.len() + SALT_LEN || &raw[..STORE_MAGIC.len()] != STORE_MAGIC {
            return Err(StoreError::StoreCorrupt("bad header".to_string()));
        }
        let salt = &raw[STORE_MAGIC.len()..STORE_MAGIC.len() + SALT_LEN];
        let sealed = &raw[STORE_MAGIC.len() + SALT_LEN..];
        let key = derive_key(salt, password);
        let plaintext = open_sealed(&key, sealed)?;
        let entries: BTreeMap<String, Entry> = serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::StoreCorrupt(format!("bad payload: {}", e)))?;
        Ok(Self { path, entries })
    }

    /// Load the store at `path`, creating an empty one on disk if absent.
    pub fn load_or_create(path: impl AsRef<Path>, password: &[u8]) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if path_ref.exists() {
            Self::load(path_ref, password)
        } else {
            let store = Self {
                path: path_ref.to_path_buf(),
                entries: BTreeMap::new(),
            };
            store.save(password)?;
            Ok(store)
        }
    }

    /// Persist the store atomically under its bound path.
    pub fn save(&self, password: &[u8]) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&self.entries)
            .map_err(|e| StoreError::StoreCorrupt(format!("serialize: {}", e)))?;
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = derive_key(&salt, password);
        let sealed = seal(&key, &payload)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(STORE_MAGIC)?;
            file.write_all(&salt)?;
            file.write_all(&sealed)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Insert or replace a private-key entry. The key DER is sealed under
    /// `key_password`; `chain` is leaf-first.
    pub fn put_key_entry(
        &mut self,
        alias: &str,
        key_pkcs8_der: &[u8],
        key_password: &[u8],
        chain: &[Vec<u8>],
    ) -> Result<(), StoreError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let inner_key = derive_key(&salt, key_password);
        let sealed_key = seal(&inner_key, key_pkcs8_der)?;
        self.entries.insert(
            alias.to_string(),
            Entry::Key {
                sealed_key: hex::encode(sealed_key),
                salt: hex::encode(salt),
                chain: chain.iter().map(|der| hex::encode(der)).collect(),
            },
        );
        Ok(())
    }

    /// Insert or replace a trusted-certificate entry.
    pub fn put_trusted_certificate(&mut self, alias: &str, cert_der: &[u8]) {
        self.entries.insert(
            alias.to_string(),
            Entry::Trusted {
                cert: hex::encode(cert_der),
            },
        );
    }

    /// Remove an alias.
    pub fn delete(&mut self, alias: &str) -> Result<(), StoreError> {
        self.entries
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| StoreError::AliasMissing(alias.to_string()))
    }

    /// Retrieve a private key (PKCS#8 DER) and its chain.
    pub fn key_entry(
        &self,
        alias: &str,
        key_password: &[u8],
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>), StoreError> {
        match self.entries.get(alias) {
            Some(Entry::Key {
                sealed_key,
                salt,
                chain,
            }) => {
                let salt = decode_hex(salt)?;
                let sealed = decode_hex(sealed_key)?;
                let inner_key = derive_key(&salt, key_password);
                let key_der = open_sealed(&inner_key, &sealed)?;
                let chain = chain
                    .iter()
                    .map(|c| decode_hex(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((key_der, chain))
            }
            Some(Entry::Trusted { .. }) => Err(StoreError::AliasMissing(alias.to_string())),
            None => Err(StoreError::AliasMissing(alias.to_string())),
        }
    }

    /// Retrieve the certificate under an alias: the chain leaf for key
    /// entries, the certificate itself for trusted entries.
    pub fn certificate(&self, alias: &str) -> Result<Vec<u8>, StoreError> {
        match self.entries.get(alias) {
            Some(Entry::Key { chain, .. }) => chain
                .first()
                .map(|c| decode_hex(c))
                .transpose()?
                .ok_or_else(|| StoreError::StoreCorrupt("key entry with empty chain".to_string())),
            Some(Entry::Trusted { cert }) => decode_hex(cert),
            None => Err(StoreError::AliasMissing(alias.to_string())),
        }
    }

    /// The full chain of a key entry, leaf first.
    pub fn chain(&self, alias: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        match self.entries.get(alias) {
            Some(Entry::Key { chain, .. }) => {
                chain.iter().map(|c| decode_hex(c)).collect()
            }
            Some(Entry::Trusted { cert }) => Ok(vec![decode_hex(cert)?]),
            None => Err(StoreError::AliasMissing(alias.to_string())),
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
