//! # Registration Client
//!
//! Drives the one-shot enrolment flow that turns a freshly installed node
//! into an attested zone member: generate a key, submit a CSR to the
//! doorman, poll until signed, validate the returned chain against the
//! trusted root, install the node CA, and derive the TLS leaf.
//!
//! ## State Machine
//!
//! ```text
//! Start ──► EnsureSelfSigned ──► SubmitOrResume ──► Poll ──► Install ──► DeriveTls ──► Done
//!   │                                                                        ▲
//!   └── CLIENT_CA present, TLS leaf present ──► Done                         │
//!   └── CLIENT_CA present, TLS leaf missing ────────────────────────────────┘
//! ```
//!
//! Every transition persists enough state that a crash resumes from the
//! correct step: the transient self-signed key survives restarts (so a
//! resumed run never submits a CSR for a different key) and the request id
//! lives in `certificate-request-id.txt` between submission and install.
//!
//! ## Cancellation
//!
//! Poll sleeps race a `CancellationToken`; cancellation surfaces as
//! [`RegistrationError::Interrupted`] with no on-disk state lost.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use zoneport_common::{CertRole, LegalName, NodeConfig};

use crate::credential_store::{CredentialStore, StoreError};
use crate::doorman_client::{DoormanClient, DoormanError};
use crate::x509::{self, X509Error, ZoneKeyPair};

/// On-disk layout under the certificates directory.
pub const NODE_KEYSTORE_FILE: &str = "nodekeystore.jks";
pub const SSL_KEYSTORE_FILE: &str = "sslkeystore.jks";
pub const TRUSTSTORE_FILE: &str = "truststore.jks";
pub const REQUEST_ID_FILE: &str = "certificate-request-id.txt";

/// Store aliases.
pub const CLIENT_CA_ALIAS: &str = "cordaclientca";
pub const CLIENT_TLS_ALIAS: &str = "cordaclienttls";
pub const ROOT_CA_ALIAS: &str = "cordarootca";
pub const SELF_SIGNED_ALIAS: &str = "selfsignedprivatekey";

/// Lifetime requested for the node CA placeholder and the TLS leaf; both
/// get clamped into the issuer's window at issuance.
const REQUESTED_LIFETIME: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Error type for enrolment. Variants map onto the CLI exit codes.
#[derive(Debug)]
pub enum RegistrationError {
    /// Configuration is unusable (no doorman URL, bad legal name).
    Config(String),
    /// The truststore is missing, unreadable, or has no root entry.
    TrustStore(String),
    /// The doorman rejected the signing request.
    Rejected(String),
    /// The returned chain does not validate against the trusted root.
    ChainValidation(X509Error),
    /// The configured enrolment deadline passed before approval.
    Timeout,
    /// Shutdown was requested while waiting.
    Interrupted,
    /// Credential store failure.
    Store(StoreError),
    /// Doorman protocol violation (not a plain rejection).
    Doorman(DoormanError),
    /// Filesystem failure outside the stores.
    Io(io::Error),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::Config(msg) => write!(f, "configuration invalid: {}", msg),
            RegistrationError::TrustStore(msg) => write!(f, "truststore unusable: {}", msg),
            RegistrationError::Rejected(reason) => {
                write!(f, "certificate request rejected: {}", reason)
            }
            RegistrationError::ChainValidation(e) => {
                write!(f, "doorman chain failed validation: {}", e)
            }
            RegistrationError::Timeout => write!(f, "enrolment timed out"),
            RegistrationError::Interrupted => write!(f, "enrolment interrupted"),
            RegistrationError::Store(e) => write!(f, "credential store failure: {}", e),
            RegistrationError::Doorman(e) => write!(f, "doorman failure: {}", e),
            RegistrationError::Io(e) => write!(f, "I/O failure: {}", e),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrationError::ChainValidation(e) => Some(e),
            RegistrationError::Store(e) => Some(e),
            RegistrationError::Doorman(e) => Some(e),
            RegistrationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RegistrationError {
    fn from(e: StoreError) -> Self {
        RegistrationError::Store(e)
    }
}

impl From<io::Error> for RegistrationError {
    fn from(e: io::Error) -> Self {
        RegistrationError::Io(e)
    }
}

impl From<X509Error> for RegistrationError {
    fn from(e: X509Error) -> Self {
        RegistrationError::ChainValidation(e)
    }
}

/// Explicit enrolment states; one transition per loop iteration.
enum EnrolmentState {
    Start,
    EnsureSelfSigned,
    SubmitOrResume,
    Poll { request_id: String },
    Install { chain: Vec<Vec<u8>> },
    DeriveTls,
    Done,
}

/// Drives enrolment against the doorman. Safe to re-run: a completed
/// enrolment is detected and left untouched.
pub struct RegistrationHandler {
    config: NodeConfig,
    legal_name: LegalName,
    key_password: String,
    doorman: DoormanClient,
    shutdown: CancellationToken,
}

impl RegistrationHandler {
    /// Build a handler. `key_password` protects private-key entries and is
    /// deliberately a separate parameter from the store password.
    pub fn new(
        config: NodeConfig,
        key_password: String,
        shutdown: CancellationToken,
    ) -> Result<Self, RegistrationError> {
        let legal_name = config
            .legal_name()
            .map_err(|e| RegistrationError::Config(e.to_string()))?;
        let url = config
            .doorman_url
            .clone()
            .ok_or_else(|| RegistrationError::Config("doorman_url is not set".to_string()))?;
        let doorman = DoormanClient::new(url).map_err(RegistrationError::Doorman)?;
        Ok(Self {
            config,
            legal_name,
            key_password,
            doorman,
            shutdown,
        })
    }

    fn dir(&self) -> PathBuf {
        self.config.certificates_directory.clone()
    }

    fn request_id_path(&self) -> PathBuf {
        self.dir().join(REQUEST_ID_FILE)
    }

    /// Run the enrolment state machine to completion.
    ///
    /// Idempotent under crash: the file-system state after any interrupt is
    /// sufficient to restart from the correct step.
    pub async fn build_keystore(&self) -> Result<(), RegistrationError> {
        let deadline = self
            .config
            .enrolment_timeout()
            .map(|timeout| Instant::now() + timeout);

        let trusted_root = self.load_trusted_root()?;
        let mut node_store = CredentialStore::load_or_create(
            self.dir().join(NODE_KEYSTORE_FILE),
            self.config.key_store_password.as_bytes(),
        )?;

        let mut state = EnrolmentState::Start;
        loop {
            state = match state {
                EnrolmentState::Start => {
                    if node_store.contains(CLIENT_CA_ALIAS) {
                        if self.tls_leaf_installed()? {
                            info!("node already enrolled; nothing to do");
                            EnrolmentState::Done
                        } else {
                            // A crash between install and TLS derivation
                            // leaves the node CA without a transport leaf.
                            info!("node CA present, deriving missing TLS certificate");
                            EnrolmentState::DeriveTls
                        }
                    } else {
                        EnrolmentState::EnsureSelfSigned
                    }
                }
                EnrolmentState::EnsureSelfSigned => {
                    if !node_store.contains(SELF_SIGNED_ALIAS) {
                        info!(scheme = ?self.config.tls_signature_scheme, "generating node key");
                        let key = ZoneKeyPair::generate(self.config.tls_signature_scheme)?;
                        let cert = x509::create_self_signed_ca(
                            &self.legal_name,
                            CertRole::NodeCa,
                            &key,
                            REQUESTED_LIFETIME,
                        )?;
                        node_store.put_key_entry(
                            SELF_SIGNED_ALIAS,
                            &key.pkcs8_der(),
                            self.key_password.as_bytes(),
                            &[cert],
                        )?;
                        node_store.save(self.config.key_store_password.as_bytes())?;
                        info!("self-signed placeholder stored");
                    }
                    EnrolmentState::SubmitOrResume
                }
                EnrolmentState::SubmitOrResume => {
                    let request_id = match self.read_request_id()? {
                        Some(id) => {
                            info!(request_id = %id, "resuming outstanding signing request");
                            id
                        }
                        None => self.submit_csr(&node_store, deadline).await?,
                    };
                    EnrolmentState::Poll { request_id }
                }
                EnrolmentState::Poll { request_id } => {
                    let chain = self.poll_until_signed(&request_id, deadline).await?;
                    EnrolmentState::Install { chain }
                }
                EnrolmentState::Install { chain } => {
                    self.install_chain(&mut node_store, &trusted_root, chain)?;
                    EnrolmentState::DeriveTls
                }
                EnrolmentState::DeriveTls => {
                    self.derive_tls(&node_store)?;
                    self.delete_request_id();
                    EnrolmentState::Done
                }
                EnrolmentState::Done => {
                    info!("enrolment complete");
                    return Ok(());
                }
            };
        }
    }

    fn load_trusted_root(&self) -> Result<Vec<u8>, RegistrationError> {
        let path = self.dir().join(TRUSTSTORE_FILE);
        if !path.exists() {
            return Err(RegistrationError::TrustStore(format!(
                "truststore not found at {}",
                path.display()
            )));
        }
        let trust = CredentialStore::load(&path, self.config.trust_store_password.as_bytes())
            .map_err(|e| RegistrationError::TrustStore(e.to_string()))?;
        trust
            .certificate(ROOT_CA_ALIAS)
            .map_err(|_| RegistrationError::TrustStore("no root entry in truststore".to_string()))
    }

    fn tls_leaf_installed(&self) -> Result<bool, RegistrationError> {
        let path = self.dir().join(SSL_KEYSTORE_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let ssl = CredentialStore::load(&path, self.config.key_store_password.as_bytes())?;
        Ok(ssl.contains(CLIENT_TLS_ALIAS))
    }

    fn read_request_id(&self) -> Result<Option<String>, RegistrationError> {
        let path = self.request_id_path();
        if !path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&path)?.trim().to_string();
        if id.is_empty() {
            // Treat a truncated file as no submission.
            return Ok(None);
        }
        Ok(Some(id))
    }

    fn write_request_id(&self, id: &str) -> Result<(), RegistrationError> {
        let path = self.request_id_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(id.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn delete_request_id(&self) {
        let path = self.request_id_path();
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(error = %e, "could not delete request id file");
            }
        }
    }

    async fn submit_csr(
        &self,
        node_store: &CredentialStore,
        deadline: Option<Instant>,
    ) -> Result<String, RegistrationError> {
        let (key_der, _) =
            node_store.key_entry(SELF_SIGNED_ALIAS, self.key_password.as_bytes())?;
        let key = ZoneKeyPair::from_pkcs8_der(&key_der)?;
        let csr = x509::create_csr(&self.legal_name, self.config.email_address.as_deref(), &key)?;
        info!(legal_name = %self.legal_name, "submitting certificate signing request");

        loop {
            self.check_deadline(deadline)?;
            match self.doorman.submit_request(&csr).await {
                Ok(id) => {
                    self.write_request_id(&id)?;
                    info!(request_id = %id, "signing request accepted for processing");
                    return Ok(id);
                }
                Err(DoormanError::Transient(msg)) => {
                    warn!(error = %msg, "doorman unreachable, retrying submission");
                    self.sleep(self.config.poll_interval()).await?;
                }
                Err(DoormanError::Rejected(reason)) => return Err(self.rejected(reason)),
                Err(e) => return Err(RegistrationError::Doorman(e)),
            }
        }
    }

    async fn poll_until_signed(
        &self,
        request_id: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<u8>>, RegistrationError> {
        loop {
            self.check_deadline(deadline)?;
            match self.doorman.retrieve_certificates(request_id).await {
                Ok(Some(chain)) => {
                    info!(chain_len = chain.len(), "signed certificate chain received");
                    return Ok(chain);
                }
                Ok(None) => {
                    info!(
                        request_id = %request_id,
                        "certificate not ready yet, polling again in {}s",
                        self.config.poll_interval_secs
                    );
                    self.sleep(self.config.poll_interval()).await?;
                }
                Err(DoormanError::Transient(msg)) => {
                    warn!(error = %msg, "doorman poll failed, retrying");
                    self.sleep(self.config.poll_interval()).await?;
                }
                Err(DoormanError::Rejected(reason)) => {
                    self.delete_request_id();
                    return Err(self.rejected(reason));
                }
                Err(e) => return Err(RegistrationError::Doorman(e)),
            }
        }
    }

    fn rejected(&self, reason: String) -> RegistrationError {
        error!("certificate signing request rejected by the doorman: {}", reason);
        error!("re-check the configured legal name and zone settings; will now terminate");
        RegistrationError::Rejected(reason)
    }

    fn install_chain(
        &self,
        node_store: &mut CredentialStore,
        trusted_root: &[u8],
        chain: Vec<Vec<u8>>,
    ) -> Result<(), RegistrationError> {
        if let Err(e) = x509::validate_chain(trusted_root, &chain) {
            // A chain signed by the wrong zone must leave no trace, and
            // the stale request id would only resume into the same failure.
            self.delete_request_id();
            return Err(RegistrationError::ChainValidation(e));
        }

        let (key_der, _) =
            node_store.key_entry(SELF_SIGNED_ALIAS, self.key_password.as_bytes())?;
        let key = ZoneKeyPair::from_pkcs8_der(&key_der)?;
        let (_, leaf) = X509Certificate::from_der(&chain[0])
            .map_err(|e| RegistrationError::ChainValidation(X509Error::Parse(e.to_string())))?;
        if leaf.public_key().raw != key.public_key_der().as_slice() {
            self.delete_request_id();
            return Err(RegistrationError::ChainValidation(X509Error::Parse(
                "doorman chain leaf does not carry the submitted key".to_string(),
            )));
        }

        node_store.put_key_entry(
            CLIENT_CA_ALIAS,
            &key_der,
            self.key_password.as_bytes(),
            &chain,
        )?;
        node_store.delete(SELF_SIGNED_ALIAS)?;
        node_store.save(self.config.key_store_password.as_bytes())?;
        info!("node CA installed into {}", NODE_KEYSTORE_FILE);
        Ok(())
    }

    fn derive_tls(&self, node_store: &CredentialStore) -> Result<(), RegistrationError> {
        let (ca_key_der, ca_chain) =
            node_store.key_entry(CLIENT_CA_ALIAS, self.key_password.as_bytes())?;
        let ca_key = ZoneKeyPair::from_pkcs8_der(&ca_key_der)?;
        let subject = x509::subject_legal_name(&ca_chain[0])?;

        let tls_key = ZoneKeyPair::generate(self.config.tls_signature_scheme)?;
        let tls_cert = x509::create_certificate(
            CertRole::Tls,
            &ca_chain[0],
            &ca_key,
            &subject,
            &tls_key,
            REQUESTED_LIFETIME,
        )?;

        let mut tls_chain = Vec::with_capacity(ca_chain.len() + 1);
        tls_chain.push(tls_cert);
        tls_chain.extend(ca_chain);

        let mut ssl_store = CredentialStore::load_or_create(
            self.dir().join(SSL_KEYSTORE_FILE),
            self.config.key_store_password.as_bytes(),
        )?;
        ssl_store.put_key_entry(
            CLIENT_TLS_ALIAS,
            &tls_key.pkcs8_der(),
            self.key_password.as_bytes(),
            &tls_chain,
        )?;
        ssl_store.save(self.config.key_store_password.as_bytes())?;
        info!("TLS certificate installed into {}", SSL_KEYSTORE_FILE);
        Ok(())
    }

    fn check_deadline(&self, deadline: Option<Instant>) -> Result<(), RegistrationError> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(RegistrationError::Timeout);
            }
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<(), RegistrationError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RegistrationError::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
