//! End-to-end enrolment scenarios against an in-process doorman.
//!
//! Covers the happy path, idempotent re-runs, the wrong-root zone,
//! explicit rejection, interrupted-and-resumed flows, and the optional
//! enrolment deadline.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::{FromDer, X509Certificate};

use common::{DoormanBehaviour, TestDoorman, ZoneFixture, KEY_PASSWORD, STORE_PASSWORD, TRUST_PASSWORD};
use zoneport_common::NodeConfig;
use zoneport_node::credential_store::CredentialStore;
use zoneport_node::registration::{
    RegistrationError, RegistrationHandler, CLIENT_CA_ALIAS, CLIENT_TLS_ALIAS, NODE_KEYSTORE_FILE,
    REQUEST_ID_FILE, SELF_SIGNED_ALIAS, SSL_KEYSTORE_FILE,
};
use zoneport_node::x509;

fn node_config(dir: &TempDir, doorman_url: &str) -> NodeConfig {
    let toml = format!(
        r#"
            my_legal_name = "O=Alice Corp, L=London, C=GB"
            email_address = "ops@alice.example"
            certificates_directory = "{}"
            key_store_password = "{}"
            trust_store_password = "{}"
            doorman_url = "{}"
            poll_interval_secs = 1
        "#,
        dir.path().display(),
        STORE_PASSWORD,
        TRUST_PASSWORD,
        doorman_url,
    );
    let config: NodeConfig = toml::from_str(&toml).expect("config parses");
    config.validate().expect("config valid");
    config
}

fn handler(config: NodeConfig) -> RegistrationHandler {
    RegistrationHandler::new(config, KEY_PASSWORD.to_string(), CancellationToken::new())
        .expect("handler builds")
}

#[tokio::test]
async fn test_correct_enrolment_installs_both_stores() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start(zone.root_key.pkcs8_der(), zone.root_der.clone()).await;
    let dir = TempDir::new().unwrap();
    zone.write_truststore(dir.path());

    let config = node_config(&dir, &doorman.url);
    handler(config).build_keystore().await.expect("enrolment succeeds");

    assert!(dir.path().join(NODE_KEYSTORE_FILE).exists());
    assert!(dir.path().join(SSL_KEYSTORE_FILE).exists());
    assert!(!dir.path().join(REQUEST_ID_FILE).exists());

    let node_store = CredentialStore::load(
        dir.path().join(NODE_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap();
    assert!(node_store.contains(CLIENT_CA_ALIAS));
    assert!(!node_store.contains(SELF_SIGNED_ALIAS));
    let (_, ca_chain) = node_store.key_entry(CLIENT_CA_ALIAS, KEY_PASSWORD.as_bytes()).unwrap();
    x509::validate_chain(&zone.root_der, &ca_chain).expect("installed chain validates");

    let ssl_store = CredentialStore::load(
        dir.path().join(SSL_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap();
    let (_, tls_chain) = ssl_store
        .key_entry(CLIENT_TLS_ALIAS, KEY_PASSWORD.as_bytes())
        .unwrap();
    x509::validate_chain(&zone.root_der, &tls_chain).expect("TLS chain validates");

    // The TLS leaf is issued by the node CA: issuer subject equality.
    let (_, tls_leaf) = X509Certificate::from_der(&tls_chain[0]).unwrap();
    let (_, node_ca) = X509Certificate::from_der(&ca_chain[0]).unwrap();
    assert_eq!(tls_leaf.issuer().as_raw(), node_ca.subject().as_raw());
    doorman.stop();
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start(zone.root_key.pkcs8_der(), zone.root_der.clone()).await;
    let dir = TempDir::new().unwrap();
    zone.write_truststore(dir.path());
    let config = node_config(&dir, &doorman.url);

    handler(config.clone()).build_keystore().await.unwrap();
    let chain_before = CredentialStore::load(
        dir.path().join(NODE_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap()
    .chain(CLIENT_CA_ALIAS)
    .unwrap();

    handler(config).build_keystore().await.expect("re-run succeeds");

    let chain_after = CredentialStore::load(
        dir.path().join(NODE_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap()
    .chain(CLIENT_CA_ALIAS)
    .unwrap();
    assert_eq!(chain_before, chain_after, "re-run must not touch the stores");
    assert_eq!(doorman.submission_count(), 1, "re-run must not resubmit");
    doorman.stop();
}

#[tokio::test]
async fn test_wrong_root_chain_is_not_installed() {
    let trusted_zone = ZoneFixture::new();
    let rogue_zone = ZoneFixture::new();
    // The doorman signs with a root the node does not trust.
    let doorman =
        TestDoorman::start(rogue_zone.root_key.pkcs8_der(), rogue_zone.root_der.clone()).await;
    let dir = TempDir::new().unwrap();
    trusted_zone.write_truststore(dir.path());

    let config = node_config(&dir, &doorman.url);
    let err = handler(config).build_keystore().await.unwrap_err();
    assert!(matches!(err, RegistrationError::ChainValidation(_)));

    let node_store = CredentialStore::load(
        dir.path().join(NODE_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap();
    assert!(!node_store.contains(CLIENT_CA_ALIAS));
    assert!(!dir.path().join(SSL_KEYSTORE_FILE).exists());
    assert!(
        !dir.path().join(REQUEST_ID_FILE).exists(),
        "request id must be deleted after an untrusted chain"
    );
    doorman.stop();
}

#[tokio::test]
async fn test_rejection_deletes_request_id() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start_with(
        zone.root_key.pkcs8_der(),
        zone.root_der.clone(),
        DoormanBehaviour {
            pending_polls: 0,
            reject_with: Some("legal name collides with an existing member".to_string()),
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    zone.write_truststore(dir.path());

    let config = node_config(&dir, &doorman.url);
    let err = handler(config).build_keystore().await.unwrap_err();
    match err {
        RegistrationError::Rejected(reason) => {
            assert!(reason.contains("legal name collides"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(!dir.path().join(REQUEST_ID_FILE).exists());
    doorman.stop();
}

#[tokio::test]
async fn test_interrupted_poll_resumes_with_same_request() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start_with(
        zone.root_key.pkcs8_der(),
        zone.root_der.clone(),
        DoormanBehaviour {
            pending_polls: u32::MAX,
            reject_with: None,
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    zone.write_truststore(dir.path());
    let config = node_config(&dir, &doorman.url);

    // First run: cancel while polling, as a stand-in for a crash.
    let shutdown = CancellationToken::new();
    let first = RegistrationHandler::new(
        config.clone(),
        KEY_PASSWORD.to_string(),
        shutdown.clone(),
    )
    .unwrap();
    let run = tokio::spawn(async move { first.build_keystore().await });
    tokio::time::sleep(Duration::from_millis(600)).await;
    shutdown.cancel();
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, RegistrationError::Interrupted));
    assert!(
        dir.path().join(REQUEST_ID_FILE).exists(),
        "interrupt must not lose the outstanding request id"
    );

    // Approval arrives; a fresh run resumes the same request and the
    // same key rather than submitting a second CSR.
    doorman.set_behaviour(DoormanBehaviour::default());
    handler(config).build_keystore().await.expect("resume succeeds");
    assert_eq!(doorman.submission_count(), 1);

    let node_store = CredentialStore::load(
        dir.path().join(NODE_KEYSTORE_FILE),
        STORE_PASSWORD.as_bytes(),
    )
    .unwrap();
    assert!(node_store.contains(CLIENT_CA_ALIAS));
    assert!(!node_store.contains(SELF_SIGNED_ALIAS));
    doorman.stop();
}

#[tokio::test]
async fn test_enrolment_timeout_is_fatal() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start_with(
        zone.root_key.pkcs8_der(),
        zone.root_der.clone(),
        DoormanBehaviour {
            pending_polls: u32::MAX,
            reject_with: None,
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    zone.write_truststore(dir.path());

    let mut config = node_config(&dir, &doorman.url);
    config.enrolment_timeout_secs = Some(2);
    let err = handler(config).build_keystore().await.unwrap_err();
    assert!(matches!(err, RegistrationError::Timeout));
    doorman.stop();
}

#[tokio::test]
async fn test_missing_truststore_aborts() {
    let zone = ZoneFixture::new();
    let doorman = TestDoorman::start(zone.root_key.pkcs8_der(), zone.root_der.clone()).await;
    let dir = TempDir::new().unwrap();
    // No truststore written.
    let config = node_config(&dir, &doorman.url);
    let err = handler(config).build_keystore().await.unwrap_err();
    assert!(matches!(err, RegistrationError::TrustStore(_)));
    doorman.stop();
}
