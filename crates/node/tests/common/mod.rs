//! Shared test harness: a zone certificate fixture and an in-process
//! doorman speaking the registration HTTP API over a plain TCP listener.
//!
//! Compiled once per integration test binary; not every binary uses
//! every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write as _};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, CustomExtension, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use zip::write::SimpleFileOptions;

use zoneport_common::{CertRole, LegalName, SignatureScheme};
use zoneport_node::credential_store::CredentialStore;
use zoneport_node::registration::{ROOT_CA_ALIAS, TRUSTSTORE_FILE};
use zoneport_node::tls::TlsMaterial;
use zoneport_node::x509::{create_certificate, create_self_signed_ca, ZoneKeyPair};

pub const STORE_PASSWORD: &str = "storepass";
pub const KEY_PASSWORD: &str = "keypass";
pub const TRUST_PASSWORD: &str = "trustpass";

const TEN_YEARS: Duration = Duration::from_secs(10 * 365 * 86_400);

/// A zone: one root CA that both the doorman and the trust stores use.
pub struct ZoneFixture {
    pub root_key: ZoneKeyPair,
    pub root_der: Vec<u8>,
}

impl ZoneFixture {
    pub fn new() -> Self {
        let root_name = LegalName::new("Zone Root", "Zurich", "CH")
            .unwrap()
            .with_common_name("Zone Root CA")
            .unwrap();
        let root_key = ZoneKeyPair::generate(SignatureScheme::EcdsaP256Sha256).unwrap();
        let root_der =
            create_self_signed_ca(&root_name, CertRole::RootCa, &root_key, TEN_YEARS).unwrap();
        Self { root_key, root_der }
    }

    /// Write a truststore holding this zone's root under `dir`.
    pub fn write_truststore(&self, dir: &Path) {
        let mut trust =
            CredentialStore::load_or_create(dir.join(TRUSTSTORE_FILE), TRUST_PASSWORD.as_bytes())
                .unwrap();
        trust.put_trusted_certificate(ROOT_CA_ALIAS, &self.root_der);
        trust.save(TRUST_PASSWORD.as_bytes()).unwrap();
    }

    /// Issue a full node identity (node CA + TLS leaf) directly, for
    /// channel tests that do not exercise enrolment.
    pub fn tls_material_for(&self, name: &LegalName) -> TlsMaterial {
        let node_key = ZoneKeyPair::generate(SignatureScheme::EcdsaP256Sha256).unwrap();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &self.root_der,
            &self.root_key,
            name,
            &node_key,
            TEN_YEARS,
        )
        .unwrap();
        let tls_key = ZoneKeyPair::generate(SignatureScheme::EcdsaP256Sha256).unwrap();
        let tls_cert = create_certificate(
            CertRole::Tls,
            &node_ca,
            &node_key,
            name,
            &tls_key,
            TEN_YEARS,
        )
        .unwrap();
        TlsMaterial {
            cert_chain: vec![
                tls_cert.into(),
                node_ca.into(),
                self.root_der.clone().into(),
            ],
            key: rustls::pki_types::PrivateKeyDer::Pkcs8(
                rustls::pki_types::PrivatePkcs8KeyDer::from(tls_key.pkcs8_der()),
            ),
            trusted_root_der: self.root_der.clone(),
        }
    }
}

/// Knobs for the doorman's behaviour, adjustable mid-test.
#[derive(Debug, Clone)]
pub struct DoormanBehaviour {
    /// How many polls return "not ready" before the chain is served.
    pub pending_polls: u32,
    /// When set, every poll is rejected with this reason.
    pub reject_with: Option<String>,
}

impl Default for DoormanBehaviour {
    fn default() -> Self {
        Self {
            pending_polls: 0,
            reject_with: None,
        }
    }
}

struct DoormanState {
    behaviour: DoormanBehaviour,
    /// request id → submitted CSR DER.
    submissions: HashMap<String, Vec<u8>>,
    polls: HashMap<String, u32>,
    next_id: u64,
}

/// An in-process doorman. Signs node CAs with its own root key, which may
/// or may not be the root the node trusts.
pub struct TestDoorman {
    pub url: String,
    state: Arc<Mutex<DoormanState>>,
    task: JoinHandle<()>,
}

impl TestDoorman {
    pub async fn start(signing_key_pkcs8: Vec<u8>, signing_root_der: Vec<u8>) -> Self {
        Self::start_with(signing_key_pkcs8, signing_root_der, DoormanBehaviour::default()).await
    }

    pub async fn start_with(
        signing_key_pkcs8: Vec<u8>,
        signing_root_der: Vec<u8>,
        behaviour: DoormanBehaviour,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DoormanState {
            behaviour,
            submissions: HashMap::new(),
            polls: HashMap::new(),
            next_id: 1,
        }));
        let task = tokio::spawn(serve(
            listener,
            state.clone(),
            signing_key_pkcs8,
            signing_root_der,
        ));
        Self {
            url: format!("http://{}", addr),
            state,
            task,
        }
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn set_behaviour(&self, behaviour: DoormanBehaviour) {
        self.state.lock().behaviour = behaviour;
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<Mutex<DoormanState>>,
    signing_key_pkcs8: Vec<u8>,
    signing_root_der: Vec<u8>,
) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let state = state.clone();
        let key = signing_key_pkcs8.clone();
        let root = signing_root_der.clone();
        tokio::spawn(async move {
            let _ = handle_request(socket, state, key, root).await;
        });
    }
}

async fn handle_request(
    mut socket: TcpStream,
    state: Arc<Mutex<DoormanState>>,
    signing_key_pkcs8: Vec<u8>,
    signing_root_der: Vec<u8>,
) -> std::io::Result<()> {
    let (head, body) = read_http_request(&mut socket).await?;
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let response = match (method.as_str(), path.as_str()) {
        ("POST", "/certificate") => {
            let id = {
                let mut state = state.lock();
                let id = format!("req-{}", state.next_id);
                state.next_id += 1;
                state.submissions.insert(id.clone(), body);
                id
            };
            plain_response("200 OK", "text/plain", id.into_bytes())
        }
        ("GET", path) if path.starts_with("/certificate/") => {
            let id = path.trim_start_matches("/certificate/").to_string();
            poll_response(&state, &id, &signing_key_pkcs8, &signing_root_der)
        }
        _ => plain_response("404 Not Found", "text/plain", b"not found".to_vec()),
    };
    socket.write_all(&response).await?;
    socket.shutdown().await
}

fn poll_response(
    state: &Arc<Mutex<DoormanState>>,
    id: &str,
    signing_key_pkcs8: &[u8],
    signing_root_der: &[u8],
) -> Vec<u8> {
    let csr = {
        let mut state = state.lock();
        if let Some(reason) = state.behaviour.reject_with.clone() {
            state.submissions.remove(id);
            return plain_response("403 Forbidden", "text/plain", reason.into_bytes());
        }
        let Some(csr) = state.submissions.get(id).cloned() else {
            return plain_response("404 Not Found", "text/plain", Vec::new());
        };
        let polls = state.polls.entry(id.to_string()).or_insert(0);
        *polls += 1;
        if *polls <= state.behaviour.pending_polls {
            return plain_response("404 Not Found", "text/plain", Vec::new());
        }
        csr
    };

    let client_ca = issue_node_ca(&csr, signing_key_pkcs8, signing_root_der);
    let bundle = certificate_bundle(&client_ca, signing_root_der);
    plain_response("200 OK", "application/zip", bundle)
}

/// Sign the CSR into a node CA certificate, the way the real doorman
/// does: CA constraints, signing usages, and the node-CA role marker.
fn issue_node_ca(csr_der: &[u8], signing_key_pkcs8: &[u8], signing_root_der: &[u8]) -> Vec<u8> {
    let csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into()).unwrap();
    let mut csr = csr;
    csr.params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    csr.params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    csr.params.custom_extensions = vec![CustomExtension::from_oid_content(
        &[1, 3, 6, 1, 4, 1, 50530, 1, 1],
        vec![0x02, 0x01, CertRole::NodeCa.code()],
    )];
    let now = time::OffsetDateTime::now_utc();
    csr.params.not_before = now;
    csr.params.not_after = now + time::Duration::days(365);

    let issuer_key = KeyPair::try_from(signing_key_pkcs8).unwrap();
    let issuer_params =
        CertificateParams::from_ca_cert_der(&signing_root_der.to_vec().into()).unwrap();
    let issuer_cert = issuer_params.self_signed(&issuer_key).unwrap();
    csr.signed_by(&issuer_cert, &issuer_key).unwrap().der().to_vec()
}

fn certificate_bundle(client_ca: &[u8], root: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("cordaclientca.cer", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(client_ca).unwrap();
    writer
        .start_file("cordarootca.cer", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(root).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn read_http_request(socket: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok((head, body))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn plain_response(status: &str, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

/// A free 127.0.0.1 address, found by binding port 0.
pub async fn free_local_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
