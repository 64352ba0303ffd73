//! HTTP client for the doorman registration authority.
//!
//! Two endpoints: `POST /certificate` submits a PKCS#10 CSR and returns a
//! request id; `GET /certificate/{id}` returns 404/empty while the request
//! is pending, a zip of DER certificates (leaf→root) once approved, or a
//! 4xx with a reason body once rejected.

use std::io::{Cursor, Read};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

/// Zip entry names in the doorman's certificate bundle, leaf to root.
pub const CLIENT_CA_ENTRY: &str = "cordaclientca.cer";
pub const INTERMEDIATE_CA_ENTRY: &str = "cordaintermediateca.cer";
pub const ROOT_CA_ENTRY: &str = "cordarootca.cer";

/// Error type for doorman interactions.
#[derive(Debug, Error)]
pub enum DoormanError {
    /// Network blip or server-side failure; safe to retry after the poll
    /// interval.
    #[error("transient doorman failure: {0}")]
    Transient(String),
    /// The doorman explicitly rejected the signing request.
    #[error("certificate request rejected: {0}")]
    Rejected(String),
    /// The doorman answered with something the protocol does not allow.
    #[error("doorman protocol violation: {0}")]
    Protocol(String),
}

/// Client for the doorman HTTP API.
#[derive(Clone)]
pub struct DoormanClient {
    base: String,
    client: Client,
}

impl DoormanClient {
    pub fn new(base: impl Into<String>) -> Result<Self, DoormanError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DoormanError::Transient(e.to_string()))?;
        Ok(DoormanClient {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Submit a CSR; returns the doorman-issued request id.
    pub async fn submit_request(&self, csr_der: &[u8]) -> Result<String, DoormanError> {
        let url = format!("{}/certificate", self.base);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(csr_der.to_vec())
            .send()
            .await
            .map_err(|e| DoormanError::Transient(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DoormanError::Transient(e.to_string()))?;
        if status.is_success() {
            let request_id = body.trim().to_string();
            if request_id.is_empty() {
                return Err(DoormanError::Protocol(
                    "empty request id in submission response".to_string(),
                ));
            }
            debug!(request_id = %request_id, "CSR submitted");
            Ok(request_id)
        } else if status.is_client_error() {
            Err(DoormanError::Rejected(reason_or_status(status, body)))
        } else {
            Err(DoormanError::Transient(reason_or_status(status, body)))
        }
    }

    /// Poll for the signed chain. `Ok(None)` means still pending.
    pub async fn retrieve_certificates(
        &self,
        request_id: &str,
    ) -> Result<Option<Vec<Vec<u8>>>, DoormanError> {
        let url = format!("{}/certificate/{}", self.base, request_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DoormanError::Transient(e.to_string()))?;
        let status = resp.status();
        match status {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| DoormanError::Transient(e.to_string()))?;
                if bytes.is_empty() {
                    return Ok(None);
                }
                chain_from_zip(&bytes).map(Some)
            }
            s if s.is_client_error() => {
                let body = resp.text().await.unwrap_or_default();
                Err(DoormanError::Rejected(reason_or_status(s, body)))
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(DoormanError::Transient(reason_or_status(s, body)))
            }
        }
    }
}

fn reason_or_status(status: StatusCode, body: String) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        body.to_string()
    }
}

/// Extract the leaf→root chain from the doorman's zip bundle.
fn chain_from_zip(bytes: &[u8]) -> Result<Vec<Vec<u8>>, DoormanError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| DoormanError::Protocol(format!("certificate bundle is not a zip: {}", e)))?;

    let mut chain = Vec::with_capacity(3);
    for (name, required) in [
        (CLIENT_CA_ENTRY, true),
        (INTERMEDIATE_CA_ENTRY, false),
        (ROOT_CA_ENTRY, true),
    ] {
        match archive.by_name(name) {
            Ok(mut entry) => {
                let mut der = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut der)
                    .map_err(|e| DoormanError::Protocol(format!("bad zip entry {}: {}", name, e)))?;
                if der.is_empty() {
                    return Err(DoormanError::Protocol(format!("empty zip entry {}", name)));
                }
                chain.push(der);
            }
            Err(zip::result::ZipError::FileNotFound) if !required => {}
            Err(e) => {
                return Err(DoormanError::Protocol(format!(
                    "missing zip entry {}: {}",
                    name, e
                )))
            }
        }
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_chain_from_zip_with_intermediate() {
        let bytes = bundle(&[
            (CLIENT_CA_ENTRY, b"leaf"),
            (INTERMEDIATE_CA_ENTRY, b"mid"),
            (ROOT_CA_ENTRY, b"root"),
        ]);
        let chain = chain_from_zip(&bytes).unwrap();
        assert_eq!(chain, vec![b"leaf".to_vec(), b"mid".to_vec(), b"root".to_vec()]);
    }

    #[test]
    fn test_chain_from_zip_without_intermediate() {
        let bytes = bundle(&[(CLIENT_CA_ENTRY, b"leaf"), (ROOT_CA_ENTRY, b"root")]);
        let chain = chain_from_zip(&bytes).unwrap();
        assert_eq!(chain, vec![b"leaf".to_vec(), b"root".to_vec()]);
    }

    #[test]
    fn test_chain_from_zip_missing_required_entry() {
        let bytes = bundle(&[(CLIENT_CA_ENTRY, b"leaf")]);
        assert!(matches!(
            chain_from_zip(&bytes),
            Err(DoormanError::Protocol(_))
        ));
    }

    #[test]
    fn test_chain_from_zip_garbage() {
        assert!(matches!(
            chain_from_zip(b"not a zip"),
            Err(DoormanError::Protocol(_))
        ));
    }
}
