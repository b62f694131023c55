use crate::api_client::{with_retries, CancelSignal, FetchError, REQUEST_TIMEOUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Computes the CIDv0 of a document: base58btc of the sha2-256
/// multihash. Pure and deterministic, no network I/O — this is what
/// lets the on-chain pointer be registered in the same transaction that
/// records the content hash, before the upload happens.
pub fn calculate_cid(document: &str) -> String {
    let digest = Sha256::digest(document.as_bytes());
    // multihash prefix: sha2-256 (0x12), 32 bytes (0x20)
    let mut multihash = Vec::with_capacity(34);
    multihash.push(0x12);
    multihash.push(0x20);
    multihash.extend_from_slice(&digest);
    base58_encode(&multihash)
}

fn base58_encode(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::new();
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = bytes.iter().take_while(|&&b| b == 0).count();
    let mut encoded = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        encoded.push('1');
    }
    for &digit in digits.iter().rev() {
        encoded.push(BASE58_ALPHABET[digit as usize] as char);
    }
    encoded
}

/// Metadata sent alongside an upload. Carries the pre-computed cid so
/// the pre-registered on-chain pointer and the actual storage location
/// stay consistent.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub qci: u64,
    pub title: String,
    pub cid: String,
}

/// The content-addressed off-chain store, authoritative for the full
/// document body.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Uploads a document and returns the identifier the store assigned.
    /// Under normal operation this matches [`calculate_cid`].
    async fn upload(&self, document: &str, metadata: &UploadMetadata)
        -> Result<String, FetchError>;

    /// Fetches a document by its `ipfs://` url (or bare cid).
    async fn fetch(&self, ipfs_url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    cid: String,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    content: &'a str,
    metadata: &'a UploadMetadata,
}

/// HTTP client for the pinning service and public gateway.
pub struct IpfsClient {
    client: reqwest::Client,
    upload_endpoint: String,
    gateway: String,
}

impl IpfsClient {
    pub fn new(upload_endpoint: String, gateway: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            upload_endpoint,
            gateway,
        }
    }

    fn gateway_url(&self, ipfs_url: &str) -> String {
        let cid = ipfs_url.strip_prefix("ipfs://").unwrap_or(ipfs_url);
        format!("{}/ipfs/{}", self.gateway.trim_end_matches('/'), cid)
    }
}

#[async_trait]
impl ContentStore for IpfsClient {
    async fn upload(
        &self,
        document: &str,
        metadata: &UploadMetadata,
    ) -> Result<String, FetchError> {
        let response: UploadResponse = with_retries(CancelSignal::never(), |_| async {
            let res = self
                .client
                .post(&self.upload_endpoint)
                .json(&UploadRequest {
                    content: document,
                    metadata,
                })
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            if res.status().is_client_error() {
                return Err(FetchError::InvalidInput(format!(
                    "upload rejected: {}",
                    res.status()
                )));
            }
            res.error_for_status()
                .map_err(|e| FetchError::Network(e.to_string()))?
                .json::<UploadResponse>()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))
        })
        .await?;

        debug!(qci = metadata.qci, cid = %response.cid, "document uploaded");
        Ok(response.cid)
    }

    async fn fetch(&self, ipfs_url: &str) -> Result<String, FetchError> {
        let url = self.gateway_url(ipfs_url);
        with_retries(CancelSignal::never(), |_| async {
            let res = self
                .client
                .get(&url)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            res.error_for_status()
                .map_err(|e| FetchError::Network(e.to_string()))?
                .text()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_is_deterministic() {
        let doc = "---\nqci: 1\n---\n\nbody\n";
        assert_eq!(calculate_cid(doc), calculate_cid(doc));
        assert_ne!(calculate_cid(doc), calculate_cid("other"));
    }

    #[test]
    fn cid_has_the_v0_shape() {
        // CIDv0 is always 46 characters starting with Qm
        let cid = calculate_cid("hello");
        assert_eq!(cid.len(), 46);
        assert!(cid.starts_with("Qm"));
    }

    #[test]
    fn cid_matches_known_vector() {
        // base58btc(0x12 0x20 || sha2-256("hello world\n"))
        assert_eq!(
            calculate_cid("hello world\n"),
            "QmZjTnYw2TFhn9Nn7tjmPSoTBoY7YRkwPzwSrSbabY24Kp"
        );
    }

    #[test]
    fn base58_preserves_leading_zero_bytes() {
        assert_eq!(base58_encode(&[0, 0, 1]), "112");
        assert_eq!(base58_encode(&[0]), "1");
    }

    #[test]
    fn gateway_url_accepts_prefixed_and_bare_cids() {
        let client = IpfsClient::new(
            "https://up.example".to_string(),
            "https://gw.example/".to_string(),
        );
        assert_eq!(
            client.gateway_url("ipfs://QmAbc"),
            "https://gw.example/ipfs/QmAbc"
        );
        assert_eq!(
            client.gateway_url("QmAbc"),
            "https://gw.example/ipfs/QmAbc"
        );
    }

    #[tokio::test]
    async fn upload_round_trips_through_the_pinning_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"cid": "QmStored"}"#)
            .create_async()
            .await;

        let client = IpfsClient::new(format!("{}/upload", server.url()), server.url());
        let cid = client
            .upload(
                "doc",
                &UploadMetadata {
                    qci: 1,
                    title: "t".to_string(),
                    cid: "QmExpected".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(cid, "QmStored");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_from_the_store_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let client = IpfsClient::new(format!("{}/upload", server.url()), server.url());
        let result = client
            .upload(
                "doc",
                &UploadMetadata {
                    qci: 1,
                    title: "t".to_string(),
                    cid: "QmExpected".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(FetchError::InvalidInput(_))));
        mock.assert_async().await;
    }
}
