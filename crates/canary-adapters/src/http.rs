//! HTTP storage backends: a Codex node, the Pinata pinning service and an IPFS
//! (kubo) node.

use async_trait::async_trait;
use canary_core::{
    CanaryError, ContentLocator, ProgressSink, StorageBackend, StorageProvider, StoredObject,
};
use futures_util::{stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const PINATA_API_URL: &str = "https://api.pinata.cloud";
pub const DEFAULT_IPFS_GATEWAY: &str = "https://gateway.pinata.cloud";

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

fn build_client(timeout: Duration) -> Result<Client, CanaryError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CanaryError::Fatal(format!("http client: {}", e)))
}

fn transport_error(provider: StorageProvider, err: reqwest::Error) -> CanaryError {
    if err.is_builder() {
        return CanaryError::Invalid(format!("{} request could not be built: {}", provider, err));
    }
    CanaryError::Transient(format!("{} request failed: {}", provider, err))
}

/// Streaming request body plus a channel of cumulative byte counts, sent as
/// the transport pulls each chunk.
fn metered_body(payload: &[u8]) -> (Body, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let chunks: Vec<Vec<u8>> = payload.chunks(UPLOAD_CHUNK_BYTES).map(<[u8]>::to_vec).collect();
    let mut pulled = 0u64;
    let chunks = stream::iter(chunks).map(move |chunk| {
        pulled += chunk.len() as u64;
        let _ = tx.send(pulled);
        Ok::<_, std::io::Error>(chunk)
    });
    (Body::wrap_stream(chunks), rx)
}

/// Drive `request` while forwarding upload progress to `progress`.
async fn with_progress<F: Future>(
    request: F,
    mut pulled: mpsc::UnboundedReceiver<u64>,
    total: u64,
    progress: &dyn ProgressSink,
) -> F::Output {
    tokio::pin!(request);
    loop {
        tokio::select! {
            out = &mut request => {
                while let Ok(sent) = pulled.try_recv() {
                    progress.report(sent, total);
                }
                return out;
            }
            Some(sent) = pulled.recv() => progress.report(sent, total),
        }
    }
}

/// `Content-Disposition` value with a quoted ASCII fallback and an RFC 5987
/// `filename*` carrying the exact UTF-8 name.
pub(crate) fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c == ' ' || c.is_ascii_graphic()) && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded: String = name
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
                char::from(b).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect();
    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}

fn metered_part(payload: &[u8], name: &str) -> (Part, mpsc::UnboundedReceiver<u64>) {
    let (body, pulled) = metered_body(payload);
    let part = Part::stream_with_length(body, payload.len() as u64).file_name(name.to_string());
    (part, pulled)
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(
    provider: StorageProvider,
    status: StatusCode,
    body: &str,
) -> CanaryError {
    let detail = format!("{} returned {}: {}", provider, status.as_u16(), body.trim());
    match status {
        StatusCode::NOT_FOUND => CanaryError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CanaryError::Fatal(detail),
        StatusCode::PAYMENT_REQUIRED => CanaryError::ResourceExhausted {
            resource: format!("{} quota", provider),
            remediation: "upgrade the plan or free pinned storage".to_string(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            CanaryError::Transient(detail)
        }
        s if s.is_server_error() => CanaryError::Transient(detail),
        _ => CanaryError::Invalid(detail),
    }
}

async fn expect_success(
    provider: StorageProvider,
    response: Response,
) -> Result<Response, CanaryError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(status_error(provider, status, &body))
    }
}

/// A Codex node's data API answers an upload with the bare CID.
pub(crate) fn parse_codex_cid(body: &str) -> Result<String, CanaryError> {
    let cid = body.trim();
    if cid.is_empty() || cid.contains(char::is_whitespace) {
        return Err(CanaryError::Fatal(format!(
            "codex returned an unusable content id '{}'",
            cid
        )));
    }
    Ok(cid.to_string())
}

#[derive(Debug, Deserialize)]
struct PinataPin {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
    #[serde(rename = "PinSize")]
    pin_size: u64,
}

pub(crate) fn parse_pinata_pin(body: &str) -> Result<(String, u64), CanaryError> {
    let pin: PinataPin = serde_json::from_str(body)?;
    Ok((pin.ipfs_hash, pin.pin_size))
}

#[derive(Debug, Deserialize)]
struct IpfsAdded {
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size")]
    size: String,
}

/// kubo reports the size as a decimal string.
pub(crate) fn parse_ipfs_add(body: &str) -> Result<(String, u64), CanaryError> {
    let added: IpfsAdded = serde_json::from_str(body.lines().last().unwrap_or_default())?;
    let size = added
        .size
        .parse()
        .map_err(|_| CanaryError::Fatal(format!("ipfs reported size '{}'", added.size)))?;
    Ok((added.hash, size))
}

/// Codex decentralized storage node.
#[derive(Debug, Clone)]
pub struct CodexBackend {
    client: Client,
    base_url: String,
}

impl CodexBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CanaryError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for CodexBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Codex
    }

    async fn upload(
        &self,
        payload: &[u8],
        name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError> {
        let url = format!("{}/api/codex/v1/data", self.base_url);
        let total = payload.len() as u64;
        let (body, pulled) = metered_body(payload);
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Disposition", content_disposition(name))
            .body(body)
            .send();
        let response = with_progress(request, pulled, total, progress)
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let body = expect_success(self.provider(), response)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;

        let cid = parse_codex_cid(&body)?;
        debug!(file = name, cid = %cid, "uploaded to codex");
        Ok(StoredObject {
            locator: ContentLocator::new(self.provider().scheme(), cid)?,
            size: total,
        })
    }

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        let url = format!(
            "{}/api/codex/v1/data/{}/network/stream",
            self.base_url,
            locator.content_id()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let bytes = expect_success(self.provider(), response)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        Ok(bytes.to_vec())
    }
}

/// Pinata IPFS pinning service, authenticated with a JWT.
#[derive(Debug, Clone)]
pub struct PinataBackend {
    client: Client,
    api_url: String,
    jwt: String,
    gateway: String,
}

impl PinataBackend {
    pub fn new(
        jwt: impl Into<String>,
        gateway: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CanaryError> {
        let jwt = jwt.into();
        if jwt.trim().is_empty() {
            return Err(CanaryError::Fatal("pinata JWT is empty".to_string()));
        }
        Ok(Self {
            client: build_client(timeout)?,
            api_url: PINATA_API_URL.to_string(),
            jwt,
            gateway: gateway.unwrap_or(DEFAULT_IPFS_GATEWAY).trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for PinataBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Pinata
    }

    async fn upload(
        &self,
        payload: &[u8],
        name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError> {
        let (part, pulled) = metered_part(payload, name);
        let form = Form::new()
            .part("file", part)
            .text("pinataMetadata", serde_json::json!({ "name": name }).to_string());
        let request = self
            .client
            .post(format!("{}/pinning/pinFileToIPFS", self.api_url))
            .bearer_auth(&self.jwt)
            .multipart(form)
            .send();
        let response = with_progress(request, pulled, payload.len() as u64, progress)
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let body = expect_success(self.provider(), response)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;

        let (cid, size) = parse_pinata_pin(&body)?;
        debug!(file = name, cid = %cid, "pinned on pinata");
        Ok(StoredObject {
            locator: ContentLocator::new(self.provider().scheme(), cid)?,
            size,
        })
    }

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        let url = locator.gateway_url(&self.gateway).ok_or_else(|| {
            CanaryError::Invalid(format!("{} is not an ipfs locator", locator))
        })?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let bytes = expect_success(self.provider(), response)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        Ok(bytes.to_vec())
    }
}

/// IPFS node reached through its RPC API.
#[derive(Debug, Clone)]
pub struct IpfsBackend {
    client: Client,
    api_url: String,
}

impl IpfsBackend {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, CanaryError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for IpfsBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Ipfs
    }

    async fn upload(
        &self,
        payload: &[u8],
        name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError> {
        let (part, pulled) = metered_part(payload, name);
        let request = self
            .client
            .post(format!("{}/api/v0/add?pin=true", self.api_url))
            .multipart(Form::new().part("file", part))
            .send();
        let response = with_progress(request, pulled, payload.len() as u64, progress)
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let body = expect_success(self.provider(), response)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;

        let (cid, size) = parse_ipfs_add(&body)?;
        debug!(file = name, cid = %cid, "added to ipfs");
        Ok(StoredObject {
            locator: ContentLocator::new(self.provider().scheme(), cid)?,
            size,
        })
    }

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        let response = self
            .client
            .post(format!("{}/api/v0/cat", self.api_url))
            .query(&[("arg", locator.content_id())])
            .send()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        let bytes = expect_success(self.provider(), response)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(self.provider(), e))?;
        Ok(bytes.to_vec())
    }
}
