//! Remote side of the sync: manifest and content-addressed blobs.

use crate::error::{IndexError, Result};
use crate::manifest::Manifest;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Source of the published index.
#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Fails with `ManifestUnavailable` when the manifest cannot be fetched.
    async fn fetch_manifest(&self) -> Result<Manifest>;

    /// Raw bytes of the blob with the given content hash. Verification is the
    /// caller's job.
    async fn fetch_blob(&self, hash: &str) -> Result<Vec<u8>>;
}

/// HTTP gateway serving blobs as `{gateway}/{hash}`.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    gateway: String,
    manifest_url: String,
}

impl GatewayClient {
    pub fn new(gateway: &str, manifest_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| IndexError::InvariantViolation(format!("http client: {err}")))?;
        Ok(Self {
            client,
            gateway: gateway.trim_end_matches('/').to_string(),
            manifest_url: manifest_url.to_string(),
        })
    }

    pub fn blob_url(&self, hash: &str) -> String {
        format!("{}/{hash}", self.gateway)
    }

    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, GetError> {
        let response = self.client.get(url).send().await.map_err(GetError::from)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(GetError::Failed(format!("{url} returned {status}")));
        }
        let body = response.bytes().await.map_err(GetError::from)?;
        Ok(body.to_vec())
    }
}

/// Transport failures split by whether the host answered at all.
#[derive(Debug)]
enum GetError {
    /// Connect or name resolution failed.
    Unreachable(String),
    Failed(String),
}

impl From<reqwest::Error> for GetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl GetError {
    fn into_reason(self) -> String {
        match self {
            Self::Unreachable(reason) | Self::Failed(reason) => reason,
        }
    }
}

#[async_trait]
impl RemoteIndex for GatewayClient {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        tracing::debug!(url = %self.manifest_url, "fetching manifest");
        let body = self
            .get(&self.manifest_url)
            .await
            .map_err(|err| IndexError::ManifestUnavailable(err.into_reason()))?;
        Manifest::from_json(&body)
    }

    async fn fetch_blob(&self, hash: &str) -> Result<Vec<u8>> {
        let url = self.blob_url(hash);
        self.get(&url).await.map_err(|err| match err {
            GetError::Unreachable(reason) => IndexError::RemoteUnreachable { url, reason },
            GetError::Failed(reason) => IndexError::DownloadFailed {
                hash: hash.to_string(),
                reason,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_urls_join_cleanly() {
        let client = GatewayClient::new(
            "https://gateway.example/ipfs/",
            "https://gateway.example/manifest.json",
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(client.blob_url("abc"), "https://gateway.example/ipfs/abc");
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // nothing listens on the discard port of localhost
        let client = GatewayClient::new(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9/manifest.json",
            Duration::from_secs(5),
        )
        .expect("client");
        let err = client.fetch_blob("abc").await.expect_err("refused");
        assert!(matches!(err, IndexError::RemoteUnreachable { .. }), "{err}");
        assert!(!err.is_retryable());
        assert!(matches!(
            client.fetch_manifest().await,
            Err(IndexError::ManifestUnavailable(_))
        ));
    }
}
