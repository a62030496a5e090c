use std::time::{Duration, Instant};

use crate::directory::Peer;
use crate::error::ProbeError;

use super::types::DownloadSample;

pub const PING_PATH: &str = "/ping";
pub const PING_RESPONSE: &str = "pong";
pub const DOWNLOAD_PATH: &str = "/download";

/// Network probes against one peer.
///
/// Implementations must be stateless with respect to peers so a single instance
/// can serve every scheduler concurrently.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip a tiny request and return its latency
    async fn ping(&self, peer: &Peer) -> Result<Duration, ProbeError>;

    /// Fetch the peer's download payload and return transfer time and size
    async fn download(&self, peer: &Peer) -> Result<DownloadSample, ProbeError>;
}

/// Probes peers over plain HTTP against the daemon's own endpoints
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(1)
            .build()?;

        Ok(Self { client, timeout })
    }

    fn url(peer: &Peer, path: &str) -> String {
        format!("http://{}{}", peer.address, path)
    }

    fn classify(&self, error: reqwest::Error) -> ProbeError {
        if error.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else if error.is_connect() {
            ProbeError::Unreachable(error.to_string())
        } else if error.is_body() || error.is_decode() || error.is_status() {
            ProbeError::Protocol(error.to_string())
        } else {
            ProbeError::Unreachable(error.to_string())
        }
    }

    async fn get(&self, peer: &Peer, path: &str) -> Result<reqwest::Response, ProbeError> {
        let response = self
            .client
            .get(Self::url(peer, path))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(ProbeError::Protocol(format!(
                "{} answered {} with status {}",
                peer.name,
                path,
                response.status()
            )));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn ping(&self, peer: &Peer) -> Result<Duration, ProbeError> {
        let start = Instant::now();

        let body = self.get(peer, PING_PATH).await?.bytes().await.map_err(|e| self.classify(e))?;
        let latency = start.elapsed();

        if body.as_ref() != PING_RESPONSE.as_bytes() {
            return Err(ProbeError::Protocol(format!(
                "unexpected ping body from {} ({} bytes)",
                peer.name,
                body.len()
            )));
        }

        Ok(latency)
    }

    async fn download(&self, peer: &Peer) -> Result<DownloadSample, ProbeError> {
        let start = Instant::now();

        let response = self.get(peer, DOWNLOAD_PATH).await?;
        let declared = response.content_length();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let duration = start.elapsed();

        let payload_bytes = body.len() as u64;
        match declared {
            Some(expected) if expected != payload_bytes => Err(ProbeError::Protocol(format!(
                "download from {} declared {} bytes but delivered {}",
                peer.name, expected, payload_bytes
            ))),
            _ => Ok(DownloadSample { duration, payload_bytes }),
        }
    }
}
