/// Cluster liveness checking against the API endpoint
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::utils::polling::{PollStatus, PollingConfig};

#[derive(Debug, Clone, Error)]
pub enum HealthCheckError {
    #[error("cluster endpoint {endpoint} did not become ready within {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },
}

/// A single liveness observation of the cluster endpoint
#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_live(&self, endpoint: &Url) -> bool;
}

/// Probes `<endpoint>/healthz` over HTTP. An unauthorized or forbidden
/// answer still proves the API server is up.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn is_live(&self, endpoint: &Url) -> bool {
        let url = match endpoint.join("healthz") {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                status.is_success()
                    || status == StatusCode::UNAUTHORIZED
                    || status == StatusCode::FORBIDDEN
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Polls the cluster endpoint until it answers liveness probes or the
/// timeout budget runs out. Timeout is a permanent failure surfaced to the
/// caller; the checker never extends the budget on its own.
pub struct HealthChecker {
    probe: Box<dyn Probe>,
}

impl HealthChecker {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            probe: Box::new(HttpProbe::new()?),
        })
    }

    #[allow(dead_code)]
    pub fn with_probe(probe: Box<dyn Probe>) -> Self {
        Self { probe }
    }

    pub async fn poll(
        &self,
        endpoint: &Url,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), HealthCheckError> {
        let polling = PollingConfig::new(
            timeout,
            interval,
            format!("Waiting for cluster API at {}", endpoint),
        );

        match polling.poll_until(|| self.probe.is_live(endpoint)).await {
            PollStatus::Ready => Ok(()),
            PollStatus::TimedOut => Err(HealthCheckError::Timeout {
                endpoint: endpoint.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// One-shot observation, used for status classification
    pub async fn probe_once(&self, endpoint: &Url) -> bool {
        self.probe.is_live(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeProbe;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    fn fast(timeout_ms: u64, interval_ms: u64) -> (Duration, Duration) {
        (
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test]
    async fn test_poll_succeeds_once_endpoint_answers() {
        let checker = HealthChecker::with_probe(Box::new(FakeProbe::ready_after(3)));
        let endpoint = Url::parse("http://192.168.99.100:8080").unwrap();
        let (timeout, interval) = fast(2000, 10);

        tokio_test::assert_ok!(checker.poll(&endpoint, timeout, interval).await);
    }

    #[tokio::test]
    async fn test_poll_times_out_when_endpoint_never_answers() {
        let checker = HealthChecker::with_probe(Box::new(FakeProbe::never()));
        let endpoint = Url::parse("http://192.168.99.100:8080").unwrap();
        let (timeout, interval) = fast(100, 20);

        match checker.poll(&endpoint, timeout, interval).await {
            Err(HealthCheckError::Timeout { endpoint: e, .. }) => {
                assert!(e.contains("192.168.99.100"))
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    async fn serve_one_response(status_line: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response =
                    format!("{}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_http_probe_accepts_success() {
        let endpoint = serve_one_response("HTTP/1.1 200 OK").await;
        let probe = HttpProbe::new().unwrap();
        assert!(probe.is_live(&endpoint).await);
    }

    #[tokio::test]
    async fn test_http_probe_accepts_unauthorized() {
        let endpoint = serve_one_response("HTTP/1.1 401 Unauthorized").await;
        let probe = HttpProbe::new().unwrap();
        assert!(probe.is_live(&endpoint).await);
    }

    #[tokio::test]
    async fn test_http_probe_rejects_unreachable_endpoint() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Url::parse(&format!("http://{}", addr)).unwrap();
        let probe = HttpProbe::new().unwrap();
        assert!(!probe.is_live(&endpoint).await);
    }
}
