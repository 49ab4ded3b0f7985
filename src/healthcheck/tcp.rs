use super::HealthChecker;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect timeout for a single probe
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP connect health checker: healthy when `endpoint` accepts a connection.
pub struct TcpChecker {
    endpoint: String,
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> Result<bool> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.endpoint)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
