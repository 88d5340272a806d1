//! Connector seam between the validator and whatever speaks proxy protocols
//!
//! A [`Connector`] turns a descriptor's [`ConfigMap`] into a [`ProxyAdapter`]
//! able to run timed reachability probes through the proxy.

use crate::proxy::models::ConfigMap;
use crate::Result;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tokio::net::TcpStream;

/// Builds dialable adapters from connector configuration
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConfigMap) -> Result<Box<dyn ProxyAdapter>>;
}

/// A proxy ready to be probed
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Probe `url` through the proxy and return the delay in milliseconds
    async fn url_test(&self, url: &str) -> Result<u16>;
}

/// Connector that only checks the proxy endpoint accepts TCP connections
///
/// The reported delay is the TCP handshake round-trip to the proxy server;
/// the test url is not requested.
#[derive(Debug, Clone, Default)]
pub struct TcpProbeConnector;

struct TcpProbe {
    server: String,
    port: u16,
}

#[async_trait]
impl Connector for TcpProbeConnector {
    async fn connect(&self, config: &ConfigMap) -> Result<Box<dyn ProxyAdapter>> {
        let server = config
            .get("server")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("config has no server"))?;
        let port = config
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| anyhow!("config has no valid port"))?;
        if port == 0 {
            bail!("port must not be 0");
        }

        Ok(Box::new(TcpProbe {
            server: server.to_string(),
            port,
        }))
    }
}

#[async_trait]
impl ProxyAdapter for TcpProbe {
    async fn url_test(&self, _url: &str) -> Result<u16> {
        let start = Instant::now();
        let stream = TcpStream::connect((self.server.as_str(), self.port)).await?;
        let elapsed = start.elapsed().as_millis();
        drop(stream);
        Ok(u16::try_from(elapsed).unwrap_or(u16::MAX).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn config(server: &str, port: u16) -> ConfigMap {
        json!({ "server": server, "port": port }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_probe_reports_positive_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let adapter = TcpProbeConnector.connect(&config("127.0.0.1", port)).await.unwrap();
        let delay = adapter.url_test("http://unused").await.unwrap();
        assert!(delay >= 1);
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_bad_config() {
        assert!(TcpProbeConnector.connect(&ConfigMap::new()).await.is_err());
        assert!(TcpProbeConnector.connect(&config("", 80)).await.is_err());
        assert!(TcpProbeConnector.connect(&config("1.2.3.4", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let adapter = TcpProbeConnector.connect(&config("127.0.0.1", port)).await.unwrap();
        assert!(adapter.url_test("http://unused").await.is_err());
    }
}
