//! Built-in sources fetching share-links over HTTP or from disk
//!
//! This module provides:
//! - Subscription feeds (base64 encoded link lists)
//! - Text pages scanned for share-links
//! - Local files with one link per line

use crate::error::SourceError;
use crate::proxy::parser::decode_base64;
use crate::source::{LinkEmitter, SourceExecutor};
use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Share-links embedded in arbitrary text
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:ssr|ss|vmess|trojan)://[^\s"'<>]+"#).expect("Invalid share-link regex")
});

/// Configuration for HTTP sources
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self) -> Result<Client> {
        Ok(Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()?)
    }
}

/// Extract share-links from text content
pub fn extract_links(content: &str) -> Vec<String> {
    LINK_REGEX
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ')']).to_string())
        .collect()
}

/// Decode a subscription body; bodies that are not base64 are used as is
pub fn decode_subscription(body: &str) -> Vec<String> {
    let compact: String = body.split_whitespace().collect();
    let text = match decode_base64(&compact) {
        Ok(decoded) if !decoded.is_empty() => decoded,
        _ => body.to_string(),
    };

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

async fn emit_all(
    links: Vec<String>,
    cancel: &CancellationToken,
    emitter: &LinkEmitter,
) -> std::result::Result<(), SourceError> {
    debug!(source = emitter.source(), links = links.len(), "emitting links");
    for link in links {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        emitter.emit(link).await?;
    }
    Ok(())
}

async fn fetch_text(
    client: &Client,
    url: &str,
    cancel: &CancellationToken,
) -> std::result::Result<String, SourceError> {
    let request = async {
        let response = client.get(url).send().await?.error_for_status()?;
        response.text().await
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SourceError::Cancelled),
        result = request => Ok(result?),
    }
}

/// Subscription feed: base64 encoded, newline separated share-links
pub struct SubscriptionSource {
    url: String,
    client: Client,
}

impl SubscriptionSource {
    pub fn new(url: &str, config: &CrawlerConfig) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            client: config.client()?,
        })
    }
}

#[async_trait]
impl SourceExecutor for SubscriptionSource {
    async fn execute(
        &self,
        cancel: CancellationToken,
        emitter: LinkEmitter,
    ) -> std::result::Result<(), SourceError> {
        let body = fetch_text(&self.client, &self.url, &cancel).await?;
        emit_all(decode_subscription(&body), &cancel, &emitter).await
    }
}

/// Any text page; share-links are found by pattern
pub struct PageSource {
    url: String,
    client: Client,
}

impl PageSource {
    pub fn new(url: &str, config: &CrawlerConfig) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            client: config.client()?,
        })
    }
}

#[async_trait]
impl SourceExecutor for PageSource {
    async fn execute(
        &self,
        cancel: CancellationToken,
        emitter: LinkEmitter,
    ) -> std::result::Result<(), SourceError> {
        let body = fetch_text(&self.client, &self.url, &cancel).await?;
        emit_all(extract_links(&body), &cancel, &emitter).await
    }
}

/// Local file, one link per line; `#` starts a comment line
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceExecutor for FileSource {
    async fn execute(
        &self,
        cancel: CancellationToken,
        emitter: LinkEmitter,
    ) -> std::result::Result<(), SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let links = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();
        emit_all(links, &cancel, &emitter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceEvent;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn collect(executor: &dyn SourceExecutor) -> (std::result::Result<(), SourceError>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = executor
            .execute(CancellationToken::new(), LinkEmitter::new(Arc::from("test"), tx))
            .await;

        let mut links = Vec::new();
        while let Ok(SourceEvent::Link { link, .. }) = rx.try_recv() {
            links.push(link);
        }
        (result, links)
    }

    #[test]
    fn test_extract_links() {
        let html = r#"
            <p>ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080#name</p>
            <a href="trojan://pw@5.6.7.8:443?sni=x.com">node</a>
            text vmess://eyJhZGQiOiIxLjIuMy40In0=, then ssr://MS4yLjMuNDo4MDpvcmlnaW4.
            http://1.2.3.4:8080 is not a share-link
        "#;
        let links = extract_links(html);
        assert_eq!(
            links,
            vec![
                "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080#name",
                "trojan://pw@5.6.7.8:443?sni=x.com",
                "vmess://eyJhZGQiOiIxLjIuMy40In0=",
                "ssr://MS4yLjMuNDo4MDpvcmlnaW4",
            ]
        );
    }

    #[test]
    fn test_decode_subscription_base64() {
        let body = STANDARD.encode("ss://a@1.2.3.4:1\r\n\r\ntrojan://b@5.6.7.8:2\n");
        assert_eq!(
            decode_subscription(&body),
            vec!["ss://a@1.2.3.4:1", "trojan://b@5.6.7.8:2"]
        );
    }

    #[test]
    fn test_decode_subscription_plain() {
        let body = "ss://a@1.2.3.4:1\ntrojan://b@5.6.7.8:2\n";
        assert_eq!(decode_subscription(body).len(), 2);
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("freeproxy-links-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "# comment\nss://a@1.2.3.4:1\n\n  trojan://b@5.6.7.8:2  \n")
            .await
            .unwrap();

        let (result, links) = collect(&FileSource::new(&path)).await;
        tokio::fs::remove_file(&path).await.unwrap();

        result.unwrap();
        assert_eq!(links, vec!["ss://a@1.2.3.4:1", "trojan://b@5.6.7.8:2"]);
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let (result, links) = collect(&FileSource::new("/nonexistent/links.txt")).await;
        assert!(matches!(result, Err(SourceError::Failed(_))));
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn test_page_source_cancelled_before_fetch() {
        let source = PageSource::new("http://10.255.255.1/", &CrawlerConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = source
            .execute(cancel, LinkEmitter::new(Arc::from("page"), tx))
            .await;
        assert!(matches!(result, Err(SourceError::Cancelled)));
    }
}
