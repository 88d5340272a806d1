//! Proxy checker: probes descriptors through a [`Connector`] and enriches
//! the survivors with country data

use crate::config::ValidatorConfig;
use crate::error::{PipelineError, ValidationError};
use crate::proxy::connector::{Connector, TcpProbeConnector};
use crate::proxy::geo::{CountryLookup, GeoLocator};
use crate::proxy::models::{Country, ProxyDescriptor, ValidationRecord};
use crate::Result;
use reqwest::Client;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default timeout for a single probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of probes per proxy
const DEFAULT_TEST_COUNT: usize = 3;

/// Default URL to test proxies against
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default URL for the direct network sanity check
pub const DEFAULT_NETWORK_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for connecting and for each probe
    pub timeout: Duration,
    /// Number of probes; the last one decides the delay
    pub test_count: usize,
    /// URL to test proxies against
    pub test_url: String,
    /// Timeout for the best-effort country lookup
    pub country_timeout: Duration,
    /// URL fetched directly, bypassing any proxy, before a tidy pass
    pub network_test_url: String,
    /// Path to MMDB file for geolocation (optional)
    pub mmdb_path: Option<PathBuf>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            test_count: DEFAULT_TEST_COUNT,
            test_url: DEFAULT_TEST_URL.to_string(),
            country_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            network_test_url: DEFAULT_NETWORK_TEST_URL.to_string(),
            mmdb_path: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_test_count(mut self, count: usize) -> Self {
        self.test_count = count;
        self
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_country_timeout(mut self, timeout: Duration) -> Self {
        self.country_timeout = timeout;
        self
    }

    pub fn with_network_test_url(mut self, url: impl Into<String>) -> Self {
        self.network_test_url = url.into();
        self
    }

    pub fn with_mmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }
}

impl From<&ValidatorConfig> for CheckerConfig {
    fn from(config: &ValidatorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.test_timeout_secs),
            test_count: config.test_count,
            test_url: config.test_url.clone(),
            country_timeout: Duration::from_secs(config.country_timeout_secs),
            network_test_url: config.network_test_url.clone(),
            mmdb_path: config.mmdb_path.clone(),
        }
    }
}

/// Proxy checker for validating proxies
#[derive(Clone)]
pub struct ProxyChecker {
    config: CheckerConfig,
    connector: Arc<dyn Connector>,
    geo: Option<Arc<dyn CountryLookup>>,
    http: Client,
}

impl ProxyChecker {
    /// Create a checker probing through `connector`, without country lookup
    pub fn new(config: CheckerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let http = Client::builder()
            .no_proxy()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            config,
            connector,
            geo: None,
            http,
        })
    }

    /// Create a checker with the TCP probe connector and, when the
    /// configured database opens, MMDB country lookup
    pub fn with_config(config: CheckerConfig) -> Result<Self> {
        let geo = config.mmdb_path.as_ref().and_then(|path| {
            GeoLocator::from_path(path)
                .map_err(|e| warn!(path = %path.display(), error = %e, "country database unavailable"))
                .ok()
        });

        let checker = Self::new(config, Arc::new(TcpProbeConnector))?;
        Ok(match geo {
            Some(geo) => checker.with_geo(Arc::new(geo)),
            None => checker,
        })
    }

    pub fn with_geo(mut self, geo: Arc<dyn CountryLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Probe `descriptor` and look up its country
    ///
    /// Country lookup failures leave the country empty; only probe failures
    /// are errors.
    pub async fn validate(
        &self,
        descriptor: ProxyDescriptor,
        cancel: &CancellationToken,
    ) -> std::result::Result<ValidationRecord, ValidationError> {
        let delay = self.probe(&descriptor, cancel).await?;
        let country = self.lookup_country(descriptor.server(), cancel).await;

        Ok(ValidationRecord::new(descriptor)
            .with_delay(delay)
            .with_country(country))
    }

    /// Run `test_count` url tests through the proxy and return the last delay
    pub async fn probe(
        &self,
        descriptor: &ProxyDescriptor,
        cancel: &CancellationToken,
    ) -> std::result::Result<u16, ValidationError> {
        let config = descriptor
            .config_map()
            .map_err(|e| ValidationError::Connect(e.to_string()))?;
        let adapter = bounded(
            cancel,
            self.config.timeout,
            self.connector.connect(&config),
            ValidationError::Connect,
        )
        .await?;

        let mut delay = 0;
        for attempt in 1..=self.config.test_count.max(1) {
            delay = bounded(
                cancel,
                self.config.timeout,
                adapter.url_test(&self.config.test_url),
                ValidationError::Probe,
            )
            .await?;
            trace!(proxy = %descriptor, attempt, delay, "url test");
        }

        if delay == 0 {
            return Err(ValidationError::ZeroDelay);
        }
        Ok(delay)
    }

    /// Best-effort country lookup, empty when unavailable
    pub async fn lookup_country(&self, server: &str, cancel: &CancellationToken) -> Country {
        let Some(geo) = &self.geo else {
            return Country::default();
        };

        tokio::select! {
            _ = cancel.cancelled() => Country::default(),
            result = tokio::time::timeout(self.config.country_timeout, geo.lookup(server)) => match result {
                Ok(Ok(country)) => country,
                Ok(Err(e)) => {
                    debug!(server, error = %e, "country lookup failed");
                    Country::default()
                }
                Err(_) => {
                    debug!(server, "country lookup timed out");
                    Country::default()
                }
            },
        }
    }

    /// Fetch the network test url directly; any failure means the local
    /// network cannot be trusted to judge proxies
    pub async fn check_network(&self, cancel: &CancellationToken) -> std::result::Result<(), PipelineError> {
        let url = &self.config.network_test_url;
        let request = self.http.get(url).send();

        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = tokio::time::timeout(self.config.timeout, request) => match result {
                Err(_) => Err(PipelineError::NetworkPreflight(format!("{url} timed out"))),
                Ok(Err(e)) => Err(PipelineError::NetworkPreflight(e.to_string())),
                Ok(Ok(response)) => response
                    .error_for_status()
                    .map(|_| ())
                    .map_err(|e| PipelineError::NetworkPreflight(e.to_string())),
            },
        }
    }
}

/// Await `fut` unless the run is cancelled or `limit` elapses first
async fn bounded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
    wrap: fn(String) -> ValidationError,
) -> std::result::Result<T, ValidationError>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ValidationError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(wrap(e.to_string())),
            Err(_) => Err(ValidationError::Timeout(limit)),
        },
    }
}
