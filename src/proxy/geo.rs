//! Country lookup for proxy servers using an MMDB database

use crate::proxy::models::Country;
use crate::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Best-effort country enrichment for a proxy server
#[async_trait]
pub trait CountryLookup: Send + Sync {
    async fn lookup(&self, server: &str) -> Result<Country>;
}

/// GeoLocator for looking up server hosts in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the country of an IP address
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<Country> {
        let lookup_result = self.reader.lookup(ip)?;
        let country: Option<geoip2::Country> = lookup_result.decode()?;

        let Some(country) = country else {
            return Ok(Country::default());
        };

        Ok(Country {
            code: country
                .country
                .iso_code
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_default(),
            name: country
                .country
                .names
                .english
                .map(String::from)
                .unwrap_or_default(),
        })
    }
}

/// Resolve a server host to its first address
pub async fn resolve(server: &str) -> Result<IpAddr> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((server, 0))
        .await?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow!("{server} did not resolve to any address"))
}

#[async_trait]
impl CountryLookup for GeoLocator {
    async fn lookup(&self, server: &str) -> Result<Country> {
        let ip = resolve(server).await?;
        self.lookup_ip(ip)
    }
}

/// Regional-indicator flag for an ISO country code, empty when not a code
pub fn country_flag(code: &str) -> String {
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return String::new();
    }

    code.to_ascii_uppercase()
        .chars()
        .filter_map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)))
        .collect()
}
