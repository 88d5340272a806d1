//! Persisted proxy rows and the queries over them

use crate::error::DecodeError;
use crate::proxy::models::{Country, ProxyDescriptor, ProxyKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One validated proxy as stored in the `proxies` table
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct StoredProxy {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub source: String,
    pub server: String,
    #[sqlx(try_from = "i64")]
    pub port: u16,
    /// Connector configuration serialized as JSON
    pub config: String,
    pub country: String,
    pub country_code: String,
    #[sqlx(try_from = "i64")]
    pub delay: u16,
}

impl StoredProxy {
    /// Rebuild the descriptor from the protocol tag and config blob
    pub fn descriptor(&self) -> Result<ProxyDescriptor, DecodeError> {
        let kind: ProxyKind = self.kind.parse()?;
        let mut descriptor = ProxyDescriptor::from_config(kind, &self.config)?;
        descriptor.header_mut().source = self.source.clone();
        Ok(descriptor)
    }

    pub fn country(&self) -> Country {
        Country {
            code: self.country_code.clone(),
            name: self.country.clone(),
        }
    }

    pub fn has_country(&self) -> bool {
        !self.country_code.is_empty()
    }

    /// Apply a fresh measurement, keeping the stored country unless a new
    /// one was found
    pub fn apply(&mut self, delay: u16, country: &Country) {
        self.delay = delay;
        if !country.is_empty() {
            self.country_code = country.code.clone();
            self.country = country.name.clone();
        }
    }
}

/// Result ordering of [`ProxyQuery`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyOrder {
    #[default]
    Random,
    /// Ascending delay
    Fastest,
}

/// Filter for listing stored proxies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyQuery {
    pub id: Option<i64>,
    pub country_codes: Vec<String>,
    pub not_country_codes: Vec<String>,
    pub limit: Option<usize>,
    pub order: ProxyOrder,
}

impl ProxyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Keep only these country codes, given as `"US,DE"`
    pub fn with_country_codes(mut self, codes: &str) -> Self {
        self.country_codes = split_codes(codes);
        self
    }

    /// Drop these country codes, given as `"CN,IN"`
    pub fn with_not_country_codes(mut self, codes: &str) -> Self {
        self.not_country_codes = split_codes(codes);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fastest(mut self) -> Self {
        self.order = ProxyOrder::Fastest;
        self
    }
}

fn split_codes(codes: &str) -> Vec<String> {
    codes
        .split(',')
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Stored proxies counted per protocol and per country
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: i64,
    pub by_type: Vec<TypeCount>,
    pub by_country: Vec<CountryCount>,
}

#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct CountryCount {
    pub country_code: String,
    pub country: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = ProxyQuery::new()
            .with_country_codes("us, de,,")
            .with_not_country_codes("CN")
            .with_limit(3)
            .fastest();

        assert_eq!(query.country_codes, vec!["US", "DE"]);
        assert_eq!(query.not_country_codes, vec!["CN"]);
        assert_eq!(query.limit, Some(3));
        assert_eq!(query.order, ProxyOrder::Fastest);
        assert_eq!(ProxyQuery::default().order, ProxyOrder::Random);
    }

    #[test]
    fn test_apply_keeps_country_when_lookup_empty() {
        let now = Utc::now();
        let mut proxy = StoredProxy {
            id: 1,
            created_at: now,
            updated_at: now,
            kind: "ss".to_string(),
            name: String::new(),
            source: String::new(),
            server: "1.2.3.4".to_string(),
            port: 8080,
            config: String::new(),
            country: "Japan".to_string(),
            country_code: "JP".to_string(),
            delay: 300,
        };

        proxy.apply(120, &Country::default());
        assert_eq!(proxy.delay, 120);
        assert_eq!(proxy.country_code, "JP");

        proxy.apply(
            90,
            &Country {
                code: "SG".to_string(),
                name: "Singapore".to_string(),
            },
        );
        assert_eq!(proxy.country(), Country { code: "SG".to_string(), name: "Singapore".to_string() });
    }
}
