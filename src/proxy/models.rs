//! Proxy descriptor models

use crate::error::DecodeError;
use crate::proxy::shadowsocks::Shadowsocks;
use crate::proxy::shadowsocksr::ShadowsocksR;
use crate::proxy::trojan::Trojan;
use crate::proxy::vmess::Vmess;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Key/value configuration in the shape the connector expects
pub type ConfigMap = Map<String, Value>;

/// Protocol tag of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyKind {
    #[serde(rename = "ss")]
    Shadowsocks,
    #[serde(rename = "ssr")]
    ShadowsocksR,
    #[serde(rename = "vmess")]
    Vmess,
    #[serde(rename = "trojan")]
    Trojan,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Shadowsocks => "ss",
            ProxyKind::ShadowsocksR => "ssr",
            ProxyKind::Vmess => "vmess",
            ProxyKind::Trojan => "trojan",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ss" => Ok(ProxyKind::Shadowsocks),
            "ssr" => Ok(ProxyKind::ShadowsocksR),
            "vmess" => Ok(ProxyKind::Vmess),
            "trojan" => Ok(ProxyKind::Trojan),
            other => Err(DecodeError::invalid(format!("unknown proxy type {other:?}"))),
        }
    }
}

/// Fields shared by every protocol variant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Display name taken from the link, may be empty
    pub name: String,
    pub server: String,
    pub port: u16,
    /// The raw share-link this descriptor was decoded from
    pub link: String,
    /// Name of the source that emitted the link
    pub source: String,
}

impl ProxyHeader {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            ..Default::default()
        }
    }

    /// `server:port`, with IPv6 literals bracketed
    pub fn endpoint(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    fn from_config(map: &ConfigMap) -> Result<Self, DecodeError> {
        let server = map
            .get("server")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::invalid("config has no server"))?;
        let port = map
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| DecodeError::invalid("config has no valid port"))?;
        let name = map.get("name").and_then(Value::as_str).unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            ..Self::new(server, port)
        })
    }
}

/// Websocket transport options shared by vmess and trojan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsOptions {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Canonical in-memory representation of one proxy endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyDescriptor {
    Shadowsocks(Shadowsocks),
    ShadowsocksR(ShadowsocksR),
    Vmess(Vmess),
    Trojan(Trojan),
}

impl ProxyDescriptor {
    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyDescriptor::Shadowsocks(_) => ProxyKind::Shadowsocks,
            ProxyDescriptor::ShadowsocksR(_) => ProxyKind::ShadowsocksR,
            ProxyDescriptor::Vmess(_) => ProxyKind::Vmess,
            ProxyDescriptor::Trojan(_) => ProxyKind::Trojan,
        }
    }

    pub fn header(&self) -> &ProxyHeader {
        match self {
            ProxyDescriptor::Shadowsocks(p) => &p.header,
            ProxyDescriptor::ShadowsocksR(p) => &p.header,
            ProxyDescriptor::Vmess(p) => &p.header,
            ProxyDescriptor::Trojan(p) => &p.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ProxyHeader {
        match self {
            ProxyDescriptor::Shadowsocks(p) => &mut p.header,
            ProxyDescriptor::ShadowsocksR(p) => &mut p.header,
            ProxyDescriptor::Vmess(p) => &mut p.header,
            ProxyDescriptor::Trojan(p) => &mut p.header,
        }
    }

    pub fn server(&self) -> &str {
        &self.header().server
    }

    pub fn port(&self) -> u16 {
        self.header().port
    }

    /// Tag the descriptor with the source that produced it
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.header_mut().source = source.into();
        self
    }

    /// Reject descriptors the connector could never use
    pub fn ensure_valid(&self) -> Result<(), DecodeError> {
        let header = self.header();
        if header.server.is_empty() {
            return Err(DecodeError::invalid("empty server"));
        }
        if header.port == 0 {
            return Err(DecodeError::invalid("port must not be 0"));
        }

        let (secret, cipher) = match self {
            ProxyDescriptor::Shadowsocks(p) => (&p.password, Some(&p.cipher)),
            ProxyDescriptor::ShadowsocksR(p) => (&p.password, Some(&p.cipher)),
            ProxyDescriptor::Vmess(p) => (&p.uuid, Some(&p.cipher)),
            ProxyDescriptor::Trojan(p) => (&p.password, None),
        };
        if secret.is_empty() {
            return Err(DecodeError::invalid("empty secret"));
        }
        if cipher.is_some_and(|c| c.is_empty()) {
            return Err(DecodeError::invalid("empty cipher"));
        }
        Ok(())
    }

    /// Build the connector configuration for this descriptor
    ///
    /// Every whole number in the result is an integer, never a float.
    pub fn config_map(&self) -> Result<ConfigMap, serde_json::Error> {
        let payload = match self {
            ProxyDescriptor::Shadowsocks(p) => serde_json::to_value(p)?,
            ProxyDescriptor::ShadowsocksR(p) => serde_json::to_value(p)?,
            ProxyDescriptor::Vmess(p) => serde_json::to_value(p)?,
            ProxyDescriptor::Trojan(p) => serde_json::to_value(p)?,
        };

        let header = self.header();
        let name = if header.name.is_empty() {
            header.endpoint()
        } else {
            header.name.clone()
        };

        let mut map = ConfigMap::new();
        map.insert("name".into(), Value::from(name));
        map.insert("type".into(), Value::from(self.kind().as_str()));
        map.insert("server".into(), Value::from(header.server.clone()));
        map.insert("port".into(), Value::from(header.port));
        if let Value::Object(fields) = payload {
            map.extend(fields);
        }
        normalize_integers(&mut map);
        Ok(map)
    }

    /// Rebuild a descriptor from a stored protocol tag and config blob
    pub fn from_config(kind: ProxyKind, config: &str) -> Result<Self, DecodeError> {
        let mut map: ConfigMap = serde_json::from_str(config)?;
        normalize_integers(&mut map);
        let header = ProxyHeader::from_config(&map)?;
        let value = Value::Object(map);

        let mut descriptor = match kind {
            ProxyKind::Shadowsocks => ProxyDescriptor::Shadowsocks(serde_json::from_value(value)?),
            ProxyKind::ShadowsocksR => {
                ProxyDescriptor::ShadowsocksR(serde_json::from_value(value)?)
            }
            ProxyKind::Vmess => ProxyDescriptor::Vmess(serde_json::from_value(value)?),
            ProxyKind::Trojan => ProxyDescriptor::Trojan(serde_json::from_value(value)?),
        };
        *descriptor.header_mut() = header;
        descriptor.ensure_valid()?;
        Ok(descriptor)
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind(), self.header().endpoint())
    }
}

/// Turn floats that carry a whole number back into integers, recursively
pub fn normalize_integers(map: &mut ConfigMap) {
    for value in map.values_mut() {
        normalize_value(value);
    }
}

fn normalize_value(value: &mut Value) {
    match value {
        Value::Number(n) if n.is_f64() => {
            if let Some(f) = n.as_f64() {
                if f.is_finite() && f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
                    *value = Value::from(f as u64);
                } else if f.fract() == 0.0 && f < 0.0 && f >= i64::MIN as f64 {
                    *value = Value::from(f as i64);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_value),
        Value::Object(map) => normalize_integers(map),
        _ => {}
    }
}

/// Country enrichment of a proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    /// ISO 3166-1 alpha-2 code, upper case
    pub code: String,
    /// English country name
    pub name: String,
}

impl Country {
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// A descriptor that went through validation
///
/// Transient: only its descriptor and measurements reach the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRecord {
    pub descriptor: ProxyDescriptor,
    /// Measured delay in milliseconds, 0 when untested
    pub delay: u16,
    pub country: Country,
}

impl ValidationRecord {
    pub fn new(descriptor: ProxyDescriptor) -> Self {
        Self {
            descriptor,
            delay: 0,
            country: Country::default(),
        }
    }

    pub fn with_delay(mut self, delay: u16) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_country(mut self, country: Country) -> Self {
        self.country = country;
        self
    }

    pub fn has_country(&self) -> bool {
        !self.country.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::parser::LinkDecoder;
    use serde_json::json;

    fn sample() -> ProxyDescriptor {
        LinkDecoder::decode("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080#name").unwrap()
    }

    #[test]
    fn test_kind_round_trip_through_str() {
        for kind in [
            ProxyKind::Shadowsocks,
            ProxyKind::ShadowsocksR,
            ProxyKind::Vmess,
            ProxyKind::Trojan,
        ] {
            assert_eq!(kind.as_str().parse::<ProxyKind>().unwrap(), kind);
        }
        assert!("http".parse::<ProxyKind>().is_err());
    }

    #[test]
    fn test_header_endpoint() {
        assert_eq!(ProxyHeader::new("1.2.3.4", 80).endpoint(), "1.2.3.4:80");
        assert_eq!(ProxyHeader::new("::1", 443).endpoint(), "[::1]:443");
    }

    #[test]
    fn test_config_map_carries_header() {
        let map = sample().config_map().unwrap();
        assert_eq!(map["type"], "ss");
        assert_eq!(map["server"], "1.2.3.4");
        assert_eq!(map["name"], "name");
        assert!(map["port"].is_u64());
        assert_eq!(map["port"], 8080);
    }

    #[test]
    fn test_config_map_defaults_name_to_endpoint() {
        let mut descriptor = sample();
        descriptor.header_mut().name.clear();
        let map = descriptor.config_map().unwrap();
        assert_eq!(map["name"], "1.2.3.4:8080");
    }

    #[test]
    fn test_normalize_integers() {
        let mut map = json!({
            "port": 443.0,
            "alterId": 64.0,
            "ratio": 0.5,
            "nested": { "port": 80.0 },
            "list": [1.0, 2.5]
        })
        .as_object()
        .cloned()
        .unwrap();
        normalize_integers(&mut map);
        assert!(map["port"].is_u64());
        assert!(map["alterId"].is_u64());
        assert!(map["ratio"].is_f64());
        assert!(map["nested"]["port"].is_u64());
        assert!(map["list"][0].is_u64());
        assert!(map["list"][1].is_f64());
    }

    #[test]
    fn test_from_config_restores_descriptor() {
        let original = sample();
        let blob = serde_json::to_string(&original.config_map().unwrap()).unwrap();
        let restored = ProxyDescriptor::from_config(ProxyKind::Shadowsocks, &blob).unwrap();
        assert_eq!(restored.server(), "1.2.3.4");
        assert_eq!(restored.port(), 8080);
        assert_eq!(restored.config_map().unwrap(), original.config_map().unwrap());
    }

    #[test]
    fn test_from_config_accepts_float_port() {
        let blob = r#"{"name":"x","type":"ss","server":"5.6.7.8","port":8388.0,"cipher":"aes-128-gcm","password":"pw"}"#;
        let restored = ProxyDescriptor::from_config(ProxyKind::Shadowsocks, blob).unwrap();
        assert_eq!(restored.port(), 8388);
    }

    #[test]
    fn test_from_config_rejects_missing_secret() {
        let blob = r#"{"server":"5.6.7.8","port":8388,"cipher":"aes-128-gcm","password":""}"#;
        let err = ProxyDescriptor::from_config(ProxyKind::Shadowsocks, blob).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLink(_)));
    }

    #[test]
    fn test_validation_record_builders() {
        let record = ValidationRecord::new(sample());
        assert_eq!(record.delay, 0);
        assert!(!record.has_country());

        let record = record.with_delay(120).with_country(Country {
            code: "US".into(),
            name: "United States".into(),
        });
        assert_eq!(record.delay, 120);
        assert!(record.has_country());
    }
}
