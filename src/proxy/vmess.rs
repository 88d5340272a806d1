//! VMess links (`vmess://`)

use crate::error::DecodeError;
use crate::proxy::models::{ProxyHeader, WsOptions};
use crate::proxy::parser::{decode_base64, split_host_port};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SCHEME: &str = "vmess://";

const DEFAULT_CIPHER: &str = "auto";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vmess {
    #[serde(skip)]
    pub header: ProxyHeader,
    pub uuid: String,
    #[serde(default, rename = "alterId")]
    pub alter_id: u32,
    pub cipher: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, rename = "ws-opts")]
    pub ws_opts: WsOptions,
    #[serde(default, rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub servername: String,
    #[serde(default)]
    pub udp: bool,
}

/// The JSON document carried by a vmess link, with its abbreviated keys
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmessShare {
    #[serde(deserialize_with = "lenient_string")]
    ps: String,
    #[serde(deserialize_with = "lenient_string")]
    add: String,
    #[serde(deserialize_with = "lenient_string")]
    port: String,
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    #[serde(deserialize_with = "lenient_string")]
    aid: String,
    #[serde(deserialize_with = "lenient_string")]
    scy: String,
    #[serde(deserialize_with = "lenient_string")]
    net: String,
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    header_type: String,
    #[serde(deserialize_with = "lenient_string")]
    host: String,
    #[serde(deserialize_with = "lenient_string")]
    path: String,
    #[serde(deserialize_with = "lenient_string")]
    tls: String,
    #[serde(deserialize_with = "lenient_string")]
    sni: String,
}

/// Accept a JSON string, number, bool or null where a string is expected
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(match (n.as_u64(), n.as_f64()) {
            (Some(u), _) => u.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f >= 0.0 => (f as u64).to_string(),
            _ => n.to_string(),
        }),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

impl Vmess {
    /// Decode `vmess://base64(json)`
    pub fn from_link(link: &str) -> Result<Self, DecodeError> {
        let body = link
            .strip_prefix(SCHEME)
            .ok_or_else(|| DecodeError::invalid("missing vmess:// prefix"))?;
        let share: VmessShare = serde_json::from_str(&decode_base64(body)?)?;

        let (server, port) = split_host_port(&format!("{}:{}", share.add.trim(), share.port.trim()))?;
        // a non-numeric alterId counts as 0
        let alter_id = share.aid.trim().parse().unwrap_or(0);

        let mut headers = BTreeMap::new();
        if !share.host.is_empty() {
            headers.insert("Host".to_string(), share.host.clone());
        }
        let path = if share.path.is_empty() {
            "/".to_string()
        } else {
            share.path
        };
        let cipher = if share.scy.is_empty() {
            DEFAULT_CIPHER.to_string()
        } else {
            share.scy
        };
        let servername = if share.sni.is_empty() {
            share.host
        } else {
            share.sni
        };

        Ok(Self {
            header: ProxyHeader {
                name: share.ps,
                link: link.to_string(),
                ..ProxyHeader::new(server, port)
            },
            uuid: share.id,
            alter_id,
            cipher,
            tls: matches!(share.tls.as_str(), "tls" | "true"),
            network: share.net,
            ws_opts: WsOptions { path, headers },
            skip_cert_verify: true,
            servername,
            udp: false,
        })
    }
}
