//! Trojan links (`trojan://`)

use crate::error::DecodeError;
use crate::proxy::models::{ProxyHeader, WsOptions};
use crate::proxy::parser::percent_decode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

pub const SCHEME: &str = "trojan://";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trojan {
    #[serde(skip)]
    pub header: ProxyHeader,
    pub password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sni: String,
    #[serde(default, rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub udp: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, rename = "ws-opts", skip_serializing_if = "Option::is_none")]
    pub ws_opts: Option<WsOptions>,
}

impl Trojan {
    /// Decode `trojan://password@host:port?sni=..&type=..&host=..&path=..#name`
    ///
    /// UDP and certificate-verification flags are always set permissively.
    pub fn from_link(link: &str) -> Result<Self, DecodeError> {
        if !link.starts_with(SCHEME) {
            return Err(DecodeError::invalid("missing trojan:// prefix"));
        }
        let uri = Url::parse(link)?;

        let password = percent_decode(uri.username());
        let server = uri
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DecodeError::invalid("trojan link has no host"))?;
        let port = uri
            .port()
            .filter(|p| *p != 0)
            .ok_or_else(|| DecodeError::invalid("trojan link needs a non-zero port"))?;

        let mut sni = String::new();
        let mut transform = String::new();
        let mut host = String::new();
        let mut path = String::new();
        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "sni" | "peer" => sni = value.into_owned(),
                "type" => transform = value.into_owned(),
                "host" => host = value.into_owned(),
                "path" => path = value.into_owned(),
                _ => {}
            }
        }

        let alpn = if transform == "h2" {
            vec!["h2".to_string()]
        } else {
            Vec::new()
        };
        if sni.is_empty() {
            sni = host.clone();
        }

        let (network, ws_opts) = match transform.as_str() {
            "ws" | "h2+ws" => {
                let mut headers = BTreeMap::new();
                if !host.is_empty() {
                    headers.insert("Host".to_string(), host);
                }
                let path = if path.is_empty() { "/".to_string() } else { path };
                ("ws".to_string(), Some(WsOptions { path, headers }))
            }
            "grpc" => ("grpc".to_string(), None),
            _ => (String::new(), None),
        };

        Ok(Self {
            header: ProxyHeader {
                name: uri.fragment().map(percent_decode).unwrap_or_default(),
                link: link.to_string(),
                ..ProxyHeader::new(server, port)
            },
            password,
            alpn,
            sni,
            skip_cert_verify: true,
            udp: true,
            network,
            ws_opts,
        })
    }
}
