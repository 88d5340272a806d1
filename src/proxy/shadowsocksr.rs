//! ShadowsocksR links (`ssr://`)

use crate::error::DecodeError;
use crate::proxy::models::ProxyHeader;
use crate::proxy::parser::{decode_base64, query_pairs, split_host_port};
use serde::{Deserialize, Serialize};

pub const SCHEME: &str = "ssr://";

/// Connectors refuse the literal `none` cipher for ssr; `dummy` is the
/// equivalent they accept.
pub const DUMMY_CIPHER: &str = "dummy";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksR {
    #[serde(skip)]
    pub header: ProxyHeader,
    pub cipher: String,
    pub password: String,
    pub protocol: String,
    #[serde(default, rename = "protocol-param", skip_serializing_if = "String::is_empty")]
    pub protocol_param: String,
    pub obfs: String,
    #[serde(default, rename = "obfs-param", skip_serializing_if = "String::is_empty")]
    pub obfs_param: String,
    #[serde(default)]
    pub udp: bool,
}

impl ShadowsocksR {
    /// Decode `ssr://base64(host:port:protocol:cipher:obfs:base64(password)/?params)`
    pub fn from_link(link: &str) -> Result<Self, DecodeError> {
        let body = link
            .strip_prefix(SCHEME)
            .ok_or_else(|| DecodeError::invalid("missing ssr:// prefix"))?;
        let decoded = decode_base64(body)?;

        let (main, params) = match decoded.split_once("/?") {
            Some((main, params)) => (main, params),
            None => (decoded.trim_end_matches('/'), ""),
        };

        // host may be an IPv6 literal, so split the five fixed fields off the right
        let fields: Vec<&str> = main.rsplitn(6, ':').collect();
        let [password, obfs, cipher, protocol, port, host] = fields[..] else {
            return Err(DecodeError::invalid("ssr body needs six fields"));
        };

        let (server, port) = split_host_port(&format!("{host}:{port}"))?;
        let password = decode_base64(password)?;

        let mut protocol_param = String::new();
        let mut obfs_param = String::new();
        let mut name = String::new();
        for (key, value) in query_pairs(params) {
            match key {
                "protoparam" => protocol_param = decode_base64(value)?,
                "obfsparam" => obfs_param = decode_base64(value)?,
                "remarks" => name = decode_base64(value).unwrap_or_default(),
                _ => {}
            }
        }

        let cipher = if cipher == "none" { DUMMY_CIPHER } else { cipher };

        Ok(Self {
            header: ProxyHeader {
                name,
                link: link.to_string(),
                ..ProxyHeader::new(server, port)
            },
            cipher: cipher.to_string(),
            password,
            protocol: protocol.to_string(),
            protocol_param,
            obfs: obfs.to_string(),
            obfs_param,
            udp: false,
        })
    }
}
