//! Shadowsocks links (`ss://`)

use crate::error::DecodeError;
use crate::proxy::models::{ConfigMap, ProxyHeader};
use crate::proxy::parser::{
    decode_base64, percent_decode, query_pairs, split_fragment, split_host_port, split_query,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEME: &str = "ss://";

/// Shadowsocks stream/AEAD cipher proxy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shadowsocks {
    #[serde(skip)]
    pub header: ProxyHeader,
    pub cipher: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    #[serde(default, rename = "plugin-opts", skip_serializing_if = "ConfigMap::is_empty")]
    pub plugin_opts: ConfigMap,
    #[serde(default)]
    pub udp: bool,
}

impl Shadowsocks {
    /// Decode either `ss://base64(cipher:password)@host:port` or
    /// `ss://base64(cipher:password@host:port)`, each with an optional
    /// `?plugin=` query and `#name`
    pub fn from_link(link: &str) -> Result<Self, DecodeError> {
        let body = link
            .strip_prefix(SCHEME)
            .ok_or_else(|| DecodeError::invalid("missing ss:// prefix"))?;
        let (body, name) = split_fragment(body);
        let (body, query) = split_query(body);

        let (userinfo, host_port) = match body.rsplit_once('@') {
            Some((userinfo, host_port)) => (decode_userinfo(userinfo)?, host_port.to_string()),
            None => {
                let decoded = decode_base64(body)?;
                let (userinfo, host_port) = decoded
                    .rsplit_once('@')
                    .ok_or_else(|| DecodeError::invalid("missing @ in ss body"))?;
                (userinfo.to_string(), host_port.to_string())
            }
        };

        let (cipher, password) = userinfo
            .split_once(':')
            .ok_or_else(|| DecodeError::invalid("ss userinfo is not cipher:password"))?;
        let (server, port) = split_host_port(&host_port)?;
        let (plugin, plugin_opts) = query.map(parse_plugin).unwrap_or_default();

        Ok(Self {
            header: ProxyHeader {
                name,
                link: link.to_string(),
                ..ProxyHeader::new(server, port)
            },
            cipher: cipher.to_string(),
            password: password.to_string(),
            plugin,
            plugin_opts,
            udp: false,
        })
    }
}

/// Userinfo is base64 of `cipher:password`; plain text is accepted as well
fn decode_userinfo(userinfo: &str) -> Result<String, DecodeError> {
    let userinfo = percent_decode(userinfo);
    match decode_base64(&userinfo) {
        Ok(decoded) if decoded.contains(':') => Ok(decoded),
        _ if userinfo.contains(':') => Ok(userinfo),
        Ok(_) => Err(DecodeError::invalid("ss userinfo is not cipher:password")),
        Err(err) => Err(err),
    }
}

/// Parse the `plugin` query value, e.g. `obfs-local;obfs=http;obfs-host=a.com`
fn parse_plugin(query: &str) -> (String, ConfigMap) {
    let Some(raw) = query_pairs(query)
        .find(|(key, _)| *key == "plugin")
        .map(|(_, value)| percent_decode(value))
    else {
        return (String::new(), ConfigMap::new());
    };

    let mut parts = raw.split(';').map(str::trim).filter(|p| !p.is_empty());
    let name = parts.next().unwrap_or_default();
    let params: Vec<(&str, Option<&str>)> = parts
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (p, None),
        })
        .collect();

    let mut opts = ConfigMap::new();
    let plugin = match name {
        "obfs-local" | "simple-obfs" | "obfs" => {
            for (key, value) in params {
                match (key, value) {
                    ("obfs", Some(mode)) => opts.insert("mode".into(), Value::from(mode)),
                    ("obfs-host", Some(host)) => opts.insert("host".into(), Value::from(host)),
                    _ => None,
                };
            }
            "obfs"
        }
        "v2ray-plugin" => {
            opts.insert("mode".into(), Value::from("websocket"));
            for (key, value) in params {
                match (key, value) {
                    ("tls", None) => opts.insert("tls".into(), Value::Bool(true)),
                    ("mux", _) => opts.insert("mux".into(), Value::Bool(value != Some("0"))),
                    (key, Some(v)) => opts.insert(key.into(), Value::from(v)),
                    (key, None) => opts.insert(key.into(), Value::Bool(true)),
                };
            }
            "v2ray-plugin"
        }
        other => {
            for (key, value) in params {
                let value = value.map_or(Value::Bool(true), Value::from);
                opts.insert(key.into(), value);
            }
            other
        }
    };

    (plugin.to_string(), opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    #[test]
    fn test_sip002_link() {
        let ss = Shadowsocks::from_link("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080#name").unwrap();
        assert_eq!(ss.header.server, "1.2.3.4");
        assert_eq!(ss.header.port, 8080);
        assert_eq!(ss.header.name, "name");
        assert_eq!(ss.cipher, "aes-256-gcm");
        assert_eq!(ss.password, "password");
        assert!(ss.plugin.is_empty());
    }

    #[test]
    fn test_fully_encoded_link() {
        let body = STANDARD.encode("chacha20-ietf-poly1305:p@ss:word@5.6.7.8:443");
        let ss = Shadowsocks::from_link(&format!("ss://{body}#node%201")).unwrap();
        assert_eq!(ss.header.server, "5.6.7.8");
        assert_eq!(ss.header.port, 443);
        assert_eq!(ss.cipher, "chacha20-ietf-poly1305");
        assert_eq!(ss.password, "p@ss:word");
        assert_eq!(ss.header.name, "node 1");
    }

    #[test]
    fn test_url_safe_unpadded_userinfo() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-128-gcm:a?b>c");
        let ss = Shadowsocks::from_link(&format!("ss://{userinfo}@example.com:8388")).unwrap();
        assert_eq!(ss.cipher, "aes-128-gcm");
        assert_eq!(ss.password, "a?b>c");
    }

    #[test]
    fn test_obfs_plugin() {
        let link = "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080/?plugin=obfs-local%3Bobfs%3Dhttp%3Bobfs-host%3Dwww.bing.com#n";
        let ss = Shadowsocks::from_link(link).unwrap();
        assert_eq!(ss.plugin, "obfs");
        assert_eq!(ss.plugin_opts["mode"], "http");
        assert_eq!(ss.plugin_opts["host"], "www.bing.com");
        assert_eq!(ss.header.port, 8080);
    }

    #[test]
    fn test_v2ray_plugin() {
        let link = "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:443?plugin=v2ray-plugin%3Btls%3Bhost%3Dcdn.example.com%3Bpath%3D%2Fws";
        let ss = Shadowsocks::from_link(link).unwrap();
        assert_eq!(ss.plugin, "v2ray-plugin");
        assert_eq!(ss.plugin_opts["mode"], "websocket");
        assert_eq!(ss.plugin_opts["tls"], true);
        assert_eq!(ss.plugin_opts["host"], "cdn.example.com");
        assert_eq!(ss.plugin_opts["path"], "/ws");
    }

    #[test]
    fn test_plugin_opts_in_config_map() {
        let link = "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:8080/?plugin=obfs-local%3Bobfs%3Dtls";
        let descriptor = crate::proxy::parser::LinkDecoder::decode(link).unwrap();
        let map = descriptor.config_map().unwrap();
        assert_eq!(map["plugin"], "obfs");
        assert_eq!(map["plugin-opts"]["mode"], "tls");
    }

    #[test]
    fn test_rejects_zero_port() {
        assert!(Shadowsocks::from_link("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@1.2.3.4:0").is_err());
    }

    #[test]
    fn test_rejects_bad_userinfo() {
        let userinfo = STANDARD.encode("no-separator");
        assert!(Shadowsocks::from_link(&format!("ss://{userinfo}@1.2.3.4:80")).is_err());
        assert!(Shadowsocks::from_link("ss://!!!@1.2.3.4:80").is_err());
    }
}
