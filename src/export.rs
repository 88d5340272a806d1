//! Clash profiles rendered from stored proxies

use crate::models::StoredProxy;
use crate::proxy::geo::country_flag;
use crate::proxy::models::{normalize_integers, ConfigMap};
use crate::Result;
use anyhow::bail;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Name of the select group, and of the only proxy in a single-proxy profile
const PROXY_GROUP: &str = "proxy";

#[derive(Debug, Serialize)]
struct ExportProfile {
    proxies: Vec<ConfigMap>,
    #[serde(rename = "proxy-groups")]
    proxy_groups: Vec<ProxyGroup>,
    rules: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProxyGroup {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    proxies: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SingleProxyProfile {
    #[serde(rename = "bind-address")]
    bind_address: String,
    #[serde(rename = "mixed-port")]
    mixed_port: u16,
    #[serde(rename = "allow-lan")]
    allow_lan: bool,
    mode: String,
    #[serde(rename = "log-level")]
    log_level: String,
    proxies: Vec<ConfigMap>,
    rules: Vec<String>,
}

/// `<flag>-<CC>-<id>`, or just the id when the country is unknown
pub fn export_name(proxy: &StoredProxy) -> String {
    if proxy.country_code.is_empty() {
        return proxy.id.to_string();
    }
    let flag = country_flag(&proxy.country_code);
    if flag.is_empty() {
        format!("{}-{}", proxy.country_code, proxy.id)
    } else {
        format!("{flag}-{}-{}", proxy.country_code, proxy.id)
    }
}

fn config_with_name(proxy: &StoredProxy, name: String) -> Result<ConfigMap> {
    let mut config: ConfigMap = serde_json::from_str(&proxy.config)?;
    normalize_integers(&mut config);
    config.insert("name".to_string(), Value::from(name));
    Ok(config)
}

/// Render a profile listing every proxy plus one select group over them
///
/// Records whose config blob cannot be read are skipped.
pub fn render_export(proxies: &[StoredProxy]) -> Result<String> {
    let mut entries = Vec::with_capacity(proxies.len());
    let mut names = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        let name = export_name(proxy);
        match config_with_name(proxy, name.clone()) {
            Ok(config) => {
                entries.push(config);
                names.push(name);
            }
            Err(e) => warn!(id = proxy.id, error = %e, "skipping unreadable record"),
        }
    }

    let profile = ExportProfile {
        proxies: entries,
        proxy_groups: vec![ProxyGroup {
            name: PROXY_GROUP.to_string(),
            kind: "select".to_string(),
            proxies: names,
        }],
        rules: vec![format!("MATCH,{PROXY_GROUP}")],
    };
    Ok(serde_yaml::to_string(&profile)?)
}

/// Render a profile that routes everything through `proxy`
pub fn render_single_proxy(proxy: &StoredProxy, bind_address: &str, port: u16) -> Result<String> {
    if port == 0 {
        bail!("listen port must not be 0");
    }

    let profile = SingleProxyProfile {
        bind_address: bind_address.to_string(),
        mixed_port: port,
        allow_lan: !matches!(bind_address, "127.0.0.1" | "localhost" | "::1"),
        mode: "rule".to_string(),
        log_level: "info".to_string(),
        proxies: vec![config_with_name(proxy, PROXY_GROUP.to_string())?],
        rules: vec![format!("MATCH,{PROXY_GROUP}")],
    };
    Ok(serde_yaml::to_string(&profile)?)
}
