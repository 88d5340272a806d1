//! Proxy descriptors and their validation
//!
//! This module provides functionality for:
//! - Decoding ss, ssr, vmess and trojan share-links into descriptors
//! - Probing descriptors through a pluggable connector
//! - Country lookup of proxy servers

pub mod checker;
pub mod connector;
pub mod geo;
pub mod models;
pub mod parser;
pub mod shadowsocks;
pub mod shadowsocksr;
pub mod trojan;
pub mod vmess;

pub use checker::{CheckerConfig, ProxyChecker};
pub use connector::{Connector, ProxyAdapter, TcpProbeConnector};
pub use geo::{CountryLookup, GeoLocator};
pub use models::{ConfigMap, Country, ProxyDescriptor, ProxyKind, ValidationRecord};
pub use parser::LinkDecoder;
