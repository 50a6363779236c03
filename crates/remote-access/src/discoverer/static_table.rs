// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Discoverer, DiscoveryError};
use crate::address::{address_message, Address, LOCALITY_KEY};
use crate::context::Context;
use crate::messager::Message;

/// Localities tried, in order, when the configured one has no hosts.
const FALLBACK_LOCALITIES: [&str; 3] = ["all", "default", "tc"];

#[derive(Debug, Deserialize)]
struct HostPort {
    #[serde(rename = "Host", default)]
    host: String,
    #[serde(rename = "Port")]
    port: u16,
}

/// Fixed address table keyed by locality.
///
/// ```toml
/// [Resource.Manual]
/// east = [{ Host = "10.0.0.1", Port = 3306 }, { Host = "10.0.0.2", Port = 3306 }]
/// default = [{ Host = "db.internal", Port = 3306 }]
/// ```
#[derive(Debug)]
pub struct StaticDiscoverer {
    locality: String,
    addresses: Vec<Address>,
}

impl StaticDiscoverer {
    pub fn new(addresses: Vec<Address>) -> Self {
        let locality = addresses
            .first()
            .and_then(|a| a.locality())
            .unwrap_or_default()
            .to_string();
        Self {
            locality,
            addresses,
        }
    }

    pub fn from_params(locality: &str, params: &toml::Value) -> Result<Self, DiscoveryError> {
        let table: BTreeMap<String, Vec<HostPort>> = params
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| DiscoveryError::Config(e.to_string()))?;
        if table.is_empty() {
            return Err(DiscoveryError::Config("empty static config".to_string()));
        }

        let non_empty = |key: &str| table.get(key).is_some_and(|hosts| !hosts.is_empty());
        let chosen = std::iter::once(locality)
            .chain(FALLBACK_LOCALITIES)
            .find(|key| non_empty(*key))
            .or_else(|| table.keys().next().map(String::as_str))
            .unwrap_or(locality)
            .to_string();

        let addresses: Vec<Address> = table
            .get(&chosen)
            .into_iter()
            .flatten()
            .filter(|hp| !hp.host.is_empty())
            .map(|hp| {
                let endpoint = if hp.host.contains(':') {
                    format!("[{}]:{}", hp.host, hp.port)
                } else {
                    format!("{}:{}", hp.host, hp.port)
                };
                Address::tcp(endpoint).with_meta(LOCALITY_KEY, chosen.as_str())
            })
            .collect();
        if addresses.is_empty() {
            return Err(DiscoveryError::Config(format!(
                "static config has no hosts for locality {chosen:?}"
            )));
        }

        Ok(Self {
            locality: chosen,
            addresses,
        })
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn locality(&self) -> &str {
        &self.locality
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn discover(&self, _ctx: &Context) -> Result<Vec<Message>, DiscoveryError> {
        Ok(vec![address_message(self.addresses.clone())])
    }

    fn describe(&self) -> String {
        let endpoints: Vec<&str> = self.addresses.iter().map(Address::endpoint).collect();
        format!(
            "StaticDiscoverer(locality={}, addresses={:?})",
            self.locality, endpoints
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::addresses_from_message;

    fn params(src: &str) -> toml::Value {
        toml::Value::Table(src.parse::<toml::Table>().unwrap())
    }

    const TABLE: &str = r#"
        east = [{ Host = "10.0.0.1", Port = 80 }, { Host = "10.0.0.2", Port = 80 }]
        default = [{ Host = "10.1.0.1", Port = 80 }]
        zeta = [{ Host = "10.9.0.1", Port = 80 }]
    "#;

    #[test]
    fn test_exact_locality() {
        let d = StaticDiscoverer::from_params("east", &params(TABLE)).unwrap();
        assert_eq!(d.locality(), "east");
        assert_eq!(d.addresses().len(), 2);
        assert_eq!(d.addresses()[0].locality(), Some("east"));
    }

    #[test]
    fn test_falls_back_to_default_localities() {
        let d = StaticDiscoverer::from_params("west", &params(TABLE)).unwrap();
        assert_eq!(d.locality(), "default");
        assert_eq!(d.addresses()[0].endpoint(), "10.1.0.1:80");
    }

    #[test]
    fn test_falls_back_to_any_key() {
        let d = StaticDiscoverer::from_params(
            "west",
            &params(r#"zeta = [{ Host = "10.9.0.1", Port = 80 }]"#),
        )
        .unwrap();
        assert_eq!(d.locality(), "zeta");
    }

    #[test]
    fn test_empty_config() {
        let err = StaticDiscoverer::from_params("east", &params("")).unwrap_err();
        assert!(err.to_string().contains("empty static config"));
    }

    #[test]
    fn test_no_hosts() {
        let err = StaticDiscoverer::from_params(
            "east",
            &params(r#"east = [{ Host = "", Port = 80 }]"#),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no hosts"));
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let d = StaticDiscoverer::from_params("east", &params(r#"east = [{ Host = "::1", Port = 80 }]"#))
            .unwrap();
        assert_eq!(d.addresses()[0].endpoint(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_discover_returns_one_address_message() {
        let d = StaticDiscoverer::from_params("east", &params(TABLE)).unwrap();
        let msgs = d.discover(&Context::background()).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(addresses_from_message(&msgs[0]).unwrap().len(), 2);
    }
}
