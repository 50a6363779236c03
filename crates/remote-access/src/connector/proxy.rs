// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unsupported proxy protocol {0:?}, expected HTTP, HTTPS or SOCKS5")]
    UnsupportedProtocol(String),
    #[error("invalid proxy section: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl FromStr for ProxyProtocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProxyProtocol::Http),
            "HTTPS" => Ok(ProxyProtocol::Https),
            "SOCKS5" => Ok(ProxyProtocol::Socks5),
            _ => Err(ProxyError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    #[serde(rename = "Protocol")]
    protocol: String,
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "User", default)]
    user: Option<String>,
    #[serde(rename = "Password", default)]
    password: Option<String>,
}

/// The `Proxy` section of a service file.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub protocol: ProxyProtocol,
    pub addr: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("protocol", &self.protocol)
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    pub fn from_raw(raw: &toml::Value) -> Result<Self, ProxyError> {
        let parsed: RawProxy = raw
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ProxyError::Invalid(e.to_string()))?;
        if parsed.addr.trim().is_empty() {
            return Err(ProxyError::Invalid("Addr cannot be empty".to_string()));
        }
        Ok(Self {
            protocol: parsed.protocol.parse()?,
            addr: parsed.addr,
            user: parsed.user.filter(|u| !u.is_empty()),
            password: parsed.password.filter(|p| !p.is_empty()),
        })
    }

    /// `scheme://[user[:password]@]addr`
    pub fn url(&self) -> String {
        let auth = match (&self.user, &self.password) {
            (Some(user), Some(password)) => format!("{user}:{password}@"),
            (Some(user), None) => format!("{user}@"),
            _ => String::new(),
        };
        format!("{}://{}{}", self.protocol, auth, self.addr)
    }
}

/// Capability of a connector that can route through a proxy.
pub trait ProxySetter: Send + Sync {
    fn set_proxy(&self, config: ProxyConfig) -> Result<(), ProxyError>;

    fn proxy(&self) -> Option<ProxyConfig>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(src: &str) -> toml::Value {
        toml::Value::Table(src.parse::<toml::Table>().unwrap())
    }

    #[test]
    fn test_parse_socks5_with_auth() {
        let cfg = ProxyConfig::from_raw(&section(
            r#"
            Protocol = "socks5"
            Addr = "127.0.0.1:1080"
            User = "u"
            Password = "p"
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.protocol, ProxyProtocol::Socks5);
        assert_eq!(cfg.url(), "socks5://u:p@127.0.0.1:1080");
        assert!(!format!("{cfg:?}").contains("\"p\""));
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let err = ProxyConfig::from_raw(&section(
            r#"
            Protocol = "FTP"
            Addr = "127.0.0.1:21"
            "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_rejects_missing_addr() {
        let err = ProxyConfig::from_raw(&section(r#"Protocol = "HTTP""#)).unwrap_err();
        assert!(matches!(err, ProxyError::Invalid(_)));
    }
}
