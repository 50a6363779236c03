// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::messager::{Message, MessageKind};

/// Meta key holding the locality an address was discovered in.
pub const LOCALITY_KEY: &str = "locality";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        })
    }
}

/// A dialable endpoint plus optional balancing metadata.
///
/// Identity is `(network, endpoint)`: two addresses naming the same endpoint
/// are equal even if their metadata differs, which keeps pooled connections
/// valid across rediscovery.
#[derive(Debug, Clone)]
pub struct Address {
    network: Network,
    endpoint: String,
    priority: Option<i32>,
    weight: Option<u32>,
    meta: BTreeMap<String, String>,
}

impl Address {
    pub fn new(network: Network, endpoint: impl Into<String>) -> Self {
        Self {
            network,
            endpoint: endpoint.into(),
            priority: None,
            weight: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn tcp(endpoint: impl Into<String>) -> Self {
        Self::new(Network::Tcp, endpoint)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn weight(&self) -> Option<u32> {
        self.weight
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn locality(&self) -> Option<&str> {
        self.meta(LOCALITY_KEY)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.endpoint == other.endpoint
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.hash(state);
        self.endpoint.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.endpoint)
    }
}

fn address_kind() -> MessageKind {
    static KIND: OnceLock<MessageKind> = OnceLock::new();
    *KIND.get_or_init(|| MessageKind::register("address"))
}

/// Wraps a fresh address set for the broker.
pub fn address_message(addrs: Vec<Address>) -> Message {
    Message::new(address_kind(), addrs)
}

pub fn addresses_from_message(msg: &Message) -> Option<&[Address]> {
    msg.payload::<Vec<Address>>(address_kind())
        .map(Vec::as_slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_metadata() {
        let a = Address::tcp("10.0.0.1:80").with_meta(LOCALITY_KEY, "east");
        let b = Address::tcp("10.0.0.1:80").with_weight(5);
        assert_eq!(a, b);

        let set: HashSet<Address> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        assert_ne!(
            Address::tcp("10.0.0.1:80"),
            Address::new(Network::Udp, "10.0.0.1:80")
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::tcp("db:3306").to_string(), "tcp://db:3306");
    }

    #[test]
    fn test_address_message_round_trip() {
        let msg = address_message(vec![Address::tcp("a:1"), Address::tcp("b:2")]);
        let addrs = addresses_from_message(&msg).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].endpoint(), "b:2");
    }
}
