// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use serde::Deserialize;

use super::{AddressPicker, PickerError};
use crate::address::Address;
use crate::context::Context;

pub(super) const NAME: &str = "weighted-round-robin";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Params {
    #[serde(rename = "DefaultWeight")]
    default_weight: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self { default_weight: 1 }
    }
}

#[derive(Debug)]
struct Peer {
    addr: Address,
    weight: i64,
    current: i64,
}

/// Smooth weighted round-robin: over one full cycle every address is picked
/// exactly `weight` times, with picks of the same address spread out.
/// Zero-weight addresses are never picked.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    default_weight: u32,
    peers: Mutex<Vec<Peer>>,
}

impl WeightedRoundRobin {
    pub fn new(default_weight: u32) -> Self {
        Self {
            default_weight,
            peers: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn from_params(params: Option<&toml::Value>) -> Result<Self, PickerError> {
        let params = match params {
            Some(raw) => raw
                .clone()
                .try_into::<Params>()
                .map_err(|e| PickerError::InvalidParams {
                    strategy: NAME.to_string(),
                    reason: e.to_string(),
                })?,
            None => Params::default(),
        };
        Ok(Self::new(params.default_weight))
    }
}

impl AddressPicker for WeightedRoundRobin {
    fn name(&self) -> &str {
        NAME
    }

    fn set_addresses(&self, addrs: Vec<Address>) -> Result<(), PickerError> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::take(&mut *peers);
        *peers = addrs
            .into_iter()
            .map(|addr| {
                let weight = i64::from(addr.weight().unwrap_or(self.default_weight));
                // Surviving addresses keep their position in the cycle.
                let current = previous
                    .iter()
                    .find(|p| p.addr == addr)
                    .map_or(0, |p| p.current);
                Peer {
                    addr,
                    weight,
                    current,
                }
            })
            .collect();
        Ok(())
    }

    fn pick(&self, _ctx: &Context) -> Result<Address, PickerError> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let total: i64 = peers.iter().map(|p| p.weight).sum();
        if total == 0 {
            return Err(PickerError::NoAddress);
        }

        for peer in peers.iter_mut().filter(|p| p.weight > 0) {
            peer.current += peer.weight;
        }
        let chosen = select_max(&peers).ok_or(PickerError::NoAddress)?;
        peers[chosen].current -= total;
        Ok(peers[chosen].addr.clone())
    }

    fn addresses(&self) -> Vec<Address> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| p.addr.clone())
            .collect()
    }
}

/// First peer with the highest running weight.
fn select_max(peers: &[Peer]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, peer) in peers.iter().enumerate() {
        if peer.weight == 0 {
            continue;
        }
        match best {
            Some(b) if peers[b].current >= peer.current => {}
            _ => best = Some(i),
        }
    }
    best
}
