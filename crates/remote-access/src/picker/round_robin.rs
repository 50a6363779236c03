// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use super::{AddressPicker, PickerError};
use crate::address::Address;
use crate::context::Context;

pub(super) const NAME: &str = "round-robin";

#[derive(Debug, Default)]
struct State {
    addrs: Vec<Address>,
    last: Option<usize>,
}

/// Cycles through the live set in insertion order.
///
/// Replacing the set keeps the cursor, so a shrinking set may skip or
/// repeat one address on the next pick.
#[derive(Debug, Default)]
pub struct RoundRobin {
    state: Mutex<State>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressPicker for RoundRobin {
    fn name(&self) -> &str {
        NAME
    }

    fn set_addresses(&self, addrs: Vec<Address>) -> Result<(), PickerError> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).addrs = addrs;
        Ok(())
    }

    fn pick(&self, _ctx: &Context) -> Result<Address, PickerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.addrs.is_empty() {
            return Err(PickerError::NoAddress);
        }
        let next = state.last.map_or(0, |i| i.wrapping_add(1)) % state.addrs.len();
        state.last = Some(next);
        Ok(state.addrs[next].clone())
    }

    fn addresses(&self) -> Vec<Address> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .addrs
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn addrs(n: usize) -> Vec<Address> {
        (0..n).map(|i| Address::tcp(format!("10.0.0.{i}:80"))).collect()
    }

    #[test]
    fn test_empty_set_has_no_address() {
        let picker = RoundRobin::new();
        let err = picker.pick(&Context::background()).unwrap_err();
        assert!(matches!(err, PickerError::NoAddress));
        assert_eq!(err.kind(), ErrorKind::Unconfigured);
    }

    #[test]
    fn test_set_keeps_cursor() {
        let ctx = Context::background();
        let picker = RoundRobin::new();
        picker.set_addresses(addrs(3)).unwrap();
        assert_eq!(picker.pick(&ctx).unwrap(), addrs(3)[0]);
        assert_eq!(picker.pick(&ctx).unwrap(), addrs(3)[1]);

        picker.set_addresses(addrs(4)).unwrap();
        assert_eq!(picker.pick(&ctx).unwrap(), addrs(4)[2]);

        // Shrinking below the cursor wraps around.
        picker.set_addresses(addrs(2)).unwrap();
        assert_eq!(picker.pick(&ctx).unwrap(), addrs(2)[1]);
        assert_eq!(picker.pick(&ctx).unwrap(), addrs(2)[0]);
    }

    proptest! {
        #[test]
        fn prop_cycles_in_insertion_order(m in 1usize..16) {
            let ctx = Context::background();
            let picker = RoundRobin::new();
            let set = addrs(m);
            picker.set_addresses(set.clone()).unwrap();

            let picked: Vec<Address> = (0..m).map(|_| picker.pick(&ctx).unwrap()).collect();
            prop_assert_eq!(&picked, &set);
            prop_assert_eq!(picker.pick(&ctx).unwrap(), set[0].clone());
        }
    }
}
