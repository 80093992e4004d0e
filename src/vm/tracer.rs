//! Call tracing.

use alloy_primitives::{Address, U256};
use std::collections::BTreeSet;

/// Observes the calls made while executing a message.
pub trait Tracer {
    /// Called once for the top-level call or creation.
    fn capture_start(&mut self, from: Address, to: Address, create: bool, input: &[u8], gas: u64, value: U256);

    /// Called for every nested call or creation.
    fn capture_enter(&mut self, from: Address, to: Address, create: bool, input: &[u8], gas: u64, value: U256);
}

/// Collects call sources and targets, whatever the outcome of the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallTracer {
    froms: BTreeSet<Address>,
    tos: BTreeSet<Address>,
}

impl CallTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn froms(&self) -> &BTreeSet<Address> {
        &self.froms
    }

    pub fn tos(&self) -> &BTreeSet<Address> {
        &self.tos
    }

    pub fn into_sets(self) -> (BTreeSet<Address>, BTreeSet<Address>) {
        (self.froms, self.tos)
    }
}

impl Tracer for CallTracer {
    fn capture_start(&mut self, from: Address, to: Address, _create: bool, _input: &[u8], _gas: u64, _value: U256) {
        self.froms.insert(from);
        self.tos.insert(to);
    }

    fn capture_enter(&mut self, from: Address, to: Address, _create: bool, _input: &[u8], _gas: u64, _value: U256) {
        self.froms.insert(from);
        self.tos.insert(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_tracer_deduplicates() {
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let c = Address::repeat_byte(0xc);

        let mut tracer = CallTracer::new();
        tracer.capture_start(a, b, false, &[], 21_000, U256::ZERO);
        tracer.capture_enter(b, c, false, &[], 1_000, U256::ZERO);
        tracer.capture_enter(b, c, true, &[], 1_000, U256::ZERO);

        assert_eq!(tracer.froms().len(), 2);
        let (froms, tos) = tracer.into_sets();
        assert!(froms.contains(&a) && froms.contains(&b));
        assert_eq!(tos.into_iter().collect::<Vec<_>>(), vec![b, c]);
    }
}
