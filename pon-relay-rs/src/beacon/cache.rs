//! Process-wide view of the chain, fed by the head and payload-attribute
//! subscriptions and read by the protocol handlers. One mutex guards all the
//! maps; holders do field-scoped updates only and never I/O.

use super::types::{HeadEvent, PayloadAttributesData, ProposerDuty};
use ethereum_consensus::primitives::{Epoch, Slot};
use std::collections::HashMap;

/// Entries older than this many slots behind the head are dropped.
pub const CACHE_WINDOW_SLOTS: u64 = 64;

#[derive(Debug, Default)]
pub struct BeaconCache {
    pub current_slot: Slot,
    pub current_epoch: Epoch,
    pub current_fork_version: String,
    pub current_head: HeadEvent,

    pub randao: HashMap<Slot, String>,
    pub proposer_duties: HashMap<Slot, ProposerDuty>,
    pub payload_attributes: HashMap<Slot, PayloadAttributesData>,
    pub validator_index_by_pubkey: HashMap<String, u64>,
    pub validator_pubkey_by_index: HashMap<u64, String>,
}

impl BeaconCache {
    /// Accepts a head event only when it moves the slot forward; duplicate
    /// fan-in from the other upstream streams is dropped here.
    pub fn accept_head(&mut self, head: HeadEvent) -> bool {
        if head.slot <= self.current_slot && self.current_slot != 0 {
            return false;
        }
        self.current_slot = head.slot;
        self.current_epoch = head.epoch();
        self.current_head = head;
        true
    }

    pub fn prune(&mut self, head_slot: Slot) {
        let horizon = head_slot.saturating_sub(CACHE_WINDOW_SLOTS);
        self.randao.retain(|slot, _| *slot >= horizon);
        self.proposer_duties.retain(|slot, _| *slot >= horizon);
        self.payload_attributes.retain(|slot, _| *slot >= horizon);
    }

    pub fn record_duties(&mut self, duties: impl IntoIterator<Item = ProposerDuty>) {
        for duty in duties {
            self.proposer_duties.insert(duty.slot, duty);
        }
    }

    pub fn record_validators(&mut self, validators: impl IntoIterator<Item = (String, u64)>) {
        for (public_key, index) in validators {
            self.validator_index_by_pubkey.insert(public_key.clone(), index);
            self.validator_pubkey_by_index.insert(index, public_key);
        }
    }
}
