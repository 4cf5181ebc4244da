//! Wire types for the consensus-node REST and event-stream surfaces.

use ethereum_consensus::primitives::{Epoch, Slot};

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncStatus {
    #[serde(with = "crate::serde::as_str")]
    pub head_slot: Slot,
    #[serde(with = "crate::serde::as_str")]
    pub sync_distance: u64,
    pub is_syncing: bool,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenesisDetails {
    #[serde(with = "crate::serde::as_str")]
    pub genesis_time: u64,
    pub genesis_validators_root: String,
    pub genesis_fork_version: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeadEvent {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    pub block: String,
    #[serde(default)]
    pub state: String,
}

impl HeadEvent {
    pub fn epoch(&self) -> Epoch {
        self.slot / crate::network::SLOTS_PER_EPOCH
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProposerDuty {
    #[serde(rename = "pubkey")]
    pub public_key: String,
    #[serde(with = "crate::serde::as_str")]
    pub validator_index: u64,
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Withdrawal {
    #[serde(with = "crate::serde::as_str")]
    pub index: u64,
    #[serde(with = "crate::serde::as_str")]
    pub validator_index: u64,
    pub address: String,
    #[serde(with = "crate::serde::as_str")]
    pub amount: u64,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadAttributes {
    #[serde(default)]
    pub prev_randao: String,
    #[serde(default)]
    pub withdrawals: Vec<Withdrawal>,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadAttributesData {
    #[serde(with = "crate::serde::as_str")]
    pub proposer_index: u64,
    #[serde(with = "crate::serde::as_str")]
    pub proposal_slot: Slot,
    #[serde(default)]
    pub parent_block_root: String,
    #[serde(default)]
    pub parent_block_hash: String,
    pub payload_attributes: PayloadAttributes,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadAttributesEvent {
    #[serde(default)]
    pub version: String,
    pub data: PayloadAttributesData,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BeaconBlockHeaderMessage {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    #[serde(with = "crate::serde::as_str")]
    pub proposer_index: u64,
    pub parent_root: String,
    pub state_root: String,
    pub body_root: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeaderMessage,
    pub signature: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockHeaderData {
    pub root: String,
    #[serde(default)]
    pub canonical: bool,
    pub header: SignedBeaconBlockHeader,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatorDescription {
    #[serde(rename = "pubkey")]
    pub public_key: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatorSummary {
    #[serde(with = "crate::serde::as_str")]
    pub index: u64,
    #[serde(default)]
    pub status: String,
    pub validator: ValidatorDescription,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RandaoMix {
    pub randao: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ForkData {
    #[serde(default)]
    pub previous_version: String,
    pub current_version: String,
    #[serde(default, with = "crate::serde::as_str")]
    pub epoch: Epoch,
}

/// Generic `{"data": ...}` wrapper the REST surface uses everywhere.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiResult<T> {
    pub data: T,
}
