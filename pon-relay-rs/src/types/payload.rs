use crate::types::{ExecutionPayload, ExecutionPayloadHeader, HeaderResponse, VERSION_CAPELLA};
use ethereum_consensus::{
    primitives::Slot,
    ssz::prelude::U256,
};

/// Everything needed to unblind a delivered header: where the builder
/// listens and which wallet gets credited once the payload ships.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadUtils {
    pub version: String,
    pub data: ExecutionPayloadHeader,
    pub api: String,
    pub builder_wallet_address: String,
}

/// Versioned envelope returned from the payload endpoint.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadResponse {
    pub version: String,
    pub data: ExecutionPayload,
}

impl PayloadResponse {
    pub fn capella(data: ExecutionPayload) -> Self {
        Self { version: VERSION_CAPELLA.to_string(), data }
    }
}

/// Per-builder entry saved on an accepted submission and replayed to the
/// proposer once it wins the auction.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeaderEntry {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    #[serde(rename = "proposer_pubkey")]
    pub proposer_public_key: String,
    pub bid: HeaderResponse,
}

/// Submission response: which builder currently tops the auction.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuilderWinningBid {
    pub bid_id: String,
    #[serde(with = "crate::serde::as_str")]
    pub highest_bid_value: U256,
    pub highest_bid_builder: String,
}
