mod bid;
mod builder_bid;
mod payload;

pub use bid::*;
pub use builder_bid::*;
pub use ethereum_consensus::capella::mainnet::{
    BlindedBeaconBlock, ExecutionPayload, ExecutionPayloadHeader, SignedBlindedBeaconBlock,
};
pub use payload::*;
