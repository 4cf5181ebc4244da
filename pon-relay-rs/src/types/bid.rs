use crate::types::ExecutionPayloadHeader;
use alloy_primitives::hex;
use ethereum_consensus::{
    primitives::{BlsPublicKey, ExecutionAddress, Hash32, Slot},
    ssz::prelude::*,
};

pub const MAX_PAYOUT_POOL_TRANSACTION_SIZE: usize = 1_048_576;

/// Payout-pool transaction bytes committed to by the RPBS service.
pub type PayoutPoolTransaction = ByteList<MAX_PAYOUT_POOL_TRANSACTION_SIZE>;

/// The builder's bid message. The ECDSA wallet signature covers the
/// hash-tree-root of this container.
#[derive(Debug, Default, Clone, Serializable, HashTreeRoot, serde::Serialize, serde::Deserialize)]
pub struct BidSubmission {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    pub parent_hash: Hash32,
    pub block_hash: Hash32,
    pub builder_wallet_address: ExecutionAddress,
    #[serde(rename = "proposer_pubkey")]
    pub proposer_public_key: BlsPublicKey,
    pub execution_payload_header: ExecutionPayloadHeader,
    #[serde(with = "crate::serde::as_str")]
    pub value: U256,
    pub payout_pool_transaction: PayoutPoolTransaction,
}

impl BidSubmission {
    /// Canonical string the RPBS service certified, lowercased end to end so
    /// address casing cannot split commitments.
    pub fn rpbs_commitment_info(&self) -> String {
        let info = format!(
            "BuilderWalletAddress:{},Slot:{},Amount:{},Transaction:0x{}",
            self.builder_wallet_address,
            self.slot,
            self.value,
            hex::encode(self.payout_pool_transaction.as_ref()),
        );
        info.to_lowercase()
    }
}

/// Hex-encoded RPBS signature tuple as produced by the RPBS service peer.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RpbsSignature {
    pub z1_hat: String,
    pub c1_hat: String,
    pub s1_hat: String,
    pub c2_hat: String,
    pub s2_hat: String,
    pub m1_hat: String,
}

/// Compact 65-byte `(r, s, v)` signature from the builder's wallet key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature(pub [u8; 65]);

impl Default for EcdsaSignature {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

impl EcdsaSignature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl std::fmt::Display for EcdsaSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EcdsaSignature({self})")
    }
}

impl serde::Serialize for EcdsaSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for EcdsaSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;
        let bytes = hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|err| serde::de::Error::custom(format!("invalid signature hex: {err}")))?;
        let bytes: [u8; 65] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 65 bytes"))?;
        Ok(Self(bytes))
    }
}

/// A complete builder submission: the bid message, the RPBS certification of
/// its payout commitment, the callback endpoint used to unblind the payload,
/// and the wallet signature binding everything to the builder.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedBidSubmission {
    pub message: BidSubmission,
    pub rpbs: RpbsSignature,
    #[serde(rename = "rpbs_pubkey")]
    pub rpbs_public_key: String,
    pub endpoint: String,
    pub ecdsa_signature: EcdsaSignature,
}
