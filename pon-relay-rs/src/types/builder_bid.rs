use crate::{
    signing::{sign_message, verify_signed_message, SecretKey},
    types::ExecutionPayloadHeader,
};
use ethereum_consensus::{
    primitives::{BlsPublicKey, BlsSignature, Domain},
    ssz::prelude::*,
    Error,
};

pub const VERSION_CAPELLA: &str = "capella";

/// Bid the relay signs and serves to the duty-bound proposer. The public key
/// is the relay's, not the builder's: proposers only ever trust the relay.
#[derive(Debug, Default, Clone, Serializable, HashTreeRoot, serde::Serialize, serde::Deserialize)]
pub struct BuilderBid {
    pub header: ExecutionPayloadHeader,
    #[serde(with = "crate::serde::as_str")]
    pub value: U256,
    #[serde(rename = "pubkey")]
    pub public_key: BlsPublicKey,
}

impl BuilderBid {
    pub fn sign(self, secret_key: &SecretKey, domain: Domain) -> Result<SignedBuilderBid, Error> {
        let signature = sign_message(&self, secret_key, domain)?;
        Ok(SignedBuilderBid { message: self, signature })
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedBuilderBid {
    pub message: BuilderBid,
    pub signature: BlsSignature,
}

impl SignedBuilderBid {
    pub fn verify_signature(&self, domain: Domain) -> Result<(), Error> {
        verify_signed_message(&self.message, &self.signature, &self.message.public_key, domain)
    }
}

impl std::fmt::Display for SignedBuilderBid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let block_hash = &self.message.header.block_hash;
        let value = &self.message.value;
        write!(f, "block hash {block_hash} and value {value}")
    }
}

/// Versioned envelope returned from the header endpoint.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeaderResponse {
    pub version: String,
    pub data: SignedBuilderBid,
}

impl HeaderResponse {
    pub fn capella(data: SignedBuilderBid) -> Self {
        Self { version: VERSION_CAPELLA.to_string(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ChainContext, Network};

    #[test]
    fn relay_signature_round_trips() {
        let mut rng = rand::thread_rng();
        let secret_key = SecretKey::random(&mut rng).unwrap();
        let context = ChainContext::new(Network::CustomTestnet).unwrap();

        let bid = BuilderBid {
            header: ExecutionPayloadHeader::default(),
            value: U256::from(1000u64),
            public_key: secret_key.public_key(),
        };
        let signed = bid.sign(&secret_key, context.domain_builder).unwrap();
        assert!(signed.verify_signature(context.domain_builder).is_ok());
        // a proposer checking under the wrong domain must fail
        assert!(signed.verify_signature(context.domain_beacon_proposer).is_err());
    }
}
