//! Domain separation and BLS signing over SSZ signing roots.
//!
//! Signatures are BLS12-381 in the minimal-pubkey-size scheme with the
//! `BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_` tag, provided by the
//! underlying crypto in `ethereum-consensus`.

use ethereum_consensus::{
    domains::DomainType,
    phase0::mainnet::compute_domain,
    primitives::{BlsPublicKey, BlsSignature, Domain, Root, Version},
    signing::{compute_signing_root, sign_with_domain, verify_signed_data},
    ssz::prelude::HashTreeRoot,
    state_transition::Context,
    Error,
};
pub use ethereum_consensus::crypto::SecretKey;

/// Domain for bids the relay itself signs before handing them to proposers.
pub fn compute_builder_domain(genesis_fork_version: Version) -> Result<Domain, Error> {
    let context = Context::for_mainnet();
    compute_domain(
        DomainType::ApplicationBuilder,
        Some(genesis_fork_version),
        Some(Root::default()),
        &context,
    )
}

/// Domain under which the proposer signs its blinded beacon block.
pub fn compute_proposer_domain(
    fork_version: Version,
    genesis_validators_root: Root,
) -> Result<Domain, Error> {
    let context = Context::for_mainnet();
    compute_domain(
        DomainType::BeaconProposer,
        Some(fork_version),
        Some(genesis_validators_root),
        &context,
    )
}

pub fn compute_message_signing_root<T: HashTreeRoot>(
    message: &T,
    domain: Domain,
) -> Result<Root, Error> {
    compute_signing_root(message, domain)
}

pub fn sign_message<T: HashTreeRoot>(
    message: &T,
    signing_key: &SecretKey,
    domain: Domain,
) -> Result<BlsSignature, Error> {
    sign_with_domain(message, signing_key, domain)
}

pub fn verify_signed_message<T: HashTreeRoot>(
    message: &T,
    signature: &BlsSignature,
    public_key: &BlsPublicKey,
    domain: Domain,
) -> Result<(), Error> {
    verify_signed_data(message, signature, public_key, domain)
}
