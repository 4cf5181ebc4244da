//! The relay proper: the submission pipeline with its bounty variant, header
//! service to proposers, and payload unblinding against the winning builder.

pub mod api;

use crate::{
    beacon::MultiBeaconClient,
    bids::BidBoard,
    bulletin::{BountyWonEvent, BulletinBoard, HeaderRequestEvent, PayloadRequestEvent},
    database::{
        AuditSink, BuilderBlockSubmissionRow, ValidatorDeliveredHeaderRow,
        ValidatorDeliveredPayloadRow, ValidatorReturnedBlockRow,
    },
    network::{ChainContext, Network},
    registry,
    signing::{verify_signed_message, SecretKey},
    store::KvStore,
    types::{
        BuilderBid, BuilderWinningBid, ExecutionPayload, HeaderEntry, HeaderResponse,
        PayloadResponse, PayloadUtils, SignedBidSubmission, SignedBlindedBeaconBlock,
        VERSION_CAPELLA,
    },
    Error,
};
use alloy_primitives::{hex, keccak256};
use ethereum_consensus::{
    primitives::{BlsPublicKey, Root, Slot},
    serde::try_bytes_from_hex_str,
    ssz::prelude::{HashTreeRoot, U256},
};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, SECP256K1,
};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Builder callbacks must answer within the proposer's signing margin.
const BUILDER_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounty submissions are only open in a narrow window after the proposer
/// has normally committed, measured from the slot's canonical time.
const BOUNTY_WINDOW_OPEN_SECS: u64 = 2;
const BOUNTY_WINDOW_CLOSE_SECS: u64 = 3;

/// Validator-index overrides baked into the custom testnet harness.
const CUSTOM_TESTNET_VALIDATORS: [&str; 4] = [
    "0xa99a76ed7796f7be22d5b7e85deeb7c5677e88e511e0b337618f8c4eb61349b4bf2d153f649f7b53359fe8b94a38e44c",
    "0xb89bebc699769726a318c8e9971bd3171297c61aea4a6578a7a4f94b547dcba5bac16a89108b6b6a1fe3695d1a874a0b",
    "0xa3a32b0f8b4ddb83f1a0a853d81dd725dfe577d4f4c3db8ece52ce2b026eca84815c1a7e8e92a4de3d755733bf7e4a9b",
    "0x88c141df77cd9d8d7a71a75c826c41a9c9f03c6ee1b180f3e7852f6a280099ded351b58d66e653af8e42816a4d8f532e",
];

#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    chain: ChainContext,
    secret_key: SecretKey,
    public_key: BlsPublicKey,
    store: Arc<dyn KvStore>,
    sink: Arc<dyn AuditSink>,
    bid_board: BidBoard,
    beacon: Arc<MultiBeaconClient>,
    bulletin: BulletinBoard,
    builder_client: reqwest::Client,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl Relay {
    pub fn new(
        chain: ChainContext,
        secret_key: SecretKey,
        store: Arc<dyn KvStore>,
        sink: Arc<dyn AuditSink>,
        beacon: Arc<MultiBeaconClient>,
        bulletin: BulletinBoard,
        bid_timeout: Duration,
    ) -> Self {
        let public_key = secret_key.public_key();
        let bid_board = BidBoard::new(store.clone(), bulletin.clone(), bid_timeout);
        let builder_client = reqwest::Client::builder()
            .timeout(BUILDER_CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                chain,
                secret_key,
                public_key,
                store,
                sink,
                bid_board,
                beacon,
                bulletin,
                builder_client,
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.inner.chain.network
    }

    pub fn public_key(&self) -> &BlsPublicKey {
        &self.inner.public_key
    }

    pub fn bid_board(&self) -> &BidBoard {
        &self.inner.bid_board
    }

    /// Regular-auction submission. Checks run in a fixed order and the first
    /// failure is the response; nothing is written before the pipeline
    /// passes.
    pub async fn submit_block(
        &self,
        submission: SignedBidSubmission,
        received_at_millis: u64,
    ) -> Result<BuilderWinningBid, Error> {
        self.validate_submission(&submission, received_at_millis).await?;
        self.accept_submission(submission, received_at_millis).await
    }

    /// Bounty-bid submission: a post-auction window where a builder can
    /// displace the winner by committing at least double the open top.
    pub async fn submit_bounty_bid(
        &self,
        submission: SignedBidSubmission,
        received_at_millis: u64,
    ) -> Result<BuilderWinningBid, Error> {
        let inner = &self.inner;
        let slot = submission.message.slot;
        let now = received_at_millis / 1000;
        let slot_time = inner.chain.slot_timestamp(slot);

        if now < slot_time + BOUNTY_WINDOW_OPEN_SECS {
            return Err(Error::Validation(format!("bounty window for slot {slot} not open yet")));
        }
        if now > slot_time + BOUNTY_WINDOW_CLOSE_SECS {
            return Err(Error::Validation(format!("bounty window for slot {slot} closed")));
        }

        if inner.bid_board.get_bounty_bid(slot).await?.is_some() {
            return Err(Error::StateConflict(format!("bounty for slot {slot} already won")));
        }

        let open_top = inner.bid_board.open_auction_highest_bid(slot).await?;
        let floor = open_top.saturating_mul(2);
        if bid_value_as_u64(&submission.message.value) < floor {
            return Err(Error::Validation(format!(
                "bounty bid must be at least {floor}, twice the open auction top {open_top}"
            )));
        }

        let builder = wallet_string(&submission);
        if !inner.bid_board.set_bounty_bid(slot, &builder).await? {
            // another bounty claimed the slot between the probe and the write
            return Err(Error::StateConflict(format!("bounty for slot {slot} already won")));
        }

        self.validate_submission(&submission, received_at_millis).await?;
        let response = self.accept_submission(submission, received_at_millis).await?;
        inner.bid_board.promote_winner(slot, &builder).await?;
        inner.bulletin.publish_bounty_won(BountyWonEvent { slot, builder: builder.clone() });

        Ok(BuilderWinningBid { highest_bid_builder: builder, ..response })
    }

    async fn validate_submission(
        &self,
        submission: &SignedBidSubmission,
        received_at_millis: u64,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let message = &submission.message;
        let header = &message.execution_payload_header;
        let slot = message.slot;
        let builder = wallet_string(submission);

        if header.withdrawals_root == Root::default() {
            return Err(Error::Validation("empty withdrawals root".to_string()));
        }

        if !registry::builder_status(inner.store.as_ref(), &builder).await? {
            return Err(Error::Validation(format!("builder {builder} not active in pool")));
        }

        let expected_timestamp = inner.chain.slot_timestamp(slot);
        if header.timestamp != expected_timestamp {
            return Err(Error::Validation(format!(
                "incorrect timestamp: got {}, expected {expected_timestamp}",
                header.timestamp
            )));
        }

        if let Some(delivered) = inner.bid_board.get_payload_delivered(slot).await? {
            return Err(Error::StateConflict(format!(
                "payload for slot {slot} already delivered for builder {delivered}"
            )));
        }

        let head_slot = inner.beacon.head_slot();
        if slot < head_slot {
            return Err(Error::Validation(format!(
                "submission for past slot {slot}, head is {head_slot}"
            )));
        }
        if slot > head_slot + 1 {
            return Err(Error::Validation(format!(
                "submission for slot {slot} too far ahead of head {head_slot}"
            )));
        }

        if message.block_hash != header.block_hash {
            return Err(Error::Validation("block hash does not match header".to_string()));
        }
        if message.parent_hash != header.parent_hash {
            return Err(Error::Validation("parent hash does not match header".to_string()));
        }

        crate::rpbs::verify_submission(message, &submission.rpbs_public_key, &submission.rpbs)
            .map_err(|err| {
                tracing::warn!(%builder, slot, %err, "rpbs verification failed");
                Error::Validation("RPBS verify failed".to_string())
            })?;

        let recovered = recover_wallet_address(submission)?;
        if !recovered.eq_ignore_ascii_case(&builder) {
            return Err(Error::Validation(format!(
                "ECDSA signer {recovered} does not match wallet address {builder}"
            )));
        }

        if let Some(last) = inner.bid_board.builder_block_last(slot, &builder).await? {
            if received_at_millis < last {
                return Err(Error::Validation(format!(
                    "newer bid already accepted for builder {builder}"
                )));
            }
        }

        Ok(())
    }

    /// Sign the bid under the relay's key, persist the board entries, and
    /// rerun the auction. The audit record is enqueued best-effort.
    async fn accept_submission(
        &self,
        submission: SignedBidSubmission,
        received_at_millis: u64,
    ) -> Result<BuilderWinningBid, Error> {
        let inner = &self.inner;
        let message = &submission.message;
        let slot = message.slot;
        let builder = wallet_string(&submission);
        let block_hash = message.block_hash.to_string();
        let proposer = message.proposer_public_key.to_string();

        let bid = BuilderBid {
            header: message.execution_payload_header.clone(),
            value: message.value,
            public_key: inner.public_key.clone(),
        };
        let signed_bid = bid.sign(&inner.secret_key, inner.chain.domain_builder)?;
        let header_response = HeaderResponse::capella(signed_bid);

        let payload_utils = PayloadUtils {
            version: VERSION_CAPELLA.to_string(),
            data: message.execution_payload_header.clone(),
            api: submission.endpoint.clone(),
            builder_wallet_address: builder.clone(),
        };
        inner.bid_board.save_payload_utils(slot, &block_hash, &payload_utils).await?;
        inner
            .bid_board
            .save_builder_bid(slot, &builder, &proposer, received_at_millis, &header_response)
            .await?;

        let (top_builder, top_value) = inner.bid_board.auction_bid(slot).await?;

        let row = BuilderBlockSubmissionRow {
            slot,
            builder_pubkey: builder.clone(),
            bid_value: message.value.to_string(),
            builder_signature: submission.ecdsa_signature.to_string(),
            block_hash,
            rpbs: serde_json::to_string(&submission.rpbs).unwrap_or_default(),
            rpbs_public_key: submission.rpbs_public_key.clone(),
            transaction_bytes: format!(
                "0x{}",
                hex::encode(message.payout_pool_transaction.as_ref())
            ),
        };
        let bid_id = row.submission_id();
        let sink = inner.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_block_submission(row).await {
                tracing::error!(%err, "could not record block submission");
            }
        });

        tracing::info!(%builder, slot, value = %message.value, "received block from builder");

        Ok(BuilderWinningBid {
            bid_id,
            highest_bid_value: U256::from(top_value),
            highest_bid_builder: top_builder,
        })
    }

    /// Serve the winning signed header for a slot to its proposer.
    pub async fn get_header(
        &self,
        slot: Slot,
        _parent_hash: &str,
        proposer_public_key: &str,
    ) -> Result<HeaderResponse, Error> {
        let inner = &self.inner;
        tracing::info!(slot, "header requested");

        let entry: HeaderEntry = inner.bid_board.winning_bid(slot).await?;
        if entry.slot != slot
            || !entry.proposer_public_key.eq_ignore_ascii_case(proposer_public_key)
        {
            return Err(Error::Validation("parameters do not match the winning bid".to_string()));
        }

        inner.bulletin.publish_header_request(HeaderRequestEvent {
            slot,
            proposer: proposer_public_key.to_string(),
            timestamp: unix_secs(),
        });

        let row = ValidatorDeliveredHeaderRow {
            slot,
            proposer_pubkey: proposer_public_key.to_string(),
            block_hash: entry.bid.data.message.header.block_hash.to_string(),
            bid_value: entry.bid.data.message.value.to_string(),
        };
        let sink = inner.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_delivered_header(row).await {
                tracing::error!(%err, "could not record delivered header");
            }
        });

        tracing::info!(
            value = %entry.bid.data.message.value,
            block_hash = %entry.bid.data.message.header.block_hash,
            "bid delivered to proposer"
        );
        Ok(entry.bid)
    }

    /// Unblind the winning payload: verify the proposer's signature, forward
    /// the signed blinded block to the builder, and return the execution
    /// payload. Delivery is marked sticky once the payload is on its way.
    pub async fn get_payload(
        &self,
        signed_block: SignedBlindedBeaconBlock,
    ) -> Result<PayloadResponse, Error> {
        let inner = &self.inner;
        let slot = signed_block.message.slot;
        let block_hash = signed_block.message.body.execution_payload_header.block_hash.to_string();
        tracing::info!(slot, %block_hash, "proposer payload request");

        let proposer_public_key =
            self.proposer_public_key_for_index(signed_block.message.proposer_index as u64)?;
        let public_key = decode_bls_public_key(&proposer_public_key)?;

        verify_signed_message(
            &signed_block.message,
            &signed_block.signature,
            &public_key,
            inner.chain.domain_beacon_proposer,
        )
        .map_err(|err| {
            tracing::warn!(slot, %err, "proposer signature verification failed");
            Error::Validation("could not verify payload signature".to_string())
        })?;

        let utils = inner
            .bid_board
            .payload_utils(slot, &block_hash)
            .await?
            .ok_or_else(|| Error::Validation(format!("no payload known for {block_hash}")))?;

        let row = ValidatorReturnedBlockRow {
            slot,
            proposer_pubkey: proposer_public_key.clone(),
            block_hash: block_hash.clone(),
            signature: signed_block.signature.to_string(),
        };
        let sink = inner.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_returned_block(row).await {
                tracing::error!(%err, "could not record returned block");
            }
        });

        let payload = self.call_builder(&utils, &signed_block).await?;

        let delivered_row = ValidatorDeliveredPayloadRow {
            slot,
            proposer_pubkey: proposer_public_key.clone(),
            block_hash: payload.block_hash.to_string(),
            payload: serde_json::to_string(&payload).unwrap_or_default(),
        };
        let response = PayloadResponse::capella(payload);

        let sink = inner.sink.clone();
        let bulletin = inner.bulletin.clone();
        let builder = utils.builder_wallet_address.clone();
        let bulletin_proposer = proposer_public_key.clone();
        let bid_board = inner.bid_board.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_delivered_payload(delivered_row).await {
                tracing::error!(%err, "could not record delivered payload");
            }
            if let Err(err) = bid_board.put_payload_delivered(slot, &builder).await {
                tracing::error!(%err, "could not set payload delivered marker");
            }
            bulletin.publish_payload_request(PayloadRequestEvent {
                slot,
                proposer: bulletin_proposer,
            });
        });

        tracing::info!(slot, "payload delivered");
        Ok(response)
    }

    async fn call_builder(
        &self,
        utils: &PayloadUtils,
        signed_block: &SignedBlindedBeaconBlock,
    ) -> Result<ExecutionPayload, Error> {
        let response = self
            .inner
            .builder_client
            .post(&utils.api)
            .json(signed_block)
            .send()
            .await
            .map_err(|err| Error::Upstream(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(body));
        }
        response
            .json::<ExecutionPayload>()
            .await
            .map_err(|err| Error::Upstream(format!("undecodable builder payload: {err}")))
    }

    /// Resolve a proposer index to its public key, honouring the fixed
    /// custom-testnet table before the chain-backed maps.
    pub fn proposer_public_key_for_index(&self, index: u64) -> Result<String, Error> {
        if self.inner.chain.network == Network::CustomTestnet {
            if let Some(public_key) = CUSTOM_TESTNET_VALIDATORS.get(index as usize) {
                return Ok(public_key.to_string());
            }
        }
        self.inner
            .beacon
            .validator_pubkey_for_index(index)
            .map_err(|_| Error::Validation("could not get proposer public key".to_string()))
    }
}

fn wallet_string(submission: &SignedBidSubmission) -> String {
    submission.message.builder_wallet_address.to_string().to_lowercase()
}

fn bid_value_as_u64(value: &U256) -> u64 {
    value.to_string().parse().unwrap_or(u64::MAX)
}

fn decode_bls_public_key(encoded: &str) -> Result<BlsPublicKey, Error> {
    let bytes = try_bytes_from_hex_str(encoded)
        .map_err(|err| Error::Validation(format!("invalid proposer public key: {err}")))?;
    BlsPublicKey::try_from(bytes.as_slice())
        .map_err(|err| Error::Validation(format!("invalid proposer public key: {err}")))
}

/// Recover the signer of `hash_tree_root(message)` from the compact 65-byte
/// signature and derive the 20-byte wallet address.
fn recover_wallet_address(submission: &SignedBidSubmission) -> Result<String, Error> {
    let root = submission
        .message
        .hash_tree_root()
        .map_err(|err| Error::Internal(format!("could not merkleize bid message: {err}")))?;

    let signature = submission.ecdsa_signature.as_bytes();
    let recovery_byte = signature[64];
    let recovery_id = i32::from(if recovery_byte >= 27 { recovery_byte - 27 } else { recovery_byte });
    let recovery_id = RecoveryId::from_i32(recovery_id)
        .map_err(|err| Error::Validation(format!("invalid recovery id: {err}")))?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|err| Error::Validation(format!("invalid ECDSA signature: {err}")))?;
    let digest = Message::from_digest_slice(root.as_ref())
        .map_err(|err| Error::Internal(format!("invalid signing digest: {err}")))?;
    let public_key = SECP256K1
        .recover_ecdsa(&digest, &recoverable)
        .map_err(|_| Error::Validation("could not recover ECDSA public key".to_string()))?;

    let uncompressed = public_key.serialize_uncompressed();
    let address = &keccak256(&uncompressed[1..])[12..];
    Ok(format!("0x{}", hex::encode(address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey as EcdsaSecretKey;

    fn random_wallet_key<R: rand::Rng>(rng: &mut R) -> EcdsaSecretKey {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            if let Ok(secret) = EcdsaSecretKey::from_slice(&bytes) {
                return secret;
            }
        }
    }

    #[test]
    fn recovered_address_matches_the_signing_wallet() {
        let mut rng = rand::thread_rng();
        let secret = random_wallet_key(&mut rng);
        let wallet = {
            let public_key = secret.public_key(SECP256K1);
            let uncompressed = public_key.serialize_uncompressed();
            format!("0x{}", hex::encode(&keccak256(&uncompressed[1..])[12..]))
        };

        let mut submission = SignedBidSubmission::default();
        submission.message.slot = 100;
        let root = submission.message.hash_tree_root().unwrap();
        let digest = Message::from_digest_slice(root.as_ref()).unwrap();
        let signature = SECP256K1.sign_ecdsa_recoverable(&digest, &secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;
        submission.ecdsa_signature = crate::types::EcdsaSignature(bytes);

        let recovered = recover_wallet_address(&submission).unwrap();
        assert!(recovered.eq_ignore_ascii_case(&wallet));
    }

    #[test]
    fn legacy_recovery_ids_are_normalized() {
        let mut rng = rand::thread_rng();
        let secret = random_wallet_key(&mut rng);
        let mut submission = SignedBidSubmission::default();
        let root = submission.message.hash_tree_root().unwrap();
        let digest = Message::from_digest_slice(root.as_ref()).unwrap();
        let signature = SECP256K1.sign_ecdsa_recoverable(&digest, &secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8 + 27;
        submission.ecdsa_signature = crate::types::EcdsaSignature(bytes);
        assert!(recover_wallet_address(&submission).is_ok());
    }
}
