//! End-to-end exercises of the submission, header, bounty and payload flows
//! against in-memory state and a local builder stub.

use alloy_primitives::{hex, keccak256};
use axum::{extract::State, routing::post, Json, Router};
use ethereum_consensus::{
    primitives::{BlsPublicKey, ExecutionAddress, Hash32, Root},
    serde::try_bytes_from_hex_str,
    ssz::prelude::{HashTreeRoot, U256},
};
use pon_relay_rs::{
    bulletin::BulletinBoard,
    network::{ChainContext, Network},
    registry::BUILDER_STATUS_KEY,
    relay::Relay,
    rpbs::testing::RpbsSigner,
    signing::{sign_message, SecretKey},
    store::KvStore,
    test_utils::{MemoryAuditSink, MemoryStore},
    types::{
        BidSubmission, EcdsaSignature, ExecutionPayload, ExecutionPayloadHeader,
        PayoutPoolTransaction, SignedBidSubmission, SignedBlindedBeaconBlock,
    },
    Error,
};
use secp256k1::{Message, SecretKey as EcdsaSecretKey, SECP256K1};
use std::{sync::Arc, time::Duration};

/// Interop validator 0; its public key sits in the fixed index table used on
/// the custom testnet.
const PROPOSER_SECRET_KEY: &str =
    "0x25295f0d1d592a90b333e26e85149708208e9f8e8bc18f6c77bd62f8ad7a6866";
const PROPOSER_PUBLIC_KEY: &str =
    "0xa99a76ed7796f7be22d5b7e85deeb7c5677e88e511e0b337618f8c4eb61349b4bf2d153f649f7b53359fe8b94a38e44c";

const GENESIS_TIME: u64 = 1688034845;

struct TestBuilder {
    ecdsa: EcdsaSecretKey,
    wallet: String,
    rpbs: RpbsSigner,
}

fn random_wallet_key<R: rand::Rng>(rng: &mut R) -> EcdsaSecretKey {
    loop {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        if let Ok(secret) = EcdsaSecretKey::from_slice(&bytes) {
            return secret;
        }
    }
}

impl TestBuilder {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        let ecdsa = random_wallet_key(&mut rng);
        let uncompressed = ecdsa.public_key(SECP256K1).serialize_uncompressed();
        let wallet = format!("0x{}", hex::encode(&keccak256(&uncompressed[1..])[12..]));
        Self { ecdsa, wallet, rpbs: RpbsSigner::random(&mut rng) }
    }

    fn wallet_bytes(&self) -> ExecutionAddress {
        let bytes = hex::decode(self.wallet.trim_start_matches("0x")).unwrap();
        ExecutionAddress::try_from(bytes.as_slice()).unwrap()
    }

    fn submission(&self, slot: u64, value: u64, endpoint: &str) -> SignedBidSubmission {
        let mut rng = rand::thread_rng();
        let mut header = ExecutionPayloadHeader::default();
        header.timestamp = GENESIS_TIME + slot * 12;
        header.block_hash = hash_for(slot, value);
        header.parent_hash = hash_for(slot, 0xdead_0000 + value);
        header.withdrawals_root = Root::try_from([0x11u8; 32].as_slice()).unwrap();

        let mut message = BidSubmission::default();
        message.slot = slot;
        message.parent_hash = header.parent_hash.clone();
        message.block_hash = header.block_hash.clone();
        message.builder_wallet_address = self.wallet_bytes();
        message.proposer_public_key = proposer_public_key();
        message.execution_payload_header = header;
        message.value = U256::from(value);
        message.payout_pool_transaction =
            PayoutPoolTransaction::try_from(vec![0xBE, 0xEF]).unwrap();

        let rpbs = self.rpbs.sign(&message.rpbs_commitment_info(), &mut rng);

        let root = message.hash_tree_root().unwrap();
        let digest = Message::from_digest_slice(root.as_ref()).unwrap();
        let signature = SECP256K1.sign_ecdsa_recoverable(&digest, &self.ecdsa);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;

        SignedBidSubmission {
            message,
            rpbs,
            rpbs_public_key: self.rpbs.public_key_wire(),
            endpoint: endpoint.to_string(),
            ecdsa_signature: EcdsaSignature(bytes),
        }
    }
}

fn hash_for(slot: u64, value: u64) -> Hash32 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&slot.to_be_bytes());
    bytes[8..16].copy_from_slice(&value.to_be_bytes());
    Hash32::try_from(bytes.as_slice()).unwrap()
}

fn proposer_public_key() -> BlsPublicKey {
    let bytes = try_bytes_from_hex_str(PROPOSER_PUBLIC_KEY).unwrap();
    BlsPublicKey::try_from(bytes.as_slice()).unwrap()
}

struct Harness {
    relay: Relay,
    store: Arc<MemoryStore>,
    sink: Arc<MemoryAuditSink>,
}

async fn harness(head_slot: u64) -> Harness {
    let chain = ChainContext::new(Network::CustomTestnet).unwrap();
    let mut rng = rand::thread_rng();
    let secret_key = SecretKey::random(&mut rng).unwrap();
    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(MemoryAuditSink::default());
    let beacon = pon_relay_rs::beacon::MultiBeaconClient::new(vec![]);
    beacon.cache.lock().current_slot = head_slot;
    let (bulletin, channels) = BulletinBoard::new();
    // drain bulletin events so senders never observe a closed broker
    tokio::spawn(async move {
        let mut channels = channels;
        loop {
            tokio::select! {
                event = channels.highest_bid.recv() => if event.is_none() { break },
                event = channels.header_request.recv() => if event.is_none() { break },
                event = channels.payload_request.recv() => if event.is_none() { break },
                event = channels.bounty_won.recv() => if event.is_none() { break },
            }
        }
    });

    let relay = Relay::new(
        chain,
        secret_key,
        store.clone(),
        sink.clone(),
        beacon,
        bulletin,
        Duration::from_secs(15),
    );
    Harness { relay, store, sink }
}

async fn allow_builder(store: &MemoryStore, wallet: &str) {
    store.hset(BUILDER_STATUS_KEY, wallet, "true", None).await.unwrap();
}

/// Builder stub answering every unblinding call with a fixed payload.
async fn spawn_builder_endpoint(payload: ExecutionPayload) -> String {
    async fn unblind(State(payload): State<ExecutionPayload>) -> Json<ExecutionPayload> {
        Json(payload)
    }
    let app = Router::new().route("/", post(unblind)).with_state(payload);
    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let address = server.local_addr();
    tokio::spawn(server);
    format!("http://{address}/")
}

fn signed_blinded_block(slot: u64, header: &ExecutionPayloadHeader) -> SignedBlindedBeaconBlock {
    let chain = ChainContext::new(Network::CustomTestnet).unwrap();
    let secret_bytes = try_bytes_from_hex_str(PROPOSER_SECRET_KEY).unwrap();
    let secret_key = SecretKey::try_from(secret_bytes.as_slice()).unwrap();

    let mut block = SignedBlindedBeaconBlock::default();
    block.message.slot = slot;
    block.message.proposer_index = 0;
    block.message.body.execution_payload_header = header.clone();
    block.signature =
        sign_message(&block.message, &secret_key, chain.domain_beacon_proposer).unwrap();
    block
}

async fn wait_for_delivery(relay: &Relay, slot: u64) -> Option<String> {
    for _ in 0..100 {
        if let Some(builder) = relay.bid_board().get_payload_delivered(slot).await.unwrap() {
            return Some(builder);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[test]
fn interop_key_matches_the_custom_testnet_table() {
    let secret_bytes = try_bytes_from_hex_str(PROPOSER_SECRET_KEY).unwrap();
    let secret_key = SecretKey::try_from(secret_bytes.as_slice()).unwrap();
    assert_eq!(secret_key.public_key(), proposer_public_key());
}

#[tokio::test]
async fn single_builder_happy_path() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let submission = builder.submission(100, 1000, "http://unused.invalid/");
    let header = submission.message.execution_payload_header.clone();

    let mut payload = ExecutionPayload::default();
    payload.block_hash = header.block_hash.clone();
    payload.timestamp = header.timestamp;
    let endpoint = spawn_builder_endpoint(payload).await;
    let submission = SignedBidSubmission { endpoint: endpoint.clone(), ..submission };

    let response = harness.relay.submit_block(submission, now_millis()).await.unwrap();
    assert_eq!(response.highest_bid_value, U256::from(1000u64));
    assert!(response.highest_bid_builder.eq_ignore_ascii_case(&builder.wallet));
    assert!(response.bid_id.starts_with("0x"));

    // proposer pulls the signed winning header
    let parent_hash = header.parent_hash.to_string();
    let served =
        harness.relay.get_header(100, &parent_hash, PROPOSER_PUBLIC_KEY).await.unwrap();
    assert_eq!(served.version, "capella");
    assert_eq!(served.data.message.value, U256::from(1000u64));
    assert_eq!(served.data.message.public_key, *harness.relay.public_key());

    // proposer returns its signed blinded block and gets the payload back
    let block = signed_blinded_block(100, &header);
    let unblinded = harness.relay.get_payload(block).await.unwrap();
    assert_eq!(unblinded.version, "capella");
    assert_eq!(unblinded.data.block_hash, header.block_hash);

    let delivered = wait_for_delivery(&harness.relay, 100).await.expect("delivery marker set");
    assert!(delivered.eq_ignore_ascii_case(&builder.wallet));
}

#[tokio::test]
async fn higher_bid_replaces_the_winner() {
    let harness = harness(99).await;
    let first = TestBuilder::random();
    let second = TestBuilder::random();
    allow_builder(&harness.store, &first.wallet).await;
    allow_builder(&harness.store, &second.wallet).await;

    let response = harness
        .relay
        .submit_block(first.submission(100, 1000, "http://builder-a.invalid/"), now_millis())
        .await
        .unwrap();
    assert!(response.highest_bid_builder.eq_ignore_ascii_case(&first.wallet));

    let response = harness
        .relay
        .submit_block(second.submission(100, 2000, "http://builder-b.invalid/"), now_millis())
        .await
        .unwrap();
    assert_eq!(response.highest_bid_value, U256::from(2000u64));
    assert!(response.highest_bid_builder.eq_ignore_ascii_case(&second.wallet));

    let served = harness
        .relay
        .get_header(100, &hash_for(100, 0).to_string(), PROPOSER_PUBLIC_KEY)
        .await
        .unwrap();
    assert_eq!(served.data.message.value, U256::from(2000u64));
}

#[tokio::test]
async fn delivered_slot_locks_out_new_submissions() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    harness.relay.bid_board().put_payload_delivered(100, &builder.wallet).await.unwrap();

    let late = TestBuilder::random();
    allow_builder(&harness.store, &late.wallet).await;
    let result = harness
        .relay
        .submit_block(late.submission(100, 1_000_000_000, "http://late.invalid/"), now_millis())
        .await;
    assert!(matches!(result, Err(Error::StateConflict(_))));
}

#[tokio::test]
async fn bounty_race_has_exactly_one_winner() {
    let harness = harness(199).await;
    let incumbent = TestBuilder::random();
    let first = TestBuilder::random();
    let second = TestBuilder::random();
    for builder in [&incumbent, &first, &second] {
        allow_builder(&harness.store, &builder.wallet).await;
    }

    harness
        .relay
        .submit_block(incumbent.submission(200, 500, "http://incumbent.invalid/"), now_millis())
        .await
        .unwrap();

    // both bounties land two seconds after the slot's canonical time
    let received_at = (GENESIS_TIME + 200 * 12 + 2) * 1000;
    let (left, right) = tokio::join!(
        harness.relay.submit_bounty_bid(
            first.submission(200, 1500, "http://bounty-a.invalid/"),
            received_at,
        ),
        harness.relay.submit_bounty_bid(
            second.submission(200, 1500, "http://bounty-b.invalid/"),
            received_at,
        ),
    );

    let outcomes = [left.is_ok(), right.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one bounty must win");
    let loser = if outcomes[0] { right } else { left };
    assert!(matches!(loser, Err(Error::StateConflict(_))));

    let winner_wallet =
        if outcomes[0] { first.wallet.clone() } else { second.wallet.clone() };
    let recorded = harness.relay.bid_board().get_bounty_bid(200).await.unwrap().unwrap();
    assert!(recorded.eq_ignore_ascii_case(&winner_wallet));

    // the bounty displaces the incumbent for payload delivery
    let served = harness
        .relay
        .get_header(200, &hash_for(200, 0).to_string(), PROPOSER_PUBLIC_KEY)
        .await
        .unwrap();
    assert_eq!(served.data.message.value, U256::from(1500u64));
}

#[tokio::test]
async fn bounty_outside_the_window_is_rejected_before_crypto() {
    let harness = harness(199).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let mut submission = builder.submission(200, 5000, "http://bounty.invalid/");
    // crypto is never consulted, so a garbage signature must not matter
    submission.rpbs.s1_hat = "zz".into();

    let slot_time = GENESIS_TIME + 200 * 12;
    let early = harness.relay.submit_bounty_bid(submission.clone(), (slot_time + 1) * 1000).await;
    assert!(matches!(early, Err(Error::Validation(_))));
    let late = harness.relay.submit_bounty_bid(submission, (slot_time + 4) * 1000).await;
    assert!(matches!(late, Err(Error::Validation(_))));

    assert!(harness.relay.bid_board().get_bounty_bid(200).await.unwrap().is_none());
}

#[tokio::test]
async fn tampered_rpbs_writes_no_state() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let mut submission = builder.submission(100, 1000, "http://builder.invalid/");
    // nudge s1̂ by one in the scalar field
    let s1 = u8::from_str_radix(&submission.rpbs.s1_hat[..2], 16).unwrap();
    submission.rpbs.s1_hat.replace_range(..2, &format!("{:02x}", s1.wrapping_add(1)));

    let result = harness.relay.submit_block(submission, now_millis()).await;
    match result {
        Err(Error::Validation(reason)) => assert_eq!(reason, "RPBS verify failed"),
        other => panic!("expected RPBS rejection, got {other:?}"),
    }

    assert!(matches!(
        harness.relay.bid_board().winning_bid(100).await,
        Err(Error::NoWinningBid(100))
    ));
    assert!(harness
        .relay
        .bid_board()
        .builder_block_last(100, &builder.wallet)
        .await
        .unwrap()
        .is_none());
    assert!(harness.sink.block_submissions.lock().is_empty());
}

#[tokio::test]
async fn stale_receipt_times_are_rejected() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let base = now_millis();
    harness
        .relay
        .submit_block(builder.submission(100, 1000, "http://builder.invalid/"), base)
        .await
        .unwrap();

    let replay = harness
        .relay
        .submit_block(builder.submission(100, 900, "http://builder.invalid/"), base - 1)
        .await;
    assert!(matches!(replay, Err(Error::Validation(_))));
}

#[tokio::test]
async fn wrong_slot_timestamps_never_mutate_state() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let mut submission = builder.submission(100, 1000, "http://builder.invalid/");
    submission.message.execution_payload_header.timestamp += 1;

    let result = harness.relay.submit_block(submission, now_millis()).await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(matches!(
        harness.relay.bid_board().winning_bid(100).await,
        Err(Error::NoWinningBid(100))
    ));
}

#[tokio::test]
async fn submissions_outside_the_slot_window_are_rejected() {
    let harness = harness(99).await;
    let builder = TestBuilder::random();
    allow_builder(&harness.store, &builder.wallet).await;

    let past = harness
        .relay
        .submit_block(builder.submission(98, 1000, "http://builder.invalid/"), now_millis())
        .await;
    assert!(matches!(past, Err(Error::Validation(_))));

    let future = harness
        .relay
        .submit_block(builder.submission(101, 1000, "http://builder.invalid/"), now_millis())
        .await;
    assert!(matches!(future, Err(Error::Validation(_))));
}
