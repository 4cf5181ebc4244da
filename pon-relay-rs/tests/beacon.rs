//! Coordinator behavior against live HTTP stubs: ranked failover, cache
//! read-through, and all-client publish fan-out.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pon_relay_rs::{
    beacon::MultiBeaconClient,
    types::SignedBlindedBeaconBlock,
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use url::Url;

#[derive(Clone, Default)]
struct StubState {
    randao_calls: Arc<AtomicUsize>,
    duty_calls: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
    reject_publishes: bool,
}

async fn syncing() -> Json<serde_json::Value> {
    Json(json!({"data": {"head_slot": "100", "sync_distance": "0", "is_syncing": false}}))
}

async fn randao(State(stub): State<StubState>, Path(slot): Path<u64>) -> Json<serde_json::Value> {
    stub.randao_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"data": {"randao": format!("0x{slot:064x}")}}))
}

async fn duties(
    State(stub): State<StubState>,
    Path(epoch): Path<u64>,
) -> Json<serde_json::Value> {
    stub.duty_calls.fetch_add(1, Ordering::SeqCst);
    let duties: Vec<_> = (0..32)
        .map(|offset| {
            let slot = epoch * 32 + offset;
            json!({
                "pubkey": format!("0x{:096x}", slot),
                "validator_index": offset.to_string(),
                "slot": slot.to_string(),
            })
        })
        .collect();
    Json(json!({"data": duties}))
}

async fn headers(Path(slot): Path<u64>) -> Json<serde_json::Value> {
    Json(json!({"data": {
        "root": format!("0x{slot:064x}"),
        "canonical": true,
        "header": {
            "message": {
                "slot": slot.to_string(),
                "proposer_index": "0",
                "parent_root": format!("0x{:064x}", slot.saturating_sub(1)),
                "state_root": format!("0x{:064x}", slot + 1000),
                "body_root": format!("0x{slot:064x}"),
            },
            "signature": "0x00",
        },
    }}))
}

async fn withdrawals(Path(slot): Path<u64>) -> Json<serde_json::Value> {
    Json(json!({"data": [{
        "index": "1",
        "validator_index": "2",
        "address": format!("0x{:040x}", slot),
        "amount": "32",
    }]}))
}

async fn publish(State(stub): State<StubState>) -> impl IntoResponse {
    stub.publishes.fetch_add(1, Ordering::SeqCst);
    if stub.reject_publishes {
        (StatusCode::BAD_REQUEST, "rejected").into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

async fn spawn_stub(stub: StubState) -> Url {
    let app = Router::new()
        .route("/eth/v1/node/syncing", get(syncing))
        .route("/eth/v1/beacon/states/:slot/randao", get(randao))
        .route("/eth/v1/validator/duties/proposer/:epoch", get(duties))
        .route("/eth/v1/beacon/headers/:slot", get(headers))
        .route("/eth/v1/builder/states/:slot/expected_withdrawals", get(withdrawals))
        .route("/eth/v1/beacon/blocks", post(publish))
        .with_state(stub);
    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let address = server.local_addr();
    tokio::spawn(server);
    Url::parse(&format!("http://{address}/")).unwrap()
}

fn dead_endpoint() -> Url {
    // nothing listens on the discard port; connections are refused outright
    Url::parse("http://127.0.0.1:9/").unwrap()
}

#[tokio::test]
async fn failover_rolls_past_dead_upstreams() {
    let stub = StubState::default();
    let good = spawn_stub(stub.clone()).await;
    let multi = MultiBeaconClient::new(vec![dead_endpoint(), good]);

    let randao = multi.randao(7).await.unwrap();
    assert_eq!(randao, format!("0x{:064x}", 7));
    assert_eq!(stub.randao_calls.load(Ordering::SeqCst), 1);

    // second read is served from the cache
    let cached = multi.randao(7).await.unwrap();
    assert_eq!(cached, randao);
    assert_eq!(stub.randao_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proposer_lookup_refetches_the_whole_epoch_once() {
    let stub = StubState::default();
    let good = spawn_stub(stub.clone()).await;
    let multi = MultiBeaconClient::new(vec![good]);

    let duty = multi.get_slot_proposer(70).await.unwrap();
    assert_eq!(duty.slot, 70);
    assert_eq!(stub.duty_calls.load(Ordering::SeqCst), 1);

    // the rest of the epoch is now cached
    let sibling = multi.get_slot_proposer(65).await.unwrap();
    assert_eq!(sibling.slot, 65);
    assert_eq!(stub.duty_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn payload_attributes_are_synthesised_on_miss() {
    let stub = StubState::default();
    let good = spawn_stub(stub.clone()).await;
    let multi = MultiBeaconClient::new(vec![good]);

    let attributes = multi.get_payload_attributes(70).await.unwrap();
    assert_eq!(attributes.proposal_slot, 70);
    assert_eq!(attributes.payload_attributes.prev_randao, format!("0x{:064x}", 69));
    assert_eq!(attributes.payload_attributes.withdrawals.len(), 1);

    // synthesised entries are cached
    let again = multi.get_payload_attributes(70).await.unwrap();
    assert_eq!(again.parent_block_hash, attributes.parent_block_hash);
}

#[tokio::test]
async fn publish_fans_out_and_tolerates_partial_failure() {
    let accepting = StubState::default();
    let rejecting = StubState { reject_publishes: true, ..Default::default() };
    let good = spawn_stub(accepting.clone()).await;
    let bad = spawn_stub(rejecting.clone()).await;

    let multi = MultiBeaconClient::new(vec![bad, good, dead_endpoint()]);
    multi.publish_block(&SignedBlindedBeaconBlock::default()).await.unwrap();

    assert_eq!(accepting.publishes.load(Ordering::SeqCst), 1);
    assert_eq!(rejecting.publishes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publish_fails_only_when_every_upstream_fails() {
    let rejecting = StubState { reject_publishes: true, ..Default::default() };
    let bad = spawn_stub(rejecting).await;
    let multi = MultiBeaconClient::new(vec![bad, dead_endpoint()]);
    assert!(multi.publish_block(&SignedBlindedBeaconBlock::default()).await.is_err());
}

#[tokio::test]
async fn sync_status_ranks_live_nodes_first() {
    let stub = StubState::default();
    let good = spawn_stub(stub).await;
    let good_endpoint = good.to_string();
    let multi = MultiBeaconClient::new(vec![dead_endpoint(), good]);

    let status = multi.sync_status().await.unwrap();
    assert!(!status.is_syncing);
    assert_eq!(status.head_slot, 100);
    assert_eq!(multi.endpoints()[0], good_endpoint);
}
