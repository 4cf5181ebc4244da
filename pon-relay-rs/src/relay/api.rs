//! HTTP surface of the relay: thin axum handlers over [`Relay`].

use super::{unix_millis, Relay};
use crate::{
    types::{BuilderWinningBid, HeaderResponse, PayloadResponse, SignedBidSubmission},
    Error,
};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, IntoMakeService},
    Router,
};
use ethereum_consensus::primitives::Slot;
use hyper::server::conn::AddrIncoming;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::task::JoinHandle;

const PARENT_HASH_HEX_LENGTH: usize = 66;
const PUBLIC_KEY_HEX_LENGTH: usize = 98;

pub type RelayServer = axum::Server<AddrIncoming, IntoMakeService<Router>>;

async fn handle_landing() -> impl IntoResponse {
    Json("PoN Relay")
}

async fn handle_status_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Registrations are accepted without processing.
async fn handle_register_validators(
    Json(registrations): Json<serde_json::Value>,
) -> impl IntoResponse {
    let count = registrations.as_array().map(|r| r.len()).unwrap_or_default();
    tracing::trace!(count, "accepted validator registrations");
    StatusCode::OK
}

async fn handle_submit_block(
    State(relay): State<Relay>,
    Json(submission): Json<SignedBidSubmission>,
) -> Result<Json<BuilderWinningBid>, Error> {
    let received_at = unix_millis();
    let response = relay.submit_block(submission, received_at).await?;
    Ok(Json(response))
}

async fn handle_submit_bounty_bid(
    State(relay): State<Relay>,
    Json(submission): Json<SignedBidSubmission>,
) -> Result<Json<BuilderWinningBid>, Error> {
    let received_at = unix_millis();
    let response = relay.submit_bounty_bid(submission, received_at).await?;
    Ok(Json(response))
}

async fn handle_get_header(
    State(relay): State<Relay>,
    Path((slot, parent_hash, public_key)): Path<(String, String, String)>,
) -> Result<Json<HeaderResponse>, Error> {
    let (slot, parent_hash, public_key) = proposer_parameters(slot, parent_hash, public_key)?;
    let response = relay.get_header(slot, &parent_hash, &public_key).await?;
    Ok(Json(response))
}

async fn handle_get_payload(
    State(relay): State<Relay>,
    Json(signed_block): Json<crate::types::SignedBlindedBeaconBlock>,
) -> Result<Json<PayloadResponse>, Error> {
    let response = relay.get_payload(signed_block).await?;
    Ok(Json(response))
}

fn proposer_parameters(
    slot: String,
    parent_hash: String,
    public_key: String,
) -> Result<(Slot, String, String), Error> {
    let slot = slot
        .parse::<Slot>()
        .map_err(|_| Error::MalformedRequest(format!("invalid slot {slot}")))?;
    if parent_hash.len() != PARENT_HASH_HEX_LENGTH || !parent_hash.starts_with("0x") {
        return Err(Error::MalformedRequest("parent hash has the wrong length".to_string()));
    }
    if public_key.len() != PUBLIC_KEY_HEX_LENGTH || !public_key.starts_with("0x") {
        return Err(Error::MalformedRequest("proposer pubkey has the wrong length".to_string()));
    }
    Ok((slot, parent_hash, public_key))
}

pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/relay", get(handle_landing))
        .route("/eth/v1/builder/status", get(handle_status_check))
        .route("/eth/v1/builder/validators", post(handle_register_validators))
        .route("/relay/v1/builder/blocks", post(handle_submit_block))
        .route("/relay/v1/builder/bounty_bids", post(handle_submit_bounty_bid))
        .route("/eth/v1/builder/header/:slot/:parent_hash/:pubkey", get(handle_get_header))
        .route("/eth/v1/builder/blinded_blocks", post(handle_get_payload))
        .with_state(relay)
}

pub struct Server {
    host: Ipv4Addr,
    port: u16,
    relay: Relay,
}

impl Server {
    pub fn new(host: Ipv4Addr, port: u16, relay: Relay) -> Self {
        Self { host, port, relay }
    }

    pub fn serve(&self) -> RelayServer {
        let addr = SocketAddr::from((self.host, self.port));
        axum::Server::bind(&addr).serve(router(self.relay.clone()).into_make_service())
    }

    /// Spawns the server on its own task, returning the handle.
    pub fn spawn(&self) -> JoinHandle<Result<(), Error>> {
        let server = self.serve();
        let address = server.local_addr();
        tokio::spawn(async move {
            tracing::info!(%address, "relay server listening");
            let result = server.await;
            if let Err(ref err) = result {
                tracing::error!(%err, "error while serving");
            }
            result.map_err(|err| Error::Internal(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposer_parameters_enforce_shapes() {
        let hash = format!("0x{}", "0".repeat(64));
        let key = format!("0x{}", "0".repeat(96));
        assert!(proposer_parameters("100".into(), hash.clone(), key.clone()).is_ok());
        assert!(proposer_parameters("x".into(), hash.clone(), key.clone()).is_err());
        assert!(proposer_parameters("100".into(), "0xdead".into(), key.clone()).is_err());
        assert!(proposer_parameters("100".into(), hash, "0xbeef".into()).is_err());
    }
}
