//! Redundant access to a set of upstream consensus nodes.
//!
//! Every read fails over across the ranked client list; block publication
//! fans out to every node at once. Chain state observed through the head and
//! payload-attribute event streams is deduplicated into one shared cache.

pub mod cache;
pub mod client;
pub mod types;

use cache::BeaconCache;
use client::BeaconClient;
use ethereum_consensus::primitives::{Epoch, Slot};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::mpsc;
use types::*;
use url::Url;

use crate::network::SLOTS_PER_EPOCH;
use crate::types::SignedBlindedBeaconBlock;

const EVENT_CHANNEL_DEPTH: usize = 64;
const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("all consensus nodes failed")]
    AllClientsFailed,
    #[error("no proposer known for slot {0}")]
    UnknownProposer(Slot),
    #[error("no payload attributes known for slot {0}")]
    UnknownPayloadAttributes(Slot),
    #[error("validator index {0} is not known")]
    UnknownValidatorIndex(u64),
}

struct ClientEntry {
    node: BeaconClient,
    node_speed: Duration,
    last_used: Instant,
    last_response_status: u16,
    sync_status: Option<SyncStatus>,
}

impl ClientEntry {
    fn new(node: BeaconClient) -> Self {
        Self {
            node,
            node_speed: Duration::ZERO,
            last_used: Instant::now(),
            last_response_status: 0,
            sync_status: None,
        }
    }
}

pub struct MultiBeaconClient {
    /// Ranking state; a separate lock from the chain cache so request
    /// bookkeeping never contends with cache reads.
    clients: Mutex<Vec<ClientEntry>>,
    pub cache: Mutex<BeaconCache>,
}

impl MultiBeaconClient {
    pub fn new(endpoints: Vec<Url>) -> Arc<Self> {
        let clients =
            endpoints.into_iter().map(|url| ClientEntry::new(BeaconClient::new(url))).collect();
        Arc::new(Self { clients: Mutex::new(clients), cache: Mutex::new(Default::default()) })
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.clients.lock().iter().map(|entry| entry.node.endpoint().to_string()).collect()
    }

    pub fn head_slot(&self) -> Slot {
        self.cache.lock().current_slot
    }

    fn ranked_nodes(&self) -> Vec<BeaconClient> {
        self.clients.lock().iter().map(|entry| entry.node.clone()).collect()
    }

    fn record_attempt(&self, endpoint: &str, status: u16, elapsed: Duration) {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.iter_mut().find(|entry| entry.node.endpoint() == endpoint) {
            entry.last_response_status = status;
            entry.last_used = Instant::now();
            entry.node_speed = elapsed;
        }
    }

    /// Re-sort the client list: synced first, then highest head, best last
    /// status, fastest, most recently used.
    fn rerank(&self) {
        let mut clients = self.clients.lock();
        clients.sort_by(|a, b| {
            let a_syncing = a.sync_status.as_ref().map(|s| s.is_syncing).unwrap_or(true);
            let b_syncing = b.sync_status.as_ref().map(|s| s.is_syncing).unwrap_or(true);
            let a_head = a.sync_status.as_ref().map(|s| s.head_slot).unwrap_or(0);
            let b_head = b.sync_status.as_ref().map(|s| s.head_slot).unwrap_or(0);
            a_syncing
                .cmp(&b_syncing)
                .then(b_head.cmp(&a_head))
                .then(a.last_response_status.cmp(&b.last_response_status))
                .then(a.node_speed.cmp(&b.node_speed))
                .then(b.last_used.cmp(&a.last_used))
        });
    }

    /// Try `op` against each client in ranked order, returning the first
    /// success and recording per-attempt status and latency.
    async fn failover<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: Fn(BeaconClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut last_error = Error::AllClientsFailed;
        for node in self.ranked_nodes() {
            let endpoint = node.endpoint().to_string();
            let started = Instant::now();
            match op(node).await {
                Ok(value) => {
                    self.record_attempt(&endpoint, 200, started.elapsed());
                    self.rerank();
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(%endpoint, %err, "consensus node call failed, rolling over");
                    self.record_attempt(&endpoint, 500, started.elapsed());
                    last_error = err;
                }
            }
        }
        self.rerank();
        Err(last_error)
    }

    pub async fn get_validator_list(&self, slot: Slot) -> Result<Vec<ValidatorSummary>, Error> {
        self.failover(|node| async move { node.validators(slot).await }).await
    }

    pub async fn get_proposer_map(
        &self,
        epoch: Epoch,
    ) -> Result<HashMap<Slot, ProposerDuty>, Error> {
        let duties = self.failover(|node| async move { node.proposer_duties(epoch).await }).await?;
        Ok(duties.into_iter().map(|duty| (duty.slot, duty)).collect())
    }

    pub async fn genesis(&self) -> Result<GenesisDetails, Error> {
        self.failover(|node| async move { node.genesis().await }).await
    }

    pub async fn get_withdrawals(&self, slot: Slot) -> Result<Vec<Withdrawal>, Error> {
        self.failover(|node| async move { node.expected_withdrawals(slot).await }).await
    }

    /// Randao read-through: the cache first, then ranked upstreams.
    pub async fn randao(&self, slot: Slot) -> Result<String, Error> {
        if let Some(known) = self.cache.lock().randao.get(&slot).cloned() {
            return Ok(known);
        }
        let randao = self.failover(|node| async move { node.randao(slot).await }).await?;
        self.cache.lock().randao.insert(slot, randao.clone());
        Ok(randao)
    }

    pub async fn get_block_header(&self, slot: Slot) -> Result<BlockHeaderData, Error> {
        self.failover(|node| async move { node.block_header(slot).await }).await
    }

    pub async fn get_current_block_header(&self) -> Result<BlockHeaderData, Error> {
        self.failover(|node| async move { node.head_block_header().await }).await
    }

    /// Resolve `pubkey ↔ index` for a batch of validators and remember them.
    pub async fn get_validator_index(&self, public_keys: Vec<String>) -> Result<(), Error> {
        let keys = public_keys.clone();
        let summaries = self
            .failover(move |node| {
                let keys = keys.clone();
                async move { node.validators_by_pubkey(&keys).await }
            })
            .await?;
        let mut cache = self.cache.lock();
        cache.record_validators(
            summaries.into_iter().map(|summary| (summary.validator.public_key, summary.index)),
        );
        Ok(())
    }

    pub fn validator_pubkey_for_index(&self, index: u64) -> Result<String, Error> {
        self.cache
            .lock()
            .validator_pubkey_by_index
            .get(&index)
            .cloned()
            .ok_or(Error::UnknownValidatorIndex(index))
    }

    pub async fn get_fork_version(&self, slot: Option<Slot>) -> Result<String, Error> {
        let fork = self.failover(|node| async move { node.fork(slot).await }).await?;
        self.cache.lock().current_fork_version = fork.current_version.clone();
        Ok(fork.current_version)
    }

    /// Publication fans out to every client at once and succeeds if any
    /// upstream accepts the block.
    pub async fn publish_block(&self, block: &SignedBlindedBeaconBlock) -> Result<(), Error> {
        let nodes = self.ranked_nodes();
        if nodes.is_empty() {
            return Err(Error::AllClientsFailed);
        }
        let submissions = nodes.into_iter().map(|node| {
            let block = block.clone();
            async move {
                let endpoint = node.endpoint().to_string();
                let started = Instant::now();
                let result = node.publish_block(&block).await;
                (endpoint, started.elapsed(), result)
            }
        });
        let mut last_error = Error::AllClientsFailed;
        let mut successes = 0usize;
        let mut failures = 0usize;
        for (endpoint, elapsed, result) in join_all(submissions).await {
            match result {
                Ok(()) => {
                    successes += 1;
                    self.record_attempt(&endpoint, 200, elapsed);
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(%endpoint, %err, "block publication failed");
                    self.record_attempt(&endpoint, 500, elapsed);
                    last_error = err;
                }
            }
        }
        self.rerank();
        if successes > 0 {
            tracing::info!(successes, failures, "published block to consensus nodes");
            Ok(())
        } else {
            Err(last_error)
        }
    }

    /// Query sync status from every client concurrently; this is the one
    /// uniform request, so it doubles as the performance sampler.
    pub async fn sync_status(&self) -> Result<SyncStatus, Error> {
        let nodes = self.ranked_nodes();
        let probes = nodes.into_iter().map(|node| async move {
            let endpoint = node.endpoint().to_string();
            let started = Instant::now();
            let result = node.sync_status().await;
            (endpoint, started.elapsed(), result)
        });
        for (endpoint, elapsed, result) in join_all(probes).await {
            match result {
                Ok(status) => {
                    self.record_attempt(&endpoint, 200, elapsed);
                    let mut clients = self.clients.lock();
                    if let Some(entry) =
                        clients.iter_mut().find(|entry| entry.node.endpoint() == endpoint)
                    {
                        entry.sync_status = Some(status);
                    }
                }
                Err(err) => {
                    tracing::warn!(endpoint, %err, "sync status probe failed");
                    self.record_attempt(&endpoint, 500, elapsed);
                }
            }
        }
        self.rerank();
        let clients = self.clients.lock();
        clients
            .first()
            .and_then(|entry| entry.sync_status.clone())
            .ok_or(Error::AllClientsFailed)
    }

    /// Block until at least one upstream reports itself synced.
    pub async fn wait_synced(&self) {
        loop {
            if let Ok(status) = self.sync_status().await {
                if !status.is_syncing {
                    return;
                }
            }
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    /// Proposer read-through: on a miss the whole epoch is refetched before
    /// giving up.
    pub async fn get_slot_proposer(&self, slot: Slot) -> Result<ProposerDuty, Error> {
        if let Some(duty) = self.cache.lock().proposer_duties.get(&slot).cloned() {
            return Ok(duty);
        }
        tracing::warn!(slot, "inconsistent proposer mapping, refetching epoch");
        let duties = self.get_proposer_map(slot / SLOTS_PER_EPOCH).await?;
        let mut cache = self.cache.lock();
        cache.record_duties(duties.into_values());
        cache.proposer_duties.get(&slot).cloned().ok_or(Error::UnknownProposer(slot))
    }

    /// Payload-attribute read-through; a miss is synthesised from the
    /// proposer duty, the parent header, the parent randao and the expected
    /// withdrawals.
    pub async fn get_payload_attributes(&self, slot: Slot) -> Result<PayloadAttributesData, Error> {
        if let Some(attributes) = self.cache.lock().payload_attributes.get(&slot).cloned() {
            return Ok(attributes);
        }
        tracing::warn!(slot, "inconsistent payload attributes mapping, synthesising");

        let proposer = self.get_slot_proposer(slot).await?;
        let parent_header = self.get_block_header(slot.saturating_sub(1)).await?;
        let prev_randao = self.randao(slot.saturating_sub(1)).await?;
        let withdrawals = self.get_withdrawals(slot).await?;

        let attributes = PayloadAttributesData {
            proposer_index: proposer.validator_index,
            proposal_slot: slot,
            parent_block_root: parent_header.header.message.state_root.clone(),
            parent_block_hash: parent_header.root.clone(),
            payload_attributes: PayloadAttributes { prev_randao, withdrawals },
        };
        self.cache.lock().payload_attributes.insert(slot, attributes.clone());
        Ok(attributes)
    }

    async fn update_randao(self: Arc<Self>, slot: Slot) {
        if let Err(err) = self.randao(slot).await {
            tracing::warn!(slot, %err, "could not refresh randao");
        }
    }

    async fn update_proposer_map(self: Arc<Self>, epoch: Epoch) {
        match self.get_proposer_map(epoch).await {
            Ok(duties) => {
                let mut cache = self.cache.lock();
                cache.record_duties(duties.into_values());
            }
            Err(err) => tracing::warn!(epoch, %err, "could not refresh proposer duties"),
        }
    }

    /// Spawn the event subscriptions and their consumers.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_head_events().await });
        let this = self.clone();
        tokio::spawn(async move { this.run_payload_attribute_events().await });
    }

    /// Fan-in of head streams from every upstream. Acceptance is
    /// slot-monotonic; everything downstream of an accepted head happens off
    /// the cache lock.
    pub async fn run_head_events(self: Arc<Self>) {
        let (events, mut stream) = mpsc::channel::<HeadEvent>(EVENT_CHANNEL_DEPTH);
        for node in self.ranked_nodes() {
            let events = events.clone();
            tokio::spawn(async move { node.subscribe("head", events).await });
        }
        drop(events);

        while let Some(head) = stream.recv().await {
            let slot = head.slot;
            let accepted = self.cache.lock().accept_head(head);
            if !accepted {
                continue;
            }
            tracing::info!(slot, "accepted head event");

            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.sync_status().await;
            });

            for nearby in slot.saturating_sub(1)..=slot + 1 {
                tokio::spawn(self.clone().update_randao(nearby));
            }

            // refresh duties whenever the head sits on an epoch boundary
            if slot % SLOTS_PER_EPOCH == 0 || slot % SLOTS_PER_EPOCH == SLOTS_PER_EPOCH - 1 {
                let epoch = slot / SLOTS_PER_EPOCH;
                tokio::spawn(self.clone().update_proposer_map(epoch));
                tokio::spawn(self.clone().update_proposer_map(epoch + 1));
            }

            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.get_fork_version(None).await;
            });

            self.cache.lock().prune(slot);
        }
    }

    pub async fn run_payload_attribute_events(self: Arc<Self>) {
        let (events, mut stream) = mpsc::channel::<PayloadAttributesEvent>(EVENT_CHANNEL_DEPTH);
        for node in self.ranked_nodes() {
            let events = events.clone();
            tokio::spawn(async move { node.subscribe("payload_attributes", events).await });
        }
        drop(events);

        while let Some(event) = stream.recv().await {
            let slot = event.data.proposal_slot;
            tracing::debug!(
                slot,
                proposer_index = event.data.proposer_index,
                withdrawals = event.data.payload_attributes.withdrawals.len(),
                "received payload attributes event"
            );
            let mut cache = self.cache.lock();
            cache.payload_attributes.insert(slot, event.data);
            cache.prune(cache.current_slot.max(slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_prefers_synced_then_speed() {
        let multi = MultiBeaconClient::new(vec![
            Url::parse("http://node-a:5052").unwrap(),
            Url::parse("http://node-b:5052").unwrap(),
            Url::parse("http://node-c:5052").unwrap(),
        ]);
        {
            let mut clients = multi.clients.lock();
            clients[0].sync_status =
                Some(SyncStatus { head_slot: 100, sync_distance: 50, is_syncing: true });
            clients[0].node_speed = Duration::from_millis(1);
            clients[1].sync_status =
                Some(SyncStatus { head_slot: 150, sync_distance: 0, is_syncing: false });
            clients[1].node_speed = Duration::from_millis(30);
            clients[2].sync_status =
                Some(SyncStatus { head_slot: 150, sync_distance: 0, is_syncing: false });
            clients[2].node_speed = Duration::from_millis(5);
        }
        multi.rerank();
        let clients = multi.clients.lock();
        assert_eq!(clients[0].node.endpoint(), "http://node-c:5052/");
        assert_eq!(clients[1].node.endpoint(), "http://node-b:5052/");
        assert_eq!(clients[2].node.endpoint(), "http://node-a:5052/");
    }

    #[tokio::test]
    async fn failover_with_no_clients_reports_total_failure() {
        let multi = MultiBeaconClient::new(vec![]);
        let result = multi.get_withdrawals(1).await;
        assert!(matches!(result, Err(Error::AllClientsFailed)));
    }
}
