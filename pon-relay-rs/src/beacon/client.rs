//! One upstream consensus node: thin typed REST access plus the two
//! server-sent-event subscriptions.

use super::{types::*, Error};
use crate::types::SignedBlindedBeaconBlock;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BeaconClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl BeaconClient {
    pub fn new(endpoint: Url) -> Self {
        Self { http: reqwest::Client::new(), endpoint }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.endpoint.join(path).map_err(|err| Error::Endpoint(err.to_string()))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let response = self.http.get(url).header("accept", "application/json").send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus { status: status.as_u16(), body });
        }
        let wrapper: ApiResult<T> = response.json().await?;
        Ok(wrapper.data)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, Error> {
        self.fetch(self.url("/eth/v1/node/syncing")?).await
    }

    pub async fn genesis(&self) -> Result<GenesisDetails, Error> {
        self.fetch(self.url("/eth/v1/beacon/genesis")?).await
    }

    pub async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, Error> {
        self.fetch(self.url(&format!("/eth/v1/validator/duties/proposer/{epoch}"))?).await
    }

    pub async fn validators(&self, slot: u64) -> Result<Vec<ValidatorSummary>, Error> {
        let mut url = self.url(&format!("/eth/v1/beacon/states/{slot}/validators"))?;
        url.query_pairs_mut().append_pair("status", "active,pending");
        self.fetch(url).await
    }

    pub async fn validators_by_pubkey(
        &self,
        public_keys: &[String],
    ) -> Result<Vec<ValidatorSummary>, Error> {
        let mut url = self.url("/eth/v1/beacon/states/head/validators")?;
        for public_key in public_keys {
            url.query_pairs_mut().append_pair("id", public_key);
        }
        self.fetch(url).await
    }

    pub async fn expected_withdrawals(&self, slot: u64) -> Result<Vec<Withdrawal>, Error> {
        self.fetch(self.url(&format!("/eth/v1/builder/states/{slot}/expected_withdrawals"))?).await
    }

    pub async fn randao(&self, slot: u64) -> Result<String, Error> {
        let mix: RandaoMix =
            self.fetch(self.url(&format!("/eth/v1/beacon/states/{slot}/randao"))?).await?;
        Ok(mix.randao)
    }

    pub async fn block_header(&self, slot: u64) -> Result<BlockHeaderData, Error> {
        self.fetch(self.url(&format!("/eth/v1/beacon/headers/{slot}"))?).await
    }

    pub async fn head_block_header(&self) -> Result<BlockHeaderData, Error> {
        self.fetch(self.url("/eth/v1/beacon/headers/head")?).await
    }

    pub async fn fork(&self, slot: Option<u64>) -> Result<ForkData, Error> {
        let url = match slot {
            Some(slot) => self.url(&format!("/eth/v1/beacon/states/{slot}/fork"))?,
            None => self.url("/eth/v1/beacon/states/head/fork")?,
        };
        self.fetch(url).await
    }

    pub async fn publish_block(&self, block: &SignedBlindedBeaconBlock) -> Result<(), Error> {
        let url = self.url("/eth/v1/beacon/blocks")?;
        let response = self.http.post(url).json(block).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus { status: status.as_u16(), body });
        }
        Ok(())
    }

    /// Streams decoded events from `topic` into `events` until the sender
    /// closes. Transient stream failures back off for a second and reopen.
    pub async fn subscribe<T>(&self, topic: &str, events: mpsc::Sender<T>)
    where
        T: serde::de::DeserializeOwned,
    {
        let url = match self.url(&format!("/eth/v1/events?topics={topic}")) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(endpoint = %self.endpoint, %err, "invalid event stream url");
                return;
            }
        };
        loop {
            match self.http.get(url.clone()).send().await {
                Ok(response) => {
                    let mut stream = response.bytes_stream().eventsource();
                    while let Some(event) = stream.next().await {
                        let event = match event {
                            Ok(event) => event,
                            Err(err) => {
                                tracing::warn!(endpoint = %self.endpoint, %err, topic, "event stream broke");
                                break;
                            }
                        };
                        match serde_json::from_str::<T>(&event.data) {
                            Ok(decoded) => {
                                if events.send(decoded).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(endpoint = %self.endpoint, %err, topic, "undecodable event");
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, %err, topic, "could not open event stream");
                }
            }
            if events.is_closed() {
                return;
            }
            tokio::time::sleep(STREAM_RETRY_DELAY).await;
            tracing::debug!(endpoint = %self.endpoint, topic, "reconnecting event stream");
        }
    }
}
