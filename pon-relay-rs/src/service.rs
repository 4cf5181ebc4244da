//! Wires configuration into the running relay: fatal startup dependencies
//! first, then the background workers, then the HTTP server.

use crate::{
    beacon::MultiBeaconClient,
    bulletin::{self, BulletinBoard},
    config::Config,
    database::PostgresSink,
    network::ChainContext,
    registry::{RegistryClient, RegistrySync},
    relay::{api, Relay},
    signing::SecretKey,
    store::RedisStore,
    Error,
};
use ethereum_consensus::serde::try_bytes_from_hex_str;
use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};
use tokio::task::{JoinError, JoinHandle};
use url::Url;

pub struct Service {
    config: Config,
}

impl Service {
    pub fn from(config: Config) -> Self {
        Self { config }
    }

    /// Bring up every dependency and spawn the server. Failures here are
    /// fatal; once this returns, all error paths are non-fatal.
    pub async fn spawn(self) -> Result<ServiceHandle, Error> {
        let config = self.config;

        let chain = ChainContext::new(config.network)?;
        tracing::info!(network = %chain.network, genesis_time = chain.genesis_time, "starting relay");

        let secret_key = parse_secret_key(&config.secret_key)?;

        let sink = Arc::new(
            PostgresSink::connect(&config.database)
                .await
                .map_err(|err| Error::Internal(format!("database unavailable: {err}")))?,
        );

        let endpoints = config
            .beacon_endpoints
            .iter()
            .map(|endpoint| Url::parse(endpoint))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::Internal(format!("invalid beacon endpoint: {err}")))?;
        if endpoints.is_empty() {
            return Err(Error::Internal("no beacon endpoints configured".to_string()));
        }
        let beacon = MultiBeaconClient::new(endpoints);
        tracing::info!("waiting for a synced consensus node");
        beacon.wait_synced().await;
        beacon.start();

        let store = Arc::new(
            RedisStore::connect(&config.redis_uri)
                .await
                .map_err(|err| Error::Internal(format!("key-value store unavailable: {err}")))?,
        );

        let (bulletin, channels) = BulletinBoard::new();
        bulletin::spawn_publisher(&config.bulletin_board, channels);

        let registry_client =
            RegistryClient::new(config.registry_url.clone(), config.registry_api_key.clone());
        RegistrySync::new(registry_client, store.clone(), sink.clone(), beacon.clone()).start();

        let relay = Relay::new(
            chain,
            secret_key,
            store,
            sink,
            beacon,
            bulletin,
            Duration::from_secs(config.bid_timeout_secs),
        );

        let server = api::Server::new(config.host, config.port, relay).spawn();
        Ok(ServiceHandle { server })
    }
}

fn parse_secret_key(encoded: &str) -> Result<SecretKey, Error> {
    let bytes = try_bytes_from_hex_str(encoded)
        .map_err(|err| Error::Internal(format!("invalid relay secret key: {err}")))?;
    SecretKey::try_from(bytes.as_slice())
        .map_err(|err| Error::Internal(format!("invalid relay secret key: {err}")))
}

/// Handle to the spawned server task; resolves when the server stops.
#[pin_project::pin_project]
pub struct ServiceHandle {
    #[pin]
    server: JoinHandle<Result<(), Error>>,
}

impl Future for ServiceHandle {
    type Output = Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.server.poll(cx).map(|result| result.map(|_| ()))
    }
}
