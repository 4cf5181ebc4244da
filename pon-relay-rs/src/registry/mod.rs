//! Periodic pull of the registry allow-lists, published into the scratchpad
//! for the fast per-request probe and mirrored into the audit store.

mod client;

pub use client::{
    BuilderEntry, RegisteredBuilder, RegisteredReporter, RegisteredValidator, RegistryClient,
    RegistryError,
};

use crate::{
    beacon::MultiBeaconClient,
    database::{AuditSink, BuilderRegistryRow, ReporterRegistryRow, ValidatorRegistryRow},
    network::EPOCH_DURATION_SECS,
    store::KvStore,
    Error,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

pub const BUILDER_STATUS_KEY: &str = "builder-status";
pub const VALIDATOR_STATUS_KEY: &str = "validator-status";
pub const REPORTER_STATUS_KEY: &str = "reporter-status";

const VALIDATOR_INDEX_BATCH: usize = 10;

/// Fast allow-list probe used by the submission pipeline.
pub async fn builder_status(store: &dyn KvStore, builder: &str) -> Result<bool, Error> {
    let status = store.hget(BUILDER_STATUS_KEY, builder).await?;
    Ok(status.as_deref() == Some("true"))
}

pub struct RegistrySync {
    client: RegistryClient,
    store: Arc<dyn KvStore>,
    sink: Arc<dyn AuditSink>,
    beacon: Arc<MultiBeaconClient>,
    builders_last: Mutex<HashMap<String, bool>>,
    validators_last: Mutex<HashMap<String, String>>,
    reporters_last: Mutex<HashMap<String, bool>>,
}

impl RegistrySync {
    pub fn new(
        client: RegistryClient,
        store: Arc<dyn KvStore>,
        sink: Arc<dyn AuditSink>,
        beacon: Arc<MultiBeaconClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            sink,
            beacon,
            builders_last: Default::default(),
            validators_last: Default::default(),
            reporters_last: Default::default(),
        })
    }

    /// One worker per table, each waking every epoch.
    pub fn start(self: &Arc<Self>) {
        let interval = Duration::from_secs(EPOCH_DURATION_SECS);
        for worker in
            [Worker::Builders, Worker::Validators, Worker::Reporters]
        {
            let this = self.clone();
            tokio::spawn(async move {
                loop {
                    this.run_once(worker).await;
                    tokio::time::sleep(interval).await;
                }
            });
        }
    }

    async fn run_once(&self, worker: Worker) {
        let result = match worker {
            Worker::Builders => self.sync_builders().await,
            Worker::Validators => self.sync_validators().await,
            Worker::Reporters => self.sync_reporters().await,
        };
        if let Err(err) = result {
            tracing::error!(?worker, %err, "registry sync pass failed");
        }
    }

    async fn sync_builders(&self) -> Result<(), Error> {
        let builders = self
            .client
            .get_builders()
            .await
            .map_err(|err| Error::Internal(format!("registry builders: {err}")))?;
        tracing::info!(count = builders.len(), "updating block builders");

        let changed: Vec<_> = {
            let last = self.builders_last.lock();
            builders
                .iter()
                .filter(|entry| last.get(&entry.builder.id).copied() != Some(entry.active))
                .cloned()
                .collect()
        };
        for entry in &changed {
            self.store
                .hset(BUILDER_STATUS_KEY, &entry.builder.id, bool_str(entry.active), None)
                .await?;
            self.builders_last.lock().insert(entry.builder.id.clone(), entry.active);
        }

        let rows = builders
            .iter()
            .map(|entry| BuilderRegistryRow {
                builder_pubkey: entry.builder.id.clone(),
                builder_stake: entry.builder.balance_staked.clone(),
                status: entry.active,
            })
            .collect();
        if let Err(err) = self.sink.upsert_builders(rows).await {
            tracing::error!(%err, "could not persist block builders");
        }
        Ok(())
    }

    async fn sync_validators(&self) -> Result<(), Error> {
        let validators = self
            .client
            .get_validators()
            .await
            .map_err(|err| Error::Internal(format!("registry validators: {err}")))?;
        tracing::info!(count = validators.len(), "updating validators");

        let mut new_validators = Vec::new();
        for validator in &validators {
            let changed = {
                let last = self.validators_last.lock();
                last.get(&validator.id) != Some(&validator.status)
            };
            if changed {
                self.store
                    .hset(VALIDATOR_STATUS_KEY, &validator.id, &validator.status, None)
                    .await?;
                self.validators_last.lock().insert(validator.id.clone(), validator.status.clone());
            }
            let known = self
                .beacon
                .cache
                .lock()
                .validator_index_by_pubkey
                .contains_key(&validator.id);
            if !known {
                new_validators.push(validator.id.clone());
            }
        }

        if !new_validators.is_empty() {
            tracing::info!(count = new_validators.len(), "resolving validator indices");
            for chunk in new_validators.chunks(VALIDATOR_INDEX_BATCH) {
                let beacon = self.beacon.clone();
                let chunk = chunk.to_vec();
                tokio::spawn(async move {
                    if let Err(err) = beacon.get_validator_index(chunk).await {
                        tracing::warn!(%err, "could not resolve validator indices");
                    }
                });
            }
        }

        let rows = validators
            .iter()
            .map(|validator| ValidatorRegistryRow {
                validator_pubkey: validator.id.clone(),
                status: validator.status.clone(),
                report_count: validator.report_count,
            })
            .collect();
        if let Err(err) = self.sink.upsert_validators(rows).await {
            tracing::error!(%err, "could not persist validators");
        }
        Ok(())
    }

    async fn sync_reporters(&self) -> Result<(), Error> {
        let reporters = self
            .client
            .get_reporters()
            .await
            .map_err(|err| Error::Internal(format!("registry reporters: {err}")))?;

        for reporter in &reporters {
            let changed = {
                let last = self.reporters_last.lock();
                last.get(&reporter.id).copied() != Some(reporter.active)
            };
            if changed {
                self.store
                    .hset(REPORTER_STATUS_KEY, &reporter.id, bool_str(reporter.active), None)
                    .await?;
                self.reporters_last.lock().insert(reporter.id.clone(), reporter.active);
            }
        }

        tracing::info!(count = reporters.len(), "updating reporters");
        let rows = reporters
            .iter()
            .map(|reporter| ReporterRegistryRow {
                reporter_pubkey: reporter.id.clone(),
                active: reporter.active,
                report_count: reporter.report_count,
            })
            .collect();
        if let Err(err) = self.sink.upsert_reporters(rows).await {
            tracing::error!(%err, "could not persist reporters");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Worker {
    Builders,
    Validators,
    Reporters,
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;

    #[tokio::test]
    async fn builder_probe_defaults_to_inactive() {
        let store = MemoryStore::default();
        assert!(!builder_status(&store, "0xabc").await.unwrap());
        store.hset(BUILDER_STATUS_KEY, "0xabc", "true", None).await.unwrap();
        assert!(builder_status(&store, "0xabc").await.unwrap());
        store.hset(BUILDER_STATUS_KEY, "0xabc", "false", None).await.unwrap();
        assert!(!builder_status(&store, "0xabc").await.unwrap());
    }
}
