//! In-memory doubles for the key-value scratchpad and the audit store, used
//! by the unit and integration suites.

use crate::{
    database::{
        AuditSink, BuilderBlockSubmissionRow, BuilderRegistryRow, DatabaseError,
        ReporterRegistryRow, ValidatorDeliveredHeaderRow, ValidatorDeliveredPayloadRow,
        ValidatorRegistryRow, ValidatorReturnedBlockRow,
    },
    store::{KvStore, StoreError},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};

/// TTL-less stand-in for the scratchpad. Hash fields keep insertion order so
/// auction tie-breaks are reproducible in tests.
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, Vec<(String, String)>>>,
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.keys.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.keys.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock();
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|fields| fields.iter().find(|(name, _)| name == field))
            .map(|(_, value)| value.clone()))
    }

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        _ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut hashes = self.hashes.lock();
        let fields = hashes.entry(key.to_string()).or_default();
        match fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, existing)) => *existing = value.to_string(),
            None => fields.push((field.to_string(), value.to_string())),
        }
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut hashes = self.hashes.lock();
        let fields = hashes.entry(key.to_string()).or_default();
        if fields.iter().any(|(name, _)| name == field) {
            return Ok(false);
        }
        fields.push((field.to_string(), value.to_string()));
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.keys.lock().clear();
        self.hashes.lock().clear();
        Ok(())
    }
}

/// Audit sink that records everything for later assertions.
#[derive(Default)]
pub struct MemoryAuditSink {
    pub block_submissions: Mutex<Vec<BuilderBlockSubmissionRow>>,
    pub delivered_headers: Mutex<Vec<ValidatorDeliveredHeaderRow>>,
    pub returned_blocks: Mutex<Vec<ValidatorReturnedBlockRow>>,
    pub delivered_payloads: Mutex<Vec<ValidatorDeliveredPayloadRow>>,
    pub builders: Mutex<Vec<BuilderRegistryRow>>,
    pub validators: Mutex<Vec<ValidatorRegistryRow>>,
    pub reporters: Mutex<Vec<ReporterRegistryRow>>,
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_block_submission(
        &self,
        row: BuilderBlockSubmissionRow,
    ) -> Result<(), DatabaseError> {
        self.block_submissions.lock().push(row);
        Ok(())
    }

    async fn record_delivered_header(
        &self,
        row: ValidatorDeliveredHeaderRow,
    ) -> Result<(), DatabaseError> {
        self.delivered_headers.lock().push(row);
        Ok(())
    }

    async fn record_returned_block(
        &self,
        row: ValidatorReturnedBlockRow,
    ) -> Result<(), DatabaseError> {
        self.returned_blocks.lock().push(row);
        Ok(())
    }

    async fn record_delivered_payload(
        &self,
        row: ValidatorDeliveredPayloadRow,
    ) -> Result<(), DatabaseError> {
        self.delivered_payloads.lock().push(row);
        Ok(())
    }

    async fn upsert_builders(&self, rows: Vec<BuilderRegistryRow>) -> Result<(), DatabaseError> {
        self.builders.lock().extend(rows);
        Ok(())
    }

    async fn upsert_validators(
        &self,
        rows: Vec<ValidatorRegistryRow>,
    ) -> Result<(), DatabaseError> {
        self.validators.lock().extend(rows);
        Ok(())
    }

    async fn upsert_reporters(&self, rows: Vec<ReporterRegistryRow>) -> Result<(), DatabaseError> {
        self.reporters.lock().extend(rows);
        Ok(())
    }
}
