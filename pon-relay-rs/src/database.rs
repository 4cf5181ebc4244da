//! Append-only audit store plus the registry upsert tables.
//!
//! Every write here is best-effort from the caller's point of view: handlers
//! log failures and keep serving. Only startup treats a broken database as
//! fatal.

use alloy_primitives::keccak256;
use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Row,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
    #[serde(default = "default_pool_size")]
    pub max_idle_connections: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_pool_size() -> u32 {
    100
}

fn default_idle_timeout_secs() -> u64 {
    100
}

#[derive(Debug, Default, Clone)]
pub struct BuilderBlockSubmissionRow {
    pub slot: u64,
    pub builder_pubkey: String,
    pub bid_value: String,
    pub builder_signature: String,
    pub block_hash: String,
    pub rpbs: String,
    pub rpbs_public_key: String,
    pub transaction_bytes: String,
}

impl BuilderBlockSubmissionRow {
    /// Stable identifier handed back to the builder as `bid_id`.
    pub fn submission_id(&self) -> String {
        let preimage = format!("{}:{}:{}", self.slot, self.builder_pubkey, self.builder_signature);
        format!("0x{:x}", keccak256(preimage.as_bytes()))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ValidatorDeliveredHeaderRow {
    pub slot: u64,
    pub proposer_pubkey: String,
    pub block_hash: String,
    pub bid_value: String,
}

#[derive(Debug, Default, Clone)]
pub struct ValidatorReturnedBlockRow {
    pub slot: u64,
    pub proposer_pubkey: String,
    pub block_hash: String,
    pub signature: String,
}

#[derive(Debug, Default, Clone)]
pub struct ValidatorDeliveredPayloadRow {
    pub slot: u64,
    pub proposer_pubkey: String,
    pub block_hash: String,
    pub payload: String,
}

#[derive(Debug, Default, Clone)]
pub struct BuilderRegistryRow {
    pub builder_pubkey: String,
    pub builder_stake: String,
    pub status: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ValidatorRegistryRow {
    pub validator_pubkey: String,
    pub status: String,
    pub report_count: i64,
}

#[derive(Debug, Default, Clone)]
pub struct ReporterRegistryRow {
    pub reporter_pubkey: String,
    pub active: bool,
    pub report_count: i64,
}

/// Ingest contract of the audit store. Handlers only ever append or upsert.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_block_submission(
        &self,
        row: BuilderBlockSubmissionRow,
    ) -> Result<(), DatabaseError>;
    async fn record_delivered_header(
        &self,
        row: ValidatorDeliveredHeaderRow,
    ) -> Result<(), DatabaseError>;
    async fn record_returned_block(
        &self,
        row: ValidatorReturnedBlockRow,
    ) -> Result<(), DatabaseError>;
    async fn record_delivered_payload(
        &self,
        row: ValidatorDeliveredPayloadRow,
    ) -> Result<(), DatabaseError>;
    async fn upsert_builders(&self, rows: Vec<BuilderRegistryRow>) -> Result<(), DatabaseError>;
    async fn upsert_validators(&self, rows: Vec<ValidatorRegistryRow>)
        -> Result<(), DatabaseError>;
    async fn upsert_reporters(&self, rows: Vec<ReporterRegistryRow>) -> Result<(), DatabaseError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS builder_block_submissions (
    id TEXT PRIMARY KEY,
    slot BIGINT NOT NULL,
    builder_pubkey TEXT NOT NULL,
    bid_value TEXT NOT NULL,
    builder_signature TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    rpbs TEXT NOT NULL,
    rpbs_public_key TEXT NOT NULL,
    transaction_byte TEXT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS validator_header_delivered (
    slot BIGINT NOT NULL,
    proposer_pubkey TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    bid_value TEXT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS validator_returned_blocks (
    signature TEXT NOT NULL,
    slot BIGINT NOT NULL,
    block_hash TEXT NOT NULL,
    proposer_pubkey TEXT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS validator_payloads_delivered (
    slot BIGINT NOT NULL,
    proposer_pubkey TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    payload TEXT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS block_builders (
    builder_pubkey TEXT PRIMARY KEY,
    builder_stake TEXT NOT NULL,
    status BOOLEAN NOT NULL
);
CREATE TABLE IF NOT EXISTS validators (
    validator_pubkey TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    report_count BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS reporters (
    reporter_pubkey TEXT PRIMARY KEY,
    active BOOLEAN NOT NULL,
    report_count BIGINT NOT NULL
);
"#;

pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.max_idle_connections.min(config.max_connections))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.dsn)
            .await?;
        let sink = Self { pool };
        sink.apply_schema().await?;
        tracing::info!(
            max_connections = config.max_connections,
            idle_timeout_secs = config.idle_timeout_secs,
            "database ready"
        );
        Ok(sink)
    }

    async fn apply_schema(&self) -> Result<(), DatabaseError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn builder_submissions_in_range(
        &self,
        slot_from: u64,
        slot_to: u64,
    ) -> Result<Vec<BuilderBlockSubmissionRow>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT slot, builder_pubkey, bid_value, builder_signature, block_hash, rpbs, \
             rpbs_public_key, transaction_byte \
             FROM builder_block_submissions WHERE slot BETWEEN $1 AND $2 ORDER BY slot ASC",
        )
        .bind(slot_from as i64)
        .bind(slot_to as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| BuilderBlockSubmissionRow {
                slot: row.get::<i64, _>("slot") as u64,
                builder_pubkey: row.get("builder_pubkey"),
                bid_value: row.get("bid_value"),
                builder_signature: row.get("builder_signature"),
                block_hash: row.get("block_hash"),
                rpbs: row.get("rpbs"),
                rpbs_public_key: row.get("rpbs_public_key"),
                transaction_bytes: row.get("transaction_byte"),
            })
            .collect())
    }

    pub async fn delivered_headers_in_range(
        &self,
        slot_from: u64,
        slot_to: u64,
    ) -> Result<Vec<ValidatorDeliveredHeaderRow>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT slot, proposer_pubkey, block_hash, bid_value \
             FROM validator_header_delivered WHERE slot BETWEEN $1 AND $2 ORDER BY slot ASC",
        )
        .bind(slot_from as i64)
        .bind(slot_to as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ValidatorDeliveredHeaderRow {
                slot: row.get::<i64, _>("slot") as u64,
                proposer_pubkey: row.get("proposer_pubkey"),
                block_hash: row.get("block_hash"),
                bid_value: row.get("bid_value"),
            })
            .collect())
    }

    pub async fn returned_blocks_in_range(
        &self,
        slot_from: u64,
        slot_to: u64,
    ) -> Result<Vec<ValidatorReturnedBlockRow>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT slot, proposer_pubkey, block_hash, signature \
             FROM validator_returned_blocks WHERE slot BETWEEN $1 AND $2 ORDER BY slot ASC",
        )
        .bind(slot_from as i64)
        .bind(slot_to as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ValidatorReturnedBlockRow {
                slot: row.get::<i64, _>("slot") as u64,
                proposer_pubkey: row.get("proposer_pubkey"),
                block_hash: row.get("block_hash"),
                signature: row.get("signature"),
            })
            .collect())
    }

    pub async fn delivered_payloads_in_range(
        &self,
        slot_from: u64,
        slot_to: u64,
    ) -> Result<Vec<ValidatorDeliveredPayloadRow>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT slot, proposer_pubkey, block_hash, payload \
             FROM validator_payloads_delivered WHERE slot BETWEEN $1 AND $2 ORDER BY slot ASC",
        )
        .bind(slot_from as i64)
        .bind(slot_to as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ValidatorDeliveredPayloadRow {
                slot: row.get::<i64, _>("slot") as u64,
                proposer_pubkey: row.get("proposer_pubkey"),
                block_hash: row.get("block_hash"),
                payload: row.get("payload"),
            })
            .collect())
    }
}

#[async_trait]
impl AuditSink for PostgresSink {
    async fn record_block_submission(
        &self,
        row: BuilderBlockSubmissionRow,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO builder_block_submissions \
             (id, slot, builder_pubkey, bid_value, builder_signature, block_hash, rpbs, \
              rpbs_public_key, transaction_byte) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (id) DO NOTHING",
        )
        .bind(row.submission_id())
        .bind(row.slot as i64)
        .bind(&row.builder_pubkey)
        .bind(&row.bid_value)
        .bind(&row.builder_signature)
        .bind(&row.block_hash)
        .bind(&row.rpbs)
        .bind(&row.rpbs_public_key)
        .bind(&row.transaction_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivered_header(
        &self,
        row: ValidatorDeliveredHeaderRow,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO validator_header_delivered (slot, proposer_pubkey, block_hash, bid_value) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(row.slot as i64)
        .bind(&row.proposer_pubkey)
        .bind(&row.block_hash)
        .bind(&row.bid_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_returned_block(
        &self,
        row: ValidatorReturnedBlockRow,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO validator_returned_blocks (signature, slot, block_hash, proposer_pubkey) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&row.signature)
        .bind(row.slot as i64)
        .bind(&row.block_hash)
        .bind(&row.proposer_pubkey)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivered_payload(
        &self,
        row: ValidatorDeliveredPayloadRow,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO validator_payloads_delivered (slot, proposer_pubkey, block_hash, payload) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(row.slot as i64)
        .bind(&row.proposer_pubkey)
        .bind(&row.block_hash)
        .bind(&row.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_builders(&self, rows: Vec<BuilderRegistryRow>) -> Result<(), DatabaseError> {
        for row in rows {
            sqlx::query(
                "INSERT INTO block_builders (builder_pubkey, builder_stake, status) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (builder_pubkey) DO UPDATE SET status = $3",
            )
            .bind(&row.builder_pubkey)
            .bind(&row.builder_stake)
            .bind(row.status)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_validators(
        &self,
        rows: Vec<ValidatorRegistryRow>,
    ) -> Result<(), DatabaseError> {
        for row in rows {
            sqlx::query(
                "INSERT INTO validators (validator_pubkey, status, report_count) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (validator_pubkey) DO UPDATE SET status = $2, report_count = $3",
            )
            .bind(&row.validator_pubkey)
            .bind(&row.status)
            .bind(row.report_count)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_reporters(&self, rows: Vec<ReporterRegistryRow>) -> Result<(), DatabaseError> {
        for row in rows {
            sqlx::query(
                "INSERT INTO reporters (reporter_pubkey, active, report_count) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (reporter_pubkey) DO UPDATE SET active = $2, report_count = $3",
            )
            .bind(&row.reporter_pubkey)
            .bind(row.active)
            .bind(row.report_count)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
