//! Client for the pool registry subgraph supplying the builder, validator
//! and reporter allow-lists.

use ethereum_consensus::ssz::prelude::U256;
use thiserror::Error;

const BUILDERS_QUERY: &str =
    r#"{"query":"{\n  builders(first:1000){\n    id\n    status\n    balanceStaked\n  }\n}","variables":{}}"#;
const PROPOSERS_QUERY: &str =
    r#"{"query":"{\n  proposers(first:1000){\n    id\n    status\n    reportCount\n  }\n}","variables":{}}"#;
const REPORTERS_QUERY: &str =
    r#"{"query":"{\n  reporters(first:1000){\n    id\n    active\n    numberOfReports\n  }\n}","variables":{}}"#;
const BUILDER_STAKE_QUERY: &str =
    r#"{"query":"\n{globalValue(id: \"1\") { builderMinimumStake }}","variables":{}}"#;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unparseable stake amount {0}")]
    InvalidStake(String),
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct RegisteredBuilder {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "balanceStaked")]
    pub balance_staked: String,
}

/// Allow-list entry derived from the stake rule: a builder is active while
/// its stake clears the registry's global minimum.
#[derive(Debug, Default, Clone)]
pub struct BuilderEntry {
    pub builder: RegisteredBuilder,
    pub active: bool,
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct RegisteredValidator {
    pub id: String,
    pub status: String,
    #[serde(rename = "reportCount", default)]
    pub report_count: i64,
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct RegisteredReporter {
    pub id: String,
    pub active: bool,
    #[serde(rename = "numberOfReports", default)]
    pub report_count: i64,
}

#[derive(Debug, serde::Deserialize)]
struct GraphResponse<T> {
    data: T,
}

#[derive(Debug, serde::Deserialize)]
struct BuildersData {
    builders: Vec<RegisteredBuilder>,
}

#[derive(Debug, serde::Deserialize)]
struct ProposersData {
    proposers: Vec<RegisteredValidator>,
}

#[derive(Debug, serde::Deserialize)]
struct ReportersData {
    reporters: Vec<RegisteredReporter>,
}

#[derive(Debug, serde::Deserialize)]
struct GlobalValueData {
    #[serde(rename = "globalValue")]
    global_value: GlobalValue,
}

#[derive(Debug, serde::Deserialize)]
struct GlobalValue {
    #[serde(rename = "builderMinimumStake")]
    builder_minimum_stake: String,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl RegistryClient {
    pub fn new(url: String, api_key: String) -> Self {
        Self { http: reqwest::Client::new(), url, api_key }
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, body: &str) -> Result<T, RegistryError> {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        if !self.api_key.is_empty() {
            request = request.header("x-api-key", &self.api_key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status { status: status.as_u16(), body });
        }
        let decoded: GraphResponse<T> = response.json().await?;
        Ok(decoded.data)
    }

    pub async fn get_builders(&self) -> Result<Vec<BuilderEntry>, RegistryError> {
        let data: BuildersData = self.query(BUILDERS_QUERY).await?;
        let minimum_stake = self.get_builder_required_stake().await?;
        data.builders
            .into_iter()
            .map(|builder| {
                let stake = parse_stake(&builder.balance_staked)?;
                Ok(BuilderEntry { active: stake >= minimum_stake, builder })
            })
            .collect()
    }

    async fn get_builder_required_stake(&self) -> Result<U256, RegistryError> {
        let data: GlobalValueData = self.query(BUILDER_STAKE_QUERY).await?;
        parse_stake(&data.global_value.builder_minimum_stake)
    }

    pub async fn get_validators(&self) -> Result<Vec<RegisteredValidator>, RegistryError> {
        let data: ProposersData = self.query(PROPOSERS_QUERY).await?;
        Ok(data.proposers)
    }

    pub async fn get_reporters(&self) -> Result<Vec<RegisteredReporter>, RegistryError> {
        let data: ReportersData = self.query(REPORTERS_QUERY).await?;
        Ok(data.reporters)
    }
}

fn parse_stake(amount: &str) -> Result<U256, RegistryError> {
    amount.parse().map_err(|_| RegistryError::InvalidStake(amount.to_string()))
}
