use crate::{bulletin::MqttConfig, database::DatabaseConfig, Network};
use serde::Deserialize;
use std::{io, net::Ipv4Addr, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub fn from_toml_file<P: AsRef<Path>, T: serde::de::DeserializeOwned>(path: P) -> Result<T, Error> {
    let config_data = std::fs::read_to_string(path.as_ref())?;
    toml::from_str(&config_data).map_err(From::from)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub network: Network,

    pub beacon_endpoints: Vec<String>,
    pub redis_uri: String,
    pub database: DatabaseConfig,

    pub registry_url: String,
    #[serde(default)]
    pub registry_api_key: String,

    pub bulletin_board: MqttConfig,

    #[serde(default)]
    pub reporter_url: String,

    #[serde(default = "default_bid_timeout_secs")]
    pub bid_timeout_secs: u64,
    #[serde(default = "default_server_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_server_timeout_secs")]
    pub read_header_timeout_secs: u64,
    #[serde(default = "default_server_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_server_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Hex-encoded 32-byte BLS secret key the relay signs bids with.
    pub secret_key: String,
}

fn default_host() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_port() -> u16 {
    9000
}

fn default_bid_timeout_secs() -> u64 {
    15
}

fn default_server_timeout_secs() -> u64 {
    10
}
