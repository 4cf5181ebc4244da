use crate::{
    signing::{compute_builder_domain, compute_proposer_domain},
    Error,
};
use ethereum_consensus::{
    primitives::{Domain, Root, Version},
    serde::try_bytes_from_hex_str,
};

pub const SECONDS_PER_SLOT: u64 = 12;
pub const SLOTS_PER_EPOCH: u64 = 32;
pub const EPOCH_DURATION_SECS: u64 = SECONDS_PER_SLOT * SLOTS_PER_EPOCH;

const GENESIS_TIME_MAINNET: u64 = 1590832934;
const GENESIS_TIME_GOERLI: u64 = 1616508000;
const GENESIS_TIME_CUSTOM_TESTNET: u64 = 1688034845;

const GENESIS_FORK_VERSION_MAINNET: &str = "0x00000000";
const CAPELLA_FORK_VERSION_MAINNET: &str = "0x03000000";
const GENESIS_VALIDATORS_ROOT_MAINNET: &str =
    "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95";

const GENESIS_FORK_VERSION_GOERLI: &str = "0x00001020";
const CAPELLA_FORK_VERSION_GOERLI: &str = "0x03001020";
const GENESIS_VALIDATORS_ROOT_GOERLI: &str =
    "0x043db0d9a83813551ee2f33450d23797757d430911a9320530ad8a0eabc43efb";

const GENESIS_FORK_VERSION_CUSTOM_TESTNET: &str = "0x00000000";
const CAPELLA_FORK_VERSION_CUSTOM_TESTNET: &str = "0x03000000";
const GENESIS_VALIDATORS_ROOT_CUSTOM_TESTNET: &str =
    "0x740cb032a0da660447055fdb161b5e285f36dbc4b1cea2b49a15e3d6196aa6ed";

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Network {
    #[default]
    Ethereum,
    Goerli,
    #[serde(rename = "Custom-Testnet")]
    CustomTestnet,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ethereum => write!(f, "Ethereum"),
            Self::Goerli => write!(f, "Goerli"),
            Self::CustomTestnet => write!(f, "Custom-Testnet"),
        }
    }
}

impl Network {
    pub fn genesis_time(&self) -> u64 {
        match self {
            Self::Ethereum => GENESIS_TIME_MAINNET,
            Self::Goerli => GENESIS_TIME_GOERLI,
            Self::CustomTestnet => GENESIS_TIME_CUSTOM_TESTNET,
        }
    }

    pub fn genesis_fork_version(&self) -> Result<Version, Error> {
        let hex = match self {
            Self::Ethereum => GENESIS_FORK_VERSION_MAINNET,
            Self::Goerli => GENESIS_FORK_VERSION_GOERLI,
            Self::CustomTestnet => GENESIS_FORK_VERSION_CUSTOM_TESTNET,
        };
        parse_version(hex)
    }

    pub fn capella_fork_version(&self) -> Result<Version, Error> {
        let hex = match self {
            Self::Ethereum => CAPELLA_FORK_VERSION_MAINNET,
            Self::Goerli => CAPELLA_FORK_VERSION_GOERLI,
            Self::CustomTestnet => CAPELLA_FORK_VERSION_CUSTOM_TESTNET,
        };
        parse_version(hex)
    }

    pub fn genesis_validators_root(&self) -> Result<Root, Error> {
        let hex = match self {
            Self::Ethereum => GENESIS_VALIDATORS_ROOT_MAINNET,
            Self::Goerli => GENESIS_VALIDATORS_ROOT_GOERLI,
            Self::CustomTestnet => GENESIS_VALIDATORS_ROOT_CUSTOM_TESTNET,
        };
        parse_root(hex)
    }
}

/// Chain facts the handlers need on every request: slot timing plus the two
/// signing domains, all fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub network: Network,
    pub genesis_time: u64,
    pub domain_builder: Domain,
    pub domain_beacon_proposer: Domain,
}

impl ChainContext {
    pub fn new(network: Network) -> Result<Self, Error> {
        let domain_builder = compute_builder_domain(network.genesis_fork_version()?)?;
        let domain_beacon_proposer = compute_proposer_domain(
            network.capella_fork_version()?,
            network.genesis_validators_root()?,
        )?;
        Ok(Self {
            network,
            genesis_time: network.genesis_time(),
            domain_builder,
            domain_beacon_proposer,
        })
    }

    pub fn slot_timestamp(&self, slot: u64) -> u64 {
        self.genesis_time + slot * SECONDS_PER_SLOT
    }
}

fn parse_version(hex: &str) -> Result<Version, Error> {
    let bytes = try_bytes_from_hex_str(hex)
        .map_err(|err| Error::Internal(format!("invalid fork version {hex}: {err}")))?;
    if bytes.len() != 4 {
        return Err(Error::Internal(format!("invalid fork version {hex}")));
    }
    let mut version = Version::default();
    version[..].copy_from_slice(&bytes);
    Ok(version)
}

fn parse_root(hex: &str) -> Result<Root, Error> {
    let bytes = try_bytes_from_hex_str(hex)
        .map_err(|err| Error::Internal(format!("invalid root {hex}: {err}")))?;
    Root::try_from(bytes.as_slice()).map_err(|_| Error::Internal(format!("invalid root {hex}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_timestamps_follow_genesis() {
        let context = ChainContext::new(Network::CustomTestnet).unwrap();
        assert_eq!(context.slot_timestamp(0), 1688034845);
        assert_eq!(context.slot_timestamp(100), 1688034845 + 1200);
    }

    #[test]
    fn domains_are_separated() {
        let context = ChainContext::new(Network::CustomTestnet).unwrap();
        assert_ne!(context.domain_builder, context.domain_beacon_proposer);
        assert_eq!(&context.domain_builder[..4], [0, 0, 0, 1]);
        assert_eq!(&context.domain_beacon_proposer[..4], [0, 0, 0, 0]);
    }
}
