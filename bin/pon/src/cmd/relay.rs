use anyhow::{anyhow, Result};
use clap::Args;
use pon_relay_rs::{
    config::{from_toml_file, Config},
    service::Service,
};

#[derive(Debug, Args)]
#[clap(about = "start the relay")]
pub struct Command {
    /// Path to a TOML configuration file.
    #[clap(long, env = "PON_RELAY_CONFIG", default_value = "config.toml")]
    config: String,

    /// Override the listen port from the configuration file.
    #[clap(long)]
    port: Option<u16>,

    /// Override the bid timeout, in seconds.
    #[clap(long)]
    bid_timeout: Option<u64>,
}

impl Command {
    pub async fn execute(self) -> Result<()> {
        let mut config: Config = from_toml_file(&self.config)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bid_timeout) = self.bid_timeout {
            config.bid_timeout_secs = bid_timeout;
        }

        let service = Service::from(config);
        let handle = service.spawn().await.map_err(|err| anyhow!("{err}"))?;
        handle.await?;
        Ok(())
    }
}
