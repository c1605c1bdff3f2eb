use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use perun_ws::{
    channel::local::LocalNetwork,
    config::Config,
    server::{self, Context},
};

#[derive(Parser)]
#[command(name = "perun-ws")]
#[command(about = "Runs Perun ledger channels for remote, key-holding clients")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "PERUN_WS_ADDR", default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// TOML file with the chains and assets to serve
    #[arg(long, env = "PERUN_WS_CHAINS")]
    chains: Option<PathBuf>,

    /// Timeout for plain requests, in seconds
    #[arg(long)]
    default_timeout: Option<u64>,

    /// Timeout for handling proposals and updates, in seconds
    #[arg(long)]
    handle_timeout: Option<u64>,

    /// Timeout for funding a channel, in seconds
    #[arg(long)]
    fund_timeout: Option<u64>,

    /// Timeout for settling a channel, in seconds
    #[arg(long)]
    settle_timeout: Option<u64>,

    /// Blocks after which a transaction counts as final
    #[arg(long, default_value_t = 1)]
    finality_depth: u64,

    /// Use fixed gas limits instead of letting the wallet estimate them
    #[arg(long)]
    predefined_gas_limit: bool,
}

impl Cli {
    fn config(&self) -> Result<Config, perun_ws::config::ConfigError> {
        let mut config = match &self.chains {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let timeouts = &mut config.timeouts;
        for (flag, slot) in [
            (self.default_timeout, &mut timeouts.default),
            (self.handle_timeout, &mut timeouts.handle),
            (self.fund_timeout, &mut timeouts.fund),
            (self.settle_timeout, &mut timeouts.settle),
        ] {
            if let Some(secs) = flag {
                *slot = Duration::from_secs(secs);
            }
        }
        config.tx_finality_depth = self.finality_depth;
        config.predefined_gas_limit |= self.predefined_gas_limit;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(cli.config()?);
    info!(
        ethereum = config.ethereum.len(),
        solana = config.solana.len(),
        timeouts = ?config.timeouts,
        "configuration loaded"
    );

    let ledger = Arc::new(LocalNetwork::new(config.clone()));
    let ctx = Context::new(config, ledger);
    let listener = TcpListener::bind(cli.addr).await?;
    server::serve(listener, ctx).await?;
    Ok(())
}
