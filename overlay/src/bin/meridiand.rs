//! Overlay daemon skeleton
//!
//! Wires the overlay against an in-memory chain view and a null transport.
//! A production node replaces both through `ChainView` and `Outbound`.

use clap::Parser;
use meridian_core::{ChainState, Network, Params, SystemClock};
use meridian_crypto::KeyPair;
use meridian_overlay::active::{ActiveOptions, NoWallet};
use meridian_overlay::config::ServiceNodeConfig;
use meridian_overlay::outbound::NullOutbound;
use meridian_overlay::store::Store;
use meridian_overlay::{OverlayContext, ServiceNodeSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meridiand", about = "Meridian service-node overlay daemon")]
struct Args {
    /// Network to run on
    #[arg(long, default_value = "mainnet")]
    network: String,

    /// Accept inbound connections (required to run a service node)
    #[arg(long, default_value_t = true)]
    listen: bool,

    /// Preferred external address (IP:port)
    #[arg(long)]
    externalip: Option<SocketAddr>,

    /// Opt in to running as a service node
    #[arg(long, default_value_t = false)]
    service_node: bool,

    /// Hex secret of the service-node key
    #[arg(long)]
    service_node_private_key: Option<String>,

    /// Path to servicenode.conf
    #[arg(long)]
    service_node_config: Option<PathBuf>,

    /// State directory
    #[arg(long, default_value = ".meridian")]
    data_dir: PathBuf,
}

fn parse_network(name: &str) -> Option<Network> {
    match name {
        "mainnet" => Some(Network::Mainnet),
        "testnet" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let Some(network) = parse_network(&args.network) else {
        error!(network = %args.network, "unknown network");
        std::process::exit(1);
    };
    let params = Params::new(network);

    let service_node = if args.service_node {
        let key = match &args.service_node_private_key {
            Some(secret) => match KeyPair::from_secret_hex(secret) {
                Ok(key) => key,
                Err(err) => {
                    error!(error = %err, "invalid service node key");
                    std::process::exit(1);
                }
            },
            None => {
                error!("service_node=1 requires service_node_private_key");
                std::process::exit(1);
            }
        };
        let mut options = ActiveOptions {
            listen: args.listen,
            external_address: args.externalip,
            collateral_txid: None,
            collateral_index: None,
        };
        if let Some(path) = &args.service_node_config {
            match ServiceNodeConfig::load(path) {
                Ok(config) => {
                    if let Some(entry) = config.entries.first() {
                        info!(alias = %entry.alias, "using servicenode.conf entry");
                        options.external_address = Some(entry.address);
                        options.collateral_txid = Some(entry.collateral_txid);
                        options.collateral_index = Some(entry.collateral_index);
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to read servicenode.conf");
                    std::process::exit(1);
                }
            }
        }
        Some(ServiceNodeSettings {
            node_key: key,
            options,
            wallet: Arc::new(NoWallet),
        })
    } else {
        None
    };

    let chain = Arc::new(ChainState::new());
    let context = OverlayContext::new(
        Arc::new(SystemClock),
        chain,
        params,
        Arc::new(NullOutbound),
        service_node,
    );

    let store = match Store::open(&args.data_dir) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "cannot open data directory");
            std::process::exit(1);
        }
    };
    if let Err(err) = context.load_state(&store).await {
        warn!(error = %err, "starting with empty overlay state");
    }

    info!(network = %args.network, "meridian overlay starting");
    let driver = {
        let context = context.clone();
        tokio::spawn(async move { context.run_ticks().await })
    };

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("signal handler unavailable, exiting");
    }
    info!("shutting down");
    context.request_shutdown();
    let _ = driver.await;

    if let Err(err) = context.save_state(&store).await {
        error!(error = %err, "failed to persist overlay state");
    }
}
