//! mfsync: multicast file synchronization.
//!
//! Wires the core subsystems together according to the operation mode:
//! `share` announces and serves, `fetch` only discovers, `get` pulls,
//! `sync` does all of it.

mod beacon;
mod config;
mod list_client;
mod scheduler;
mod server;
mod session;
mod transfer;
mod transport;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::{Cli, Config, Mode};
use mfsync_core::{CryptoHandler, Keypair, ProgressRegistry, Store};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error};

use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let keypair = match Keypair::load_or_generate(&cli.key_file) {
        Ok(keypair) => Arc::new(keypair),
        Err(err) => {
            error!("could not load or create the key file: {err}");
            std::process::exit(-1);
        }
    };

    if cli.public_key {
        println!("{}", keypair.public_key_hex());
        return;
    }

    let config = match config::validate(cli) {
        Ok(config) => config,
        Err(message) => {
            error!("{message}");
            std::process::exit(-1);
        }
    };

    let mut handler = CryptoHandler::new(keypair);
    for key in &config.trusted_keys {
        handler.add_allowed_key(key.clone());
    }
    let handler = Arc::new(handler);
    debug!(public_key = %handler.public_key_hex(), "identity loaded");

    let server_tls = match load_server_tls(&config) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            error!("could not load the server tls files: {err}");
            std::process::exit(-1);
        }
    };
    let client_tls = match load_client_tls(&config) {
        Ok(connector) => connector,
        Err(err) => {
            error!("could not load the client tls trust file: {err}");
            std::process::exit(-1);
        }
    };

    let progress = Arc::new(ProgressRegistry::new());
    let root = config
        .destination
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let store = Arc::new(Store::new(root, true, Arc::clone(&progress)));

    if config.mode != Mode::Fetch {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = store.init().await {
                error!("storage scan failed: {err}");
            }
        });
    }

    if matches!(config.mode, Mode::Share | Mode::Sync) {
        for outbound in &config.outbound_addresses {
            if let Some(address) = outbound {
                debug!(%address, "announcing over outbound interface");
            }
            tokio::spawn(beacon::run_sender(
                config.multicast_address,
                config.multicast_port,
                *outbound,
                handler.public_key_hex(),
                config.port,
            ));
        }
        tokio::spawn(server::run_server(
            config.port,
            Arc::clone(&store),
            Arc::clone(&handler),
            Arc::clone(&progress),
            server_tls,
        ));
    }

    if matches!(config.mode, Mode::Fetch | Mode::Get | Mode::Sync) {
        tokio::spawn(beacon::run_receiver(
            config.multicast_listen_address,
            config.multicast_address,
            config.multicast_port,
            Arc::clone(&store),
            Arc::clone(&handler),
            client_tls.clone(),
            config.list_hosts,
        ));
    }

    let mut completion = None;
    if matches!(config.mode, Mode::Get | Mode::Sync) {
        let (scheduler, done_rx) = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&handler),
            Arc::clone(&progress),
            config.concurrent_downloads,
            config.request.clone(),
            client_tls,
        );
        tokio::spawn(scheduler.run());
        if !config.request.is_empty() {
            completion = Some(done_rx);
        }
    }

    if config.mode == Mode::Fetch && !config.list_hosts {
        tokio::spawn(print_availables(Arc::clone(&store)));
    }

    wait_for_exit(completion, config.wait_until).await;
    debug!("stopped");
}

fn init_tracing(cli: &Cli) {
    let level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("mfsync={level},mfsync_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_server_tls(config: &Config) -> Result<Option<TlsAcceptor>, Box<dyn std::error::Error>> {
    match &config.server_tls {
        Some((cert, key)) => Ok(Some(transport::load_server_tls(cert, key)?)),
        None => Ok(None),
    }
}

fn load_client_tls(config: &Config) -> Result<Option<TlsConnector>, Box<dyn std::error::Error>> {
    match &config.client_tls {
        Some(ca) => Ok(Some(transport::load_client_tls(ca)?)),
        None => Ok(None),
    }
}

/// Print every announced file name once, as it becomes known.
async fn print_availables(store: Arc<Store>) {
    let mut seen = HashSet::new();
    loop {
        for available in store.get_available_files() {
            if seen.insert(available.file_info.file_name.clone()) {
                println!("{}", available.file_info.file_name);
            }
        }
        tokio::select! {
            _ = store.wait_new_available() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

/// Run until interrupted, until the optional deadline passes, or until
/// every explicitly requested file has been stored.
async fn wait_for_exit(completion: Option<watch::Receiver<bool>>, wait_until: Option<u64>) {
    let deadline = async {
        match wait_until {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    let completed = async {
        match completion {
            Some(mut done) => {
                while !*done.borrow_and_update() {
                    if done.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("interrupted"),
        _ = deadline => debug!("deadline reached"),
        _ = completed => debug!("all requested files stored"),
    }
}
