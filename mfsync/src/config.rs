//! Command line surface and validated runtime configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use mfsync_core::protocol;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Share the destination directory and pull everything peers offer.
    Sync,
    /// Announce and serve the destination directory.
    Share,
    /// Only list what peers are offering.
    Fetch,
    /// Download into the destination directory.
    Get,
}

#[derive(Parser)]
#[command(
    name = "mfsync",
    version = protocol::VERSION,
    about = "Share, fetch and synchronize files over LAN multicast"
)]
pub struct Cli {
    /// Operation mode
    #[arg(value_enum)]
    pub mode: Option<Mode>,

    /// Storage root to share from, or destination to download into
    pub destination: Option<PathBuf>,

    /// File names or directory prefixes to request
    #[arg(long, num_args = 1..)]
    pub request: Vec<String>,

    /// TCP port to listen on for transfers
    #[arg(short, long, default_value_t = protocol::TCP_PORT)]
    pub port: u16,

    /// Multicast group address
    #[arg(long, default_value = protocol::MULTICAST_ADDRESS)]
    pub multicast_address: Ipv4Addr,

    /// Multicast port
    #[arg(short, long, default_value_t = protocol::MULTICAST_PORT)]
    pub multicast_port: u16,

    /// Address to listen for multicast announcements on
    #[arg(short = 'l', long, default_value = protocol::MULTICAST_LISTEN_ADDRESS)]
    pub multicast_listen_address: Ipv4Addr,

    /// Interface addresses multicast announcements are sent from
    #[arg(short = 'a', long, num_args = 1..)]
    pub outbound_addresses: Vec<Ipv4Addr>,

    /// Interface names multicast announcements are sent from
    #[arg(short = 'i', long, num_args = 1..)]
    pub outbound_interfaces: Vec<String>,

    /// Maximum concurrent downloads
    #[arg(short = 'c', long = "concurrent_downloads", default_value_t = 3)]
    pub concurrent_downloads: usize,

    /// X25519 key file; created on first run
    #[arg(long, default_value = "key.bin")]
    pub key_file: PathBuf,

    /// Peer public keys to accept; everyone is accepted when empty
    #[arg(long, num_args = 1..)]
    pub trusted_keys: Vec<String>,

    /// Serve transfers over TLS: certificate chain and private key
    #[arg(long, num_args = 2, value_names = ["CERT", "KEY"])]
    pub server_tls: Vec<PathBuf>,

    /// Connect over TLS, trusting the certificates in this file
    #[arg(long, value_name = "CA")]
    pub client_tls: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short = 'w', long)]
    pub wait_until: Option<u64>,

    /// Print discovered hosts and their keys
    #[arg(long)]
    pub list_hosts: bool,

    /// Print this node's public key and exit
    #[arg(long)]
    pub public_key: bool,

    /// Show debug logs
    #[arg(short, long)]
    pub verbose: bool,

    /// Also show sent and received multicast messages
    #[arg(short, long)]
    pub trace: bool,
}

/// Validated configuration the subsystems are built from.
pub struct Config {
    pub mode: Mode,
    pub destination: Option<PathBuf>,
    pub request: Vec<String>,
    pub port: u16,
    pub multicast_address: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_listen_address: Ipv4Addr,
    /// `None` entries announce over the default interface.
    pub outbound_addresses: Vec<Option<Ipv4Addr>>,
    pub concurrent_downloads: usize,
    pub trusted_keys: Vec<String>,
    pub server_tls: Option<(PathBuf, PathBuf)>,
    pub client_tls: Option<PathBuf>,
    pub wait_until: Option<u64>,
    pub list_hosts: bool,
}

pub fn validate(cli: Cli) -> Result<Config, String> {
    let mode = if cli.list_hosts {
        Mode::Fetch
    } else {
        cli.mode.ok_or(
            "no operation mode was given; valid values are: sync, share, fetch, get".to_string(),
        )?
    };

    if mode != Mode::Fetch && cli.destination.is_none() {
        return Err(
            "no destination was given; the only mode that needs no destination is 'fetch'"
                .to_string(),
        );
    }

    if !cli.multicast_address.is_multicast() {
        return Err(format!(
            "{} is not a valid multicast address",
            cli.multicast_address
        ));
    }

    if !cli.outbound_addresses.is_empty() && !cli.outbound_interfaces.is_empty() {
        return Err(
            "only one of --outbound-addresses and --outbound-interfaces can be specified"
                .to_string(),
        );
    }

    let outbound_addresses = if !cli.outbound_addresses.is_empty() {
        cli.outbound_addresses.iter().copied().map(Some).collect()
    } else if !cli.outbound_interfaces.is_empty() {
        let resolved = interface_addresses(&cli.outbound_interfaces);
        if resolved.len() != cli.outbound_interfaces.len() {
            info!("could not resolve addresses for all given outbound interfaces");
            info!("multicast announcements may not reach all of them");
        }
        if resolved.is_empty() {
            return Err(
                "could not resolve any of the given outbound interfaces; \
                 pass the addresses directly with --outbound-addresses"
                    .to_string(),
            );
        }
        resolved.into_iter().map(Some).collect()
    } else {
        vec![None]
    };

    let server_tls = match cli.server_tls.as_slice() {
        [] => None,
        [cert, key] => Some((cert.clone(), key.clone())),
        _ => return Err("--server-tls needs exactly two files: certificate and key".to_string()),
    };

    Ok(Config {
        mode,
        destination: cli.destination,
        request: cli.request,
        port: cli.port,
        multicast_address: cli.multicast_address,
        multicast_port: cli.multicast_port,
        multicast_listen_address: cli.multicast_listen_address,
        outbound_addresses,
        concurrent_downloads: cli.concurrent_downloads,
        trusted_keys: cli.trusted_keys,
        server_tls,
        client_tls: cli.client_tls,
        wait_until: cli.wait_until,
        list_hosts: cli.list_hosts,
    })
}

/// IPv4 addresses of the named interfaces. Interface enumeration is
/// the job of an external helper this crate only exposes the hook
/// for; without one wired in, nothing resolves and callers are pointed
/// at `--outbound-addresses`.
fn interface_addresses(_names: &[String]) -> Vec<Ipv4Addr> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mfsync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = validate(parse(&["fetch"])).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.multicast_port, 30001);
        assert_eq!(config.multicast_address, Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(config.concurrent_downloads, 3);
        assert_eq!(config.outbound_addresses, vec![None]);
    }

    #[test]
    fn non_fetch_modes_need_a_destination() {
        assert!(validate(parse(&["get"])).is_err());
        assert!(validate(parse(&["share"])).is_err());
        assert!(validate(parse(&["get", "downloads"])).is_ok());
    }

    #[test]
    fn list_hosts_implies_fetch() {
        let config = validate(parse(&["--list-hosts"])).unwrap();
        assert_eq!(config.mode, Mode::Fetch);
    }

    #[test]
    fn rejects_non_multicast_group() {
        assert!(validate(parse(&["fetch", "--multicast-address", "10.0.0.1"])).is_err());
    }

    #[test]
    fn outbound_selectors_are_mutually_exclusive() {
        let cli = parse(&[
            "share",
            "data",
            "--outbound-addresses",
            "192.168.1.2",
            "--outbound-interfaces",
            "eth0",
        ]);
        assert!(validate(cli).is_err());
    }

    #[test]
    fn unresolvable_interfaces_are_a_config_error() {
        let cli = parse(&["share", "data", "--outbound-interfaces", "eth0"]);
        assert!(validate(cli).is_err());
    }

    #[test]
    fn request_names_are_collected() {
        let config = validate(parse(&["get", "dest", "--request", "a.txt", "sub"])).unwrap();
        assert_eq!(config.request, vec!["a.txt", "sub"]);
    }
}
