//! Multicast beacon: announce this node at 1 Hz and listen for peer
//! announcements, turning each one into a file-list fetch.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use mfsync_core::crypto::{self, Role};
use mfsync_core::{protocol, CryptoHandler, Store};
use tokio::net::UdpSocket;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::list_client;

const BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// Announce `{public_key, port, version}` to the multicast group once a
/// second until cancelled.
pub async fn run_sender(
    multicast_addr: Ipv4Addr,
    multicast_port: u16,
    outbound: Option<Ipv4Addr>,
    public_key: String,
    tcp_port: u16,
) -> io::Result<()> {
    let socket = make_send_socket(outbound)?;
    let target = SocketAddr::V4(SocketAddrV4::new(multicast_addr, multicast_port));
    let message = protocol::create_host_announcement(&public_key, tcp_port);

    loop {
        trace!(%target, message = %message, "sending announcement");
        if let Err(error) = socket.send_to(message.as_bytes(), target).await {
            debug!(%error, "multicast send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

fn make_send_socket(outbound: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(1)?;
    if let Some(address) = outbound {
        set_outbound_interface(&socket, address)?;
    }
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(unix)]
fn set_outbound_interface(socket: &std::net::UdpSocket, address: Ipv4Addr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(address.octets()),
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &addr as *const libc::in_addr as *const libc::c_void,
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn set_outbound_interface(_socket: &std::net::UdpSocket, _address: Ipv4Addr) -> io::Result<()> {
    tracing::warn!("selecting a multicast outbound interface is not supported on this platform");
    Ok(())
}

fn make_recv_socket(
    listen_addr: Ipv4Addr,
    multicast_addr: Ipv4Addr,
    multicast_port: u16,
) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((listen_addr, multicast_port))?;
    socket.join_multicast_v4(&multicast_addr, &listen_addr)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Listen on the multicast group. In list-hosts mode each unique peer
/// is printed once; otherwise every parsed announcement from a trusted
/// key spawns a list-client toward the announced endpoint.
#[allow(clippy::too_many_arguments)]
pub async fn run_receiver(
    listen_addr: Ipv4Addr,
    multicast_addr: Ipv4Addr,
    multicast_port: u16,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    tls: Option<TlsConnector>,
    list_hosts: bool,
) -> io::Result<()> {
    let socket = make_recv_socket(listen_addr, multicast_addr, multicast_port)?;
    let own_key = handler.public_key_hex();
    let mut seen_hosts = HashSet::new();
    let mut buf = [0u8; protocol::MAX_MESSAGE_SIZE];

    loop {
        let (received, from) = socket.recv_from(&mut buf).await?;
        let Ok(text) = std::str::from_utf8(&buf[..received]) else {
            continue;
        };
        trace!(%from, message = text, "received multicast");

        let host = match protocol::parse_host_announcement(text, from.ip()) {
            Ok(host) => host,
            Err(error) => {
                debug!(%from, %error, "ignoring malformed announcement");
                continue;
            }
        };
        if host.public_key == own_key {
            continue;
        }

        if list_hosts {
            if seen_hosts.insert(host.public_key.clone()) {
                println!("{} {}:{}", host.public_key, host.ip, host.port);
            }
            continue;
        }

        let salt = crypto::encode(&crypto::generate_salt());
        if let Err(error) = handler.trust(&host.public_key, &salt, Role::Initiator) {
            debug!(public_key = %host.public_key, %error, "not fetching list from peer");
            continue;
        }

        let store = Arc::clone(&store);
        let handler = Arc::clone(&handler);
        let tls = tls.clone();
        tokio::spawn(async move {
            let public_key = host.public_key.clone();
            if let Err(error) = list_client::fetch_file_list(host, store, handler, tls).await {
                debug!(%public_key, %error, "file list fetch failed");
            }
        });
    }
}
