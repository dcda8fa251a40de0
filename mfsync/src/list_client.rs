//! List client: one short session per beacon datagram that pulls the
//! announcing peer's stored-file list into the local available set.

use std::net::SocketAddr;
use std::sync::Arc;

use mfsync_core::protocol::{self, HostInfo, Message};
use mfsync_core::{CryptoHandler, Store};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::session::{self, SessionError};
use crate::transport::{self, MessageStream, Transport};

/// Connect to the announced endpoint, handshake, fetch the file list
/// and record every entry as available.
pub async fn fetch_file_list(
    host: HostInfo,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    tls: Option<TlsConnector>,
) -> Result<(), SessionError> {
    let address = SocketAddr::new(host.ip, host.port);
    let tcp = TcpStream::connect(address).await?;

    match tls {
        Some(connector) => {
            let name = transport::server_name(&host.ip.to_string())?;
            let stream = connector.connect(name, tcp).await?;
            run(MessageStream::new(stream), host, store, handler).await
        }
        None => run(MessageStream::new(tcp), host, store, handler).await,
    }
}

async fn run<S: Transport>(
    mut stream: MessageStream<S>,
    host: HostInfo,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
) -> Result<(), SessionError> {
    let derived = session::client_handshake(&mut stream, &handler, &host.public_key).await?;

    let request = Message::FileList {
        public_key: derived.public_key_hex(),
        count: None,
        message: None,
    };
    stream
        .write_message(&protocol::encode_message(&request))
        .await?;

    let reply = stream.read_message().await?;
    let (count, message) = match protocol::decode_message(&reply)? {
        Message::FileList {
            count,
            message: Some(message),
            ..
        } => (count, message),
        Message::Denied { .. } => {
            debug!(public_key = %host.public_key, "file list request denied");
            return Err(SessionError::Denied);
        }
        Message::Error { reason } => return Err(SessionError::Refused(reason)),
        _ => return Err(SessionError::UnexpectedMessage),
    };

    let wrapper = protocol::parse_wrapper(&message)?;
    // The counter advertised in the envelope resyncs the long-lived
    // handler so later sessions toward this peer pick up the right
    // sequence.
    let advertised = count.unwrap_or(wrapper.count);
    if let Err(error) = handler.set_counter(&host.public_key, advertised) {
        debug!(public_key = %host.public_key, %error, "counter resync skipped");
    }

    let plain = derived.decrypt(&host.public_key, &wrapper)?;
    let payload = String::from_utf8(plain)
        .map_err(|_| SessionError::Transport(crate::transport::TransportError::Utf8))?;
    let availables = protocol::parse_file_list_payload(&payload, host.ip, &host.public_key)?;

    debug!(
        public_key = %host.public_key,
        files = availables.len(),
        "received file list"
    );
    store.add_available_files(availables);
    Ok(())
}
