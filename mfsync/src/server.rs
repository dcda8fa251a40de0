//! Transfer server: accepts inbound connections and answers file-list
//! and file requests. A failed bind disables sharing but leaves the
//! client side of the process running.

use std::net::Ipv4Addr;
use std::sync::Arc;

use mfsync_core::crypto::Role;
use mfsync_core::progress::TransferStatus;
use mfsync_core::protocol::{self, Message, CHUNK_SIZE};
use mfsync_core::{CryptoHandler, ProgressRegistry, RequestedFile, Store};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::session::{self, SessionError};
use crate::transport::{MessageStream, Transport};

/// Bind and serve until cancelled. Logs and returns on bind failure so
/// the caller keeps running client-only.
pub async fn run_server(
    port: u16,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    tls: Option<TlsAcceptor>,
) {
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(
                port,
                %error,
                "port already in use, files will not be served; use --port to pick another"
            );
            return;
        }
    };
    info!(port, "serving stored files");
    serve(listener, store, handler, progress, tls).await;
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    tls: Option<TlsAcceptor>,
) {
    let port = listener
        .local_addr()
        .map(|address| address.port())
        .unwrap_or_default();

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(%error, "accept failed");
                continue;
            }
        };

        let store = Arc::clone(&store);
        let handler = Arc::clone(&handler);
        let progress = Arc::clone(&progress);
        let tls = tls.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        handle_connection(MessageStream::new(stream), store, handler, progress, port)
                            .await
                    }
                    Err(error) => {
                        debug!(%peer_addr, %error, "tls accept failed");
                        return;
                    }
                },
                None => {
                    handle_connection(MessageStream::new(stream), store, handler, progress, port)
                        .await
                }
            };
            if let Err(error) = result {
                debug!(%peer_addr, %error, "session ended with error");
            }
        });
    }
}

async fn handle_connection<S: Transport>(
    mut stream: MessageStream<S>,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    port: u16,
) -> Result<(), SessionError> {
    let opener = stream.read_message().await?;
    let Message::Handshake { public_key, salt } = protocol::decode_message(&opener)? else {
        return Err(SessionError::UnexpectedMessage);
    };

    if let Err(error) = handler.trust(&public_key, &salt, Role::Responder) {
        debug!(%public_key, %error, "rejecting handshake");
        stream
            .write_message(&protocol::create_denied_message())
            .await?;
        return Ok(());
    }
    let derived = handler.derive(&public_key, &salt, Role::Responder)?;
    session::send_verdict(&mut stream, &derived, &public_key, true).await?;

    let request = stream.read_message().await?;
    match protocol::decode_message(&request)? {
        Message::FileList { .. } => serve_file_list(stream, derived, &public_key, store, port).await,
        Message::File { message, .. } => {
            serve_file(stream, derived, &public_key, store, progress, message).await
        }
        other => {
            debug!(message = ?other, "request with unexpected type");
            Err(SessionError::UnexpectedMessage)
        }
    }
}

async fn serve_file_list<S: Transport>(
    mut stream: MessageStream<S>,
    derived: CryptoHandler,
    peer: &str,
    store: Arc<Store>,
    port: u16,
) -> Result<(), SessionError> {
    let files = store.stored_files_with_hashes().await;
    let payload = protocol::create_file_list_payload(&files, port);
    let wrapper = derived.encrypt(peer, payload.as_bytes(), "")?;
    let reply = protocol::create_file_list_reply(&derived.public_key_hex(), &wrapper);
    stream.write_message(&reply).await?;
    debug!(files = files.len(), "served file list");
    Ok(())
}

async fn serve_file<S: Transport>(
    mut stream: MessageStream<S>,
    derived: CryptoHandler,
    peer: &str,
    store: Arc<Store>,
    progress: Arc<ProgressRegistry>,
    message: String,
) -> Result<(), SessionError> {
    let wrapper = protocol::parse_wrapper(&message)?;
    let plain = derived.decrypt(peer, &wrapper)?;
    let request: RequestedFile =
        serde_json::from_slice(&plain).map_err(protocol::WireError::from)?;

    if !store.is_stored(&request.file_info) {
        debug!(file = %request.file_info.file_name, "requested file is not stored");
        stream
            .write_message(&protocol::encode_message(&Message::Error {
                reason: "file does not exist".to_string(),
            }))
            .await?;
        return Ok(());
    }

    session::send_verdict(&mut stream, &derived, peer, true).await?;

    let mut file = store.read_file(&request.file_info).await?;
    file.seek(std::io::SeekFrom::Start(request.offset)).await?;

    let entry = progress.create(&request.file_info.file_name, request.file_info.size);
    entry.set_status(TransferStatus::Uploading);
    entry.set_bytes(request.offset);

    let chunk_size = if request.chunk_size == 0 {
        CHUNK_SIZE
    } else {
        request.chunk_size
    };
    debug!(
        file = %request.file_info.file_name,
        offset = request.offset,
        chunk_size,
        "streaming file"
    );

    let mut offset = request.offset;
    let mut buf = vec![0u8; chunk_size as usize];
    while offset < request.file_info.size {
        let wanted = (request.file_info.size - offset).min(u64::from(chunk_size)) as usize;
        file.read_exact(&mut buf[..wanted]).await?;
        let frame = derived.encrypt_chunk(peer, &buf[..wanted])?;
        stream.write_all(&frame).await?;
        offset += wanted as u64;
        entry.set_bytes(offset);
    }

    entry.set_status(TransferStatus::Done);
    debug!(file = %request.file_info.file_name, "finished streaming");
    Ok(())
}
