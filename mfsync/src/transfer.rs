//! Transfer client session: pull one file from the peer that announced
//! it. One session per scheduler slot, strictly sequential inside.
//!
//! ```text
//! CONNECT -> HANDSHAKE -> REQUEST -> STREAM -> COMMIT -> DONE
//!    \________________________ error _______________________/
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use mfsync_core::crypto::TAG_LEN;
use mfsync_core::progress::TransferStatus;
use mfsync_core::protocol::{self, CHUNK_SIZE};
use mfsync_core::store::FileWriter;
use mfsync_core::{AvailableFile, CryptoHandler, ProgressRegistry, RequestedFile, Store};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::session::{self, SessionError};
use crate::transport::{self, MessageStream, Transport};

/// Download one announced file into the store.
pub async fn download(
    available: AvailableFile,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    tls: Option<TlsConnector>,
) -> Result<(), SessionError> {
    let address = SocketAddr::new(available.source_addr, available.source_port);
    let tcp = TcpStream::connect(address).await?;

    match tls {
        Some(connector) => {
            let name = transport::server_name(&available.source_addr.to_string())?;
            let stream = connector.connect(name, tcp).await?;
            run(MessageStream::new(stream), available, store, handler, progress).await
        }
        None => run(MessageStream::new(tcp), available, store, handler, progress).await,
    }
}

async fn run<S: Transport>(
    mut stream: MessageStream<S>,
    available: AvailableFile,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
) -> Result<(), SessionError> {
    let peer = available.public_key.clone();
    let derived = session::client_handshake(&mut stream, &handler, &peer).await?;

    // The store fills in the resume offset from the temp file.
    let mut request = RequestedFile {
        file_info: available.file_info.clone(),
        offset: 0,
        chunk_size: CHUNK_SIZE,
    };
    let writer = store.create_file(&mut request)?;

    let plain = serde_json::to_vec(&request).map_err(protocol::WireError::from)?;
    let wrapper = derived.encrypt(&peer, &plain, "")?;
    let envelope = protocol::create_file_message(&derived.public_key_hex(), &wrapper);
    stream.write_message(&envelope).await?;

    let reply = stream.read_message().await?;
    session::read_verdict(&reply, &derived, &peer)?;

    debug!(
        file = %request.file_info.file_name,
        offset = request.offset,
        "starting download"
    );
    let entry = progress.create(&request.file_info.file_name, request.file_info.size);
    entry.set_status(TransferStatus::Downloading);
    entry.set_bytes(request.offset);

    let outcome = stream_and_commit(
        &mut stream, &derived, &peer, &store, &request, writer, &entry,
    )
    .await;
    match outcome {
        Ok(()) => {
            entry.set_bytes(request.file_info.size);
            entry.set_status(TransferStatus::Done);
            debug!(file = %request.file_info.file_name, "download finished");
            Ok(())
        }
        Err(error) => {
            entry.set_status(TransferStatus::Failed);
            Err(error)
        }
    }
}

async fn stream_and_commit<S: Transport>(
    stream: &mut MessageStream<S>,
    derived: &CryptoHandler,
    peer: &str,
    store: &Store,
    request: &RequestedFile,
    mut writer: FileWriter,
    entry: &mfsync_core::progress::FileProgress,
) -> Result<(), SessionError> {
    let mut offset = request.offset;
    while offset < request.file_info.size {
        let wanted = (request.file_info.size - offset).min(u64::from(request.chunk_size)) as usize;
        let frame = stream.read_exact(wanted + TAG_LEN).await?;
        let plain = derived.decrypt_chunk(peer, &frame)?;
        writer.write_chunk(&plain).await?;
        offset += plain.len() as u64;
        entry.set_bytes(offset);
    }

    writer.flush().await?;
    entry.set_status(TransferStatus::Comparing);
    store.finalize_file(&request.file_info).await?;
    drop(writer);
    Ok(())
}
