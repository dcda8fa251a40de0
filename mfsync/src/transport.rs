//! Transport layer for transfer sessions: framed message reads over
//! anything that is `AsyncRead + AsyncWrite`, plus the TLS acceptor
//! and connector setup. The session state machines are written once
//! over [`Transport`]; plain TCP and TLS are the two instantiations.

use std::io;
use std::path::Path;
use std::sync::Arc;

use mfsync_core::protocol::{HEADER_END, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Anything a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed before a full message arrived")]
    Closed,
    #[error("framed message exceeds the size limit")]
    TooLarge,
    #[error("framed message is not valid utf-8")]
    Utf8,
}

/// Buffered reader/writer over a transport. Bytes read past a message
/// trailer stay buffered so the chunk stream following a reply is not
/// swallowed.
pub struct MessageStream<S> {
    inner: S,
    buffer: Vec<u8>,
}

impl<S: Transport> MessageStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Read one framed message, scanning for the trailer literal.
    pub async fn read_message(&mut self) -> Result<String, TransportError> {
        let trailer = HEADER_END.as_bytes();
        loop {
            if let Some(pos) = self
                .buffer
                .windows(trailer.len())
                .position(|window| window == trailer)
            {
                let end = pos + trailer.len();
                let frame: Vec<u8> = self.buffer.drain(..end).collect();
                return String::from_utf8(frame).map_err(|_| TransportError::Utf8);
            }
            if self.buffer.len() > MAX_FRAME_SIZE {
                return Err(TransportError::TooLarge);
            }
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read exactly `len` raw bytes, draining anything buffered first.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let buffered = len.min(self.buffer.len());
        let mut out: Vec<u8> = self.buffer.drain(..buffered).collect();
        if out.len() < len {
            let mut rest = vec![0u8; len - out.len()];
            self.inner.read_exact(&mut rest).await?;
            out.extend_from_slice(&rest);
        }
        Ok(out)
    }

    pub async fn write_message(&mut self, message: &str) -> Result<(), TransportError> {
        self.write_all(message.as_bytes()).await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Build the acceptor for `--server-tls <cert> <key>`.
pub fn load_server_tls(
    cert_path: &Path,
    key_path: &Path,
) -> Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let mut cert_reader = io::BufReader::new(std::fs::File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = io::BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| format!("no private key in {}", key_path.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector for `--client-tls <ca>`.
pub fn load_client_tls(ca_path: &Path) -> Result<TlsConnector, Box<dyn std::error::Error>> {
    let mut reader = io::BufReader::new(std::fs::File::open(ca_path)?);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for certificate verification, from the peer address.
pub fn server_name(host: &str) -> Result<ServerName<'static>, io::Error> {
    ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid tls server name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfsync_core::protocol::wrap_with_header;

    #[tokio::test]
    async fn reads_one_message_and_keeps_the_rest_buffered() {
        let first = wrap_with_header("{\"type\":\"denied\"}");
        let mut wire = first.clone().into_bytes();
        wire.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let (client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            server.write_all(&wire).await.unwrap();
        });

        let mut stream = MessageStream::new(client);
        assert_eq!(stream.read_message().await.unwrap(), first);
        assert_eq!(stream.read_exact(4).await.unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[tokio::test]
    async fn split_writes_reassemble() {
        let message = wrap_with_header("{\"type\":\"denied\"}");
        let (client, mut server) = tokio::io::duplex(256);
        let halves = (
            message.as_bytes()[..10].to_vec(),
            message.as_bytes()[10..].to_vec(),
        );
        tokio::spawn(async move {
            server.write_all(&halves.0).await.unwrap();
            server.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            server.write_all(&halves.1).await.unwrap();
        });

        let mut stream = MessageStream::new(client);
        assert_eq!(stream.read_message().await.unwrap(), message);
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut stream = MessageStream::new(client);
        assert!(matches!(
            stream.read_message().await,
            Err(TransportError::Closed)
        ));
    }
}
