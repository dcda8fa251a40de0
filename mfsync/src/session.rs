//! Pieces shared by every transfer-protocol session: the error type,
//! the client-side handshake and the encrypted accepted/denied
//! verdict exchange.

use mfsync_core::crypto::{self, CryptoError, CryptoHandler, Role};
use mfsync_core::protocol::{self, Message, Verdict, WireError};
use mfsync_core::StoreError;
use tracing::debug;

use crate::transport::{MessageStream, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("peer denied the request")]
    Denied,
    #[error("peer sent an unexpected message")]
    UnexpectedMessage,
    #[error("peer refused: {0}")]
    Refused(String),
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::Transport(TransportError::Io(error))
    }
}

/// Open a session as the connecting side: generate the per-connection
/// salt, derive the session handler, send the handshake and check the
/// peer's encrypted verdict. Returns the derived handler the rest of
/// the session encrypts with.
pub async fn client_handshake<S: Transport>(
    stream: &mut MessageStream<S>,
    handler: &CryptoHandler,
    peer_pub_key: &str,
) -> Result<CryptoHandler, SessionError> {
    let salt = crypto::encode(&crypto::generate_salt());
    let derived = handler.derive(peer_pub_key, &salt, Role::Initiator)?;

    let handshake = Message::Handshake {
        public_key: derived.public_key_hex(),
        salt,
    };
    stream
        .write_message(&protocol::encode_message(&handshake))
        .await?;

    let reply = stream.read_message().await?;
    read_verdict(&reply, &derived, peer_pub_key)?;
    Ok(derived)
}

/// Interpret a verdict reply: an encrypted accepted/denied envelope,
/// a plain denial, or a plaintext error.
pub fn read_verdict(
    reply: &str,
    handler: &CryptoHandler,
    peer_pub_key: &str,
) -> Result<(), SessionError> {
    match protocol::decode_message(reply)? {
        Message::Accepted { message, .. } => {
            let wrapper = protocol::parse_wrapper(&message)?;
            let plain = handler.decrypt(peer_pub_key, &wrapper)?;
            match serde_json::from_slice::<Verdict>(&plain) {
                Ok(Verdict::Accepted) => Ok(()),
                Ok(Verdict::Denied) => Err(SessionError::Denied),
                Err(_) => {
                    debug!("verdict payload was not a confirmation");
                    Err(SessionError::UnexpectedMessage)
                }
            }
        }
        Message::Denied { .. } => Err(SessionError::Denied),
        Message::Error { reason } => Err(SessionError::Refused(reason)),
        _ => Err(SessionError::UnexpectedMessage),
    }
}

/// Encrypt and send an accepted/denied verdict envelope.
pub async fn send_verdict<S: Transport>(
    stream: &mut MessageStream<S>,
    handler: &CryptoHandler,
    peer_pub_key: &str,
    accepted: bool,
) -> Result<(), SessionError> {
    let verdict = if accepted {
        Verdict::Accepted
    } else {
        Verdict::Denied
    };
    let plain = serde_json::to_vec(&verdict).expect("verdict serialization is infallible");
    let wrapper = handler.encrypt(peer_pub_key, &plain, "")?;
    let envelope = protocol::create_verdict_message(accepted, &handler.public_key_hex(), &wrapper);
    stream.write_message(&envelope).await?;
    Ok(())
}
