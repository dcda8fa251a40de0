//! Wire protocol: framed JSON messages and the multicast announcement
//! payload.
//!
//! Every message on the wire is the literal `<MFSYNC_HEADER_BEGIN>`,
//! a UTF-8 JSON body and the literal `<MFSYNC_HEADER_END>`. There is
//! no other framing. Every body carries a `type` discriminator;
//! encrypted payloads ride inside an envelope whose `message` field is
//! the stringified JSON of an [`EncryptionWrapper`]. The list reply's
//! envelope additionally carries the sender's counter in cleartext so
//! the receiver can resync.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionWrapper;
use crate::store::{AvailableFile, FileInfo};

pub const HEADER_BEGIN: &str = "<MFSYNC_HEADER_BEGIN>";
pub const HEADER_END: &str = "<MFSYNC_HEADER_END>";

pub const TCP_PORT: u16 = 8000;
pub const MULTICAST_ADDRESS: &str = "239.255.0.1";
pub const MULTICAST_PORT: u16 = 30001;
pub const MULTICAST_LISTEN_ADDRESS: &str = "0.0.0.0";
/// Largest multicast datagram we emit or accept.
pub const MAX_MESSAGE_SIZE: usize = 1024;
/// Transfer chunk size in plaintext bytes.
pub const CHUNK_SIZE: u32 = 1024;
/// Upper bound for a single framed stream message; read-until stops
/// here instead of growing without bound.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const VERSION: &str = "0.2.0";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message does not start with the mfsync header")]
    MissingHeader,
    #[error("message has no trailer")]
    MissingTrailer,
    #[error("message exceeds the frame size limit")]
    TooLarge,
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed messages exchanged over a transfer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Connection opener; `salt` seeds the session key derivation.
    Handshake { public_key: String, salt: String },
    /// File-list request, or the reply when `count` and `message` are
    /// set: `message` wraps the encrypted list, `count` repeats the
    /// wrapper's counter in cleartext.
    FileList {
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Request one file; `message` wraps the encrypted `RequestedFile`.
    File { public_key: String, message: String },
    /// Encrypted confirmation envelope.
    Accepted { public_key: String, message: String },
    /// Refusal: plain (no fields) before a session exists, an
    /// encrypted envelope afterwards.
    Denied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Plaintext refusal with a reason, e.g. for unknown files.
    Error { reason: String },
}

/// Authenticated confirmation carried inside a verdict envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Denied,
}

/// Host announcement broadcast by the beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    public_key: String,
    port: u16,
    version: String,
}

/// A peer seen on the multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub public_key: String,
    pub version: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// One entry of a served file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub file_name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
    pub port: u16,
}

pub fn wrap_with_header(body: &str) -> String {
    format!("{HEADER_BEGIN}{body}{HEADER_END}")
}

/// Strip the header/trailer literals, returning the JSON body.
pub fn unwrap_message(message: &str) -> Result<&str, WireError> {
    let body = message
        .strip_prefix(HEADER_BEGIN)
        .ok_or(WireError::MissingHeader)?;
    body.strip_suffix(HEADER_END)
        .ok_or(WireError::MissingTrailer)
}

pub fn encode_message(message: &Message) -> String {
    wrap_with_header(&serde_json::to_string(message).expect("message serialization is infallible"))
}

pub fn decode_message(message: &str) -> Result<Message, WireError> {
    Ok(serde_json::from_str(unwrap_message(message)?)?)
}

/// Stringify a wrapper for the `message` field of an envelope.
fn wrapper_to_message(wrapper: &EncryptionWrapper) -> String {
    serde_json::to_string(wrapper).expect("wrapper serialization is infallible")
}

/// Parse an envelope's `message` field back into the wrapper.
pub fn parse_wrapper(message: &str) -> Result<EncryptionWrapper, WireError> {
    Ok(serde_json::from_str(message)?)
}

/// Encrypted accepted/denied envelope.
pub fn create_verdict_message(
    accepted: bool,
    public_key: &str,
    wrapper: &EncryptionWrapper,
) -> String {
    let message = wrapper_to_message(wrapper);
    let verdict = if accepted {
        Message::Accepted {
            public_key: public_key.to_string(),
            message,
        }
    } else {
        Message::Denied {
            public_key: Some(public_key.to_string()),
            message: Some(message),
        }
    };
    encode_message(&verdict)
}

/// Plain refusal for peers no session exists with yet.
pub fn create_denied_message() -> String {
    encode_message(&Message::Denied {
        public_key: None,
        message: None,
    })
}

/// Encrypted file request envelope.
pub fn create_file_message(public_key: &str, wrapper: &EncryptionWrapper) -> String {
    encode_message(&Message::File {
        public_key: public_key.to_string(),
        message: wrapper_to_message(wrapper),
    })
}

/// List reply envelope; the wrapper's counter rides along in cleartext
/// so the receiver can resync before decrypting.
pub fn create_file_list_reply(public_key: &str, wrapper: &EncryptionWrapper) -> String {
    encode_message(&Message::FileList {
        public_key: public_key.to_string(),
        count: Some(wrapper.count),
        message: Some(wrapper_to_message(wrapper)),
    })
}

pub fn create_host_announcement(public_key: &str, port: u16) -> String {
    wrap_with_header(
        &serde_json::to_string(&Announcement {
            public_key: public_key.to_string(),
            port,
            version: VERSION.to_string(),
        })
        .expect("announcement serialization is infallible"),
    )
}

/// Parse a beacon datagram; the host address comes from the datagram
/// source, not the payload.
pub fn parse_host_announcement(message: &str, source: IpAddr) -> Result<HostInfo, WireError> {
    let announcement: Announcement = serde_json::from_str(unwrap_message(message)?)?;
    Ok(HostInfo {
        public_key: announcement.public_key,
        version: announcement.version,
        ip: source,
        port: announcement.port,
    })
}

/// Serialize a stored-file list as the plaintext of a list reply.
pub fn create_file_list_payload(files: &[FileInfo], port: u16) -> String {
    let entries: Vec<SharedFile> = files
        .iter()
        .map(|info| SharedFile {
            file_name: info.file_name.clone(),
            size: info.size,
            sha256sum: info.sha256sum.clone(),
            port,
        })
        .collect();
    serde_json::to_string(&entries).expect("file list serialization is infallible")
}

/// Split a stored-file list into framed messages that each fit inside
/// `max_size` bytes, for transports with a datagram cap. Concatenating
/// the parsed results of every message yields the full set again.
pub fn create_file_list_messages(files: &[FileInfo], port: u16, max_size: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut batch: Vec<FileInfo> = Vec::new();

    for info in files {
        batch.push(info.clone());
        if wrap_with_header(&create_file_list_payload(&batch, port)).len() > max_size
            && batch.len() > 1
        {
            let overflow = batch.pop().expect("batch has at least two entries");
            messages.push(wrap_with_header(&create_file_list_payload(&batch, port)));
            batch = vec![overflow];
        }
    }

    if !batch.is_empty() {
        messages.push(wrap_with_header(&create_file_list_payload(&batch, port)));
    }
    messages
}

/// Parse a list payload into available files, stamping the source
/// address and announcing peer key onto every entry.
pub fn parse_file_list_payload(
    payload: &str,
    source: IpAddr,
    peer_pub_key: &str,
) -> Result<Vec<AvailableFile>, WireError> {
    let entries: Vec<SharedFile> = serde_json::from_str(payload)?;
    Ok(entries
        .into_iter()
        .map(|entry| AvailableFile {
            file_info: FileInfo {
                file_name: entry.file_name,
                size: entry.size,
                sha256sum: entry.sha256sum,
            },
            source_addr: source,
            source_port: entry.port,
            public_key: peer_pub_key.to_string(),
        })
        .collect())
}
