//! mfsync protocol core.
//!
//! Everything that does not own a socket lives here: the long-term
//! identity and per-connection session crypto, the framed JSON wire
//! codec, the storage handler with its stored/available/in-flight
//! bookkeeping, the deduplicating request queue and the progress
//! registry polled by the terminal renderer.
//!
//! The `mfsync` binary wires these pieces to UDP multicast discovery,
//! the TCP/TLS transfer sessions and the CLI.

pub mod crypto;
pub mod identity;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod store;

pub use crypto::{CryptoError, CryptoHandler, EncryptionWrapper, Role};
pub use identity::Keypair;
pub use progress::{ProgressRegistry, TransferStatus};
pub use protocol::{HostInfo, Message, Verdict, WireError};
pub use queue::RequestQueue;
pub use store::{AvailableFile, FileInfo, RequestedFile, Store, StoreError};
