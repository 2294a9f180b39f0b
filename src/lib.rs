//! P2P pairing and encrypted messaging core for a wallet/dApp bridge,
//! tunneled over a federated chat relay.
//!
//! The public surface is [`pairing::PairingClient`]: construct it with a
//! [`config::Config`] and a [`storage::Storage`] implementation, then drive
//! pairing (outbound via [`pairing::PairingClient::get_pairing_request_info`]
//! / inbound via [`pairing::PairingClient::listen_for_channel_opening`]) and
//! session messaging ([`pairing::PairingClient::send_message`] /
//! [`pairing::PairingClient::listen_for_encrypted_message`]) from there.
//!
//! Everything else — relay selection, the chat client, the state store, room
//! routing, and the underlying crypto primitives — is composable on its own
//! and exposed as a module so it can be tested or swapped independently.

pub mod chat;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod pairing;
pub mod relay;
pub mod routing;
pub mod storage;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::CoreError;
pub use keys::{generate_keypair, import_from_mnemonic, KeyError, KeyPair};
pub use pairing::PairingClient;
pub use storage::{InMemoryStorage, SqliteStorage, Storage, StorageError};
