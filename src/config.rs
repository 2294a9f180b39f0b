//! Explicit configuration for the pairing/messaging core. No module-level
//! mutable globals: everything the core needs is passed in here at
//! construction.

use crate::keys::KeyPair;

/// Construction-time configuration for [`crate::pairing::PairingClient`].
#[derive(Clone)]
pub struct Config {
    /// Human-readable name advertised in pairing descriptors.
    pub name: String,
    /// Long-term Ed25519 identity.
    pub keypair: KeyPair,
    /// Accepted but not read by the relay selector beyond documentation —
    /// advisory only; the core always targets a single active relay.
    pub replication_count: u32,
    /// Candidate relay hostnames. Empty falls back to
    /// [`crate::relay::DEFAULT_RELAYS`].
    pub relay_nodes: Vec<String>,
    /// Whether this instance plays the wallet role (maintains a standby room).
    pub is_wallet: bool,
    pub icon_url: Option<String>,
    pub app_url: Option<String>,
}

impl Config {
    pub fn new(name: impl Into<String>, keypair: KeyPair) -> Self {
        Config {
            name: name.into(),
            keypair,
            replication_count: 1,
            relay_nodes: Vec::new(),
            is_wallet: false,
            icon_url: None,
            app_url: None,
        }
    }

    pub fn with_relay_nodes(mut self, nodes: Vec<String>) -> Self {
        self.relay_nodes = nodes;
        self
    }

    pub fn with_wallet_role(mut self, is_wallet: bool) -> Self {
        self.is_wallet = is_wallet;
        self
    }

    pub fn with_icon_url(mut self, icon_url: impl Into<String>) -> Self {
        self.icon_url = Some(icon_url.into());
        self
    }

    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = Some(app_url.into());
        self
    }
}
