//! Wire-level and in-memory data shapes shared across the crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `{ id, type, name, version, publicKey, relayServer, icon?, appUrl? }` —
/// the handshake payload carried both by a pairing request and a pairing
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PeerDescriptorKind,
    pub name: String,
    pub version: String,
    pub public_key: String,
    pub relay_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerDescriptorKind {
    #[serde(rename = "p2p-pairing-request")]
    PairingRequest,
    #[serde(rename = "p2p-pairing-response")]
    PairingResponse,
}

pub type PairingRequest = PeerDescriptor;
pub type PairingResponse = PeerDescriptor;

/// A [`PairingResponse`] with the sender's address attached — computed
/// locally from its embedded `publicKey`, never carried on the wire.
#[derive(Debug, Clone)]
pub struct ExtendedPairingResponse {
    pub response: PairingResponse,
    pub sender_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Unknown,
    Joined,
    Invited,
    Left,
}

/// A chat room. `members` is transient — never serialized, never hydrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub status: RoomStatus,
    #[serde(skip)]
    pub members: Vec<String>,
    #[serde(skip)]
    pub messages: Vec<RoomMessage>,
}

impl Room {
    pub fn new(id: impl Into<String>, status: RoomStatus) -> Self {
        Room {
            id: id.into(),
            status,
            members: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// A room is relevant to `recipient` if self is a member along with them.
    pub fn is_relevant_for(&self, recipient: &str) -> bool {
        self.members.iter().any(|m| m == recipient)
    }
}

#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub kind: MessageKind,
    pub content: String,
    pub sender: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Other,
}

/// The subset of [`crate::store::ClientState`] that survives a store
/// round-trip through [`crate::storage::Storage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub rooms: HashMap<String, Room>,
}

/// `peer-room-ids` — the routing cache: recipient address -> room ID.
pub type PeerRoomIds = HashMap<String, String>;

pub mod storage_keys {
    pub const CHAT_STATE: &str = "preserved-chat-state";
    pub const PEER_ROOM_IDS: &str = "peer-room-ids";
    pub const STANDBY_ROOM: &str = "standby-room";
}

/// `"@<hex(genericHash(pk)))>:<relay>"`, byte-exact with the glossary's
/// recipient string.
pub fn recipient_address(public_key_hash_hex: &str, relay: &str) -> String {
    format!("@{public_key_hash_hex}:{relay}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_address_matches_spec_shape() {
        assert_eq!(recipient_address("abc123", "matrix.papers.tech"), "@abc123:matrix.papers.tech");
    }

    #[test]
    fn peer_descriptor_serializes_camel_case() {
        let descriptor = PeerDescriptor {
            id: "id-1".into(),
            kind: PeerDescriptorKind::PairingRequest,
            name: "Wallet".into(),
            version: "1".into(),
            public_key: "deadbeef".into(),
            relay_server: "matrix.papers.tech".into(),
            icon: None,
            app_url: None,
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"publicKey\":\"deadbeef\""));
        assert!(json.contains("\"relayServer\":\"matrix.papers.tech\""));
        assert!(json.contains("\"type\":\"p2p-pairing-request\""));
        assert!(!json.contains("icon"));
    }

    #[test]
    fn room_is_relevant_only_with_member_present() {
        let mut room = Room::new("!r:relay", RoomStatus::Joined);
        room.members.push("@abc:relay".into());
        assert!(room.is_relevant_for("@abc:relay"));
        assert!(!room.is_relevant_for("@other:relay"));
    }

    #[test]
    fn room_members_and_messages_are_not_serialized() {
        let mut room = Room::new("!r:relay", RoomStatus::Joined);
        room.members.push("@abc:relay".into());
        room.messages.push(RoomMessage {
            kind: MessageKind::Text,
            content: "hi".into(),
            sender: "@abc:relay".into(),
            timestamp: 1,
        });
        let json = serde_json::to_string(&room).unwrap();
        assert!(!json.contains("members"));
        assert!(!json.contains("messages"));
    }
}
