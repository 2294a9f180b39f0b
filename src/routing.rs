//! Maps a recipient address to a chat room, backed by the `peer-room-ids`
//! and `standby-room` storage keys. Free functions, not a struct — all of
//! its state already lives in [`crate::storage::Storage`].

use std::collections::HashMap;

use crate::chat::ChatClient;
use crate::storage::{Storage, StorageError};
use crate::types::{storage_keys, PeerRoomIds};

async fn load_peer_room_ids(storage: &dyn Storage) -> Result<PeerRoomIds, StorageError> {
    match storage.get(storage_keys::PEER_ROOM_IDS).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        None => Ok(HashMap::new()),
    }
}

async fn save_peer_room_ids(storage: &dyn Storage, map: &PeerRoomIds) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(map).expect("HashMap<String,String> always serializes");
    storage.set(storage_keys::PEER_ROOM_IDS, bytes).await
}

async fn load_standby_room(storage: &dyn Storage) -> Result<Option<String>, StorageError> {
    Ok(storage
        .get(storage_keys::STANDBY_ROOM)
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
}

/// Resolve (and cache) the room to use for `recipient`:
/// 1. a cached `peer-room-ids` binding,
/// 2. otherwise a joined room that already contains `recipient`,
/// 3. otherwise the standby room (consumed, replacement provisioned by the caller),
/// 4. otherwise a freshly created trusted private room.
pub async fn get_relevant_room(
    storage: &dyn Storage,
    chat: &dyn ChatClient,
    recipient: &str,
) -> Result<String, crate::chat::ChatError> {
    let mut peer_room_ids = load_peer_room_ids(storage)
        .await
        .map_err(|e| crate::chat::ChatError::Protocol(e.to_string()))?;

    if let Some(room_id) = peer_room_ids.get(recipient) {
        return Ok(room_id.clone());
    }

    if let Some(room_id) = find_joined_room_with_member(chat, recipient).await {
        peer_room_ids.insert(recipient.to_string(), room_id.clone());
        save_peer_room_ids(storage, &peer_room_ids)
            .await
            .map_err(|e| crate::chat::ChatError::Protocol(e.to_string()))?;
        return Ok(room_id);
    }

    let room_id = if let Some(standby) = load_standby_room(storage)
        .await
        .map_err(|e| crate::chat::ChatError::Protocol(e.to_string()))?
    {
        storage
            .delete(storage_keys::STANDBY_ROOM)
            .await
            .map_err(|e| crate::chat::ChatError::Protocol(e.to_string()))?;
        chat.invite_to_rooms(recipient, &[standby.clone()]).await?;
        standby
    } else {
        chat.create_trusted_private_room(&[recipient.to_string()]).await?
    };

    peer_room_ids.insert(recipient.to_string(), room_id.clone());
    save_peer_room_ids(storage, &peer_room_ids)
        .await
        .map_err(|e| crate::chat::ChatError::Protocol(e.to_string()))?;

    Ok(room_id)
}

async fn find_joined_room_with_member(chat: &dyn ChatClient, recipient: &str) -> Option<String> {
    chat.joined_rooms()
        .await
        .into_iter()
        .find(|room| room.is_relevant_for(recipient))
        .map(|room| room.id)
}

/// Rebuild `peer-room-ids`, dropping every entry whose value equals
/// `room_id`. Triggered by "forbidden" on send.
pub async fn delete_room_id_from_rooms(storage: &dyn Storage, room_id: &str) -> Result<(), StorageError> {
    let mut peer_room_ids = load_peer_room_ids(storage).await?;
    peer_room_ids.retain(|_, v| v != room_id);
    save_peer_room_ids(storage, &peer_room_ids).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatClient, ChatError, EventKind, LoginCredentials};
    use crate::storage::InMemoryStorage;
    use crate::types::{Room, RoomStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Minimal in-memory [`ChatClient`] fake for routing tests.
    #[derive(Default)]
    struct FakeChatClient {
        rooms: Mutex<Vec<Room>>,
        created: Mutex<Vec<Vec<String>>>,
        invited: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ChatClient for FakeChatClient {
        async fn start(&self, _credentials: LoginCredentials) -> Result<(), ChatError> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn join_rooms(&self, _room_ids: &[String]) -> Result<(), ChatError> {
            Ok(())
        }
        async fn create_trusted_private_room(&self, invitees: &[String]) -> Result<String, ChatError> {
            self.created.lock().unwrap().push(invitees.to_vec());
            Ok(format!("!created-{}:relay", self.created.lock().unwrap().len()))
        }
        async fn invite_to_rooms(&self, user: &str, room_ids: &[String]) -> Result<(), ChatError> {
            self.invited.lock().unwrap().push((user.to_string(), room_ids.to_vec()));
            Ok(())
        }
        async fn send_text_message(&self, _room_id: &str, _text: &str) -> Result<(), ChatError> {
            Ok(())
        }
        async fn get_room_by_id(&self, id: &str) -> Option<Room> {
            self.rooms.lock().unwrap().iter().find(|r| r.id == id).cloned()
        }
        async fn joined_rooms(&self) -> Vec<Room> {
            self.rooms
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status == RoomStatus::Joined)
                .cloned()
                .collect()
        }
        async fn invited_rooms(&self) -> Vec<Room> {
            self.rooms
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status == RoomStatus::Invited)
                .cloned()
                .collect()
        }
        fn subscribe(&self, _kind: EventKind, _handler: std::sync::Arc<dyn Fn(&crate::chat::ChatEvent) + Send + Sync>) -> u64 {
            0
        }
        fn unsubscribe(&self, _kind: EventKind, _handler_id: Option<u64>) {}
    }

    #[tokio::test]
    async fn cached_binding_short_circuits_lookup() {
        let storage = InMemoryStorage::new();
        let mut map = HashMap::new();
        map.insert("@peer:relay".to_string(), "!cached:relay".to_string());
        storage.set(storage_keys::PEER_ROOM_IDS, serde_json::to_vec(&map).unwrap()).await.unwrap();

        let chat = FakeChatClient::default();
        let room_id = get_relevant_room(&storage, &chat, "@peer:relay").await.unwrap();
        assert_eq!(room_id, "!cached:relay");
        assert!(chat.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_joined_room_scan() {
        let storage = InMemoryStorage::new();
        let mut room = Room::new("!found:relay", RoomStatus::Joined);
        room.members.push("@peer:relay".into());
        let chat = FakeChatClient::default();
        chat.rooms.lock().unwrap().push(room);

        let room_id = get_relevant_room(&storage, &chat, "@peer:relay").await.unwrap();
        assert_eq!(room_id, "!found:relay");

        let cached = load_peer_room_ids(&storage).await.unwrap();
        assert_eq!(cached.get("@peer:relay"), Some(&"!found:relay".to_string()));
    }

    #[tokio::test]
    async fn standby_room_is_consumed_and_cleared() {
        let storage = InMemoryStorage::new();
        storage
            .set(storage_keys::STANDBY_ROOM, b"!standby:relay".to_vec())
            .await
            .unwrap();
        let chat = FakeChatClient::default();

        let room_id = get_relevant_room(&storage, &chat, "@peer:relay").await.unwrap();
        assert_eq!(room_id, "!standby:relay");
        assert!(load_standby_room(&storage).await.unwrap().is_none());
        assert_eq!(chat.invited.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn creates_trusted_private_room_as_last_resort() {
        let storage = InMemoryStorage::new();
        let chat = FakeChatClient::default();

        let room_id = get_relevant_room(&storage, &chat, "@peer:relay").await.unwrap();
        assert!(room_id.starts_with("!created-"));
        assert_eq!(chat.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_room_id_removes_only_matching_entries() {
        let storage = InMemoryStorage::new();
        let mut map = HashMap::new();
        map.insert("@a:relay".to_string(), "!x:relay".to_string());
        map.insert("@b:relay".to_string(), "!y:relay".to_string());
        storage.set(storage_keys::PEER_ROOM_IDS, serde_json::to_vec(&map).unwrap()).await.unwrap();

        delete_room_id_from_rooms(&storage, "!x:relay").await.unwrap();

        let remaining = load_peer_room_ids(&storage).await.unwrap();
        assert!(!remaining.contains_key("@a:relay"));
        assert_eq!(remaining.get("@b:relay"), Some(&"!y:relay".to_string()));
    }
}
