//! Client-side state store: an in-memory `ClientState`, lazily hydrated from
//! [`crate::storage::Storage`], mutated only through a serialized `update`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::storage::{Storage, StorageError};
use crate::types::{storage_keys, PersistedState, Room, RoomStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// In-memory client state. Only `sync_token` and `rooms` survive a store
/// round-trip (see [`PersistedState`]); everything else is process-lifetime.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub is_running: bool,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub txn_no: u64,
    pub access_token: Option<String>,
    pub sync_token: Option<String>,
    pub polling_timeout: Option<u64>,
    pub polling_retries: u32,
    pub rooms: HashMap<String, Room>,
}

/// A partial update to [`ClientState`]. `None` fields are left untouched;
/// `rooms`, when present, is merged (not replaced) into the existing map.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub is_running: Option<bool>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub txn_no: Option<u64>,
    pub access_token: Option<String>,
    pub sync_token: Option<String>,
    pub polling_timeout: Option<u64>,
    pub polling_retries: Option<u32>,
    pub rooms: Option<HashMap<String, Room>>,
}

/// Which top-level fields changed in an update, for listener keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    IsRunning,
    UserId,
    DeviceId,
    TxnNo,
    AccessToken,
    SyncToken,
    PollingTimeout,
    PollingRetries,
    Rooms,
}

/// The set of [`StateKey`]s that changed in one `update()` call.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub changed: Vec<StateKey>,
}

impl StateDelta {
    pub fn contains(&self, key: StateKey) -> bool {
        self.changed.contains(&key)
    }
}

type Listener = Arc<dyn Fn(&ClientState, &ClientState, &StateDelta) + Send + Sync>;

/// Registration target for [`StateStore::on_state_changed`]: either a
/// specific key or the catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    Key(StateKey),
    All,
}

struct Inner {
    state: Mutex<ClientState>,
    listeners: Mutex<HashMap<ListenerKey, Vec<Listener>>>,
    hydrated: OnceCell<()>,
    storage: Arc<dyn Storage>,
}

/// Owns the in-memory [`ClientState`], hydrates it once from storage, and
/// serializes every mutation through [`StateStore::update`].
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        StateStore {
            inner: Arc::new(Inner {
                state: Mutex::new(ClientState::default()),
                listeners: Mutex::new(HashMap::new()),
                hydrated: OnceCell::new(),
                storage,
            }),
        }
    }

    /// Idempotent: the first caller performs the read, every later caller
    /// (concurrent or not) awaits the same result. No update is ever lost to
    /// a startup hydration race.
    async fn ensure_hydrated(&self) -> Result<(), StoreError> {
        self.inner
            .hydrated
            .get_or_try_init(|| async {
                let bytes = self.inner.storage.get(storage_keys::CHAT_STATE).await?;
                if let Some(bytes) = bytes {
                    let persisted: PersistedState = serde_json::from_slice(&bytes)?;
                    let mut state = self.inner.state.lock().await;
                    state.sync_token = persisted.sync_token;
                    state.rooms = persisted.rooms;
                }
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }

    pub async fn get(&self) -> Result<ClientState, StoreError> {
        self.ensure_hydrated().await?;
        Ok(self.inner.state.lock().await.clone())
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.ensure_hydrated().await?;
        Ok(self.inner.state.lock().await.rooms.get(room_id).cloned())
    }

    /// Apply `update`, merge rooms, persist `{sync_token, rooms}` when
    /// either changed and is truthy, then notify listeners.
    pub async fn update(&self, update: StateUpdate) -> Result<(), StoreError> {
        self.ensure_hydrated().await?;

        let mut guard = self.inner.state.lock().await;
        let old = guard.clone();
        let mut delta = StateDelta::default();

        if let Some(v) = update.is_running {
            guard.is_running = v;
            delta.changed.push(StateKey::IsRunning);
        }
        if let Some(v) = update.user_id {
            guard.user_id = Some(v);
            delta.changed.push(StateKey::UserId);
        }
        if let Some(v) = update.device_id {
            guard.device_id = Some(v);
            delta.changed.push(StateKey::DeviceId);
        }
        if let Some(v) = update.txn_no {
            guard.txn_no = v;
            delta.changed.push(StateKey::TxnNo);
        }
        if let Some(v) = update.access_token {
            guard.access_token = Some(v);
            delta.changed.push(StateKey::AccessToken);
        }
        if let Some(v) = update.sync_token {
            guard.sync_token = Some(v);
            delta.changed.push(StateKey::SyncToken);
        }
        if let Some(v) = update.polling_timeout {
            guard.polling_timeout = Some(v);
            delta.changed.push(StateKey::PollingTimeout);
        }
        if let Some(v) = update.polling_retries {
            guard.polling_retries = v;
            delta.changed.push(StateKey::PollingRetries);
        }
        if let Some(incoming_rooms) = update.rooms {
            merge_rooms(&mut guard.rooms, incoming_rooms);
            delta.changed.push(StateKey::Rooms);
        }

        let new = guard.clone();
        drop(guard);

        let persist_sync_token = delta.contains(StateKey::SyncToken) && new.sync_token.is_some();
        let persist_rooms = delta.contains(StateKey::Rooms) && !new.rooms.is_empty();
        if persist_sync_token || persist_rooms {
            self.persist(&new).await?;
        }

        self.notify(&old, &new, &delta).await;
        Ok(())
    }

    async fn persist(&self, state: &ClientState) -> Result<(), StoreError> {
        let mut rooms = state.rooms.clone();
        for room in rooms.values_mut() {
            room.messages.clear();
        }
        let persisted = PersistedState {
            sync_token: state.sync_token.clone(),
            rooms,
        };
        let bytes = serde_json::to_vec(&persisted)?;
        self.inner.storage.set(storage_keys::CHAT_STATE, bytes).await?;
        Ok(())
    }

    async fn notify(&self, old: &ClientState, new: &ClientState, delta: &StateDelta) {
        let listeners = self.inner.listeners.lock().await;
        for key in &delta.changed {
            if let Some(handlers) = listeners.get(&ListenerKey::Key(*key)) {
                for handler in handlers {
                    handler(old, new, delta);
                }
            }
        }
        if let Some(handlers) = listeners.get(&ListenerKey::All) {
            for handler in handlers {
                handler(old, new, delta);
            }
        }
    }

    pub async fn on_state_changed(&self, keys: Vec<ListenerKey>, listener: Listener) {
        let mut listeners = self.inner.listeners.lock().await;
        for key in keys {
            listeners.entry(key).or_default().push(listener.clone());
        }
    }
}

/// New rooms merge by ID: per-room merge keeps the newer status and unions
/// members/messages; rooms absent from the update retain their prior state.
fn merge_rooms(existing: &mut HashMap<String, Room>, incoming: HashMap<String, Room>) {
    for (id, incoming_room) in incoming {
        match existing.get_mut(&id) {
            Some(current) => {
                current.status = incoming_room.status;
                for member in incoming_room.members {
                    if !current.members.contains(&member) {
                        current.members.push(member);
                    }
                }
                current.messages.extend(incoming_room.messages);
            }
            None => {
                existing.insert(id, incoming_room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::RoomMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> StateStore {
        StateStore::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn persistence_covers_only_sync_token_and_rooms() {
        let s = store();
        let mut rooms = HashMap::new();
        rooms.insert("!a:relay".to_string(), Room::new("!a:relay", RoomStatus::Joined));

        s.update(StateUpdate {
            user_id: Some("u1".into()),
            access_token: Some("tok".into()),
            sync_token: Some("cursor-1".into()),
            rooms: Some(rooms),
            ..Default::default()
        })
        .await
        .unwrap();

        let raw = s.inner.storage.get(storage_keys::CHAT_STATE).await.unwrap().unwrap();
        let persisted: PersistedState = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.sync_token.as_deref(), Some("cursor-1"));
        assert_eq!(persisted.rooms.len(), 1);

        let as_value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let obj = as_value.as_object().unwrap();
        assert!(obj.contains_key("syncToken") || obj.contains_key("sync_token"));
        assert!(!obj.contains_key("userId"));
        assert!(!obj.contains_key("accessToken"));
    }

    #[tokio::test]
    async fn room_messages_do_not_survive_rehydration() {
        let storage = Arc::new(InMemoryStorage::new());
        let s1 = StateStore::new(storage.clone());

        let mut room = Room::new("!a:relay", RoomStatus::Joined);
        room.messages.push(RoomMessage {
            kind: crate::types::MessageKind::Text,
            content: "hi".into(),
            sender: "@x:relay".into(),
            timestamp: 1,
        });
        let mut rooms = HashMap::new();
        rooms.insert("!a:relay".to_string(), room);

        s1.update(StateUpdate {
            sync_token: Some("c1".into()),
            rooms: Some(rooms),
            ..Default::default()
        })
        .await
        .unwrap();

        let s2 = StateStore::new(storage);
        let reloaded = s2.get_room("!a:relay").await.unwrap().unwrap();
        assert!(reloaded.messages.is_empty());
    }

    #[tokio::test]
    async fn merge_keeps_newer_status_and_unions_members() {
        let s = store();

        let mut room_v1 = Room::new("!a:relay", RoomStatus::Invited);
        room_v1.members.push("@a:relay".into());
        let mut rooms1 = HashMap::new();
        rooms1.insert("!a:relay".to_string(), room_v1);
        s.update(StateUpdate { rooms: Some(rooms1), ..Default::default() }).await.unwrap();

        let mut room_v2 = Room::new("!a:relay", RoomStatus::Joined);
        room_v2.members.push("@b:relay".into());
        let mut rooms2 = HashMap::new();
        rooms2.insert("!a:relay".to_string(), room_v2);
        s.update(StateUpdate { rooms: Some(rooms2), ..Default::default() }).await.unwrap();

        let merged = s.get_room("!a:relay").await.unwrap().unwrap();
        assert_eq!(merged.status, RoomStatus::Joined);
        assert_eq!(merged.members.len(), 2);
        assert!(merged.members.contains(&"@a:relay".to_string()));
        assert!(merged.members.contains(&"@b:relay".to_string()));
    }

    #[tokio::test]
    async fn listeners_are_notified_once_per_changed_key() {
        let s = store();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        s.on_state_changed(
            vec![ListenerKey::Key(StateKey::SyncToken)],
            Arc::new(move |_old, _new, _delta| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        s.update(StateUpdate { sync_token: Some("c1".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Updating an unrelated field must not re-trigger the sync-token listener.
        s.update(StateUpdate { txn_no: Some(1), ..Default::default() }).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rooms_absent_from_update_retain_prior_state() {
        let s = store();
        let mut rooms1 = HashMap::new();
        rooms1.insert("!a:relay".to_string(), Room::new("!a:relay", RoomStatus::Joined));
        s.update(StateUpdate { rooms: Some(rooms1), ..Default::default() }).await.unwrap();

        let mut rooms2 = HashMap::new();
        rooms2.insert("!b:relay".to_string(), Room::new("!b:relay", RoomStatus::Invited));
        s.update(StateUpdate { rooms: Some(rooms2), ..Default::default() }).await.unwrap();

        let state = s.get().await.unwrap();
        assert_eq!(state.rooms.len(), 2);
        assert!(state.rooms.contains_key("!a:relay"));
    }
}
