//! Chat client: owns the sync loop against one relay server, accepts
//! invites, creates rooms, sends text messages, and publishes a stream of
//! typed events to subscribers.
//!
//! `ChatClient` is a trait so the pairing/messaging core can be exercised
//! against an in-memory fake; [`HttpChatClient`] is the one shipped
//! implementation, backed by `reqwest` against a Matrix-style homeserver API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{StateStore, StateUpdate};
use crate::types::{MessageKind, Room, RoomMessage, RoomStatus};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("http error: {0}")]
    Transport(String),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("forbidden")]
    Forbidden,
    #[error("not authenticated — call start() first")]
    NotStarted,
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

/// `password-login` credentials handed to [`ChatClient::start`].
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub user_id: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub content: String,
    pub sender: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub room_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone)]
pub struct InviteEvent {
    pub room_id: String,
}

/// Tagged union of the event types the pairing/messaging core depends on.
/// Dispatched from the sync loop via per-variant handler lists rather than
/// heterogeneous callbacks.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(MessageEvent),
    Invite(InviteEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Invite,
}

impl ChatEvent {
    fn kind(&self) -> EventKind {
        match self {
            ChatEvent::Message(_) => EventKind::Message,
            ChatEvent::Invite(_) => EventKind::Invite,
        }
    }
}

pub type HandlerId = u64;
type Handler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn start(&self, credentials: LoginCredentials) -> Result<(), ChatError>;
    async fn stop(&self);

    async fn join_rooms(&self, room_ids: &[String]) -> Result<(), ChatError>;
    async fn create_trusted_private_room(&self, invitees: &[String]) -> Result<String, ChatError>;
    async fn invite_to_rooms(&self, user: &str, room_ids: &[String]) -> Result<(), ChatError>;
    async fn send_text_message(&self, room_id: &str, text: &str) -> Result<(), ChatError>;

    async fn get_room_by_id(&self, id: &str) -> Option<Room>;
    async fn joined_rooms(&self) -> Vec<Room>;
    async fn invited_rooms(&self) -> Vec<Room>;

    fn subscribe(&self, kind: EventKind, handler: Handler) -> HandlerId;
    fn unsubscribe(&self, kind: EventKind, handler_id: Option<HandlerId>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Starting,
    Running,
}

/// `min(30s, 500ms * 2^retries)`, ±20% jitter (Open Question (c): any bounded
/// exponential scheme with a ceiling is acceptable).
fn backoff_delay(retries: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << retries.min(20));
    let capped_ms = base_ms.min(30_000);
    let jitter_fraction = 0.8 + (pseudo_jitter(retries) * 0.4);
    Duration::from_millis((capped_ms as f64 * jitter_fraction) as u64)
}

/// Deterministic, allocation-free jitter source in `[0, 1)`, avoiding a
/// dependency on `rand` for a purely cosmetic spread.
fn pseudo_jitter(seed: u32) -> f64 {
    let x = seed.wrapping_mul(2654435761).wrapping_add(1);
    (x % 1000) as f64 / 1000.0
}

/// `reqwest`-backed [`ChatClient`] against a single Matrix-style homeserver.
pub struct HttpChatClient {
    base_url: String,
    http: reqwest::Client,
    store: StateStore,
    run_state: Mutex<RunState>,
    shutdown: Arc<AtomicBool>,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_handler_id: AtomicU64,
    next_txn_id: AtomicU64,
}

impl HttpChatClient {
    pub fn new(relay: &str, store: StateStore) -> Self {
        HttpChatClient {
            base_url: format!("https://{relay}"),
            http: reqwest::Client::new(),
            store,
            run_state: Mutex::new(RunState::Stopped),
            shutdown: Arc::new(AtomicBool::new(false)),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn access_token(&self) -> Result<String, ChatError> {
        self.store
            .get()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?
            .access_token
            .ok_or(ChatError::NotStarted)
    }

    async fn dispatch(&self, event: ChatEvent) {
        // Cloned out from under the lock so handler invocation (which may be
        // arbitrarily slow) never blocks `subscribe`/`unsubscribe`.
        let matching: Vec<Handler> = {
            let handlers = self.handlers.read().unwrap();
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in matching {
            handler(&event);
        }
    }

    async fn sync_loop(self: Arc<Self>) {
        let mut retries: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let since = self.store.get().await.ok().and_then(|s| s.sync_token);
            match self.sync_once(since.as_deref()).await {
                Ok(()) => {
                    retries = 0;
                }
                Err(e) => {
                    log::warn!("sync round failed, retrying: {e}");
                    let _ = self
                        .store
                        .update(StateUpdate {
                            polling_retries: Some(retries + 1),
                            ..Default::default()
                        })
                        .await;
                    retries = retries.saturating_add(1);
                    tokio::time::sleep(backoff_delay(retries)).await;
                }
            }
        }

        *self.run_state.lock().await = RunState::Stopped;
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<(), ChatError> {
        let token = self.access_token().await?;
        let mut url = self.endpoint("/_matrix/client/r0/sync?timeout=30000");
        if let Some(since) = since {
            url.push_str("&since=");
            url.push_str(since);
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;
        let body: SyncResponse = response.json().await?;

        let mut rooms: HashMap<String, Room> = HashMap::new();
        let mut events = Vec::new();

        for (room_id, joined) in body.rooms.join {
            let mut room = Room::new(room_id.clone(), RoomStatus::Joined);
            for event in joined.timeline.events {
                if event.event_type == "m.room.message" {
                    if let Some(content) = event.content {
                        let kind = if content.msgtype.as_deref() == Some("m.text") {
                            MessageKind::Text
                        } else {
                            MessageKind::Other
                        };
                        let message = ChatMessage {
                            kind,
                            content: content.body.unwrap_or_default(),
                            sender: event.sender.clone(),
                            timestamp: event.origin_server_ts.unwrap_or(0),
                        };
                        room.messages.push(RoomMessage {
                            kind: message.kind,
                            content: message.content.clone(),
                            sender: message.sender.clone(),
                            timestamp: message.timestamp,
                        });
                        if !room.members.contains(&event.sender) {
                            room.members.push(event.sender.clone());
                        }
                        events.push(ChatEvent::Message(MessageEvent {
                            room_id: room_id.clone(),
                            message,
                        }));
                    }
                } else if event.event_type == "m.room.member" {
                    if !room.members.contains(&event.sender) {
                        room.members.push(event.sender.clone());
                    }
                }
            }
            rooms.insert(room_id, room);
        }

        for (room_id, _invited) in body.rooms.invite {
            rooms.insert(room_id.clone(), Room::new(room_id.clone(), RoomStatus::Invited));
            events.push(ChatEvent::Invite(InviteEvent { room_id }));
        }

        self.store
            .update(StateUpdate {
                sync_token: Some(body.next_batch),
                rooms: Some(rooms),
                ..Default::default()
            })
            .await
            .map_err(|e| ChatError::Protocol(e.to_string()))?;

        for event in events {
            self.dispatch(event).await;
        }

        Ok(())
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn start(&self, credentials: LoginCredentials) -> Result<(), ChatError> {
        *self.run_state.lock().await = RunState::Starting;

        let login_body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": credentials.user_id },
            "password": credentials.password,
            "device_id": credentials.device_id,
        });

        let response = self
            .http
            .post(self.endpoint("/_matrix/client/r0/login"))
            .json(&login_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            *self.run_state.lock().await = RunState::Stopped;
            return Err(ChatError::LoginFailed(format!("status {status}")));
        }

        let login: LoginResponse = response.json().await?;

        self.store
            .update(StateUpdate {
                is_running: Some(true),
                user_id: Some(login.user_id),
                device_id: Some(login.device_id),
                access_token: Some(login.access_token),
                ..Default::default()
            })
            .await
            .map_err(|e| ChatError::Protocol(e.to_string()))?;

        *self.run_state.lock().await = RunState::Running;
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self
            .store
            .update(StateUpdate { is_running: Some(false), ..Default::default() })
            .await;
    }

    async fn join_rooms(&self, room_ids: &[String]) -> Result<(), ChatError> {
        let token = self.access_token().await?;
        for room_id in room_ids {
            let url = self.endpoint(&format!("/_matrix/client/r0/join/{room_id}"));
            let response = self.http.post(url).bearer_auth(&token).json(&json!({})).send().await?;
            if response.status() == reqwest::StatusCode::FORBIDDEN {
                return Err(ChatError::Forbidden);
            }
            response.error_for_status()?;
        }
        Ok(())
    }

    async fn create_trusted_private_room(&self, invitees: &[String]) -> Result<String, ChatError> {
        let token = self.access_token().await?;
        let body = json!({
            "preset": "trusted_private_chat",
            "invite": invitees,
            "is_direct": invitees.len() == 1,
        });
        let response = self
            .http
            .post(self.endpoint("/_matrix/client/r0/createRoom"))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let created: CreateRoomResponse = response.json().await?;
        Ok(created.room_id)
    }

    async fn invite_to_rooms(&self, user: &str, room_ids: &[String]) -> Result<(), ChatError> {
        let token = self.access_token().await?;
        for room_id in room_ids {
            let url = self.endpoint(&format!("/_matrix/client/r0/rooms/{room_id}/invite"));
            let response = self
                .http
                .post(url)
                .bearer_auth(&token)
                .json(&json!({ "user_id": user }))
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::FORBIDDEN {
                return Err(ChatError::Forbidden);
            }
            response.error_for_status()?;
        }
        Ok(())
    }

    async fn send_text_message(&self, room_id: &str, text: &str) -> Result<(), ChatError> {
        let token = self.access_token().await?;
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let url = self.endpoint(&format!(
            "/_matrix/client/r0/rooms/{room_id}/send/m.room.message/{txn_id}"
        ));
        let response = self
            .http
            .put(url)
            .bearer_auth(&token)
            .json(&json!({ "msgtype": "m.text", "body": text }))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatError::Forbidden);
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn get_room_by_id(&self, id: &str) -> Option<Room> {
        self.store.get_room(id).await.ok().flatten()
    }

    async fn joined_rooms(&self) -> Vec<Room> {
        self.store
            .get()
            .await
            .map(|s| s.rooms.into_values().filter(|r| r.status == RoomStatus::Joined).collect())
            .unwrap_or_default()
    }

    async fn invited_rooms(&self) -> Vec<Room> {
        self.store
            .get()
            .await
            .map(|s| s.rooms.into_values().filter(|r| r.status == RoomStatus::Invited).collect())
            .unwrap_or_default()
    }

    fn subscribe(&self, kind: EventKind, handler: Handler) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.handlers.write().unwrap();
        guard.entry(kind).or_default().push((id, handler));
        id
    }

    fn unsubscribe(&self, kind: EventKind, handler_id: Option<HandlerId>) {
        let mut guard = self.handlers.write().unwrap();
        if let Some(list) = guard.get_mut(&kind) {
            match handler_id {
                Some(id) => list.retain(|(existing, _)| *existing != id),
                None => list.clear(),
            }
        }
    }
}

/// Spawn the sync loop once `start()` has succeeded. Exposed separately from
/// `ChatClient::start` because the trait method must remain usable on a
/// bare `&dyn ChatClient`, while spawning requires an owned `Arc`.
pub fn spawn_sync_loop(client: Arc<HttpChatClient>) {
    tokio::spawn(client.sync_loop());
}

// ─── Wire DTOs (Matrix-style homeserver responses) ──────────────────────────

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoom {
    timeline: Timeline,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    events: Vec<TimelineEvent>,
}

#[derive(Debug, Deserialize)]
struct TimelineEvent {
    sender: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    origin_server_ts: Option<u64>,
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    msgtype: Option<String>,
    #[serde(default)]
    body: Option<String>,
}
