//! Pairing & Messaging Core: the P2P client proper. Performs login on the
//! selected relay, manages the sealed-box handshake (`@channel-open`),
//! derives per-peer session keys, routes encrypted payloads to the correct
//! room, and recovers from room-forbidden errors.
//!
//! Owns the [`ChatClient`] it runs against; the chat client never calls back
//! into this type — it only publishes events on the channel this module
//! reads (per the design note on cyclic references).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chat::{
    ChatClient, ChatError, ChatEvent, EventKind, HttpChatClient, LoginCredentials, MessageEvent,
};
use crate::config::Config;
use crate::crypto;
use crate::error::CoreError;
use crate::relay;
use crate::routing;
use crate::storage::Storage;
use crate::store::StateStore;
use crate::types::{
    recipient_address, storage_keys, ExtendedPairingResponse, MessageKind, PairingRequest,
    PairingResponse, PeerDescriptorKind,
};

/// The retry ceiling for [`PairingClient::try_join_rooms`] (§4.4.2).
const JOIN_RETRY_LIMIT: u32 = 10;
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How long a captured initial message stays eligible for replay (§4.4.7).
const INITIAL_MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);

/// `waitForJoin` bounds (§4.4.5 / §5): 100ms for the first ~5s, then 1s, for
/// up to 200 attempts total (~2m45s aggregate ceiling).
const WAIT_FOR_JOIN_FAST_ATTEMPTS: u32 = 50;
const WAIT_FOR_JOIN_FAST_DELAY: Duration = Duration::from_millis(100);
const WAIT_FOR_JOIN_SLOW_DELAY: Duration = Duration::from_secs(1);
const WAIT_FOR_JOIN_MAX_ATTEMPTS: u32 = 200;

#[derive(Debug, Clone, Copy)]
struct SessionKeys {
    tx: [u8; 32],
    rx: [u8; 32],
}

/// `h32(raw_public_key_bytes)`, hex-encoded — matches [`crate::keys::KeyPair::public_key_hash_hex`],
/// which hashes the decoded key bytes, not the hex string itself.
fn pubkey_hash_hex(public_key_hex: &str) -> Result<String, CoreError> {
    let bytes = hex::decode(public_key_hex).map_err(|e| CoreError::Transient(e.to_string()))?;
    Ok(crypto::generic_hash_hex(&bytes))
}

/// Role asymmetry for session-key derivation (§4.4.6): the initiating
/// (dApp) side plays `Client`, the responding (wallet) side plays `Server`.
/// Both derive the same pair of keys from the same DH secret; only which
/// half is "tx" vs "rx" is swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// The P2P pairing/messaging client. Construct with [`PairingClient::start`].
pub struct PairingClient {
    config: Config,
    chat: Arc<dyn ChatClient>,
    storage: Arc<dyn Storage>,
    relay_server: String,
    role: Role,
    running: AtomicBool,
    session_keys: Mutex<HashMap<String, SessionKeys>>,
    listening_senders: StdMutex<HashSet<String>>,
    initial_message: Arc<StdMutex<Option<(MessageEvent, Instant)>>>,
    initial_message_handler: StdMutex<Option<u64>>,
}

impl PairingClient {
    /// Run the full startup sequence (§4.4.1) against a freshly constructed
    /// [`HttpChatClient`] on the relay selected for this identity.
    pub async fn start(config: Config, storage: Arc<dyn Storage>) -> Result<Arc<Self>, CoreError> {
        let store = StateStore::new(storage.clone());
        let relay_server =
            relay::select_owned(&config.keypair.public_key_hash_hex, "0", &config.relay_nodes);
        let http_client = Arc::new(HttpChatClient::new(&relay_server, store));
        crate::chat::spawn_sync_loop(http_client.clone());
        Self::start_with_chat(config, storage, http_client, relay_server).await
    }

    /// Same startup sequence, against a caller-supplied [`ChatClient`] — the
    /// seam exercised by tests with an in-memory fake.
    pub async fn start_with_chat(
        config: Config,
        storage: Arc<dyn Storage>,
        chat: Arc<dyn ChatClient>,
        relay_server: String,
    ) -> Result<Arc<Self>, CoreError> {
        let role = if config.is_wallet { Role::Server } else { Role::Client };

        let client = Arc::new(PairingClient {
            config,
            chat: chat.clone(),
            storage,
            relay_server,
            role,
            running: AtomicBool::new(false),
            session_keys: Mutex::new(HashMap::new()),
            listening_senders: StdMutex::new(HashSet::new()),
            initial_message: Arc::new(StdMutex::new(None)),
            initial_message_handler: StdMutex::new(None),
        });

        client.install_initial_message_listener();
        client.install_invite_listener();

        let seed = client.config.keypair.seed_bytes().map_err(|e| CoreError::Transient(e.to_string()))?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let digest = crypto::login_digest(now);
        let sig = crypto::sign_detached(&seed, &digest);

        let credentials = LoginCredentials {
            user_id: client.config.keypair.public_key_hash_hex.clone(),
            password: format!("ed:{}:{}", hex::encode(sig), client.config.keypair.public_key_hex),
            device_id: client.config.keypair.public_key_hex.clone(),
        };
        chat.start(credentials).await?;

        let invited: Vec<String> = chat.invited_rooms().await.into_iter().map(|r| r.id).collect();
        for room_id in invited {
            Self::try_join_rooms(&client.chat, room_id, 1).await;
        }

        if client.config.is_wallet {
            client.ensure_standby_room().await?;
        }

        client.running.store(true, Ordering::SeqCst);
        Ok(client)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.chat.stop().await;
    }

    fn ensure_ready(&self) -> Result<(), CoreError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::NotReady)
        }
    }

    /// Remember the most-recently-timestamped [`ChatEvent::Message`], so an
    /// early channel-open can be recovered by a caller who registers
    /// [`PairingClient::listen_for_encrypted_message`] after it already
    /// arrived (§4.4.7).
    fn install_initial_message_listener(self: &Arc<Self>) {
        let slot = self.initial_message.clone();
        let handler_id = self.chat.subscribe(
            EventKind::Message,
            Arc::new(move |event: &ChatEvent| {
                if let ChatEvent::Message(message_event) = event {
                    let mut guard = slot.lock().unwrap();
                    let is_newer = guard
                        .as_ref()
                        .map(|(existing, _)| message_event.message.timestamp >= existing.message.timestamp)
                        .unwrap_or(true);
                    if is_newer {
                        *guard = Some((message_event.clone(), Instant::now()));
                    }
                }
            }),
        );
        *self.initial_message_handler.lock().unwrap() = Some(handler_id);
    }

    fn install_invite_listener(self: &Arc<Self>) {
        let chat = self.chat.clone();
        self.chat.subscribe(
            EventKind::Invite,
            Arc::new(move |event: &ChatEvent| {
                if let ChatEvent::Invite(invite) = event {
                    let chat = chat.clone();
                    let room_id = invite.room_id.clone();
                    tokio::spawn(async move {
                        Self::try_join_rooms(&chat, room_id, 1).await;
                    });
                }
            }),
        );
    }

    /// §4.4.2: join `room_id`, retrying on "forbidden" up to
    /// [`JOIN_RETRY_LIMIT`] times at [`JOIN_RETRY_DELAY`] intervals. Other
    /// errors are logged and abandoned.
    async fn try_join_rooms(chat: &Arc<dyn ChatClient>, room_id: String, attempt: u32) {
        match chat.join_rooms(&[room_id.clone()]).await {
            Ok(()) => {}
            Err(ChatError::Forbidden) if attempt < JOIN_RETRY_LIMIT => {
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
                Box::pin(Self::try_join_rooms(chat, room_id, attempt + 1)).await;
            }
            Err(ChatError::Forbidden) => {
                log::warn!("giving up joining room {room_id} after {JOIN_RETRY_LIMIT} forbidden responses");
            }
            Err(e) => {
                log::warn!("failed to join room {room_id}: {e}");
            }
        }
    }

    async fn ensure_standby_room(&self) -> Result<(), CoreError> {
        if self.storage.get(storage_keys::STANDBY_ROOM).await?.is_some() {
            return Ok(());
        }
        let room_id = self.chat.create_trusted_private_room(&[]).await?;
        self.storage.set(storage_keys::STANDBY_ROOM, room_id.into_bytes()).await?;
        Ok(())
    }

    /// Replace a just-consumed standby room with a fresh one, without
    /// blocking the caller that consumed it.
    fn replenish_standby_room(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.ensure_standby_room().await {
                log::warn!("failed to provision replacement standby room: {e}");
            }
        });
    }

    // ─── Pairing: outbound (dApp role), §4.4.3 ──────────────────────────────

    /// Build the out-of-band pairing-request descriptor (e.g. for a QR code).
    pub fn get_pairing_request_info(&self) -> PairingRequest {
        PairingRequest {
            id: Uuid::new_v4().to_string(),
            kind: PeerDescriptorKind::PairingRequest,
            name: self.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_key: self.config.keypair.public_key_hex.clone(),
            relay_server: self.relay_server.clone(),
            icon: self.config.icon_url.clone(),
            app_url: self.config.app_url.clone(),
        }
    }

    // ─── Pairing: inbound (wallet role), §4.4.4 ─────────────────────────────

    /// Subscribe for channel-open handshakes addressed to our identity.
    /// Filters text messages whose content begins with
    /// `"@channel-open:@<ourPublicKeyHash>"`, sealed-box-decrypts the last
    /// colon-delimited segment, and invokes `callback` with the parsed,
    /// address-extended response.
    pub fn listen_for_channel_opening(
        self: &Arc<Self>,
        callback: Arc<dyn Fn(ExtendedPairingResponse) + Send + Sync>,
    ) -> Result<(), CoreError> {
        self.ensure_ready()?;

        let prefix = format!("@channel-open:@{}", self.config.keypair.public_key_hash_hex);
        let seed = self.config.keypair.seed_bytes().map_err(|e| CoreError::Transient(e.to_string()))?;

        self.chat.subscribe(
            EventKind::Message,
            Arc::new(move |event: &ChatEvent| {
                let ChatEvent::Message(message_event) = event else { return };
                if message_event.message.kind != MessageKind::Text {
                    return;
                }
                let content = &message_event.message.content;
                if !content.starts_with(&prefix) {
                    return;
                }
                let Some(hex_part) = content.rsplit(':').next() else { return };
                let Ok(sealed) = hex::decode(hex_part) else { return };
                let Ok(plaintext) = crypto::unseal(&sealed, &seed) else { return };
                let Ok(response) = serde_json::from_slice::<PairingResponse>(&plaintext) else { return };
                let Ok(sender_hash) = pubkey_hash_hex(&response.public_key) else { return };

                let sender_id = recipient_address(&sender_hash, &response.relay_server);
                callback(ExtendedPairingResponse { response, sender_id });
            }),
        );

        Ok(())
    }

    // ─── sendPairingResponse, §4.4.5 ────────────────────────────────────────

    /// Respond to a pairing request: resolve (or create) a room with the
    /// requester, wait for them to join, then send the sealed-box-encrypted
    /// response as a `@channel-open` text message.
    pub async fn send_pairing_response(self: &Arc<Self>, request: &PairingRequest) -> Result<(), CoreError> {
        self.ensure_ready()?;

        let peer_hash = pubkey_hash_hex(&request.public_key)?;
        let recipient = recipient_address(&peer_hash, &request.relay_server);

        let room_id = self.get_relevant_room(&recipient).await?;
        self.wait_for_join(&room_id).await?;

        let response = self.get_pairing_response_info(request);
        let payload = serde_json::to_vec(&response)?;

        let peer_pk_bytes: [u8; 32] = hex::decode(&request.public_key)
            .map_err(|e| CoreError::Transient(e.to_string()))?
            .try_into()
            .map_err(|_| CoreError::Transient("peer public key must be 32 bytes".into()))?;
        let sealed = crypto::seal(&payload, &peer_pk_bytes).map_err(|e| CoreError::Transient(e.to_string()))?;

        let text = format!("@channel-open:{recipient}:{}", hex::encode(sealed));
        self.chat.send_text_message(&room_id, &text).await?;
        Ok(())
    }

    fn get_pairing_response_info(&self, request: &PairingRequest) -> PairingResponse {
        let _ = request;
        PairingResponse {
            id: Uuid::new_v4().to_string(),
            kind: PeerDescriptorKind::PairingResponse,
            name: self.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_key: self.config.keypair.public_key_hex.clone(),
            relay_server: self.relay_server.clone(),
            icon: self.config.icon_url.clone(),
            app_url: self.config.app_url.clone(),
        }
    }

    /// Poll `room_id` until it has at least 2 members: 100ms for the first
    /// [`WAIT_FOR_JOIN_FAST_ATTEMPTS`] checks, then 1s, up to
    /// [`WAIT_FOR_JOIN_MAX_ATTEMPTS`] total before giving up (§4.4.5/§7).
    async fn wait_for_join(&self, room_id: &str) -> Result<(), CoreError> {
        for attempt in 0..WAIT_FOR_JOIN_MAX_ATTEMPTS {
            if let Some(room) = self.chat.get_room_by_id(room_id).await {
                if room.members.len() >= 2 {
                    return Ok(());
                }
            }
            let delay = if attempt < WAIT_FOR_JOIN_FAST_ATTEMPTS {
                WAIT_FOR_JOIN_FAST_DELAY
            } else {
                WAIT_FOR_JOIN_SLOW_DELAY
            };
            tokio::time::sleep(delay).await;
        }
        Err(CoreError::Timeout(format!("room {room_id} never reached 2 members")))
    }

    // ─── Room routing glue, §4.5 ─────────────────────────────────────────────

    async fn get_relevant_room(self: &Arc<Self>, recipient: &str) -> Result<String, CoreError> {
        let had_standby = self.storage.get(storage_keys::STANDBY_ROOM).await?.is_some();
        let room_id = routing::get_relevant_room(self.storage.as_ref(), self.chat.as_ref(), recipient).await?;
        if had_standby && self.storage.get(storage_keys::STANDBY_ROOM).await?.is_none() {
            self.replenish_standby_room();
        }
        Ok(room_id)
    }

    // ─── Session key derivation, §4.4.6 ──────────────────────────────────────

    async fn session_keys_for(&self, peer_public_key_hex: &str) -> Result<SessionKeys, CoreError> {
        if let Some(keys) = self.session_keys.lock().await.get(peer_public_key_hex) {
            return Ok(*keys);
        }

        let own_seed = self.config.keypair.seed_bytes().map_err(|e| CoreError::Transient(e.to_string()))?;
        let own_pk_bytes = self.config.keypair.public_key_bytes().map_err(|e| CoreError::Transient(e.to_string()))?;
        let peer_pk_bytes: [u8; 32] = hex::decode(peer_public_key_hex)
            .map_err(|e| CoreError::Transient(e.to_string()))?
            .try_into()
            .map_err(|_| CoreError::Transient("peer public key must be 32 bytes".into()))?;

        let own_x25519 = crypto::ed25519_seed_to_x25519(&own_seed);
        let peer_x25519 = crypto::ed25519_pubkey_to_x25519(&peer_pk_bytes).map_err(|e| CoreError::Transient(e.to_string()))?;
        let shared = own_x25519.diffie_hellman(&peer_x25519);

        // Order-independent salt so both peers derive the same key pair
        // regardless of which side is "own" vs "peer".
        let mut salt = Vec::with_capacity(64);
        if own_pk_bytes <= peer_pk_bytes {
            salt.extend_from_slice(&own_pk_bytes);
            salt.extend_from_slice(&peer_pk_bytes);
        } else {
            salt.extend_from_slice(&peer_pk_bytes);
            salt.extend_from_slice(&own_pk_bytes);
        }

        let key_a = crypto::derive_aead_key(shared.as_bytes(), &salt, b"beacon:session:a");
        let key_b = crypto::derive_aead_key(shared.as_bytes(), &salt, b"beacon:session:b");

        let keys = match self.role {
            Role::Client => SessionKeys { tx: key_a, rx: key_b },
            Role::Server => SessionKeys { tx: key_b, rx: key_a },
        };

        self.session_keys.lock().await.insert(peer_public_key_hex.to_string(), keys);
        Ok(keys)
    }

    // ─── listenForEncryptedMessage, §4.4.7 ───────────────────────────────────

    /// Idempotent per sender: a second call for the same `sender_public_key`
    /// is a no-op. Installs a message listener filtering on sender address
    /// and successful symmetric decryption under the derived `sharedRx`;
    /// replays a captured initial message if one arrived within the last
    /// five minutes, then detaches the initial-message listener.
    pub async fn listen_for_encrypted_message(
        self: &Arc<Self>,
        sender_public_key: &str,
        callback: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    ) -> Result<(), CoreError> {
        self.ensure_ready()?;

        {
            let mut listening = self.listening_senders.lock().unwrap();
            if !listening.insert(sender_public_key.to_string()) {
                return Ok(());
            }
        }

        let shared_rx = self.session_keys_for(sender_public_key).await?.rx;
        let sender_hash = pubkey_hash_hex(sender_public_key)?;
        let sender_prefix = format!("@{sender_hash}");

        self.chat.subscribe(
            EventKind::Message,
            Arc::new(move |event: &ChatEvent| {
                let ChatEvent::Message(message_event) = event else { return };
                if message_event.message.kind != MessageKind::Text {
                    return;
                }
                if !message_event.message.sender.starts_with(&sender_prefix) {
                    return;
                }
                let Ok(payload) = hex::decode(&message_event.message.content) else { return };
                if payload.len() < crypto::NONCE_LEN + crypto::MAC_LEN {
                    return;
                }
                if let Ok(plaintext) = crypto::secretbox_decrypt(&payload, &shared_rx) {
                    callback(plaintext);
                }
            }),
        );

        self.replay_initial_message_if_fresh(sender_public_key, &callback).await;
        Ok(())
    }

    async fn replay_initial_message_if_fresh(
        &self,
        sender_public_key: &str,
        callback: &Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    ) {
        let captured = {
            let guard = self.initial_message.lock().unwrap();
            guard.clone()
        };
        let Some((event, captured_at)) = captured else { return };
        if captured_at.elapsed() > INITIAL_MESSAGE_TTL {
            return;
        }
        if event.message.kind != MessageKind::Text {
            return;
        }

        let Ok(sender_hash) = pubkey_hash_hex(sender_public_key) else { return };
        if !event.message.sender.starts_with(&format!("@{sender_hash}")) {
            return;
        }

        let shared_rx = match self.session_keys_for(sender_public_key).await {
            Ok(keys) => keys.rx,
            Err(_) => return,
        };
        let Ok(payload) = hex::decode(&event.message.content) else { return };
        if payload.len() < crypto::NONCE_LEN + crypto::MAC_LEN {
            return;
        }
        if let Ok(plaintext) = crypto::secretbox_decrypt(&payload, &shared_rx) {
            callback(plaintext);
        }

        *self.initial_message.lock().unwrap() = None;
        if let Some(handler_id) = self.initial_message_handler.lock().unwrap().take() {
            self.chat.unsubscribe(EventKind::Message, Some(handler_id));
        }
    }

    // ─── sendMessage, §4.4.8 ─────────────────────────────────────────────────

    /// Encrypt `plaintext` under the session key shared with `peer` and send
    /// it as text to the resolved room. On "forbidden" (the room is no
    /// longer valid) the cached binding is evicted and a fresh room is
    /// resolved for exactly one retry; errors on the retry are logged, not
    /// surfaced.
    pub async fn send_message(self: &Arc<Self>, plaintext: &[u8], peer: &PairingResponse) -> Result<(), CoreError> {
        self.ensure_ready()?;

        let shared_tx = self.session_keys_for(&peer.public_key).await?.tx;
        let peer_hash = pubkey_hash_hex(&peer.public_key)?;
        let recipient = recipient_address(&peer_hash, &peer.relay_server);

        let room_id = self.get_relevant_room(&recipient).await?;
        let ciphertext = crypto::secretbox_encrypt(plaintext, &shared_tx).map_err(|e| CoreError::Transient(e.to_string()))?;
        let wire = hex::encode(&ciphertext);

        match self.chat.send_text_message(&room_id, &wire).await {
            Ok(()) => Ok(()),
            Err(ChatError::Forbidden) => {
                routing::delete_room_id_from_rooms(self.storage.as_ref(), &room_id).await?;
                let fresh_room_id = self.get_relevant_room(&recipient).await?;
                if let Err(e) = self.chat.send_text_message(&fresh_room_id, &wire).await {
                    log::warn!("retry send to {recipient} failed: {e}");
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
