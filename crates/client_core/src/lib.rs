use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use shared::{
    domain::{RoomId, UserId},
    protocol::{room_read_topic, room_topic, ChatMessagePayload, OutgoingMessage, UserProfile},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::info;

pub mod api;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod receipts;
pub mod reconcile;
pub mod refresh;

pub use api::{AuthApi, ChatApi};
pub use channel::{ChannelConfig, ChannelManager, ConnectionState, SubscriptionHandle};
pub use config::{load_settings, Settings};
pub use credentials::{Credential, CredentialStore};
pub use error::{ClientError, RefreshError};
pub use gateway::{
    AlwaysOnline, ApiResponse, ConnectivityProbe, RequestDescriptor, RequestGateway,
};
pub use reconcile::{HistorySource, MessageLedger, RoomReconciler};
pub use receipts::{unread_foreign, ReadReceiptTracker};
pub use refresh::RefreshCoordinator;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The session ended: explicit sign-out, a failed renewal, or a second
    /// unauthorized response. `resume_path` preserves the request the user
    /// was trying to make so it can be replayed after re-authentication.
    SignedOut { resume_path: Option<String> },
    ConnectionChanged(ConnectionState),
    /// Side-channel notification for cross-cutting concerns; the failing
    /// call still receives its own rejection.
    Error(String),
}

struct RuntimeState {
    current_user: Option<UserProfile>,
    state_forwarder: Option<JoinHandle<()>>,
}

/// Wires the pieces together the way the embedding application consumes
/// them: one credential store, one gateway in front of REST, one broker
/// connection, and per-room sessions merging history with the live stream.
pub struct ClientRuntime {
    settings: Settings,
    store: CredentialStore,
    gateway: Arc<RequestGateway>,
    channel: Arc<ChannelManager>,
    auth: AuthApi,
    chat: Arc<ChatApi>,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<RuntimeState>,
}

impl ClientRuntime {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::new_with_connectivity(settings, Arc::new(AlwaysOnline))
    }

    pub fn new_with_connectivity(
        settings: Settings,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let http = Client::new();
        let store = CredentialStore::new();
        let refresher = RefreshCoordinator::new(http.clone(), &settings.api_base_url, store.clone());
        let gateway = Arc::new(RequestGateway::new(
            http,
            settings.api_base_url.clone(),
            settings.request_timeout(),
            store.clone(),
            refresher,
            connectivity,
            events.clone(),
        ));
        let channel = ChannelManager::new(ChannelConfig {
            broker_url: settings.broker_url.clone(),
            reconnect_delay: settings.reconnect_delay(),
            keepalive_interval: settings.keepalive_interval(),
        });
        let auth = AuthApi::new(Arc::clone(&gateway), store.clone());
        let chat = Arc::new(ChatApi::new(Arc::clone(&gateway)));
        Arc::new(Self {
            settings,
            store,
            gateway,
            channel,
            auth,
            chat,
            events,
            inner: Mutex::new(RuntimeState {
                current_user: None,
                state_forwarder: None,
            }),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth
    }

    pub fn chat(&self) -> &ChatApi {
        &self.chat
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.gateway.subscribe_loading()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe_state()
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.inner.lock().await.current_user.clone()
    }

    /// Signs in, loads the profile, and brings up the broker connection.
    pub async fn sign_in(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<UserProfile, ClientError> {
        self.auth.sign_in(email, password).await?;
        let profile = self.auth.current_user().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.current_user = Some(profile.clone());
        }
        self.start_state_forwarder().await;
        self.channel.connect(self.store.clone()).await;
        info!(user_id = profile.user_id.0, "signed in");
        Ok(profile)
    }

    pub async fn sign_out(&self) {
        self.channel.disconnect().await;
        self.auth.sign_out().await;
        self.inner.lock().await.current_user = None;
        let _ = self.events.send(ClientEvent::SignedOut { resume_path: None });
    }

    /// Opens the merged live view of a room: one historical fetch plus a
    /// broker subscription feeding the same ledger, with the read receipt
    /// tracker acknowledging foreign unread messages on every change.
    pub async fn open_room(self: &Arc<Self>, room_id: RoomId) -> Result<RoomSession, ClientError> {
        if !self.channel.has_session().await {
            return Err(ClientError::NotConnected);
        }
        let local_user = self
            .current_user()
            .await
            .ok_or(ClientError::NotSignedIn)?
            .user_id;

        let reconciler = Arc::new(RoomReconciler::new(room_id));
        // Subscribe before fetching so nothing falls between the snapshot
        // and the live stream; duplicates collapse in the ledger.
        let (room_sub, mut room_rx) = self.channel.subscribe(&room_topic(room_id)).await;
        let (read_sub, mut read_rx) = self.channel.subscribe(&room_read_topic(room_id)).await;

        let history: Arc<dyn HistorySource> = self.chat.clone();
        match history.room_messages(room_id).await {
            Ok(messages) => reconciler.ingest_history(messages).await,
            Err(err) => {
                self.channel.unsubscribe(room_sub).await;
                self.channel.unsubscribe(read_sub).await;
                return Err(err);
            }
        }

        let mut tasks = Vec::new();
        {
            let reconciler = Arc::clone(&reconciler);
            let events = self.events.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(body) = room_rx.recv().await {
                    if let Err(err) = reconciler.ingest_live(body).await {
                        let _ = events.send(ClientEvent::Error(err.to_string()));
                    }
                }
            }));
        }
        {
            let reconciler = Arc::clone(&reconciler);
            let events = self.events.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(body) = read_rx.recv().await {
                    match receipts::parse_receipt(body) {
                        Ok(receipt) => reconciler.apply_receipt(&receipt.message_ids).await,
                        Err(err) => {
                            let _ = events.send(ClientEvent::Error(err.to_string()));
                        }
                    }
                }
            }));
        }
        {
            let tracker =
                ReadReceiptTracker::new(room_id, local_user, Arc::clone(&self.channel));
            let mut updates = reconciler.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let snapshot = updates.borrow_and_update().clone();
                    let _ = tracker.acknowledge(&snapshot).await;
                    if updates.changed().await.is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(RoomSession {
            room_id,
            local_user,
            reconciler,
            history,
            channel: Arc::clone(&self.channel),
            subscriptions: Mutex::new(vec![room_sub, read_sub]),
            tasks,
        })
    }

    async fn start_state_forwarder(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state_forwarder.is_some() {
            return;
        }
        let mut state_rx = self.channel.subscribe_state();
        let events = self.events.clone();
        inner.state_forwarder = Some(tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                let _ = events.send(ClientEvent::ConnectionChanged(state));
            }
        }));
    }
}

/// One open room. Dropping the session stops its tasks; `close` also
/// releases the broker subscriptions.
pub struct RoomSession {
    room_id: RoomId,
    local_user: UserId,
    reconciler: Arc<RoomReconciler>,
    history: Arc<dyn HistorySource>,
    channel: Arc<ChannelManager>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("local_user", &self.local_user)
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Snapshot channel of the merged, ordered, de-duplicated message list.
    pub fn messages(&self) -> watch::Receiver<Vec<ChatMessagePayload>> {
        self.reconciler.subscribe()
    }

    pub fn message_stream(&self) -> WatchStream<Vec<ChatMessagePayload>> {
        WatchStream::new(self.reconciler.subscribe())
    }

    /// Publishes through the broker. False means the caller should fall back
    /// to the REST send path.
    pub async fn send(&self, content: &str) -> bool {
        let body = OutgoingMessage {
            room_id: self.room_id,
            sender_id: self.local_user,
            content: content.to_string(),
            sent_at: Some(Utc::now()),
        };
        let Ok(body) = serde_json::to_value(&body) else {
            return false;
        };
        self.channel.publish(&room_topic(self.room_id), body).await
    }

    /// Re-fetches history and merges it, closing the gap left by a
    /// connection outage. Messages the live stream already delivered are
    /// not duplicated.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let messages = self.history.room_messages(self.room_id).await?;
        self.reconciler.ingest_history(messages).await;
        Ok(())
    }

    pub async fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let handles: Vec<SubscriptionHandle> = self.subscriptions.lock().await.drain(..).collect();
        for handle in handles {
            self.channel.unsubscribe(handle).await;
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
