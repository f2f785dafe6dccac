use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::{BrokerFrame, ClientFrame};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::credentials::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub broker_url: String,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
}

type SubscriptionId = u64;

/// Proof of a registered subscription; hand it back to [`ChannelManager::unsubscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: String,
    id: SubscriptionId,
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

struct ChannelState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_subscription_id: SubscriptionId,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Owns the broker socket: connect/handshake, keepalive, auto-reconnect with
/// a fixed delay, and the topic subscription registry.
///
/// Subscriptions registered while the socket is down are queued: the registry
/// is the source of truth and every registered topic is (re)announced each
/// time a session is established, so subscribers survive reconnects
/// transparently. Catching up on messages missed during an outage is the
/// subscriber's job (re-fetch history), not this component's.
pub struct ChannelManager {
    config: ChannelConfig,
    inner: Mutex<ChannelState>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            inner: Mutex::new(ChannelState {
                subscribers: HashMap::new(),
                next_subscription_id: 0,
                outbound: None,
                supervisor: None,
            }),
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True once `connect` has been called and not yet torn down.
    pub async fn has_session(&self) -> bool {
        self.inner.lock().await.supervisor.is_some()
    }

    /// Starts the supervisor task. The store is read on every (re)connect
    /// attempt so a renewed access token is picked up automatically.
    pub async fn connect(self: &Arc<Self>, store: CredentialStore) {
        let supervisor = tokio::spawn(Arc::clone(self).run(store));
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.supervisor.replace(supervisor) {
            previous.abort();
        }
    }

    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.abort();
        }
        inner.outbound = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Registers a subscriber for a topic. Works in any connection state;
    /// while disconnected the topic is merely queued and announced on the
    /// next established session.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;
        let first_for_topic = !inner.subscribers.contains_key(topic);
        inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        if first_for_topic {
            if let Some(outbound) = &inner.outbound {
                let _ = outbound.send(ClientFrame::Subscribe {
                    topic: topic.to_string(),
                });
            }
        }
        (
            SubscriptionHandle {
                topic: topic.to_string(),
                id,
            },
            rx,
        )
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock().await;
        if let Some(subscribers) = inner.subscribers.get_mut(&handle.topic) {
            subscribers.retain(|subscriber| subscriber.id != handle.id);
            if subscribers.is_empty() {
                inner.subscribers.remove(&handle.topic);
                if let Some(outbound) = &inner.outbound {
                    let _ = outbound.send(ClientFrame::Unsubscribe {
                        topic: handle.topic,
                    });
                }
            }
        }
    }

    /// False when no session is established or the frame cannot be enqueued;
    /// the caller is expected to fall back to the REST send path.
    pub async fn publish(&self, topic: &str, body: serde_json::Value) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let inner = self.inner.lock().await;
        match &inner.outbound {
            Some(outbound) => outbound
                .send(ClientFrame::Publish {
                    topic: topic.to_string(),
                    body,
                })
                .is_ok(),
            None => false,
        }
    }

    async fn run(self: Arc<Self>, store: CredentialStore) {
        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.session(&store).await {
                Ok(()) => {
                    info!("broker connection closed");
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
                Err(err) => {
                    warn!("broker connection failed: {err:#}");
                    self.state_tx.send_replace(ConnectionState::Errored);
                }
            }
            self.inner.lock().await.outbound = None;
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn session(&self, store: &CredentialStore) -> Result<()> {
        let access_token = store
            .access_token()
            .await
            .ok_or_else(|| anyhow!("no access token available for broker connect"))?;
        let ws_url = derive_ws_url(&self.config.broker_url)?;
        let (stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect broker: {ws_url}"))?;
        let (mut writer, mut reader) = stream.split();

        send_frame(&mut writer, &ClientFrame::Connect { access_token }).await?;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<BrokerFrame>(&text) {
                    Ok(BrokerFrame::Connected) => break,
                    Ok(BrokerFrame::Error(err)) => bail!("broker rejected connection: {err}"),
                    Ok(_) => continue,
                    Err(err) => bail!("invalid broker frame during handshake: {err}"),
                },
                Some(Ok(Message::Close(_))) | None => bail!("broker closed during handshake"),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let topics: Vec<String> = {
            let mut inner = self.inner.lock().await;
            inner.outbound = Some(outbound_tx);
            inner.subscribers.keys().cloned().collect()
        };
        for topic in topics {
            send_frame(&mut writer, &ClientFrame::Subscribe { topic }).await?;
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        info!(url = %ws_url, "broker connected");

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => send_frame(&mut writer, &frame).await?,
                    None => return Ok(()),
                },
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_frame(&text).await {
                            send_frame(&mut writer, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
                _ = keepalive.tick() => send_frame(&mut writer, &ClientFrame::Ping).await?,
            }
        }
    }

    async fn handle_frame(&self, text: &str) -> Option<ClientFrame> {
        match serde_json::from_str::<BrokerFrame>(text) {
            Ok(BrokerFrame::Deliver { topic, body }) => {
                self.dispatch(&topic, body).await;
                None
            }
            Ok(BrokerFrame::Ping) => Some(ClientFrame::Pong),
            Ok(BrokerFrame::Pong) | Ok(BrokerFrame::Connected) => None,
            Ok(BrokerFrame::Error(err)) => {
                warn!("broker reported error: {err}");
                None
            }
            Err(err) => {
                warn!("invalid broker frame: {err}");
                None
            }
        }
    }

    async fn dispatch(&self, topic: &str, body: serde_json::Value) {
        let mut inner = self.inner.lock().await;
        if let Some(subscribers) = inner.subscribers.get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.tx.send(body.clone()).is_ok());
        }
    }
}

async fn send_frame<W>(writer: &mut W, frame: &ClientFrame) -> Result<()>
where
    W: futures::Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(frame)?;
    writer.send(Message::Text(text)).await?;
    Ok(())
}

fn derive_ws_url(broker_url: &str) -> Result<String> {
    let mut url =
        Url::parse(broker_url).with_context(|| format!("invalid broker url: {broker_url}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| anyhow!("failed to derive websocket scheme"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| anyhow!("failed to derive websocket scheme"))?,
        other => bail!("unsupported broker url scheme: {other}"),
    }
    Ok(url.to_string())
}
