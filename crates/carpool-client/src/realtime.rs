//! Realtime event source: one Phoenix channel websocket per subscription.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use carpool_sync::{EventSink, EventSource, SyncError, SyncResult, Subscription};
use carpool_types::{Change, ChangeEvent, EntityKind, Operation, Scope};

use crate::config::ClientConfig;

/// Heartbeat interval expected by the Realtime server.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long to wait for the server to acknowledge a channel join.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Phoenix protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: u64) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    fn into_message(self) -> SyncResult<Message> {
        let text = serde_json::to_string(&self).map_err(SyncError::transport)?;
        Ok(Message::Text(text.into()))
    }
}

/// Channel topic for a scope.
pub fn topic_for(scope: &Scope) -> String {
    format!("realtime:{}", scope.topic())
}

/// `postgres_changes` binding a scope subscribes with.
pub fn postgres_changes_filter(scope: &Scope) -> Value {
    let (event, filter) = match scope {
        Scope::Rooms { status: None } => ("*", None),
        Scope::Rooms { status: Some(status) } => ("*", Some(format!("status=eq.{}", status))),
        Scope::Memberships { room_id: None } => ("*", None),
        Scope::Memberships { room_id: Some(id) } => ("*", Some(format!("room_id=eq.{}", id))),
        Scope::Messages { room_id } => ("INSERT", Some(format!("room_id=eq.{}", room_id))),
    };

    let mut binding = json!({
        "event": event,
        "schema": "public",
        "table": scope.kind().table(),
    });
    if let Some(filter) = filter {
        binding["filter"] = json!(filter);
    }
    binding
}

fn join_payload(scope: &Scope, access_token: &str) -> Value {
    json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": [postgres_changes_filter(scope)],
        },
        "access_token": access_token,
    })
}

/// Decode the `data` object of a `postgres_changes` frame.
pub fn decode_change(kind: EntityKind, payload: &Value) -> SyncResult<ChangeEvent> {
    let data = payload.get("data").unwrap_or(payload);
    let operation = match data.get("type").and_then(Value::as_str) {
        Some("INSERT") => Operation::Insert,
        Some("UPDATE") => Operation::Update,
        Some("DELETE") => Operation::Delete,
        other => return Err(SyncError::Transport(format!("unknown change type {:?}", other))),
    };
    let record = data.get("record");
    let old_record = data.get("old_record");

    Ok(match kind {
        EntityKind::Room => ChangeEvent::Room(decode_rows(operation, record, old_record)?),
        EntityKind::Membership => ChangeEvent::Membership(decode_rows(operation, record, old_record)?),
        EntityKind::Message => ChangeEvent::Message(decode_rows(operation, record, old_record)?),
    })
}

fn decode_rows<T: DeserializeOwned>(
    operation: Operation,
    record: Option<&Value>,
    old_record: Option<&Value>,
) -> SyncResult<Change<T>> {
    let row = |value: Option<&Value>| -> SyncResult<T> {
        let value = value.ok_or_else(|| SyncError::Transport("change without a row".into()))?;
        T::deserialize(value).map_err(|e| SyncError::Transport(format!("malformed row: {}", e)))
    };
    // Without full replica identity, old rows only carry the key.
    let partial = |value: Option<&Value>| value.and_then(|v| T::deserialize(v).ok());

    Ok(match operation {
        Operation::Insert => Change::insert(row(record)?),
        Operation::Update => Change::update(partial(old_record), row(record)?),
        Operation::Delete => Change::delete(row(old_record)?),
    })
}

/// Read frames until the reply to `reference` arrives.
async fn await_reply(socket: &mut Socket, reference: Option<&str>) -> SyncResult<Value> {
    while let Some(message) = socket.next().await {
        let text = match message.map_err(SyncError::transport)? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Frame>(text.as_str()) else {
            continue;
        };
        if frame.event == "phx_reply" && frame.reference.as_deref() == reference {
            return Ok(frame.payload);
        }
    }
    Err(SyncError::Transport("connection closed while joining".into()))
}

/// Opens a websocket per subscription and keeps it joined until released.
#[derive(Clone, Debug)]
pub struct RealtimeSource {
    config: ClientConfig,
    reconnects: Arc<watch::Sender<u64>>,
}

impl RealtimeSource {
    pub fn new(config: ClientConfig) -> Self {
        let (reconnects, _) = watch::channel(0);
        Self {
            config,
            reconnects: Arc::new(reconnects),
        }
    }

    /// Bumped every time a dropped subscription is re-joined. Changes made
    /// while it was down are lost, so owners should re-seed when it moves.
    pub fn reconnections(&self) -> watch::Receiver<u64> {
        self.reconnects.subscribe()
    }
}

#[async_trait]
impl EventSource for RealtimeSource {
    async fn subscribe(&self, scope: Scope) -> SyncResult<Subscription> {
        let mut channel = Channel::new(self.config.clone(), scope);
        let socket = channel.join().await?;

        let (subscription, sink) = Subscription::channel(scope);
        let reconnects = self.reconnects.clone();
        tokio::spawn(async move {
            channel.run(socket, sink, reconnects).await;
        });
        Ok(subscription)
    }
}

/// State of one joined channel.
struct Channel {
    config: ClientConfig,
    scope: Scope,
    topic: String,
    next_ref: u64,
}

enum Exit {
    Released,
    Lost,
}

impl Channel {
    fn new(config: ClientConfig, scope: Scope) -> Self {
        Self {
            config,
            topic: topic_for(&scope),
            scope,
            next_ref: 0,
        }
    }

    fn frame(&mut self, event: &str, payload: Value) -> Frame {
        self.next_ref += 1;
        Frame::new(self.topic.clone(), event, payload, self.next_ref)
    }

    /// Connect and join, waiting for the server's acknowledgement.
    async fn join(&mut self) -> SyncResult<Socket> {
        let (mut socket, _) = connect_async(self.config.realtime_url())
            .await
            .map_err(SyncError::transport)?;

        let mut join = self.frame("phx_join", join_payload(&self.scope, self.config.bearer()));
        join.join_ref = join.reference.clone();
        let join_ref = join.reference.clone();
        socket.send(join.into_message()?).await.map_err(SyncError::transport)?;

        let reply = timeout(JOIN_TIMEOUT, await_reply(&mut socket, join_ref.as_deref()))
            .await
            .map_err(|_| SyncError::Transport(format!("timed out joining {}", self.topic)))??;

        match reply.get("status").and_then(Value::as_str) {
            Some("ok") => {
                info!(topic = %self.topic, "realtime channel joined");
                Ok(socket)
            }
            _ => Err(SyncError::Transport(format!(
                "join of {} refused: {}",
                self.topic, reply["response"]
            ))),
        }
    }

    /// Serve the channel until released, re-joining after connection loss.
    async fn run(mut self, socket: Socket, sink: EventSink, reconnects: Arc<watch::Sender<u64>>) {
        let mut socket = socket;
        loop {
            match self.pump(socket, &sink).await {
                Exit::Released => break,
                Exit::Lost => {}
            }

            let mut delay = RECONNECT_BASE_DELAY;
            socket = loop {
                tokio::select! {
                    _ = sink.released() => {
                        debug!(topic = %self.topic, "released while reconnecting");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.join().await {
                    Ok(socket) => break socket,
                    Err(e) => {
                        warn!(topic = %self.topic, error = %e, delay_secs = delay.as_secs(), "realtime reconnect failed");
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            };
            reconnects.send_modify(|n| *n += 1);
        }
        debug!(topic = %self.topic, "realtime channel closed");
    }

    /// Forward changes from one connection until it drops or is released.
    async fn pump(&mut self, socket: Socket, sink: &EventSink) -> Exit {
        let (mut write, mut read) = socket.split();
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let kind = self.scope.kind();

        loop {
            tokio::select! {
                _ = sink.released() => {
                    let leave = self.frame("phx_leave", json!({}));
                    if let Ok(message) = leave.into_message() {
                        let _ = write.send(message).await;
                    }
                    let _ = write.close().await;
                    info!(topic = %self.topic, "realtime channel left");
                    return Exit::Released;
                }
                _ = heartbeat.tick() => {
                    self.next_ref += 1;
                    let beat = Frame::new("phoenix", "heartbeat", json!({}), self.next_ref);
                    let sent = match beat.into_message() {
                        Ok(message) => write.send(message).await.is_ok(),
                        Err(_) => false,
                    };
                    if !sent {
                        warn!(topic = %self.topic, "heartbeat failed");
                        return Exit::Lost;
                    }
                }
                message = read.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(topic = %self.topic, "realtime connection closed by server");
                            return Exit::Lost;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(topic = %self.topic, error = %e, "realtime connection error");
                            return Exit::Lost;
                        }
                    };
                    let frame = match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "unreadable realtime frame");
                            continue;
                        }
                    };
                    match frame.event.as_str() {
                        "postgres_changes" => match decode_change(kind, &frame.payload) {
                            Ok(event) => {
                                if !sink.deliver(event).await {
                                    return Exit::Released;
                                }
                            }
                            Err(e) => warn!(topic = %self.topic, error = %e, "skipping undecodable change"),
                        },
                        "phx_error" | "phx_close" if frame.topic == self.topic => {
                            warn!(topic = %self.topic, event = %frame.event, "channel dropped by server");
                            return Exit::Lost;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
