//! Live chat log of one room.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carpool_types::api::NewMessage;
use carpool_types::{Change, ChangeEvent, MessageRecord, MessageView, Operation, RoomId, Scope, UserId};

use crate::error::SyncResult;
use crate::ordered::AppendLog;
use crate::source::{Backend, ConnectionHandle, Subscription};
use crate::validate::validate_message_body;

struct ConversationState {
    alive: bool,
    messages: AppendLog<MessageView>,
}

struct ConversationShared {
    backend: Arc<dyn Backend>,
    room_id: RoomId,
    state: Mutex<ConversationState>,
    view: Arc<watch::Sender<Vec<MessageView>>>,
    stopped: CancellationToken,
}

impl ConversationShared {
    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop(&self) {
        self.lock().alive = false;
        self.stopped.cancel();
    }

    async fn fold(&self, change: Change<MessageRecord>) {
        if change.operation != Operation::Insert {
            debug!(operation = ?change.operation, "ignoring non-insert message event");
            return;
        }
        let Some(record) = change.after else {
            warn!("message insert without a row, ignoring");
            return;
        };
        if record.room_id != self.room_id {
            debug!(message_id = %record.id, "message for another room, ignoring");
            return;
        }

        {
            let state = self.lock();
            if !state.alive || state.messages.contains(record.id) {
                return;
            }
        }

        // Events carry only the author id; re-read to get the display name.
        let message = match self.backend.message(record.id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(message_id = %record.id, "message vanished before it could be read");
                return;
            }
            Err(e) => {
                warn!(message_id = %record.id, error = %e, "dropping message insert, point read failed");
                return;
            }
        };

        let mut state = self.lock();
        if !state.alive {
            debug!(message_id = %message.id, "conversation deactivated during fold, discarding");
            return;
        }
        if state.messages.push(message) {
            self.view.send_replace(state.messages.to_vec());
        }
    }
}

async fn run_fold_loop(shared: Arc<ConversationShared>, mut events: mpsc::Receiver<ChangeEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.stopped.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            ChangeEvent::Message(change) => shared.fold(change).await,
            other => warn!(entity = ?other.kind(), "unexpected event on a message subscription"),
        }
    }
    debug!(room_id = %shared.room_id, "conversation fold loop finished");
}

struct ActiveConversation {
    shared: Arc<ConversationShared>,
    handle: ConnectionHandle,
}

/// The messages of one room in arrival order.
///
/// The seed is sorted by creation time; live messages are appended as they
/// arrive and are never re-sorted against each other.
pub struct ConversationReconciler {
    backend: Arc<dyn Backend>,
    view: Arc<watch::Sender<Vec<MessageView>>>,
    active: Option<ActiveConversation>,
}

impl ConversationReconciler {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (view, _) = watch::channel(Vec::new());
        Self {
            backend,
            view: Arc::new(view),
            active: None,
        }
    }

    /// Open the room's message stream and seed from its history.
    ///
    /// Re-activating the same room swaps in the new activation only once the
    /// history is in, so a failed re-seed leaves the running one in place. A
    /// failed switch to another room ends the previous activation.
    pub async fn activate(&mut self, room_id: RoomId) -> SyncResult<Vec<MessageView>> {
        let seeded = self.seed(room_id).await;
        let (subscription, history) = match seeded {
            Ok(seeded) => seeded,
            Err(e) => {
                if self.room_id() != Some(room_id) {
                    self.deactivate();
                    self.view.send_replace(Vec::new());
                }
                return Err(e);
            }
        };

        self.deactivate();
        let shared = Arc::new(ConversationShared {
            backend: self.backend.clone(),
            room_id,
            state: Mutex::new(ConversationState {
                alive: true,
                messages: AppendLog::from_snapshot(history),
            }),
            view: self.view.clone(),
            stopped: CancellationToken::new(),
        });
        let snapshot = shared.lock().messages.to_vec();
        self.view.send_replace(snapshot.clone());

        tokio::spawn(run_fold_loop(shared.clone(), subscription.events));

        info!(room_id = %room_id, messages = snapshot.len(), "conversation activated");
        self.active = Some(ActiveConversation {
            shared,
            handle: subscription.handle,
        });
        Ok(snapshot)
    }

    async fn seed(&self, room_id: RoomId) -> SyncResult<(Subscription, Vec<MessageView>)> {
        let subscription = self.backend.subscribe(Scope::Messages { room_id }).await?;
        let history = self.backend.fetch_messages(room_id).await?;
        Ok((subscription, history))
    }

    pub fn deactivate(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.shared.stop();
        active.handle.release();
        info!(room_id = %active.shared.room_id, "conversation deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Room of the current activation, if any.
    pub fn room_id(&self) -> Option<RoomId> {
        self.active.as_ref().map(|a| a.shared.room_id)
    }

    pub fn messages(&self) -> Vec<MessageView> {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<MessageView>> {
        self.view.subscribe()
    }

    /// Fold one message event. No-op while inactive.
    pub async fn on_message_event(&self, change: Change<MessageRecord>) {
        if let Some(active) = &self.active {
            active.shared.fold(change).await;
        }
    }

    /// Post a message. It is not appended locally; it shows up once the
    /// backend echoes the insert back through the stream.
    pub async fn send(&self, room_id: RoomId, author_id: UserId, body: &str) -> SyncResult<()> {
        validate_message_body(body)?;
        let message = NewMessage {
            room_id,
            user_id: author_id,
            content: body.to_string(),
        };
        self.backend.send_message(&message).await.inspect_err(|e| {
            warn!(room_id = %room_id, error = %e, "message rejected");
        })
    }
}

impl Drop for ConversationReconciler {
    fn drop(&mut self) {
        self.deactivate();
    }
}
