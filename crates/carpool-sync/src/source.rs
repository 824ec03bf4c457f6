//! Contracts of the collaborators a reconciler depends on.
//!
//! A reconciler only ever talks to the backend through these traits: bulk
//! snapshot reads to seed state, point reads to re-derive one value while
//! folding an event, remote mutations whose effects arrive later as events,
//! and event sources delivering change notifications over a channel.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use carpool_types::api::{CreateRoomRequest, NewMessage, ProfileUpdate};
use carpool_types::{
    ChangeEvent, Membership, MessageId, MessageView, Profile, Room, RoomId, RoomStatus, Scope,
    UserId,
};

use crate::error::SyncResult;

/// Events buffered per subscription before the producer waits on the consumer.
pub const EVENT_BUFFER: usize = 256;

/// Idempotent bulk reads of the authoritative state.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Rooms with the given status, in any order.
    async fn fetch_rooms(&self, status: RoomStatus) -> SyncResult<Vec<Room>>;

    /// Membership count per room. Rooms without members may be absent.
    async fn fetch_member_counts(&self, room_ids: &[RoomId]) -> SyncResult<HashMap<RoomId, u32>>;

    /// Every membership row of one user.
    async fn fetch_memberships(&self, user_id: UserId) -> SyncResult<Vec<Membership>>;

    /// All messages of a room, newest first.
    async fn fetch_messages(&self, room_id: RoomId) -> SyncResult<Vec<MessageView>>;

    /// One room, whatever its status.
    async fn fetch_room(&self, room_id: RoomId) -> SyncResult<Option<Room>>;

    async fn fetch_profile(&self, user_id: UserId) -> SyncResult<Option<Profile>>;
}

/// Single-value reads used while folding one event.
#[async_trait]
pub trait PointReader: Send + Sync {
    async fn member_count(&self, room_id: RoomId) -> SyncResult<u32>;

    /// One message joined with its author's display name.
    async fn message(&self, message_id: MessageId) -> SyncResult<Option<MessageView>>;
}

/// Atomic remote calls. Their effects are only observed through events.
#[async_trait]
pub trait RemoteMutations: Send + Sync {
    async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId>;

    async fn join_room(&self, room_id: RoomId) -> SyncResult<()>;

    async fn leave_room(&self, room_id: RoomId) -> SyncResult<()>;

    async fn send_message(&self, message: &NewMessage) -> SyncResult<()>;

    /// Overwrite the editable fields of a user's own profile and return the
    /// stored row.
    async fn update_profile(&self, user_id: UserId, update: &ProfileUpdate) -> SyncResult<Profile>;
}

/// Push channel of change notifications for a scoped entity set.
///
/// Delivery is at-least-once with best-effort ordering inside one scope and
/// no ordering across scopes. Reconnection is the source's own business.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, scope: Scope) -> SyncResult<Subscription>;
}

/// Everything a reconciler needs from the backend.
pub trait Backend: SnapshotFetcher + PointReader + RemoteMutations + EventSource {}

impl<T> Backend for T where T: SnapshotFetcher + PointReader + RemoteMutations + EventSource {}

/// An open subscription: the event channel plus the handle that closes it.
pub struct Subscription {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub handle: ConnectionHandle,
}

impl Subscription {
    /// Create a subscription for `scope`. The returned sink is kept by the
    /// event source and feeds the subscription until the handle is released.
    pub fn channel(scope: Scope) -> (Self, EventSink) {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let id = Uuid::new_v4();

        let sink = EventSink {
            id,
            scope,
            tx,
            released: token.clone(),
        };
        let subscription = Self {
            events,
            handle: ConnectionHandle { id, scope, token },
        };
        (subscription, sink)
    }
}

/// Ownership of one active subscription.
///
/// Released exactly once: `release` consumes the handle, and dropping an
/// unreleased handle releases it as well.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    scope: Scope,
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn release(self) {
        debug!(handle = %self.id, scope = %self.scope.topic(), "releasing subscription");
        // Drop does the cancelling.
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Producer side of a subscription, held by the event source.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: Uuid,
    scope: Scope,
    tx: mpsc::Sender<ChangeEvent>,
    released: CancellationToken,
}

impl EventSink {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the subscription's handle has been released.
    pub async fn released(&self) {
        tokio::select! {
            _ = self.released.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Forward an event if it falls inside the scope.
    ///
    /// Returns `false` once the subscription is gone, which tells the source
    /// to stop feeding it.
    pub async fn deliver(&self, event: ChangeEvent) -> bool {
        if self.is_released() {
            return false;
        }
        if !self.scope.matches(&event) {
            return true;
        }
        tokio::select! {
            _ = self.released.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}
