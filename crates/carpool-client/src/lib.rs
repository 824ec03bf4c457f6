//! Hosted backend: PostgREST for reads and mutations, Realtime websockets
//! for change events.

pub mod config;
pub mod realtime;
pub mod rest;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::watch;

use carpool_sync::{
    EventSource, PointReader, RemoteMutations, SnapshotFetcher, Subscription, SyncResult,
};
use carpool_types::api::{CreateRoomRequest, NewMessage, ProfileUpdate};
use carpool_types::{
    Membership, MessageId, MessageView, Profile, Room, RoomId, RoomStatus, Scope, UserId,
};

pub use config::ClientConfig;
pub use realtime::RealtimeSource;
pub use rest::RestClient;

/// Both halves of the hosted backend behind the reconciler contracts.
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    rest: RestClient,
    realtime: RealtimeSource,
}

impl RemoteBackend {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            rest: RestClient::new(config.clone()),
            realtime: RealtimeSource::new(config),
        }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// See [`RealtimeSource::reconnections`].
    pub fn reconnections(&self) -> watch::Receiver<u64> {
        self.realtime.reconnections()
    }
}

#[async_trait]
impl SnapshotFetcher for RemoteBackend {
    async fn fetch_rooms(&self, status: RoomStatus) -> SyncResult<Vec<Room>> {
        self.rest.fetch_rooms(status).await
    }

    async fn fetch_member_counts(&self, room_ids: &[RoomId]) -> SyncResult<HashMap<RoomId, u32>> {
        self.rest.fetch_member_counts(room_ids).await
    }

    async fn fetch_memberships(&self, user_id: UserId) -> SyncResult<Vec<Membership>> {
        self.rest.fetch_memberships(user_id).await
    }

    async fn fetch_messages(&self, room_id: RoomId) -> SyncResult<Vec<MessageView>> {
        self.rest.fetch_messages(room_id).await
    }

    async fn fetch_room(&self, room_id: RoomId) -> SyncResult<Option<Room>> {
        self.rest.fetch_room(room_id).await
    }

    async fn fetch_profile(&self, user_id: UserId) -> SyncResult<Option<Profile>> {
        self.rest.fetch_profile(user_id).await
    }
}

#[async_trait]
impl PointReader for RemoteBackend {
    async fn member_count(&self, room_id: RoomId) -> SyncResult<u32> {
        self.rest.member_count(room_id).await
    }

    async fn message(&self, message_id: MessageId) -> SyncResult<Option<MessageView>> {
        self.rest.message(message_id).await
    }
}

#[async_trait]
impl RemoteMutations for RemoteBackend {
    async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId> {
        self.rest.create_room(req).await
    }

    async fn join_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.rest.join_room(room_id).await
    }

    async fn leave_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.rest.leave_room(room_id).await
    }

    async fn send_message(&self, message: &NewMessage) -> SyncResult<()> {
        self.rest.send_message(message).await
    }

    async fn update_profile(&self, user_id: UserId, update: &ProfileUpdate) -> SyncResult<Profile> {
        self.rest.update_profile(user_id, update).await
    }
}

#[async_trait]
impl EventSource for RemoteBackend {
    async fn subscribe(&self, scope: Scope) -> SyncResult<Subscription> {
        self.realtime.subscribe(scope).await
    }
}
