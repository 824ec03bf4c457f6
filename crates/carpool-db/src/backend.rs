use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use carpool_sync::{
    EventSource, PointReader, RemoteMutations, SnapshotFetcher, Subscription, SyncError, SyncResult,
};
use carpool_types::api::{CreateRoomRequest, NewMessage, ProfileUpdate};
use carpool_types::{
    ChangeEvent, Membership, MessageId, MessageView, Profile, Room, RoomId, RoomStatus, Scope,
    UserId,
};

use crate::feed::ChangeFeed;
use crate::{Database, Rejected};

/// The local database seen through the eyes of one signed-in user.
///
/// Clones made with [`LocalBackend::as_user`] share the database and the
/// change feed, so a mutation by one user is observed by every other.
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
    feed: ChangeFeed,
    user_id: Option<UserId>,
}

impl LocalBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            feed: ChangeFeed::new(),
            user_id: None,
        }
    }

    pub fn as_user(&self, user_id: UserId) -> Self {
        Self {
            db: self.db.clone(),
            feed: self.feed.clone(),
            user_id: Some(user_id),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn signed_in(&self) -> SyncResult<UserId> {
        self.user_id
            .ok_or_else(|| SyncError::Domain("sign in required".into()))
    }

    /// Run a database call off the async runtime.
    async fn run<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                SyncError::transport(e)
            })?
            .map_err(to_sync_error)
    }

    // -- Test and seeding hooks --

    pub async fn upsert_profile(&self, id: UserId, full_name: Option<String>) -> SyncResult<()> {
        self.run(move |db| db.upsert_profile(id, full_name.as_deref())).await
    }

    pub async fn insert_room(&self, room: Room) -> SyncResult<RoomId> {
        let event = self.run(move |db| db.insert_room(&room)).await?;
        let room_id = match &event {
            ChangeEvent::Room(change) => change.record().map(|r| r.id),
            _ => None,
        };
        self.feed.publish(event);
        room_id.ok_or_else(|| SyncError::Transport("room insert produced no row".into()))
    }

    pub async fn set_status(&self, room_id: RoomId, status: RoomStatus) -> SyncResult<()> {
        match self.run(move |db| db.set_room_status(room_id, status)).await? {
            Some(event) => {
                self.feed.publish(event);
                Ok(())
            }
            None => Err(SyncError::NotFound(format!("room {}", room_id))),
        }
    }

    pub async fn delete_room(&self, room_id: RoomId) -> SyncResult<()> {
        let events = self.run(move |db| db.delete_room(room_id)).await?;
        self.feed.publish_all(events);
        Ok(())
    }
}

fn to_sync_error(err: anyhow::Error) -> SyncError {
    match err.downcast::<Rejected>() {
        Ok(Rejected(reason)) => SyncError::Domain(reason),
        Err(err) => SyncError::Transport(format!("{:#}", err)),
    }
}

#[async_trait]
impl SnapshotFetcher for LocalBackend {
    async fn fetch_rooms(&self, status: RoomStatus) -> SyncResult<Vec<Room>> {
        self.run(move |db| db.get_rooms_by_status(status)).await
    }

    async fn fetch_member_counts(&self, room_ids: &[RoomId]) -> SyncResult<HashMap<RoomId, u32>> {
        let room_ids = room_ids.to_vec();
        self.run(move |db| db.member_counts(&room_ids)).await
    }

    async fn fetch_memberships(&self, user_id: UserId) -> SyncResult<Vec<Membership>> {
        self.run(move |db| db.memberships_of(user_id)).await
    }

    async fn fetch_messages(&self, room_id: RoomId) -> SyncResult<Vec<MessageView>> {
        self.run(move |db| db.get_messages(room_id)).await
    }

    async fn fetch_room(&self, room_id: RoomId) -> SyncResult<Option<Room>> {
        self.run(move |db| db.get_room(room_id)).await
    }

    async fn fetch_profile(&self, user_id: UserId) -> SyncResult<Option<Profile>> {
        self.run(move |db| db.get_profile(user_id)).await
    }
}

#[async_trait]
impl PointReader for LocalBackend {
    async fn member_count(&self, room_id: RoomId) -> SyncResult<u32> {
        self.run(move |db| db.member_count(room_id)).await
    }

    async fn message(&self, message_id: MessageId) -> SyncResult<Option<MessageView>> {
        self.run(move |db| db.get_message(message_id)).await
    }
}

#[async_trait]
impl RemoteMutations for LocalBackend {
    async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId> {
        let host_id = self.signed_in()?;
        let req = req.clone();
        let (room_id, events) = self
            .run(move |db| db.create_room(host_id, &req, Utc::now()))
            .await?;
        self.feed.publish_all(events);
        info!(room_id = %room_id, host = %host_id, "room created");
        Ok(room_id)
    }

    async fn join_room(&self, room_id: RoomId) -> SyncResult<()> {
        let user_id = self.signed_in()?;
        let events = self
            .run(move |db| db.join_room(room_id, user_id, Utc::now()))
            .await?;
        self.feed.publish_all(events);
        Ok(())
    }

    async fn leave_room(&self, room_id: RoomId) -> SyncResult<()> {
        let user_id = self.signed_in()?;
        let events = self.run(move |db| db.leave_room(room_id, user_id)).await?;
        self.feed.publish_all(events);
        Ok(())
    }

    async fn send_message(&self, message: &NewMessage) -> SyncResult<()> {
        let user_id = self.signed_in()?;
        if message.user_id != user_id {
            return Err(SyncError::Domain("cannot post as another user".into()));
        }
        let message = message.clone();
        let event = self
            .run(move |db| db.insert_message(&message, Utc::now()))
            .await?;
        self.feed.publish(event);
        Ok(())
    }

    async fn update_profile(&self, user_id: UserId, update: &ProfileUpdate) -> SyncResult<Profile> {
        if self.signed_in()? != user_id {
            return Err(SyncError::Domain("cannot edit another user's profile".into()));
        }
        let update = update.clone();
        let profile = self.run(move |db| db.update_profile(user_id, &update)).await?;
        info!(user_id = %user_id, "profile updated");
        Ok(profile)
    }
}

#[async_trait]
impl EventSource for LocalBackend {
    async fn subscribe(&self, scope: Scope) -> SyncResult<Subscription> {
        Ok(self.feed.subscribe(scope))
    }
}
