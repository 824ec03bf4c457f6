//! In-memory backend for reconciler unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use carpool_types::api::{CreateRoomRequest, NewMessage, ProfileUpdate};
use carpool_types::{
    ChangeEvent, Location, Membership, MessageId, MessageView, Profile, Room, RoomId, RoomStatus,
    Scope, UserId,
};

use crate::error::{SyncError, SyncResult};
use crate::source::{EventSink, EventSource, PointReader, RemoteMutations, SnapshotFetcher, Subscription};

#[derive(Default)]
struct FakeState {
    rooms: Vec<Room>,
    members: HashSet<Membership>,
    messages: Vec<MessageView>,
    profiles: HashMap<UserId, Profile>,
    sinks: Vec<EventSink>,
    fail_snapshot: bool,
    fail_point_reads: bool,
    reject_mutations: Option<String>,
    mutations: Vec<String>,
    count_reads: usize,
    stalled_read: Option<(usize, Arc<Notify>)>,
}

/// Backend double: state is edited directly by the test and events are
/// injected by hand with [`FakeBackend::emit`].
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    count_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_room(&self, room: Room) {
        self.lock().rooms.push(room);
    }

    pub fn add_member(&self, room_id: RoomId, user_id: UserId) {
        self.lock().members.insert(Membership { room_id, user_id });
    }

    pub fn remove_member(&self, room_id: RoomId, user_id: UserId) {
        self.lock().members.remove(&Membership { room_id, user_id });
    }

    pub fn add_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id, profile);
    }

    pub fn add_message(&self, message: MessageView) {
        self.lock().messages.push(message);
    }

    pub fn fail_snapshot(&self, fail: bool) {
        self.lock().fail_snapshot = fail;
    }

    pub fn fail_point_reads(&self, fail: bool) {
        self.lock().fail_point_reads = fail;
    }

    pub fn reject_mutations(&self, reason: &str) {
        self.lock().reject_mutations = Some(reason.to_string());
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn count_reads(&self) -> usize {
        self.lock().count_reads
    }

    pub fn open_subscriptions(&self) -> usize {
        self.lock().sinks.iter().filter(|s| !s.is_released()).count()
    }

    /// Hold every membership count read until the returned notify fires.
    pub fn gate_count_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.count_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    /// Let the `nth` membership count read (1-based) compute its result and
    /// then hold it until the returned notify fires, as a slow response would.
    pub fn stall_count_read(&self, nth: usize) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().stalled_read = Some((nth, gate.clone()));
        gate
    }

    /// Deliver an event to every open subscription whose scope matches.
    pub async fn emit(&self, event: ChangeEvent) {
        let sinks: Vec<EventSink> = self.lock().sinks.clone();
        for sink in sinks {
            sink.deliver(event.clone()).await;
        }
    }

    fn record(&self, call: String) -> SyncResult<()> {
        let mut state = self.lock();
        state.mutations.push(call);
        match &state.reject_mutations {
            Some(reason) => Err(SyncError::Domain(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SnapshotFetcher for FakeBackend {
    async fn fetch_rooms(&self, status: RoomStatus) -> SyncResult<Vec<Room>> {
        let state = self.lock();
        if state.fail_snapshot {
            return Err(SyncError::Transport("snapshot unavailable".into()));
        }
        Ok(state.rooms.iter().filter(|r| r.status == status).cloned().collect())
    }

    async fn fetch_member_counts(&self, room_ids: &[RoomId]) -> SyncResult<HashMap<RoomId, u32>> {
        let state = self.lock();
        let mut counts = HashMap::new();
        for m in state.members.iter().filter(|m| room_ids.contains(&m.room_id)) {
            *counts.entry(m.room_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn fetch_memberships(&self, user_id: UserId) -> SyncResult<Vec<Membership>> {
        Ok(self.lock().members.iter().filter(|m| m.user_id == user_id).copied().collect())
    }

    async fn fetch_messages(&self, room_id: RoomId) -> SyncResult<Vec<MessageView>> {
        let state = self.lock();
        if state.fail_snapshot {
            return Err(SyncError::Transport("snapshot unavailable".into()));
        }
        let mut messages: Vec<MessageView> =
            state.messages.iter().filter(|m| m.room_id == room_id).cloned().collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages)
    }

    async fn fetch_room(&self, room_id: RoomId) -> SyncResult<Option<Room>> {
        Ok(self.lock().rooms.iter().find(|r| r.id == room_id).cloned())
    }

    async fn fetch_profile(&self, user_id: UserId) -> SyncResult<Option<Profile>> {
        Ok(self.lock().profiles.get(&user_id).cloned())
    }
}

#[async_trait]
impl PointReader for FakeBackend {
    async fn member_count(&self, room_id: RoomId) -> SyncResult<u32> {
        let (read, stalled) = {
            let mut state = self.lock();
            state.count_reads += 1;
            (state.count_reads, state.stalled_read.clone())
        };
        let gate = self.count_gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = {
            let state = self.lock();
            if state.fail_point_reads {
                Err(SyncError::Transport("point read failed".into()))
            } else {
                Ok(state.members.iter().filter(|m| m.room_id == room_id).count() as u32)
            }
        };
        if let Some((nth, gate)) = stalled {
            if nth == read {
                gate.notified().await;
            }
        }
        result
    }

    async fn message(&self, message_id: MessageId) -> SyncResult<Option<MessageView>> {
        let state = self.lock();
        if state.fail_point_reads {
            return Err(SyncError::Transport("point read failed".into()));
        }
        Ok(state.messages.iter().find(|m| m.id == message_id).cloned())
    }
}

#[async_trait]
impl RemoteMutations for FakeBackend {
    async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId> {
        self.record(format!("create_room {}->{}", req.origin, req.destination))?;
        Ok(Uuid::new_v4())
    }

    async fn join_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.record(format!("join_room {}", room_id))
    }

    async fn leave_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.record(format!("leave_room {}", room_id))
    }

    async fn send_message(&self, message: &NewMessage) -> SyncResult<()> {
        self.record(format!("send_message {}", message.content))
    }

    async fn update_profile(&self, user_id: UserId, update: &ProfileUpdate) -> SyncResult<Profile> {
        self.record(format!("update_profile {}", user_id))?;
        let mut state = self.lock();
        let profile = state.profiles.entry(user_id).or_insert_with(|| Profile {
            id: user_id,
            ..Profile::default()
        });
        profile.full_name = update.full_name.clone();
        profile.paypal_id = update.paypal_id.clone();
        profile.toss_bank_name = update.toss_bank_name.clone();
        profile.toss_account_no = update.toss_account_no.clone();
        Ok(profile.clone())
    }
}

#[async_trait]
impl EventSource for FakeBackend {
    async fn subscribe(&self, scope: Scope) -> SyncResult<Subscription> {
        let (subscription, sink) = Subscription::channel(scope);
        self.lock().sinks.push(sink);
        Ok(subscription)
    }
}

pub(crate) fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 9, minute, 0).unwrap()
}

pub(crate) fn room(departure_minute: u32, capacity: u32, status: RoomStatus) -> Room {
    Room {
        id: Uuid::new_v4(),
        created_at: None,
        origin: Location::PyeongtaekStation,
        destination: Location::WalkingGate,
        departure_time: at(departure_minute),
        capacity,
        status,
        host_id: None,
    }
}

pub(crate) fn message(room_id: RoomId, minute: u32, body: &str) -> MessageView {
    MessageView {
        id: Uuid::new_v4(),
        room_id,
        author_id: Uuid::new_v4(),
        author_display_name: "Kim".into(),
        body: body.into(),
        created_at: at(minute),
    }
}

/// Poll `check` until it holds, failing the test after a second.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
