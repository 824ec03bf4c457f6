//! Live listing of rooms that are recruiting riders.
//!
//! The listing is seeded from a snapshot and then kept current by folding two
//! independent event streams: room rows and membership rows. Membership
//! events never adjust counts by a delta; every fold re-reads the room's
//! count, so duplicated or reordered deliveries still converge.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carpool_types::api::CreateRoomRequest;
use carpool_types::{
    Change, ChangeEvent, Membership, Operation, Room, RoomId, RoomStatus, RoomView, Scope, UserId,
};

use crate::error::SyncResult;
use crate::ordered::OrderedSet;
use crate::source::{Backend, ConnectionHandle, Subscription};
use crate::validate::validate_new_room;

/// Membership events remembered for rooms that are not (yet) listed.
const ORPHAN_LIMIT: usize = 256;

/// Membership events for rooms missing from the listing.
///
/// Room and membership streams have no mutual ordering, so a join can be
/// observed before the room it belongs to. Such events are remembered and
/// replayed when the room is admitted.
#[derive(Debug, Default)]
struct Orphans {
    entries: VecDeque<(RoomId, Option<bool>)>,
}

impl Orphans {
    fn remember(&mut self, room_id: RoomId, viewer_flag: Option<bool>) {
        if self.entries.len() == ORPHAN_LIMIT {
            self.entries.pop_front();
        }
        self.entries.push_back((room_id, viewer_flag));
    }

    /// Remove every entry for the room. `Some(flag)` if there were any, where
    /// `flag` is the latest viewer membership seen.
    fn take(&mut self, room_id: RoomId) -> Option<Option<bool>> {
        let mut found = false;
        let mut flag = None;
        self.entries.retain(|(id, viewer_flag)| {
            if *id != room_id {
                return true;
            }
            found = true;
            if viewer_flag.is_some() {
                flag = *viewer_flag;
            }
            false
        });
        found.then_some(flag)
    }

    fn forget(&mut self, room_id: RoomId) {
        self.entries.retain(|(id, _)| *id != room_id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct ListingState {
    alive: bool,
    rooms: OrderedSet<RoomView>,
    orphans: Orphans,
}

/// State of one activation. Replaced wholesale on re-activation, so folds
/// belonging to an old activation can never touch the new one.
struct ListingShared {
    backend: Arc<dyn Backend>,
    viewer_id: Option<UserId>,
    state: Mutex<ListingState>,
    view: Arc<watch::Sender<Vec<RoomView>>>,
    stopped: CancellationToken,
    /// Held for the whole of a fold, point reads included.
    folding: tokio::sync::Mutex<()>,
}

impl ListingShared {
    fn lock(&self) -> MutexGuard<'_, ListingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_alive(&self) -> bool {
        self.lock().alive
    }

    fn stop(&self) {
        self.lock().alive = false;
        self.stopped.cancel();
    }

    fn publish(&self, state: &ListingState) {
        self.view.send_replace(state.rooms.to_vec());
    }

    async fn fold(&self, event: ChangeEvent) {
        let _folding = self.folding.lock().await;
        match event {
            ChangeEvent::Room(change) => self.fold_room(change).await,
            ChangeEvent::Membership(change) => self.fold_membership(change).await,
            ChangeEvent::Message(_) => {
                warn!("message event delivered to the room listing, ignoring");
            }
        }
    }

    async fn fold_room(&self, change: Change<Room>) {
        match change.operation {
            Operation::Insert => {
                let Some(room) = change.after else {
                    warn!("room insert without a row, ignoring");
                    return;
                };
                self.admit(room, false).await;
            }
            Operation::Update => {
                let Some(room) = change.after else {
                    warn!("room update without a row, ignoring");
                    return;
                };
                if room.status != RoomStatus::Recruiting {
                    debug!(room_id = %room.id, status = %room.status, "room left recruiting");
                    self.discard(room.id);
                    return;
                }

                let room_id = room.id;
                let absent = {
                    let mut state = self.lock();
                    if !state.alive {
                        return;
                    }
                    if state.rooms.contains(room_id) {
                        // Room events carry no membership data: keep the derived fields.
                        state.rooms.update(room_id, |view| view.room = room);
                        self.publish(&state);
                        None
                    } else {
                        Some(room)
                    }
                };
                if let Some(room) = absent {
                    debug!(room_id = %room_id, "update for an unlisted recruiting room, admitting");
                    self.admit(room, true).await;
                }
            }
            Operation::Delete => {
                let Some(room_id) = change.record().map(|room| room.id) else {
                    warn!("room delete without a row, ignoring");
                    return;
                };
                self.discard(room_id);
            }
        }
    }

    /// Add a recruiting room unless it is already listed.
    ///
    /// A fresh insert cannot have the viewer seated yet. A room coming back
    /// into recruiting can, so `reopened` also looks up the viewer's seats.
    async fn admit(&self, room: Room, reopened: bool) {
        if room.status != RoomStatus::Recruiting {
            debug!(room_id = %room.id, status = %room.status, "ignoring non-recruiting room");
            return;
        }
        let room_id = room.id;
        {
            let state = self.lock();
            if !state.alive || state.rooms.contains(room_id) {
                debug!(room_id = %room_id, "room already listed");
                return;
            }
        }

        let count = match self.backend.member_count(room_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "dropping room insert, member count unavailable");
                return;
            }
        };

        let seated = match self.viewer_id {
            Some(viewer) if reopened => match self.backend.fetch_memberships(viewer).await {
                Ok(seats) => seats.iter().any(|m| m.room_id == room_id),
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "dropping room update, viewer seats unavailable");
                    return;
                }
            },
            _ => false,
        };

        let replay = {
            let mut state = self.lock();
            if !state.alive || state.rooms.contains(room_id) {
                return;
            }
            let orphaned = state.orphans.take(room_id);
            let is_viewer_member = match orphaned {
                Some(Some(flag)) => flag,
                _ => seated,
            };
            state.rooms.insert(RoomView::new(room, count, is_viewer_member));
            self.publish(&state);
            orphaned.is_some()
        };

        if replay {
            debug!(room_id = %room_id, "replaying membership events that arrived before the room");
            self.recount(room_id, None).await;
        }
    }

    fn discard(&self, room_id: RoomId) {
        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.orphans.forget(room_id);
        if state.rooms.remove(room_id).is_some() {
            self.publish(&state);
        }
    }

    async fn fold_membership(&self, change: Change<Membership>) {
        let Some(edge) = change.record().copied() else {
            warn!("membership event without a row, ignoring");
            return;
        };

        let viewer_flag = match self.viewer_id {
            Some(viewer) if viewer == edge.user_id => match change.operation {
                Operation::Insert => Some(true),
                Operation::Delete => Some(false),
                Operation::Update => None,
            },
            _ => None,
        };

        {
            let mut state = self.lock();
            if !state.alive {
                return;
            }
            if !state.rooms.contains(edge.room_id) {
                state.orphans.remember(edge.room_id, viewer_flag);
                debug!(
                    room_id = %edge.room_id,
                    pending = state.orphans.len(),
                    "membership event for an unlisted room"
                );
                return;
            }
        }

        self.recount(edge.room_id, viewer_flag).await;
    }

    /// Re-derive a listed room's count from the backend.
    async fn recount(&self, room_id: RoomId, viewer_flag: Option<bool>) {
        let count = match self.backend.member_count(room_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "dropping membership fold, member count unavailable");
                return;
            }
        };

        let mut state = self.lock();
        if !state.alive {
            debug!(room_id = %room_id, "listing deactivated during fold, discarding");
            return;
        }
        let changed = state.rooms.update(room_id, |view| {
            view.participant_count = count;
            if let Some(flag) = viewer_flag {
                view.is_viewer_member = flag;
            }
        });
        if changed {
            self.publish(&state);
        }
    }
}

/// Folds events from both subscriptions, one at a time. A fold finishes,
/// point reads included, before the next event is taken.
async fn run_fold_loop(
    shared: Arc<ListingShared>,
    mut rooms: mpsc::Receiver<ChangeEvent>,
    mut members: mpsc::Receiver<ChangeEvent>,
) {
    let mut rooms_open = true;
    let mut members_open = true;
    while rooms_open || members_open {
        let event = tokio::select! {
            _ = shared.stopped.cancelled() => break,
            event = rooms.recv(), if rooms_open => match event {
                Some(event) => event,
                None => {
                    rooms_open = false;
                    continue;
                }
            },
            event = members.recv(), if members_open => match event {
                Some(event) => event,
                None => {
                    members_open = false;
                    continue;
                }
            },
        };
        if !shared.is_alive() {
            break;
        }
        // An in-flight fold is not interrupted; it checks liveness before committing.
        shared.fold(event).await;
    }
    debug!("listing fold loop finished");
}

struct ActiveListing {
    shared: Arc<ListingShared>,
    handles: Vec<ConnectionHandle>,
}

/// The ordered set of recruiting rooms, kept live.
pub struct ListingReconciler {
    backend: Arc<dyn Backend>,
    view: Arc<watch::Sender<Vec<RoomView>>>,
    active: Option<ActiveListing>,
}

impl ListingReconciler {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (view, _) = watch::channel(Vec::new());
        Self {
            backend,
            view: Arc::new(view),
            active: None,
        }
    }

    /// Seed from a snapshot and start folding live events.
    ///
    /// Subscriptions are opened before the snapshot is read so nothing is
    /// lost in between; events overlapping the snapshot are absorbed by
    /// duplicate suppression. Calling this again (e.g. after the event source
    /// reconnected) replaces the previous activation once the new snapshot is
    /// in. If re-seeding fails, the previous activation keeps running.
    pub async fn activate(&mut self, viewer_id: Option<UserId>) -> SyncResult<Vec<RoomView>> {
        let rooms_sub = self.backend.subscribe(Scope::Rooms { status: None }).await?;
        let members_sub = self
            .backend
            .subscribe(Scope::Memberships { room_id: None })
            .await?;

        // Subscriptions dropped on error release themselves.
        let seeded = self.seed(viewer_id).await?;

        self.deactivate();
        let shared = Arc::new(ListingShared {
            backend: self.backend.clone(),
            viewer_id,
            state: Mutex::new(ListingState {
                alive: true,
                rooms: seeded,
                orphans: Orphans::default(),
            }),
            view: self.view.clone(),
            stopped: CancellationToken::new(),
            folding: tokio::sync::Mutex::new(()),
        });
        let snapshot = {
            let state = shared.lock();
            shared.publish(&state);
            state.rooms.to_vec()
        };

        let Subscription { events: room_events, handle: rooms_handle } = rooms_sub;
        let Subscription { events: member_events, handle: members_handle } = members_sub;
        tokio::spawn(run_fold_loop(shared.clone(), room_events, member_events));

        info!(
            rooms = snapshot.len(),
            viewer = ?viewer_id,
            "room listing activated"
        );
        self.active = Some(ActiveListing {
            shared,
            handles: vec![rooms_handle, members_handle],
        });
        Ok(snapshot)
    }

    async fn seed(&self, viewer_id: Option<UserId>) -> SyncResult<OrderedSet<RoomView>> {
        let rooms = self.backend.fetch_rooms(RoomStatus::Recruiting).await?;

        let room_ids: Vec<RoomId> = rooms.iter().map(|room| room.id).collect();
        let counts: HashMap<RoomId, u32> = if room_ids.is_empty() {
            HashMap::new()
        } else {
            self.backend.fetch_member_counts(&room_ids).await?
        };

        let joined: HashSet<RoomId> = match viewer_id {
            Some(viewer) => self
                .backend
                .fetch_memberships(viewer)
                .await?
                .into_iter()
                .map(|m| m.room_id)
                .collect(),
            None => HashSet::new(),
        };

        Ok(OrderedSet::from_unsorted(
            rooms
                .into_iter()
                .filter(|room| room.status == RoomStatus::Recruiting)
                .map(|room| {
                    let count = counts.get(&room.id).copied().unwrap_or(0);
                    let is_viewer_member = joined.contains(&room.id);
                    RoomView::new(room, count, is_viewer_member)
                }),
        ))
    }

    /// Stop folding and release both subscriptions.
    ///
    /// A fold still waiting on a point read when this runs finds the
    /// activation dead when it resumes and discards its result.
    pub fn deactivate(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.shared.stop();
        for handle in active.handles {
            handle.release();
        }
        info!("room listing deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Current listing, ordered by departure time.
    pub fn rooms(&self) -> Vec<RoomView> {
        self.view.borrow().clone()
    }

    /// Receiver notified after every fold that changed the listing.
    pub fn watch(&self) -> watch::Receiver<Vec<RoomView>> {
        self.view.subscribe()
    }

    /// Fold one room event. No-op while inactive.
    pub async fn on_room_event(&self, change: Change<Room>) {
        if let Some(active) = &self.active {
            active.shared.fold(ChangeEvent::Room(change)).await;
        }
    }

    /// Fold one membership event. No-op while inactive.
    pub async fn on_membership_event(&self, change: Change<Membership>) {
        if let Some(active) = &self.active {
            active.shared.fold(ChangeEvent::Membership(change)).await;
        }
    }

    /// Ask the backend to seat the viewer. The listing changes only once the
    /// resulting membership event arrives.
    pub async fn join(&self, room_id: RoomId) -> SyncResult<()> {
        self.backend.join_room(room_id).await.inspect_err(|e| {
            warn!(room_id = %room_id, error = %e, "join rejected");
        })
    }

    pub async fn leave(&self, room_id: RoomId) -> SyncResult<()> {
        self.backend.leave_room(room_id).await.inspect_err(|e| {
            warn!(room_id = %room_id, error = %e, "leave rejected");
        })
    }

    /// Validate and create a room. It shows up through the room stream.
    pub async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId> {
        validate_new_room(req, Utc::now())?;
        let room_id = self.backend.create_room(req).await?;
        info!(room_id = %room_id, "room created");
        Ok(room_id)
    }
}

impl Drop for ListingReconciler {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::{FakeBackend, eventually, room};
    use uuid::Uuid;

    fn ids(rooms: &[RoomView]) -> Vec<RoomId> {
        rooms.iter().map(|r| r.id()).collect()
    }

    #[tokio::test]
    async fn test_activation_seeds_sorted_recruiting_rooms() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let late = room(50, 4, RoomStatus::Recruiting);
        let early = room(10, 3, RoomStatus::Recruiting);
        let full = room(20, 2, RoomStatus::Full);
        for r in [&late, &early, &full] {
            backend.add_room(r.clone());
        }
        backend.add_member(late.id, viewer);
        backend.add_member(late.id, Uuid::new_v4());

        let mut listing = ListingReconciler::new(backend.clone());
        let rooms = listing.activate(Some(viewer)).await.unwrap();

        assert_eq!(ids(&rooms), vec![early.id, late.id]);
        assert_eq!(rooms[0].participant_count, 0);
        assert!(!rooms[0].is_viewer_member);
        assert_eq!(rooms[1].participant_count, 2);
        assert!(rooms[1].is_viewer_member);
        assert_eq!(listing.rooms(), rooms);
        assert_eq!(backend.open_subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_insert_is_placed_by_departure_and_deduplicated() {
        let backend = FakeBackend::new();
        let first = room(10, 4, RoomStatus::Recruiting);
        let last = room(30, 4, RoomStatus::Recruiting);
        backend.add_room(first.clone());
        backend.add_room(last.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        let middle = room(20, 4, RoomStatus::Recruiting);
        backend.add_member(middle.id, Uuid::new_v4());
        listing.on_room_event(Change::insert(middle.clone())).await;
        listing.on_room_event(Change::insert(middle.clone())).await;

        let rooms = listing.rooms();
        assert_eq!(ids(&rooms), vec![first.id, middle.id, last.id]);
        assert_eq!(rooms[1].participant_count, 1);
        assert!(!rooms[1].is_viewer_member);
        // The duplicate is suppressed before any point read.
        assert_eq!(backend.count_reads(), 1);
    }

    #[tokio::test]
    async fn test_non_recruiting_insert_is_ignored() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        listing.on_room_event(Change::insert(room(10, 4, RoomStatus::InProgress))).await;

        assert!(listing.rooms().is_empty());
        assert_eq!(backend.count_reads(), 0);
    }

    #[tokio::test]
    async fn test_update_preserves_derived_fields_and_reorders() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let a = room(10, 4, RoomStatus::Recruiting);
        let b = room(20, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());
        backend.add_room(b.clone());
        backend.add_member(a.id, viewer);

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(Some(viewer)).await.unwrap();

        let mut moved = a.clone();
        moved.departure_time = crate::testing::at(40);
        moved.capacity = 6;
        listing.on_room_event(Change::update(Some(a.clone()), moved)).await;

        let rooms = listing.rooms();
        assert_eq!(ids(&rooms), vec![b.id, a.id]);
        assert_eq!(rooms[1].room.capacity, 6);
        assert_eq!(rooms[1].participant_count, 1);
        assert!(rooms[1].is_viewer_member);
    }

    #[tokio::test]
    async fn test_update_leaving_recruiting_removes_room() {
        let backend = FakeBackend::new();
        let a = room(10, 2, RoomStatus::Recruiting);
        backend.add_room(a.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        for status in [RoomStatus::Full, RoomStatus::InProgress, RoomStatus::Completed] {
            let mut changed = a.clone();
            changed.status = status;
            listing.on_room_event(Change::update(Some(a.clone()), changed)).await;
            assert!(listing.rooms().is_empty(), "{} should leave the listing", status);
        }
    }

    #[tokio::test]
    async fn test_update_back_to_recruiting_is_admitted_with_viewer_seat() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let reopened = room(10, 2, RoomStatus::Recruiting);
        backend.add_member(reopened.id, Uuid::new_v4());
        backend.add_member(reopened.id, viewer);

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(Some(viewer)).await.unwrap();

        let mut was_full = reopened.clone();
        was_full.status = RoomStatus::Full;
        listing.on_room_event(Change::update(Some(was_full), reopened.clone())).await;

        let rooms = listing.rooms();
        assert_eq!(ids(&rooms), vec![reopened.id]);
        assert_eq!(rooms[0].participant_count, 2);
        assert!(rooms[0].is_viewer_member);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_room_is_harmless() {
        let backend = FakeBackend::new();
        let a = room(10, 2, RoomStatus::Recruiting);
        backend.add_room(a.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        listing.on_room_event(Change::delete(room(5, 2, RoomStatus::Recruiting))).await;
        assert_eq!(ids(&listing.rooms()), vec![a.id]);

        listing.on_room_event(Change::delete(a.clone())).await;
        assert!(listing.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_membership_of_other_user_changes_only_count() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let other = Uuid::new_v4();
        let a = room(10, 4, RoomStatus::Recruiting);
        let b = room(20, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());
        backend.add_room(b.clone());
        backend.add_member(b.id, viewer);

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(Some(viewer)).await.unwrap();

        backend.add_member(a.id, other);
        listing
            .on_membership_event(Change::insert(Membership { room_id: a.id, user_id: other }))
            .await;

        let rooms = listing.rooms();
        assert_eq!(rooms[0].participant_count, 1);
        assert!(!rooms[0].is_viewer_member);
        assert_eq!(rooms[1].participant_count, 1);
        assert!(rooms[1].is_viewer_member);
    }

    #[tokio::test]
    async fn test_viewer_membership_toggles_flag_for_that_room_only() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let a = room(10, 4, RoomStatus::Recruiting);
        let b = room(20, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());
        backend.add_room(b.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(Some(viewer)).await.unwrap();

        let edge = Membership { room_id: b.id, user_id: viewer };
        backend.add_member(b.id, viewer);
        listing.on_membership_event(Change::insert(edge)).await;

        let rooms = listing.rooms();
        assert!(!rooms[0].is_viewer_member);
        assert!(rooms[1].is_viewer_member);
        assert_eq!(rooms[1].participant_count, 1);

        backend.remove_member(b.id, viewer);
        listing.on_membership_event(Change::delete(edge)).await;

        let rooms = listing.rooms();
        assert!(!rooms[1].is_viewer_member);
        assert_eq!(rooms[1].participant_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_membership_events_do_not_drift() {
        let backend = FakeBackend::new();
        let a = room(10, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        let user = Uuid::new_v4();
        backend.add_member(a.id, user);
        let join = Change::insert(Membership { room_id: a.id, user_id: user });
        for _ in 0..3 {
            listing.on_membership_event(join.clone()).await;
        }

        assert_eq!(listing.rooms()[0].participant_count, 1);
    }

    #[tokio::test]
    async fn test_orphaned_membership_is_replayed_when_room_appears() {
        let backend = FakeBackend::new();
        let viewer = Uuid::new_v4();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(Some(viewer)).await.unwrap();

        let created = room(10, 4, RoomStatus::Recruiting);
        backend.add_member(created.id, viewer);
        listing
            .on_membership_event(Change::insert(Membership { room_id: created.id, user_id: viewer }))
            .await;
        assert!(listing.rooms().is_empty());

        listing.on_room_event(Change::insert(created.clone())).await;

        let rooms = listing.rooms();
        assert_eq!(ids(&rooms), vec![created.id]);
        assert!(rooms[0].is_viewer_member);
        assert_eq!(rooms[0].participant_count, 1);
    }

    #[tokio::test]
    async fn test_failed_point_read_drops_the_fold() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        backend.fail_point_reads(true);
        listing.on_room_event(Change::insert(room(10, 4, RoomStatus::Recruiting))).await;
        assert!(listing.rooms().is_empty());

        backend.fail_point_reads(false);
        let later = room(20, 4, RoomStatus::Recruiting);
        listing.on_room_event(Change::insert(later.clone())).await;
        assert_eq!(ids(&listing.rooms()), vec![later.id]);
    }

    #[tokio::test]
    async fn test_snapshot_failure_surfaces_and_releases_subscriptions() {
        let backend = FakeBackend::new();
        backend.fail_snapshot(true);

        let mut listing = ListingReconciler::new(backend.clone());
        let err = listing.activate(None).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(!listing.is_active());
        assert_eq!(backend.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_failed_reseed_keeps_previous_activation() {
        let backend = FakeBackend::new();
        let a = room(10, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        backend.fail_snapshot(true);
        let err = listing.activate(None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(listing.is_active());
        assert_eq!(ids(&listing.rooms()), vec![a.id]);
        assert_eq!(backend.open_subscriptions(), 2);

        // The old activation still folds live events.
        let mut full = a.clone();
        full.status = RoomStatus::Full;
        backend
            .emit(ChangeEvent::Room(Change::update(Some(a.clone()), full)))
            .await;
        eventually(|| listing.rooms().is_empty()).await;

        backend.fail_snapshot(false);
        listing.activate(None).await.unwrap();
        assert_eq!(backend.open_subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_slow_replay_recount_cannot_overwrite_a_later_join() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        let created = room(10, 4, RoomStatus::Recruiting);
        let first = Uuid::new_v4();
        backend.add_member(created.id, first);
        backend
            .emit(ChangeEvent::Membership(Change::insert(Membership {
                room_id: created.id,
                user_id: first,
            })))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Read 1 admits the room, read 2 is the replay recount and answers late.
        let slow = backend.stall_count_read(2);
        backend.add_room(created.clone());
        backend.emit(ChangeEvent::Room(Change::insert(created.clone()))).await;
        eventually(|| backend.count_reads() == 2).await;

        let second = Uuid::new_v4();
        backend.add_member(created.id, second);
        backend
            .emit(ChangeEvent::Membership(Change::insert(Membership {
                room_id: created.id,
                user_id: second,
            })))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        slow.notify_one();
        eventually(|| backend.count_reads() == 3).await;
        eventually(|| listing.rooms().first().map(|r| r.participant_count) == Some(2)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listing.rooms()[0].participant_count, 2);
    }

    #[tokio::test]
    async fn test_live_events_are_folded_from_subscriptions() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();
        let mut watch = listing.watch();

        let a = room(10, 4, RoomStatus::Recruiting);
        backend.emit(ChangeEvent::Room(Change::insert(a.clone()))).await;

        watch.changed().await.unwrap();
        assert_eq!(ids(&watch.borrow_and_update()), vec![a.id]);
    }

    #[tokio::test]
    async fn test_fold_resolving_after_deactivation_is_discarded() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        let gate = backend.gate_count_reads();
        backend
            .emit(ChangeEvent::Room(Change::insert(room(10, 4, RoomStatus::Recruiting))))
            .await;
        eventually(|| backend.count_reads() == 1).await;

        listing.deactivate();
        assert_eq!(backend.open_subscriptions(), 0);

        gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(listing.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_events_after_deactivation_are_ignored() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();
        listing.deactivate();

        listing.on_room_event(Change::insert(room(10, 4, RoomStatus::Recruiting))).await;
        backend
            .emit(ChangeEvent::Room(Change::insert(room(20, 4, RoomStatus::Recruiting))))
            .await;

        assert!(listing.rooms().is_empty());
        assert_eq!(backend.count_reads(), 0);
    }

    #[tokio::test]
    async fn test_join_and_leave_only_delegate() {
        let backend = FakeBackend::new();
        let a = room(10, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());

        let mut listing = ListingReconciler::new(backend.clone());
        let viewer = Uuid::new_v4();
        let before = listing.activate(Some(viewer)).await.unwrap();

        listing.join(a.id).await.unwrap();
        assert_eq!(listing.rooms(), before);

        backend.reject_mutations("room is full");
        let err = listing.leave(a.id).await.unwrap_err();
        assert_eq!(err, SyncError::Domain("room is full".into()));
        assert_eq!(listing.rooms(), before);
        assert_eq!(
            backend.mutations(),
            vec![format!("join_room {}", a.id), format!("leave_room {}", a.id)]
        );
    }

    #[tokio::test]
    async fn test_create_room_validates_before_calling_backend() {
        let backend = FakeBackend::new();
        let listing = ListingReconciler::new(backend.clone());

        let invalid = CreateRoomRequest {
            origin: carpool_types::Location::Cpx,
            destination: carpool_types::Location::Cpx,
            departure_time: Utc::now() + chrono::Duration::hours(1),
            capacity: 4,
        };
        assert!(matches!(
            listing.create_room(&invalid).await,
            Err(SyncError::InvalidInput(_))
        ));
        assert!(backend.mutations().is_empty());

        let valid = CreateRoomRequest {
            destination: carpool_types::Location::Bx,
            ..invalid
        };
        listing.create_room(&valid).await.unwrap();
        assert_eq!(backend.mutations(), vec!["create_room CPX->BX".to_string()]);
    }

    #[tokio::test]
    async fn test_reactivation_reseeds() {
        let backend = FakeBackend::new();
        let mut listing = ListingReconciler::new(backend.clone());
        listing.activate(None).await.unwrap();

        let a = room(10, 4, RoomStatus::Recruiting);
        backend.add_room(a.clone());
        let rooms = listing.activate(None).await.unwrap();

        assert_eq!(ids(&rooms), vec![a.id]);
        assert_eq!(backend.open_subscriptions(), 2);
    }

    mod histories {
        use super::*;
        use crate::testing::at;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        const SLOTS: u128 = 5;

        /// One step of a room's history. Whether it becomes an insert, an
        /// update or a delete depends on whether the room exists yet.
        #[derive(Debug, Clone)]
        struct Step {
            slot: u128,
            delete: bool,
            departure_minute: u32,
            status: RoomStatus,
            delivered_twice: bool,
        }

        fn status() -> impl Strategy<Value = RoomStatus> {
            prop_oneof![
                3 => Just(RoomStatus::Recruiting),
                1 => Just(RoomStatus::Full),
                1 => Just(RoomStatus::InProgress),
                1 => Just(RoomStatus::Completed),
            ]
        }

        fn step() -> impl Strategy<Value = Step> {
            (0..SLOTS, any::<bool>(), 0u32..4, status(), any::<bool>()).prop_map(
                |(slot, delete, departure_minute, status, delivered_twice)| Step {
                    slot,
                    delete,
                    departure_minute,
                    status,
                    delivered_twice,
                },
            )
        }

        fn slot_room(step: &Step) -> Room {
            Room {
                id: Uuid::from_u128(step.slot + 1),
                ..room(step.departure_minute, 4, step.status)
            }
        }

        /// Fold a history and return the listing next to the rooms the history
        /// leaves recruiting, sorted by departure then id.
        fn replay(steps: &[Step]) -> (Vec<(RoomId, u32)>, Vec<(RoomId, u32)>) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut listing = ListingReconciler::new(FakeBackend::new());
                listing.activate(None).await.unwrap();

                let mut rooms: BTreeMap<u128, Room> = BTreeMap::new();
                for step in steps {
                    let change = match rooms.remove(&step.slot) {
                        None => {
                            let created = slot_room(step);
                            rooms.insert(step.slot, created.clone());
                            Change::insert(created)
                        }
                        Some(old) if step.delete => Change::delete(old),
                        Some(old) => {
                            let new = slot_room(step);
                            rooms.insert(step.slot, new.clone());
                            Change::update(Some(old), new)
                        }
                    };
                    let deliveries = if step.delivered_twice { 2 } else { 1 };
                    for _ in 0..deliveries {
                        listing.on_room_event(change.clone()).await;
                    }
                }

                let minute = |r: &Room| (r.departure_time - at(0)).num_minutes() as u32;
                let listed: Vec<(RoomId, u32)> = listing
                    .rooms()
                    .iter()
                    .map(|view| (view.id(), minute(&view.room)))
                    .collect();
                let mut expected: Vec<&Room> = rooms
                    .values()
                    .filter(|r| r.status == RoomStatus::Recruiting)
                    .collect();
                expected.sort_by_key(|r| (r.departure_time, r.id));
                let expected: Vec<(RoomId, u32)> =
                    expected.into_iter().map(|r| (r.id, minute(r))).collect();
                (listed, expected)
            })
        }

        proptest! {
            #[test]
            fn listing_matches_recruiting_rooms_of_any_history(
                steps in prop::collection::vec(step(), 0..40),
            ) {
                let (listed, expected) = replay(&steps);
                prop_assert_eq!(listed, expected);
            }
        }
    }
}
