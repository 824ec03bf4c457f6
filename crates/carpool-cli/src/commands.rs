use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use carpool_client::RemoteBackend;
use carpool_db::LocalBackend;
use carpool_sync::{
    Backend, ConversationReconciler, Currency, ListingReconciler, PaymentTarget, PointReader,
    RemoteMutations, SnapshotFetcher, format_currency, host_payment_targets, split_fare,
};
use carpool_types::api::{CreateRoomRequest, ProfileUpdate};
use carpool_types::{
    Location, MessageId, MessageView, Profile, Room, RoomId, RoomStatus, RoomView, UserId,
};

/// Tables read by `check`.
const CHECKED_TABLES: [&str; 3] = ["profiles", "rooms", "room_members"];

/// Resolves when the event source reports a reconnect. Never resolves
/// without a counter to watch.
async fn reconnected(reconnects: &mut Option<watch::Receiver<u64>>) {
    if let Some(rx) = reconnects {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Schedule for retrying a re-seed that failed. The reconciler keeps its
/// previous activation meanwhile, so the view only goes stale.
struct ReseedRetry {
    delay: std::time::Duration,
    due: Option<tokio::time::Instant>,
}

impl ReseedRetry {
    const FIRST: std::time::Duration = std::time::Duration::from_secs(2);
    const MAX: std::time::Duration = std::time::Duration::from_secs(30);

    fn new() -> Self {
        Self {
            delay: Self::FIRST,
            due: None,
        }
    }

    fn succeeded(&mut self) {
        self.delay = Self::FIRST;
        self.due = None;
    }

    /// Schedule the next attempt and return how long until it runs.
    fn failed(&mut self) -> std::time::Duration {
        let delay = self.delay;
        self.due = Some(tokio::time::Instant::now() + delay);
        self.delay = (delay * 2).min(Self::MAX);
        delay
    }

    /// Resolves when a scheduled attempt is due. Never resolves otherwise.
    async fn wait(&self) {
        match self.due {
            Some(due) => tokio::time::sleep_until(due).await,
            None => std::future::pending::<()>().await,
        }
    }
}

pub async fn watch_rooms(
    backend: Arc<dyn Backend>,
    viewer: Option<UserId>,
    mut reconnects: Option<watch::Receiver<u64>>,
) -> Result<()> {
    let mut listing = ListingReconciler::new(backend);
    let seeded = listing.activate(viewer).await?;
    print_rooms(&seeded);

    let mut updates = listing.watch();
    let mut retry = ReseedRetry::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let rooms = updates.borrow_and_update().clone();
                print_rooms(&rooms);
                continue;
            }
            _ = reconnected(&mut reconnects) => {
                info!("event source reconnected, re-seeding the listing");
            }
            _ = retry.wait() => {
                info!("retrying the listing re-seed");
            }
        }
        match listing.activate(viewer).await {
            Ok(_) => retry.succeeded(),
            Err(e) => {
                let delay = retry.failed();
                warn!(error = %e, retry_in = ?delay, "re-seeding the listing failed");
            }
        }
    }

    listing.deactivate();
    Ok(())
}

fn print_rooms(rooms: &[RoomView]) {
    println!("-- {} recruiting --", rooms.len());
    for room in rooms {
        println!("{}", room_line(room));
    }
}

fn room_line(view: &RoomView) -> String {
    let room = &view.room;
    let departure = room.departure_time.with_timezone(&Local).format("%m-%d %H:%M");
    let joined = if view.is_viewer_member { "  (joined)" } else { "" };
    format!(
        "{}  {} -> {}  {}  {}/{} seats{}",
        room.id, room.origin, room.destination, departure, view.participant_count, room.capacity, joined
    )
}

pub async fn chat(
    backend: Arc<dyn Backend>,
    room_id: RoomId,
    author: Option<UserId>,
    mut reconnects: Option<watch::Receiver<u64>>,
) -> Result<()> {
    let mut chat = ConversationReconciler::new(backend);
    let mut printed: HashSet<MessageId> = HashSet::new();
    let history = chat.activate(room_id).await?;
    print_new_messages(&history, &mut printed);

    if author.is_none() {
        warn!("no user id set, following the room read-only");
    }

    let mut updates = chat.watch();
    let mut retry = ReseedRetry::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = updates.borrow_and_update().clone();
                print_new_messages(&messages, &mut printed);
                continue;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match author {
                    Some(author) => {
                        // Shows up once the insert comes back through the stream
                        if let Err(e) = chat.send(room_id, author, &line).await {
                            eprintln!("not sent: {}", e);
                        }
                    }
                    None => eprintln!("not sent: set CARPOOL_USER_ID to post"),
                }
                continue;
            }
            _ = reconnected(&mut reconnects) => {
                info!(room_id = %room_id, "event source reconnected, re-seeding the conversation");
            }
            _ = retry.wait() => {
                info!(room_id = %room_id, "retrying the conversation re-seed");
            }
        }
        match chat.activate(room_id).await {
            Ok(messages) => {
                retry.succeeded();
                print_new_messages(&messages, &mut printed);
            }
            Err(e) => {
                let delay = retry.failed();
                warn!(error = %e, retry_in = ?delay, "re-seeding the conversation failed");
            }
        }
    }

    chat.deactivate();
    Ok(())
}

fn print_new_messages(messages: &[MessageView], printed: &mut HashSet<MessageId>) {
    for message in messages {
        if printed.insert(message.id) {
            println!("{}", message_line(message));
        }
    }
}

fn message_line(message: &MessageView) -> String {
    format!(
        "[{}] {}: {}",
        message.created_at.with_timezone(&Local).format("%H:%M"),
        message.author_display_name,
        message.body
    )
}

pub async fn create_room(
    backend: Arc<dyn Backend>,
    origin: Location,
    destination: Location,
    departure_time: DateTime<Utc>,
    capacity: u32,
) -> Result<()> {
    let listing = ListingReconciler::new(backend);
    let req = CreateRoomRequest {
        origin,
        destination,
        departure_time,
        capacity,
    };
    let room_id = listing.create_room(&req).await?;
    println!("{}", room_id);
    Ok(())
}

pub async fn join(backend: Arc<dyn Backend>, room_id: RoomId) -> Result<()> {
    ListingReconciler::new(backend).join(room_id).await?;
    println!("joined {}", room_id);
    Ok(())
}

pub async fn leave(backend: Arc<dyn Backend>, room_id: RoomId) -> Result<()> {
    ListingReconciler::new(backend).leave(room_id).await?;
    println!("left {}", room_id);
    Ok(())
}

pub async fn seat_count(backend: Arc<dyn Backend>, room_id: RoomId) -> Result<i64> {
    Ok(i64::from(backend.member_count(room_id).await?))
}

/// Payment targets named on the command line.
pub fn payment_targets(
    toss_bank: Option<String>,
    toss_account: Option<String>,
    paypal: Option<String>,
) -> Vec<PaymentTarget> {
    let mut targets = Vec::new();
    if toss_bank.is_some() || toss_account.is_some() {
        targets.push(PaymentTarget::Toss {
            bank_name: toss_bank.unwrap_or_default(),
            account_no: toss_account.unwrap_or_default(),
        });
    }
    if let Some(paypal_id) = paypal {
        targets.push(PaymentTarget::PayPal { paypal_id });
    }
    targets
}

/// Targets for a fare split: the flags when any were given, otherwise the
/// payee details of the room's host.
pub async fn split_targets(
    backend: Option<&dyn Backend>,
    room_id: Option<RoomId>,
    flagged: Vec<PaymentTarget>,
) -> Result<Vec<PaymentTarget>> {
    match (backend, room_id) {
        (Some(backend), Some(room_id)) if flagged.is_empty() => {
            let targets = host_payment_targets(backend, room_id).await?;
            if targets.is_empty() {
                warn!(room_id = %room_id, "the host has no payee details, printing the split only");
            }
            Ok(targets)
        }
        _ => Ok(flagged),
    }
}

pub fn split(total: u64, members: i64, usd: bool, targets: &[PaymentTarget]) -> Result<()> {
    let currency = if usd { Currency::Usd } else { Currency::Krw };
    let share = split_fare(total, members)?;
    println!(
        "{} split {} ways: {} each",
        format_currency(total as f64, currency),
        members,
        format_currency(share as f64, currency)
    );
    for target in targets {
        println!("{}", target.link(share)?);
    }
    Ok(())
}

/// Profile fields given on the command line. `None` keeps the stored value
/// and an empty string clears it.
#[derive(Debug, Default)]
pub struct ProfileEdit {
    pub full_name: Option<String>,
    pub paypal_id: Option<String>,
    pub toss_bank_name: Option<String>,
    pub toss_account_no: Option<String>,
}

impl ProfileEdit {
    fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.paypal_id.is_none()
            && self.toss_bank_name.is_none()
            && self.toss_account_no.is_none()
    }

    /// The full update to send, given what is stored now.
    fn apply(self, current: Option<&Profile>) -> ProfileUpdate {
        fn keep(edit: Option<String>, stored: Option<&String>) -> Option<String> {
            edit.or_else(|| stored.cloned())
        }
        ProfileUpdate::new(
            keep(self.full_name, current.and_then(|p| p.full_name.as_ref())),
            keep(self.paypal_id, current.and_then(|p| p.paypal_id.as_ref())),
            keep(self.toss_bank_name, current.and_then(|p| p.toss_bank_name.as_ref())),
            keep(self.toss_account_no, current.and_then(|p| p.toss_account_no.as_ref())),
        )
    }
}

/// Show the user's profile, after applying `edit` if it changes anything.
pub async fn profile(backend: Arc<dyn Backend>, user_id: UserId, edit: ProfileEdit) -> Result<()> {
    let current = backend.fetch_profile(user_id).await?;
    let profile = if edit.is_empty() {
        current.ok_or_else(|| anyhow::anyhow!("no profile for {}", user_id))?
    } else {
        let update = edit.apply(current.as_ref());
        let stored = backend.update_profile(user_id, &update).await?;
        info!(user_id = %user_id, "profile saved");
        stored
    };
    println!("{}", profile_lines(&profile));
    Ok(())
}

fn profile_lines(profile: &Profile) -> String {
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".into());
    [
        format!("name          {}", field(&profile.full_name)),
        format!("phone         {}", field(&profile.phone_number)),
        format!("paypal        {}", field(&profile.paypal_id)),
        format!("toss bank     {}", field(&profile.toss_bank_name)),
        format!("toss account  {}", field(&profile.toss_account_no)),
    ]
    .join("\n")
}

/// The rooms the seeding command inserts, departing 2, 4 and 6 hours out.
pub fn sample_rooms(now: DateTime<Utc>) -> Vec<Room> {
    [
        (Location::PyeongtaekStation, Location::WalkingGate, 2, 4),
        (Location::WalkingGate, Location::PyeongtaekStation, 4, 3),
        (Location::Cpx, Location::PyeongtaekStation, 6, 4),
    ]
    .into_iter()
    .map(|(origin, destination, hours, capacity)| Room {
        id: Uuid::new_v4(),
        created_at: None,
        origin,
        destination,
        departure_time: now + Duration::hours(hours),
        capacity,
        status: RoomStatus::Recruiting,
        host_id: None,
    })
    .collect()
}

pub async fn seed_local(local: &LocalBackend) -> Result<()> {
    for room in sample_rooms(Utc::now()) {
        let route = format!("{} -> {}", room.origin, room.destination);
        let room_id = local.insert_room(room).await?;
        println!("created {}  {}", room_id, route);
    }
    Ok(())
}

pub async fn seed_remote(remote: &RemoteBackend) -> Result<()> {
    let mut failed = 0;
    for room in sample_rooms(Utc::now()) {
        let route = format!("{} -> {}", room.origin, room.destination);
        match remote.rest().insert("rooms", &room).await {
            Ok(()) => println!("created {}  {}", room.id, route),
            Err(e) => {
                failed += 1;
                eprintln!("failed {}: {}", route, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of the sample rooms were not created", failed);
    }
    Ok(())
}

pub async fn check(remote: &RemoteBackend) -> Result<()> {
    let mut failed = Vec::new();
    for table in CHECKED_TABLES {
        match remote.rest().sample_row(table).await {
            Ok(rows) => println!("ok      {} ({} row sampled)", table, rows),
            Err(e) => {
                println!("FAILED  {}: {}", table, e);
                failed.push(table);
            }
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("unreachable tables: {}", failed.join(", "));
    }
    Ok(())
}
