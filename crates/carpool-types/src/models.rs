use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub type RoomId = Uuid;
pub type UserId = Uuid;
pub type MessageId = Uuid;

/// Display name used for message authors without a profile name.
pub const UNKNOWN_AUTHOR: &str = "Unknown User";

// -- Locations --

/// Pickup and drop-off points. Rooms can only be created between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    #[serde(rename = "Pyeongtaek Station")]
    PyeongtaekStation,
    #[serde(rename = "Walking Gate")]
    WalkingGate,
    #[serde(rename = "CPX")]
    Cpx,
    #[serde(rename = "Main Gate")]
    MainGate,
    #[serde(rename = "BX")]
    Bx,
}

impl Location {
    pub const ALL: [Location; 5] = [
        Location::PyeongtaekStation,
        Location::WalkingGate,
        Location::Cpx,
        Location::MainGate,
        Location::Bx,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Location::PyeongtaekStation => "Pyeongtaek Station",
            Location::WalkingGate => "Walking Gate",
            Location::Cpx => "CPX",
            Location::MainGate => "Main Gate",
            Location::Bx => "BX",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLocation(pub String);

impl fmt::Display for UnknownLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Location::ALL.iter().map(|l| l.name()).collect();
        write!(f, "unknown location '{}' (expected one of: {})", self.0, names.join(", "))
    }
}

impl std::error::Error for UnknownLocation {}

impl FromStr for Location {
    type Err = UnknownLocation;

    /// Accepts the display name in any case, or its kebab-case form (`walking-gate`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', " ");
        Location::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| UnknownLocation(s.to_string()))
    }
}

// -- Rooms --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Recruiting,
    Full,
    InProgress,
    Completed,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Recruiting => "recruiting",
            RoomStatus::Full => "full",
            RoomStatus::InProgress => "in_progress",
            RoomStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recruiting" => Ok(RoomStatus::Recruiting),
            "full" => Ok(RoomStatus::Full),
            "in_progress" => Ok(RoomStatus::InProgress),
            "completed" => Ok(RoomStatus::Completed),
            other => Err(format!("unknown room status '{}'", other)),
        }
    }
}

/// A room row as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(default, deserialize_with = "optional_timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "start_point")]
    pub origin: Location,
    #[serde(rename = "end_point")]
    pub destination: Location,
    #[serde(deserialize_with = "timestamp")]
    pub departure_time: DateTime<Utc>,
    pub capacity: u32,
    pub status: RoomStatus,
    #[serde(default)]
    pub host_id: Option<UserId>,
}

/// A room as shown in the recruiting listing.
///
/// `participant_count` and `is_viewer_member` are derived from membership rows;
/// room events never carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub participant_count: u32,
    pub is_viewer_member: bool,
}

impl RoomView {
    pub fn new(room: Room, participant_count: u32, is_viewer_member: bool) -> Self {
        Self {
            room,
            participant_count,
            is_viewer_member,
        }
    }

    pub fn id(&self) -> RoomId {
        self.room.id
    }

    pub fn seats_left(&self) -> u32 {
        self.room.capacity.saturating_sub(self.participant_count)
    }
}

// -- Memberships --

/// One occupied seat. Identified only by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
}

// -- Profiles --

/// A user's profile. The payee fields say where riders send a fare share
/// when this user hosts a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub paypal_id: Option<String>,
    #[serde(default)]
    pub toss_bank_name: Option<String>,
    #[serde(default)]
    pub toss_account_no: Option<String>,
}

// -- Messages --

/// A message row, as carried by message change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// A message joined with its author's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl MessageView {
    pub fn from_record(record: MessageRecord, author_name: Option<String>) -> Self {
        Self {
            id: record.id,
            room_id: record.room_id,
            author_id: record.user_id,
            author_display_name: author_name.unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            body: record.content,
            created_at: record.created_at,
        }
    }
}

// -- Timestamps --

/// Parse a backend timestamp.
///
/// Accepts RFC 3339 as well as the space-separated and offset-less forms
/// Postgres emits for `timestamp`/`timestamptz` columns. Offset-less values
/// are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ndt.and_utc());
        }
    }
    None
}

fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}

fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
        None => Ok(None),
    }
}
