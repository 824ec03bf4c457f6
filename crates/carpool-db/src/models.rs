//! Database row types. These map directly to SQLite rows and are converted
//! into the shared carpool types at the query boundary.

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use carpool_types::models::parse_timestamp;
use carpool_types::{MessageRecord, MessageView, Room};

pub struct RoomRow {
    pub id: String,
    pub created_at: String,
    pub start_point: String,
    pub end_point: String,
    pub departure_time: String,
    pub capacity: i64,
    pub status: String,
    pub host_id: Option<String>,
}

impl RoomRow {
    pub fn into_room(self) -> Result<Room> {
        Ok(Room {
            id: parse_id(&self.id)?,
            created_at: Some(parse_ts(&self.created_at)?),
            origin: self.start_point.parse()?,
            destination: self.end_point.parse()?,
            departure_time: parse_ts(&self.departure_time)?,
            capacity: u32::try_from(self.capacity)?,
            status: self.status.parse().map_err(|e: String| anyhow!(e))?,
            host_id: self.host_id.as_deref().map(parse_id).transpose()?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub author_name: Option<String>,
    pub content: String,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_record(self) -> Result<MessageRecord> {
        Ok(MessageRecord {
            id: parse_id(&self.id)?,
            room_id: parse_id(&self.room_id)?,
            user_id: parse_id(&self.user_id)?,
            content: self.content,
            created_at: parse_ts(&self.created_at)?,
        })
    }

    pub fn into_view(mut self) -> Result<MessageView> {
        let author_name = self.author_name.take();
        Ok(MessageView::from_record(self.into_record()?, author_name))
    }
}

/// Fixed-width UTC timestamps, so string order is time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| anyhow!("invalid timestamp in database: {}", raw))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| anyhow!("invalid id in database '{}': {}", raw, e))
}
