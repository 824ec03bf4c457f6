use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use carpool_types::api::{CreateRoomRequest, NewMessage, ProfileUpdate};
use carpool_types::{
    Change, ChangeEvent, Membership, MessageId, MessageView, Profile, Room, RoomId, RoomStatus,
    UserId,
};

use crate::models::{MessageRow, RoomRow, format_ts};
use crate::{Database, Rejected};

const ROOM_COLUMNS: &str =
    "id, created_at, start_point, end_point, departure_time, capacity, status, host_id";

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.user_id, p.full_name, m.content, m.created_at
     FROM messages m
     LEFT JOIN profiles p ON m.user_id = p.id";

impl Database {
    // -- Profiles --

    pub fn upsert_profile(&self, id: UserId, full_name: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, full_name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET full_name = excluded.full_name",
                (id.to_string(), full_name),
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: UserId) -> Result<Option<Profile>> {
        self.with_conn(|conn| query_profile(conn, id))
    }

    /// Write the editable fields of a profile, creating the row if needed.
    /// The phone number is left as it was.
    pub fn update_profile(&self, id: UserId, update: &ProfileUpdate) -> Result<Profile> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, full_name, paypal_id, toss_bank_name, toss_account_no)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    full_name = excluded.full_name,
                    paypal_id = excluded.paypal_id,
                    toss_bank_name = excluded.toss_bank_name,
                    toss_account_no = excluded.toss_account_no",
                (
                    id.to_string(),
                    update.full_name.as_deref(),
                    update.paypal_id.as_deref(),
                    update.toss_bank_name.as_deref(),
                    update.toss_account_no.as_deref(),
                ),
            )?;
            query_profile(conn, id)?.ok_or_else(|| anyhow::anyhow!("profile {} vanished after write", id))
        })
    }

    // -- Rooms --

    pub fn get_rooms_by_status(&self, status: RoomStatus) -> Result<Vec<Room>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM rooms WHERE status = ?1 ORDER BY departure_time ASC",
                ROOM_COLUMNS
            ))?;
            let rows = stmt
                .query_map([status.as_str()], map_room_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(RoomRow::into_room).collect()
        })
    }

    pub fn get_room(&self, id: RoomId) -> Result<Option<Room>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    /// Insert a fully formed room row without a host, the way the seeding
    /// script does.
    pub fn insert_room(&self, room: &Room) -> Result<ChangeEvent> {
        self.with_conn(|conn| {
            let mut stored = room.clone();
            if stored.created_at.is_none() {
                stored.created_at = Some(Utc::now());
            }
            write_room(conn, &stored)?;
            Ok(ChangeEvent::Room(Change::insert(stored)))
        })
    }

    /// Create a room hosted by `host_id`, who takes the first seat.
    pub fn create_room(
        &self,
        host_id: UserId,
        req: &CreateRoomRequest,
        now: DateTime<Utc>,
    ) -> Result<(RoomId, Vec<ChangeEvent>)> {
        self.with_tx(|tx| {
            let room = Room {
                id: Uuid::new_v4(),
                created_at: Some(now),
                origin: req.origin,
                destination: req.destination,
                departure_time: req.departure_time,
                capacity: req.capacity,
                status: RoomStatus::Recruiting,
                host_id: Some(host_id),
            };
            write_room(tx, &room)?;

            let seat = Membership {
                room_id: room.id,
                user_id: host_id,
            };
            insert_member(tx, seat, now)?;

            let mut events = vec![
                ChangeEvent::Room(Change::insert(room.clone())),
                ChangeEvent::Membership(Change::insert(seat)),
            ];
            if room.capacity <= 1 {
                events.push(update_status(tx, &room, RoomStatus::Full)?);
            }
            Ok((room.id, events))
        })
    }

    /// Returns `None` if the room does not exist.
    pub fn set_room_status(&self, id: RoomId, status: RoomStatus) -> Result<Option<ChangeEvent>> {
        self.with_tx(|tx| match query_room(tx, id)? {
            Some(room) => update_status(tx, &room, status).map(Some),
            None => Ok(None),
        })
    }

    /// Delete a room together with its seats and messages.
    pub fn delete_room(&self, id: RoomId) -> Result<Vec<ChangeEvent>> {
        self.with_tx(|tx| {
            let Some(room) = query_room(tx, id)? else {
                return Ok(vec![]);
            };

            let mut events: Vec<ChangeEvent> = query_members(tx, id)?
                .into_iter()
                .map(|m| ChangeEvent::Membership(Change::delete(m)))
                .collect();

            tx.execute("DELETE FROM rooms WHERE id = ?1", [id.to_string()])?;
            events.push(ChangeEvent::Room(Change::delete(room)));
            Ok(events)
        })
    }

    // -- Memberships --

    pub fn member_count(&self, room_id: RoomId) -> Result<u32> {
        self.with_conn(|conn| count_members(conn, room_id))
    }

    /// Batch-count seats for a set of rooms. Rooms without members are absent.
    pub fn member_counts(&self, room_ids: &[RoomId]) -> Result<HashMap<RoomId, u32>> {
        if room_ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=room_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT room_id, COUNT(*) FROM room_members WHERE room_id IN ({}) GROUP BY room_id",
                placeholders.join(", ")
            );

            let ids: Vec<String> = room_ids.iter().map(|id| id.to_string()).collect();
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, count)| Ok((Uuid::parse_str(&id)?, count)))
                .collect()
        })
    }

    pub fn memberships_of(&self, user_id: UserId) -> Result<Vec<Membership>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT room_id FROM room_members WHERE user_id = ?1")?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|room_id| {
                    Ok(Membership {
                        room_id: Uuid::parse_str(&room_id)?,
                        user_id,
                    })
                })
                .collect()
        })
    }

    /// Take a seat. The room flips to `full` when the last seat is taken.
    pub fn join_room(&self, room_id: RoomId, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<ChangeEvent>> {
        self.with_tx(|tx| {
            let room = query_room(tx, room_id)?.ok_or_else(|| Rejected("room not found".into()))?;
            if room.status != RoomStatus::Recruiting {
                return Err(Rejected("room is not recruiting".into()).into());
            }

            let seat = Membership { room_id, user_id };
            if is_member(tx, seat)? {
                return Err(Rejected("already joined this room".into()).into());
            }
            let count = count_members(tx, room_id)?;
            if count >= room.capacity {
                return Err(Rejected("room is full".into()).into());
            }

            insert_member(tx, seat, now)?;
            let mut events = vec![ChangeEvent::Membership(Change::insert(seat))];
            if count + 1 >= room.capacity {
                events.push(update_status(tx, &room, RoomStatus::Full)?);
            }
            Ok(events)
        })
    }

    /// Give up a seat. A `full` room goes back to `recruiting`.
    pub fn leave_room(&self, room_id: RoomId, user_id: UserId) -> Result<Vec<ChangeEvent>> {
        self.with_tx(|tx| {
            let room = query_room(tx, room_id)?.ok_or_else(|| Rejected("room not found".into()))?;

            let seat = Membership { room_id, user_id };
            if !is_member(tx, seat)? {
                return Err(Rejected("not a member of this room".into()).into());
            }

            tx.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                (room_id.to_string(), user_id.to_string()),
            )?;
            let mut events = vec![ChangeEvent::Membership(Change::delete(seat))];
            if room.status == RoomStatus::Full && count_members(tx, room_id)? < room.capacity {
                events.push(update_status(tx, &room, RoomStatus::Recruiting)?);
            }
            Ok(events)
        })
    }

    // -- Messages --

    /// All messages of a room, newest first.
    pub fn get_messages(&self, room_id: RoomId) -> Result<Vec<MessageView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE m.room_id = ?1 ORDER BY m.created_at DESC, m.id DESC",
                MESSAGE_SELECT
            ))?;
            let rows = stmt
                .query_map([room_id.to_string()], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(MessageRow::into_view).collect()
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<MessageView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE m.id = ?1", MESSAGE_SELECT))?;
            stmt.query_row([id.to_string()], map_message_row)
                .optional()?
                .map(MessageRow::into_view)
                .transpose()
        })
    }

    /// Store a message from a seated member.
    pub fn insert_message(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<ChangeEvent> {
        self.with_tx(|tx| {
            if query_room(tx, message.room_id)?.is_none() {
                return Err(Rejected("room not found".into()).into());
            }
            let seat = Membership {
                room_id: message.room_id,
                user_id: message.user_id,
            };
            if !is_member(tx, seat)? {
                return Err(Rejected("not a member of this room".into()).into());
            }

            let row = MessageRow {
                id: Uuid::new_v4().to_string(),
                room_id: message.room_id.to_string(),
                user_id: message.user_id.to_string(),
                author_name: None,
                content: message.content.clone(),
                created_at: format_ts(now),
            };
            tx.execute(
                "INSERT INTO messages (id, room_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (&row.id, &row.room_id, &row.user_id, &row.content, &row.created_at),
            )?;
            Ok(ChangeEvent::Message(Change::insert(row.into_record()?)))
        })
    }
}

fn map_room_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        start_point: row.get(2)?,
        end_point: row.get(3)?,
        departure_time: row.get(4)?,
        capacity: row.get(5)?,
        status: row.get(6)?,
        host_id: row.get(7)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        author_name: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn query_profile(conn: &Connection, id: UserId) -> Result<Option<Profile>> {
    conn.query_row(
        "SELECT full_name, phone_number, paypal_id, toss_bank_name, toss_account_no
         FROM profiles WHERE id = ?1",
        [id.to_string()],
        |row| {
            Ok(Profile {
                id,
                full_name: row.get(0)?,
                phone_number: row.get(1)?,
                paypal_id: row.get(2)?,
                toss_bank_name: row.get(3)?,
                toss_account_no: row.get(4)?,
            })
        },
    )
    .optional()
}

fn query_room(conn: &Connection, id: RoomId) -> Result<Option<Room>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM rooms WHERE id = ?1", ROOM_COLUMNS))?;
    stmt.query_row([id.to_string()], map_room_row)
        .optional()?
        .map(RoomRow::into_room)
        .transpose()
}

fn write_room(conn: &Connection, room: &Room) -> Result<()> {
    let created_at = format_ts(room.created_at.unwrap_or_else(Utc::now));
    conn.execute(
        "INSERT INTO rooms (id, created_at, start_point, end_point, departure_time, capacity, status, host_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            room.id.to_string(),
            created_at,
            room.origin.name(),
            room.destination.name(),
            format_ts(room.departure_time),
            room.capacity,
            room.status.as_str(),
            room.host_id.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

fn update_status(conn: &Connection, room: &Room, status: RoomStatus) -> Result<ChangeEvent> {
    conn.execute(
        "UPDATE rooms SET status = ?1 WHERE id = ?2",
        (status.as_str(), room.id.to_string()),
    )?;
    let mut after = room.clone();
    after.status = status;
    Ok(ChangeEvent::Room(Change::update(Some(room.clone()), after)))
}

fn query_members(conn: &Connection, room_id: RoomId) -> Result<Vec<Membership>> {
    let mut stmt = conn.prepare("SELECT user_id FROM room_members WHERE room_id = ?1")?;
    let rows = stmt
        .query_map([room_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|user_id| {
            Ok(Membership {
                room_id,
                user_id: Uuid::parse_str(&user_id)?,
            })
        })
        .collect()
}

fn count_members(conn: &Connection, room_id: RoomId) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM room_members WHERE room_id = ?1",
        [room_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn is_member(conn: &Connection, seat: Membership) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            (seat.room_id.to_string(), seat.user_id.to_string()),
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_member(conn: &Connection, seat: Membership, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        (seat.room_id.to_string(), seat.user_id.to_string(), format_ts(now)),
    )?;
    Ok(())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carpool_types::Location;
    use chrono::Duration;

    fn request(capacity: u32) -> CreateRoomRequest {
        CreateRoomRequest {
            origin: Location::PyeongtaekStation,
            destination: Location::MainGate,
            departure_time: Utc::now() + Duration::hours(2),
            capacity,
        }
    }

    fn rejection(err: anyhow::Error) -> String {
        err.downcast::<Rejected>().expect("expected a rule rejection").0
    }

    #[test]
    fn test_create_room_seats_the_host() {
        let db = Database::open_in_memory().unwrap();
        let host = Uuid::new_v4();

        let (room_id, events) = db.create_room(host, &request(3), Utc::now()).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(db.member_count(room_id).unwrap(), 1);
        let room = db.get_room(room_id).unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Recruiting);
        assert_eq!(room.host_id, Some(host));
        assert_eq!(room.origin, Location::PyeongtaekStation);
    }

    #[test]
    fn test_join_enforces_room_rules() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = db.create_room(Uuid::new_v4(), &request(2), Utc::now()).unwrap();
        let rider = Uuid::new_v4();

        let events = db.join_room(room_id, rider, Utc::now()).unwrap();
        assert_eq!(events.len(), 2, "last seat flips the room to full");
        assert_eq!(db.get_room(room_id).unwrap().unwrap().status, RoomStatus::Full);

        let again = db.join_room(room_id, rider, Utc::now()).unwrap_err();
        assert_eq!(rejection(again), "room is not recruiting");

        db.set_room_status(room_id, RoomStatus::Recruiting).unwrap();
        let dup = db.join_room(room_id, rider, Utc::now()).unwrap_err();
        assert_eq!(rejection(dup), "already joined this room");
        let over = db.join_room(room_id, Uuid::new_v4(), Utc::now()).unwrap_err();
        assert_eq!(rejection(over), "room is full");
    }

    #[test]
    fn test_leaving_a_full_room_reopens_it() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = db.create_room(Uuid::new_v4(), &request(2), Utc::now()).unwrap();
        let rider = Uuid::new_v4();
        db.join_room(room_id, rider, Utc::now()).unwrap();

        let events = db.leave_room(room_id, rider).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(db.get_room(room_id).unwrap().unwrap().status, RoomStatus::Recruiting);

        let err = db.leave_room(room_id, rider).unwrap_err();
        assert_eq!(rejection(err), "not a member of this room");
    }

    #[test]
    fn test_member_counts_skip_empty_rooms() {
        let db = Database::open_in_memory().unwrap();
        let (busy, _) = db.create_room(Uuid::new_v4(), &request(4), Utc::now()).unwrap();
        db.join_room(busy, Uuid::new_v4(), Utc::now()).unwrap();

        let mut empty = db.get_room(busy).unwrap().unwrap();
        empty.id = Uuid::new_v4();
        empty.host_id = None;
        db.insert_room(&empty).unwrap();

        let counts = db.member_counts(&[busy, empty.id]).unwrap();
        assert_eq!(counts.get(&busy), Some(&2));
        assert!(!counts.contains_key(&empty.id));
    }

    #[test]
    fn test_profile_update_keeps_phone_and_clears_payees() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        assert_eq!(db.get_profile(user).unwrap(), None);

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, full_name, phone_number, paypal_id) VALUES (?1, 'Park', '010-1234-5678', 'park')",
                [user.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        let update = ProfileUpdate::new(Some("Park Jiwoo".into()), Some("".into()), Some("KB".into()), Some("123-45".into()));
        let stored = db.update_profile(user, &update).unwrap();

        assert_eq!(stored.full_name.as_deref(), Some("Park Jiwoo"));
        assert_eq!(stored.phone_number.as_deref(), Some("010-1234-5678"));
        assert_eq!(stored.paypal_id, None);
        assert_eq!(stored.toss_bank_name.as_deref(), Some("KB"));
        assert_eq!(db.get_profile(user).unwrap(), Some(stored));
    }

    #[test]
    fn test_messages_join_author_names() {
        let db = Database::open_in_memory().unwrap();
        let named = Uuid::new_v4();
        let anonymous = Uuid::new_v4();
        db.upsert_profile(named, Some("Park")).unwrap();
        let (room_id, _) = db.create_room(named, &request(4), Utc::now()).unwrap();
        db.join_room(room_id, anonymous, Utc::now()).unwrap();

        let start = Utc::now();
        for (i, author) in [named, anonymous].into_iter().enumerate() {
            let msg = NewMessage {
                room_id,
                user_id: author,
                content: format!("message {}", i),
            };
            db.insert_message(&msg, start + Duration::seconds(i as i64)).unwrap();
        }

        let messages = db.get_messages(room_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author_display_name, "Unknown User");
        assert_eq!(messages[1].author_display_name, "Park");

        let outsider = NewMessage {
            room_id,
            user_id: Uuid::new_v4(),
            content: "hello?".into(),
        };
        let err = db.insert_message(&outsider, Utc::now()).unwrap_err();
        assert_eq!(rejection(err), "not a member of this room");
    }

    #[test]
    fn test_delete_room_reports_seat_removals() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = db.create_room(Uuid::new_v4(), &request(4), Utc::now()).unwrap();
        db.join_room(room_id, Uuid::new_v4(), Utc::now()).unwrap();

        let events = db.delete_room(room_id).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                carpool_types::EntityKind::Membership,
                carpool_types::EntityKind::Membership,
                carpool_types::EntityKind::Room
            ]
        );
        assert!(db.get_room(room_id).unwrap().is_none());
        assert_eq!(db.member_count(room_id).unwrap(), 0);
        assert!(db.delete_room(room_id).unwrap().is_empty());
    }
}
