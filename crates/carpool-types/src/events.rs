use serde::{Deserialize, Serialize};

use crate::models::{Membership, MessageRecord, Room, RoomId, RoomStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row change: `after` is set for insert/update, `before` for update/delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<T> {
    pub operation: Operation,
    pub before: Option<T>,
    pub after: Option<T>,
}

impl<T> Change<T> {
    pub fn insert(after: T) -> Self {
        Self {
            operation: Operation::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: Option<T>, after: T) -> Self {
        Self {
            operation: Operation::Update,
            before,
            after: Some(after),
        }
    }

    pub fn delete(before: T) -> Self {
        Self {
            operation: Operation::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// The row this change is about: `after` for insert/update, `before` for delete.
    pub fn record(&self) -> Option<&T> {
        match self.operation {
            Operation::Insert | Operation::Update => self.after.as_ref(),
            Operation::Delete => self.before.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Room,
    Membership,
    Message,
}

impl EntityKind {
    /// Backing table name.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Room => "rooms",
            EntityKind::Membership => "room_members",
            EntityKind::Message => "messages",
        }
    }
}

/// Change notifications delivered by an event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "change", rename_all = "lowercase")]
pub enum ChangeEvent {
    Room(Change<Room>),
    Membership(Change<Membership>),
    Message(Change<MessageRecord>),
}

impl ChangeEvent {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Room(_) => EntityKind::Room,
            Self::Membership(_) => EntityKind::Membership,
            Self::Message(_) => EntityKind::Message,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Room(c) => c.operation,
            Self::Membership(c) => c.operation,
            Self::Message(c) => c.operation,
        }
    }
}

/// Filter predicate a subscription is scoped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Room rows, optionally only those whose status matches.
    Rooms { status: Option<RoomStatus> },
    /// Membership rows, optionally for one room.
    Memberships { room_id: Option<RoomId> },
    /// Message inserts for one room.
    Messages { room_id: RoomId },
}

impl Scope {
    pub fn kind(&self) -> EntityKind {
        match self {
            Scope::Rooms { .. } => EntityKind::Room,
            Scope::Memberships { .. } => EntityKind::Membership,
            Scope::Messages { .. } => EntityKind::Message,
        }
    }

    /// Whether the event falls inside this scope.
    ///
    /// Row filters are evaluated against `record()`, except that an update
    /// leaving a status filter still matches through its `before` row, so
    /// subscribers see rows moving out of the filtered set.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (Scope::Rooms { status }, ChangeEvent::Room(change)) => match status {
                None => true,
                Some(status) => [change.before.as_ref(), change.after.as_ref()]
                    .into_iter()
                    .flatten()
                    .any(|room| room.status == *status),
            },
            (Scope::Memberships { room_id }, ChangeEvent::Membership(change)) => match room_id {
                None => true,
                Some(room_id) => change.record().is_some_and(|m| m.room_id == *room_id),
            },
            (Scope::Messages { room_id }, ChangeEvent::Message(change)) => {
                change.operation == Operation::Insert
                    && change.record().is_some_and(|m| m.room_id == *room_id)
            }
            _ => false,
        }
    }

    /// Short label used for channel topics and logs.
    pub fn topic(&self) -> String {
        match self {
            Scope::Rooms { status: None } => "rooms".to_string(),
            Scope::Rooms { status: Some(status) } => format!("rooms:status={}", status),
            Scope::Memberships { room_id: None } => "room_members".to_string(),
            Scope::Memberships { room_id: Some(id) } => format!("room_members:room_id={}", id),
            Scope::Messages { room_id } => format!("messages:room_id={}", room_id),
        }
    }
}
