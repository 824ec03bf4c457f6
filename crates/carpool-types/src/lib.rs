pub mod api;
pub mod events;
pub mod models;

pub use events::{Change, ChangeEvent, EntityKind, Operation, Scope};
pub use models::{
    Location, Membership, MessageId, MessageRecord, MessageView, Profile, Room, RoomId,
    RoomStatus, RoomView, UserId,
};
