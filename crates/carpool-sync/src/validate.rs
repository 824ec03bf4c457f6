//! Client-side checks run before a mutation is sent.

use chrono::{DateTime, Utc};

use carpool_types::api::CreateRoomRequest;

use crate::error::{SyncError, SyncResult};

pub const MIN_CAPACITY: u32 = 1;
pub const MAX_CAPACITY: u32 = 10;

pub fn validate_new_room(req: &CreateRoomRequest, now: DateTime<Utc>) -> SyncResult<()> {
    if req.origin == req.destination {
        return Err(SyncError::InvalidInput(
            "origin and destination must be different places".into(),
        ));
    }
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&req.capacity) {
        return Err(SyncError::InvalidInput(format!(
            "capacity must be between {} and {}, got {}",
            MIN_CAPACITY, MAX_CAPACITY, req.capacity
        )));
    }
    if req.departure_time <= now {
        return Err(SyncError::InvalidInput(
            "departure time must be in the future".into(),
        ));
    }
    Ok(())
}

pub fn validate_message_body(body: &str) -> SyncResult<()> {
    if body.trim().is_empty() {
        return Err(SyncError::InvalidInput("message body is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carpool_types::Location;
    use chrono::Duration;

    fn request(capacity: u32, in_minutes: i64) -> CreateRoomRequest {
        CreateRoomRequest {
            origin: Location::MainGate,
            destination: Location::PyeongtaekStation,
            departure_time: Utc::now() + Duration::minutes(in_minutes),
            capacity,
        }
    }

    #[test]
    fn test_accepts_a_reasonable_room() {
        assert!(validate_new_room(&request(4, 60), Utc::now()).is_ok());
        assert!(validate_new_room(&request(MAX_CAPACITY, 1), Utc::now()).is_ok());
    }

    #[test]
    fn test_rejects_same_endpoints() {
        let mut req = request(4, 60);
        req.destination = req.origin;
        assert!(matches!(
            validate_new_room(&req, Utc::now()),
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_capacity_out_of_range() {
        assert!(validate_new_room(&request(0, 60), Utc::now()).is_err());
        assert!(validate_new_room(&request(11, 60), Utc::now()).is_err());
    }

    #[test]
    fn test_rejects_past_departure() {
        let req = request(4, -5);
        assert!(matches!(
            validate_new_room(&req, Utc::now()),
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_blank_messages_are_rejected() {
        assert!(validate_message_body("  \n").is_err());
        assert!(validate_message_body("see you at the gate").is_ok());
    }
}
