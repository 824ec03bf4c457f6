use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Location, RoomId, UserId};

// -- Rooms --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub origin: Location,
    pub destination: Location,
    pub departure_time: DateTime<Utc>,
    pub capacity: u32,
}

/// Arguments of the `create_room` procedure.
#[derive(Debug, Serialize)]
pub struct CreateRoomParams {
    pub p_start_point: Location,
    pub p_end_point: Location,
    pub p_departure_time: DateTime<Utc>,
    pub p_capacity: u32,
}

impl From<&CreateRoomRequest> for CreateRoomParams {
    fn from(req: &CreateRoomRequest) -> Self {
        Self {
            p_start_point: req.origin,
            p_end_point: req.destination,
            p_departure_time: req.departure_time,
            p_capacity: req.capacity,
        }
    }
}

/// Arguments of the `join_room` and `leave_room` procedures.
#[derive(Debug, Serialize)]
pub struct RoomParams {
    pub p_room_id: RoomId,
}

// -- Profiles --

/// Editable profile fields. Sent as a whole, so a cleared field is written
/// back as null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub paypal_id: Option<String>,
    pub toss_bank_name: Option<String>,
    pub toss_account_no: Option<String>,
}

impl ProfileUpdate {
    /// Trims every field and turns blanks into `None`.
    pub fn new(
        full_name: Option<String>,
        paypal_id: Option<String>,
        toss_bank_name: Option<String>,
        toss_account_no: Option<String>,
    ) -> Self {
        Self {
            full_name: non_blank(full_name),
            paypal_id: non_blank(paypal_id),
            toss_bank_name: non_blank(toss_bank_name),
            toss_account_no: non_blank(toss_account_no),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// -- Messages --

#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
}

// -- Errors --

/// Error body returned by the REST layer on rejected requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}
