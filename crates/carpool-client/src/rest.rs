//! PostgREST client for snapshot reads, point reads and mutations.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use carpool_sync::{PointReader, RemoteMutations, SnapshotFetcher, SyncError, SyncResult};
use carpool_types::api::{
    BackendErrorBody, CreateRoomParams, CreateRoomRequest, NewMessage, ProfileUpdate, RoomParams,
};
use carpool_types::{
    Membership, MessageId, MessageRecord, MessageView, Profile, Room, RoomId, RoomStatus, UserId,
};

use crate::config::ClientConfig;

/// Profile columns a client may read.
const PROFILE_SELECT: &str =
    "select=id,full_name,phone_number,paypal_id,toss_bank_name,toss_account_no";

/// Message columns plus the author's profile name.
const MESSAGE_SELECT: &str = "select=*,profiles(full_name)";

/// A `messages` row with its embedded author profile.
#[derive(Debug, Deserialize)]
struct MessageRow {
    #[serde(flatten)]
    record: MessageRecord,
    #[serde(default)]
    profiles: Option<ProfileName>,
}

#[derive(Debug, Deserialize)]
struct ProfileName {
    #[serde(default)]
    full_name: Option<String>,
}

impl MessageRow {
    fn into_view(self) -> MessageView {
        let author_name = self.profiles.and_then(|p| p.full_name);
        MessageView::from_record(self.record, author_name)
    }
}

/// A room id with its seat count aggregated server side.
#[derive(Debug, Deserialize)]
struct RoomMemberCount {
    id: RoomId,
    #[serde(default)]
    room_members: Vec<Aggregate>,
}

#[derive(Debug, Deserialize)]
struct Aggregate {
    count: u32,
}

impl RoomMemberCount {
    fn count(&self) -> u32 {
        self.room_members.first().map(|a| a.count).unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct RestClient {
    http_client: reqwest::Client,
    config: ClientConfig,
}

impl RestClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, self.config.rest_url(path))
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", self.config.bearer()))
    }

    /// GET a path and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        debug!(path, "GET");
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(SyncError::transport)?;
        let response = check_response(response).await?;
        response.json().await.map_err(SyncError::transport)
    }

    /// Row count of a filtered table, without transferring rows.
    pub async fn count(&self, path: &str) -> SyncResult<u32> {
        debug!(path, "HEAD count");
        let response = self
            .request(reqwest::Method::HEAD, path)
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(SyncError::transport)?;
        let response = check_response(response).await?;

        let range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SyncError::Transport("count response without Content-Range".into()))?;
        parse_content_range(range)
            .ok_or_else(|| SyncError::Transport(format!("unreadable Content-Range '{}'", range)))
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> SyncResult<reqwest::Response> {
        debug!(path, "POST");
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(SyncError::transport)?;
        check_response(response).await
    }

    /// Call a stored procedure, ignoring its result.
    pub async fn rpc<P: Serialize>(&self, name: &str, params: &P) -> SyncResult<()> {
        self.post(&format!("rpc/{}", name), params).await?;
        Ok(())
    }

    pub async fn rpc_returning<P: Serialize, R: DeserializeOwned>(&self, name: &str, params: &P) -> SyncResult<R> {
        let response = self.post(&format!("rpc/{}", name), params).await?;
        response.json().await.map_err(SyncError::transport)
    }

    /// PATCH the rows a filtered path selects and decode the updated rows.
    pub async fn patch<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> SyncResult<Vec<R>> {
        debug!(path, "PATCH");
        let response = self
            .request(reqwest::Method::PATCH, path)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(SyncError::transport)?;
        let response = check_response(response).await?;
        response.json().await.map_err(SyncError::transport)
    }

    pub async fn insert<B: Serialize>(&self, table: &str, body: &B) -> SyncResult<()> {
        self.post(table, body).await?;
        Ok(())
    }

    /// Fetch one row of a table, to confirm it is reachable and readable.
    pub async fn sample_row(&self, table: &str) -> SyncResult<usize> {
        let rows: Vec<serde_json::Value> = self.get_json(&format!("{}?select=*&limit=1", table)).await?;
        Ok(rows.len())
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("url", &self.config.url)
            .finish_non_exhaustive()
    }
}

/// Map a non-success response: 4xx is a rejection meant for the user,
/// anything else a transport failure.
async fn check_response(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = map_error(status, &body);
    match &err {
        SyncError::Domain(message) => warn!(status = status.as_u16(), message = %message, "request rejected"),
        _ => error!("Backend request failed: {} - {}", status, body),
    }
    Err(err)
}

fn map_error(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<BackendErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });

    if status.is_client_error() {
        SyncError::Domain(message)
    } else {
        SyncError::Transport(format!("{}: {}", status, message))
    }
}

/// Total from a `Content-Range` header: `0-9/42` or `*/0`.
fn parse_content_range(value: &str) -> Option<u32> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.parse().ok()
}

fn in_list(ids: &[RoomId]) -> String {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("in.({})", ids.join(","))
}

#[async_trait]
impl SnapshotFetcher for RestClient {
    async fn fetch_rooms(&self, status: RoomStatus) -> SyncResult<Vec<Room>> {
        self.get_json(&format!(
            "rooms?select=*&status=eq.{}&order=departure_time.asc",
            status
        ))
        .await
    }

    async fn fetch_member_counts(&self, room_ids: &[RoomId]) -> SyncResult<HashMap<RoomId, u32>> {
        if room_ids.is_empty() {
            return Ok(HashMap::new());
        }
        // One row per room, so the response stays small however many seats are taken
        let rows: Vec<RoomMemberCount> = self
            .get_json(&format!("rooms?select=id,room_members(count)&id={}", in_list(room_ids)))
            .await?;
        Ok(rows.into_iter().map(|row| (row.id, row.count())).collect())
    }

    async fn fetch_memberships(&self, user_id: UserId) -> SyncResult<Vec<Membership>> {
        self.get_json(&format!("room_members?select=room_id,user_id&user_id=eq.{}", user_id))
            .await
    }

    async fn fetch_messages(&self, room_id: RoomId) -> SyncResult<Vec<MessageView>> {
        let rows: Vec<MessageRow> = self
            .get_json(&format!(
                "messages?{}&room_id=eq.{}&order=created_at.desc",
                MESSAGE_SELECT, room_id
            ))
            .await?;
        Ok(rows.into_iter().map(MessageRow::into_view).collect())
    }

    async fn fetch_room(&self, room_id: RoomId) -> SyncResult<Option<Room>> {
        let rows: Vec<Room> = self.get_json(&format!("rooms?select=*&id=eq.{}", room_id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_profile(&self, user_id: UserId) -> SyncResult<Option<Profile>> {
        let rows: Vec<Profile> = self
            .get_json(&format!("profiles?{}&id=eq.{}", PROFILE_SELECT, user_id))
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl PointReader for RestClient {
    async fn member_count(&self, room_id: RoomId) -> SyncResult<u32> {
        self.count(&format!("room_members?select=room_id&room_id=eq.{}", room_id))
            .await
    }

    async fn message(&self, message_id: MessageId) -> SyncResult<Option<MessageView>> {
        let rows: Vec<MessageRow> = self
            .get_json(&format!("messages?{}&id=eq.{}", MESSAGE_SELECT, message_id))
            .await?;
        Ok(rows.into_iter().next().map(MessageRow::into_view))
    }
}

#[async_trait]
impl RemoteMutations for RestClient {
    async fn create_room(&self, req: &CreateRoomRequest) -> SyncResult<RoomId> {
        self.rpc_returning("create_room", &CreateRoomParams::from(req)).await
    }

    async fn join_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.rpc("join_room", &RoomParams { p_room_id: room_id }).await
    }

    async fn leave_room(&self, room_id: RoomId) -> SyncResult<()> {
        self.rpc("leave_room", &RoomParams { p_room_id: room_id }).await
    }

    async fn send_message(&self, message: &NewMessage) -> SyncResult<()> {
        self.insert("messages", message).await
    }

    async fn update_profile(&self, user_id: UserId, update: &ProfileUpdate) -> SyncResult<Profile> {
        // Row security filters out other users' rows, which then come back as no rows
        let rows: Vec<Profile> = self
            .patch(&format!("profiles?id=eq.{}&{}", user_id, PROFILE_SELECT), update)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("profile {}", user_id)))
    }
}
