// Tripbeacon Wire Protocol
//
// JSON text frames exchanged with the tracking server over the duplex channel.
//
// Protocol flow:
// 1. Transport connects; server sends "welcome" with our peer id
// 2. Client sends "join_group" and waits for the matching "ack"
// 3. Server pushes "group_locations" (snapshot), then "location_update",
//    "user_joined" and "user_left" deltas while the membership lasts
// 4. Client streams "update_location" fire-and-forget; "leave_group" is
//    best-effort and its ack is not awaited

use serde::{Deserialize, Serialize};

/// A single device position, stamped in epoch milliseconds.
///
/// Samples are transient: each new one fully replaces the previous, none are
/// queued or retained for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: i64,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            lat,
            lng,
            timestamp,
        }
    }

    /// Stamp a sample with the current wall clock
    pub fn now(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A peer's last-known location, as carried by snapshot and update frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLocation {
    /// Server-assigned session identifier of the peer
    pub peer_id: String,

    /// Display name the peer joined with
    pub username: String,

    #[serde(flatten)]
    pub last_sample: LocationSample,
}

/// Outbound frame from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Request/response join; `id` correlates the ack
    #[serde(rename = "join_group")]
    JoinGroup {
        id: String,
        group_id: String,
        username: String,
    },

    /// Best-effort leave notification; the client does not wait for its ack
    #[serde(rename = "leave_group")]
    LeaveGroup { id: String },

    /// Fire-and-forget position broadcast; a lost sample is superseded by the
    /// next one within seconds
    #[serde(rename = "update_location")]
    UpdateLocation(LocationSample),
}

/// Inbound frame from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// First frame after connect; carries our own peer id
    #[serde(rename = "welcome")]
    Welcome(WelcomePayload),

    /// Response to join_group / leave_group
    #[serde(rename = "ack")]
    Ack(AckPayload),

    /// Full presence snapshot, sent on (re)join
    #[serde(rename = "group_locations")]
    GroupLocations(Vec<PeerLocation>),

    /// Incremental update for a single peer
    #[serde(rename = "location_update")]
    LocationUpdate(PeerLocation),

    /// A peer entered the group (it may not have reported a location yet)
    #[serde(rename = "user_joined")]
    UserJoined {
        peer_id: String,
        username: String,
        group_id: String,
    },

    /// A peer left the group
    #[serde(rename = "user_left")]
    UserLeft { peer_id: String },
}

/// Welcome payload (first frame on a fresh link)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    /// Server-assigned session identifier for this client
    pub peer_id: String,
}

/// Ack status flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Acknowledgement for a request/response exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Correlation id from the originating request
    pub id: String,

    pub status: AckStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Group size as seen by the server at join time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members_count: Option<u32>,

    /// Server rejection text, returned to the caller verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckPayload {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Success,
            group_id: None,
            username: None,
            members_count: None,
            message: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Error,
            group_id: None,
            username: None,
            members_count: None,
            message: Some(message.into()),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>, username: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self.username = Some(username.into());
        self
    }

    pub fn with_members_count(mut self, count: u32) -> Self {
        self.members_count = Some(count);
        self
    }
}
