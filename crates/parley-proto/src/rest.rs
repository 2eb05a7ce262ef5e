//! Message API request and response bodies.
//!
//! `POST {api}/messages/{roomId}` persists one message and answers with the
//! stored record; `GET {api}/messages/{roomId}` returns recent history,
//! oldest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId, UserId};

/// Default page size of a history request, matching the server.
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Authoritative message record returned by the message API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Durable id.
    pub id: MessageId,
    /// Room the message belongs to.
    #[serde(default)]
    pub room_id: RoomId,
    /// Author.
    #[serde(alias = "senderId")]
    pub user_id: UserId,
    /// Message body.
    pub content: String,
    /// Server persist time.
    pub created_at: DateTime<Utc>,
    /// Author display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Body of a durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageRequest {
    /// Message body.
    pub content: String,
}

/// Response to a successful durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageResponse {
    /// The stored record.
    pub content: StoredMessage,
    /// Human-readable status.
    #[serde(default)]
    pub message: Option<String>,
}

/// Query parameters of a history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryQuery {
    /// Page size.
    pub limit: u32,
    /// Only messages created before this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self { limit: DEFAULT_HISTORY_LIMIT, before: None }
    }
}

/// Response to a history request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Messages, oldest first. The server sends `null` for an empty room.
    #[serde(rename = "messageData", default)]
    pub message_data: Option<Vec<StoredMessage>>,
}

impl HistoryResponse {
    /// Messages in server order.
    pub fn into_messages(self) -> Vec<StoredMessage> {
        self.message_data.unwrap_or_default()
    }
}

/// Error body of a non-2xx response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// Error text.
    #[serde(default)]
    pub error: Option<String>,
    /// Alternative status text some endpoints use.
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Best available description.
    pub fn describe(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}
