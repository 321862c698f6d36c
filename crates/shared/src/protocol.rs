use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Attachment, ConversationId, Identity, MessageId, UserId},
    error::ProtocolError,
};

pub const EVENT_MESSAGE_SEND: &str = "message.send";
pub const EVENT_MESSAGE_INCOMING: &str = "message.incoming";
pub const EVENT_PRESENCE_HEARTBEAT: &str = "presence.heartbeat";
pub const EVENT_PRESENCE_STATUS: &str = "presence.status";
pub const EVENT_CONVERSATION_CREATED: &str = "conversation.created";

/// One named event on the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Payloads arrive either as structured JSON or as JSON serialized into a
/// string; both decode the same way.
pub fn decode_payload<T: DeserializeOwned>(
    event: &'static str,
    data: Value,
) -> Result<T, ProtocolError> {
    match data {
        Value::String(raw) => serde_json::from_str(&raw)
            .map_err(|source| ProtocolError::InvalidJson { event, source }),
        other => serde_json::from_value(other)
            .map_err(|source| ProtocolError::UnexpectedShape { event, source }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Absent for a self-only heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPresenceStatus {
    #[serde(alias = "userId")]
    identity_id: UserId,
    #[serde(default, alias = "status")]
    last_seen_at: Option<Value>,
}

/// A liveness reply. `last_seen_at` is only set when the service sent a
/// numeric millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceReply {
    pub identity_id: UserId,
    pub last_seen_at: Option<i64>,
}

impl PresenceReply {
    pub fn from_event(data: Value) -> Result<Self, ProtocolError> {
        let raw: RawPresenceStatus = decode_payload(EVENT_PRESENCE_STATUS, data)?;
        let last_seen_at = raw.last_seen_at.and_then(|value| match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64)),
            _ => None,
        });
        Ok(Self {
            identity_id: raw.identity_id,
            last_seen_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SenderField {
    Record(Identity),
    Id(UserId),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInboundMessage {
    #[serde(default, alias = "_id")]
    id: Option<MessageId>,
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    group_id: Option<ConversationId>,
    #[serde(default)]
    group: Option<ConversationId>,
    #[serde(default)]
    sender: Option<SenderField>,
    #[serde(default)]
    sender_id: Option<UserId>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachment: Option<Attachment>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    client_message_id: Option<MessageId>,
}

/// An inbound message in one fixed shape, whatever field names the service
/// used for the conversation and sender.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub embedded_sender: Option<Identity>,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub client_message_id: Option<MessageId>,
}

impl InboundMessage {
    pub fn from_event(data: Value) -> Result<Self, ProtocolError> {
        let raw: RawInboundMessage = decode_payload(EVENT_MESSAGE_INCOMING, data)?;

        let conversation_id = raw
            .conversation_id
            .or(raw.group_id)
            .or(raw.group)
            .filter(|id| !id.as_str().is_empty())
            .ok_or(ProtocolError::MissingConversationId)?;

        let (embedded_sender, sender_id) = match raw.sender {
            Some(SenderField::Record(identity)) => {
                let id = identity.id.clone();
                (Some(identity), id)
            }
            Some(SenderField::Id(id)) => (None, id),
            None => (None, raw.sender_id.unwrap_or_else(|| UserId::new(""))),
        };

        Ok(Self {
            id: raw.id,
            conversation_id,
            sender_id,
            embedded_sender,
            content: raw.content,
            attachment: raw.attachment,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            client_message_id: raw.client_message_id,
        })
    }
}

/// Success envelope every request-channel response is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

/// Identity fields arrive flattened next to the credential pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(flatten)]
    pub identity: Identity,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

/// History is returned newest-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<crate::domain::Message>,
    #[serde(default)]
    pub can_load_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileImageRequest {
    pub profile_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub file_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub url: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
