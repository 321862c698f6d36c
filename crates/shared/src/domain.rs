use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

const PROVISIONAL_PREFIX: &str = "temp-";
const UNASSIGNED_PREFIX: &str = "incoming-";

impl MessageId {
    /// Client-generated id for a message the service has not acknowledged yet.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// Local id for an inbound message the service sent without one.
    pub fn unassigned() -> Self {
        Self(format!("{UNASSIGNED_PREFIX}{}", Uuid::new_v4().simple()))
    }
}

/// A user as last observed by this client. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Stand-in used when an event names a sender this client has never seen.
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            profile_url: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(alias = "name")]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Shown locally, not yet acknowledged by the service.
    Optimistic,
    #[default]
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub sender: Identity,
    #[serde(rename = "group", alias = "conversationId")]
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    pub fn is_optimistic(&self) -> bool {
        self.delivery == Delivery::Optimistic
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id", alias = "id")]
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub members: Vec<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Avatar source for a conversation row: an image reference if one exists,
/// and the name used for initials otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRef {
    pub src: Option<String>,
    pub name: String,
}

impl Conversation {
    pub fn member_ids(&self) -> impl Iterator<Item = &UserId> {
        self.members.iter().map(|member| &member.id)
    }

    pub fn is_direct(&self) -> bool {
        self.name.is_none() && self.members.len() == 2
    }

    pub fn other_member(&self, self_id: &UserId) -> Option<&Identity> {
        self.members
            .iter()
            .find(|member| !member.id.as_str().is_empty() && &member.id != self_id)
    }

    pub fn latest_message(&self) -> Option<&Message> {
        self.last_messages.first().or(self.last_message.as_ref())
    }

    /// Latest-activity time: the newest known message, else the conversation's
    /// own last update.
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.latest_message()
            .map(|message| message.created_at)
            .unwrap_or(self.updated_at)
    }

    pub fn display_name(&self, self_id: &UserId) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        match self.other_member(self_id) {
            Some(other) => {
                let name = other.full_name();
                if name.is_empty() {
                    "User".to_string()
                } else {
                    name
                }
            }
            None => "Conversation".to_string(),
        }
    }

    pub fn avatar(&self, self_id: &UserId) -> AvatarRef {
        if let Some(image_url) = &self.image_url {
            return AvatarRef {
                src: Some(image_url.clone()),
                name: self.name.clone().unwrap_or_else(|| "Group".to_string()),
            };
        }

        if let Some(name) = &self.name {
            return AvatarRef {
                src: None,
                name: name.clone(),
            };
        }

        match self.other_member(self_id) {
            Some(other) => AvatarRef {
                src: other.profile_url.clone(),
                name: self.display_name(self_id),
            },
            None => AvatarRef {
                src: None,
                name: "Conversation".to_string(),
            },
        }
    }

    /// Moves the latest-message pointer forward if `message` is newer.
    pub fn observe_message(&mut self, message: &Message) {
        let newer = self
            .latest_message()
            .map_or(true, |latest| message.created_at >= latest.created_at);
        if newer {
            self.last_messages.clear();
            self.last_message = Some(message.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
