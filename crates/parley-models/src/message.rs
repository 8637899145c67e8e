use chrono::{DateTime, Utc};
use parley_util::id_string;
use serde::{Deserialize, Serialize};

/// Text substituted for a message deleted for everyone.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Document,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    /// Classify an uploaded file by its MIME type.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else {
            Self::Document
        }
    }
}

/// Delivery status. Variant order is the transition order, so `Ord` can be
/// used to reject regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Seen,
}

impl MessageStatus {
    pub fn rank(self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Seen => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Seen),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Seen => "seen",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(with = "id_string")]
    pub id: i64,
    #[serde(with = "id_string")]
    pub thread_id: i64,
    #[serde(with = "id_string")]
    pub sender_id: i64,
    pub text: Option<String>,
    pub message_type: MessageType,
    pub media: Option<MediaRef>,
    pub status: MessageStatus,
    pub is_pinned: bool,
    pub is_deleted: bool,
    #[serde(with = "id_string::vec")]
    pub deleted_for: Vec<i64>,
    #[serde(with = "id_string::option")]
    pub forwarded_from: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Body of a new message before it is assigned an id and a position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Explicit type, else inferred. A message carrying media is never
    /// `text`; without a better type it is a document.
    pub fn resolved_type(&self) -> MessageType {
        match (self.message_type, &self.media) {
            (Some(MessageType::Text) | None, Some(_)) => MessageType::Document,
            (Some(t), _) => t,
            (None, None) => MessageType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    Me,
    Everyone,
}
