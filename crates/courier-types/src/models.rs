use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal account identifier.
///
/// Only built from values that were read back from storage or accepted by
/// account provisioning. Lookups by caller-supplied input take raw strings,
/// so a value that failed to resolve never becomes an `AccountId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(ParseEnumError {
                kind: "direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery status of a message. Status only ever moves forward:
/// `pending → sent | failed`, `sent → delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent | Self::Failed | Self::Delivered)
                | (Self::Sent, Self::Delivered)
        )
    }

    /// Statuses from which `self` is a legal next step.
    pub fn predecessors(self) -> &'static [DeliveryStatus] {
        match self {
            Self::Pending => &[],
            Self::Sent | Self::Failed => &[Self::Pending],
            Self::Delivered => &[Self::Pending, Self::Sent],
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "delivery status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }

    /// Map a platform attachment type (`image`, `video`, `audio`, `file`,
    /// `share`, ...) onto the closed set stored here.
    pub fn from_platform(kind: &str) -> Self {
        match kind {
            "image" | "sticker" | "animated_image" => Self::Image,
            "video" | "ig_reel" | "reel" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Other,
        }
    }
}

impl FromStr for MediaType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "other" => Ok(Self::Other),
            other => Err(ParseEnumError {
                kind: "media type",
                value: other.to_string(),
            }),
        }
    }
}

/// Attachment identity is `{message_id}_{index}`.
pub fn attachment_id(message_id: &str, index: u32) -> String {
    format!("{message_id}_{index}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub index: u32,
    pub media_type: MediaType,
    /// Remote URL for inbound media, public media URL for outbound uploads.
    pub locator: String,
}

impl Attachment {
    pub fn new(message_id: &str, index: u32, media_type: MediaType, locator: String) -> Self {
        Self {
            id: attachment_id(message_id, index),
            message_id: message_id.to_string(),
            index,
            media_type,
            locator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub account_id: AccountId,
    pub provider_message_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: Option<String>,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub idempotency_key: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// A message must carry non-empty text or at least one attachment.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty()) || !self.attachments.is_empty()
    }

    /// The customer on the other side of the conversation.
    pub fn peer_id(&self) -> &str {
        match self.direction {
            Direction::Inbound => &self.sender_id,
            Direction::Outbound => &self.recipient_id,
        }
    }

    pub fn conversation_id(&self) -> String {
        format!("{}:{}", self.account_id, self.peer_id())
    }

    pub fn message_type(&self) -> &'static str {
        match self.attachments.first() {
            Some(attachment) => attachment.media_type.as_str(),
            None => "text",
        }
    }

    /// Attachment indices must be `0..n` in order.
    pub fn attachments_contiguous(&self) -> bool {
        self.attachments
            .iter()
            .enumerate()
            .all(|(i, a)| a.index as usize == i && a.message_id == self.id)
    }
}

/// Send credential as stored: AES-256-GCM ciphertext plus nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredential {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedCredential")
            .field("ciphertext", &format_args!("<{} bytes>", self.ciphertext.len()))
            .finish()
    }
}

/// A linked business account. Read-only for the relay pipeline.
#[derive(Clone)]
pub struct Account {
    pub id: AccountId,
    pub platform_account_id: String,
    /// The id webhook deliveries are addressed to.
    pub channel_id: String,
    pub webhook_secret: String,
    pub crm_webhook_url: Option<String>,
    pub credential: SealedCredential,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("platform_account_id", &self.platform_account_id)
            .field("channel_id", &self.channel_id)
            .field("crm_webhook_url", &self.crm_webhook_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub account_id: AccountId,
    pub idempotency_key: String,
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, attachments: usize) -> Message {
        let id = "mid.1".to_string();
        Message {
            attachments: (0..attachments as u32)
                .map(|i| Attachment::new(&id, i, MediaType::Image, format!("https://cdn/{i}")))
                .collect(),
            id,
            account_id: AccountId::new("acc_1"),
            provider_message_id: None,
            sender_id: "u_1".into(),
            recipient_id: "ig_1".into(),
            text: text.map(str::to_string),
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            status: DeliveryStatus::Delivered,
            idempotency_key: None,
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn content_requires_text_or_attachment() {
        assert!(message(Some("hi"), 0).has_content());
        assert!(message(None, 1).has_content());
        assert!(!message(Some(""), 0).has_content());
        assert!(!message(None, 0).has_content());
    }

    #[test]
    fn status_only_moves_forward() {
        use DeliveryStatus::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Pending.can_advance_to(Failed));
        assert!(Sent.can_advance_to(Delivered));
        assert!(!Sent.can_advance_to(Pending));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
    }

    #[test]
    fn attachment_ids_follow_message_and_index() {
        let msg = message(None, 3);
        assert_eq!(msg.attachments[2].id, "mid.1_2");
        assert!(msg.attachments_contiguous());
        assert_eq!(msg.message_type(), "image");
    }

    #[test]
    fn conversation_is_keyed_by_peer() {
        let mut msg = message(Some("hi"), 0);
        assert_eq!(msg.conversation_id(), "acc_1:u_1");
        msg.direction = Direction::Outbound;
        assert_eq!(msg.conversation_id(), "acc_1:ig_1");
    }
}
