use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AccountId, Attachment, DeliveryStatus, Direction, Message};

// -- Webhook --

/// Query string of the subscription handshake (`GET /webhook`).
#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

// -- Outbound send --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub account_id: String,
    pub recipient_id: String,
    pub text: Option<String>,
    pub attachment: Option<AttachmentUpload>,
    pub idempotency_key: String,
}

/// A single outbound attachment with its declared MIME type. Carries either
/// a base64 body to store, or `path`: a file already under the media root
/// (relative, or prefixed with the public `/media/` mount).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentUpload {
    pub content_type: String,
    pub data: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Message> for SendMessageResponse {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            status: message.status,
            timestamp: message.timestamp,
            error_code: message.error_code.clone(),
            error_message: message.error_message.clone(),
        }
    }
}

// -- History --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: String,
    pub account_id: AccountId,
    pub provider_message_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: Option<String>,
    pub direction: Direction,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            account_id: m.account_id,
            provider_message_id: m.provider_message_id,
            sender_id: m.sender_id,
            recipient_id: m.recipient_id,
            text: m.text,
            direction: m.direction,
            status: m.status,
            timestamp: m.timestamp,
            error_code: m.error_code,
            error_message: m.error_message,
            attachments: m.attachments,
        }
    }
}

// -- Accounts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterAccountRequest {
    pub id: String,
    pub platform_account_id: String,
    pub channel_id: String,
    pub send_credential: String,
    pub webhook_secret: String,
    pub crm_webhook_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub id: AccountId,
    pub platform_account_id: String,
    pub channel_id: String,
    pub crm_webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// -- CRM --

/// Body POSTed to an account's CRM webhook after a message is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmForwardPayload {
    pub event: String,
    pub message_id: String,
    pub account_id: AccountId,
    pub sender_id: String,
    pub text: Option<String>,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub conversation_id: String,
}

impl CrmForwardPayload {
    pub fn for_message(message: &Message) -> Self {
        let event = match message.direction {
            Direction::Inbound => "message.received",
            Direction::Outbound => "message.sent",
        };
        Self {
            event: event.to_string(),
            message_id: message.id.clone(),
            account_id: message.account_id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            message_type: message.message_type().to_string(),
            timestamp: message.timestamp,
            provider_message_id: message.provider_message_id.clone(),
            conversation_id: message.conversation_id(),
        }
    }
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
