//! Database row types. These map directly to SQLite rows and stay
//! separate from the courier-types models.
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

use courier_types::models::{
    Account, AccountId, Attachment, DeliveryStatus, Direction, MediaType, Message,
    SealedCredential,
};

use crate::{DbError, Result};

pub struct AccountRow {
    pub id: String,
    pub platform_account_id: String,
    pub channel_id: String,
    pub credential_ciphertext: Vec<u8>,
    pub credential_nonce: Vec<u8>,
    pub webhook_secret: String,
    pub crm_webhook_url: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub account_id: String,
    pub provider_message_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: Option<String>,
    pub direction: String,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: String,
}

pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub idx: i64,
    pub media_type: String,
    pub locator: String,
}

pub(crate) const ACCOUNT_COLUMNS: &str = "id, platform_account_id, channel_id, credential_ciphertext, \
     credential_nonce, webhook_secret, crm_webhook_url, created_at";

pub(crate) const MESSAGE_COLUMNS: &str = "id, account_id, provider_message_id, sender_id, recipient_id, \
     text, direction, status, idempotency_key, error_code, error_message, timestamp";

impl AccountRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            platform_account_id: row.get(1)?,
            channel_id: row.get(2)?,
            credential_ciphertext: row.get(3)?,
            credential_nonce: row.get(4)?,
            webhook_secret: row.get(5)?,
            crm_webhook_url: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    pub fn into_account(self) -> Result<Account> {
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        Ok(Account {
            id: AccountId::new(self.id),
            platform_account_id: self.platform_account_id,
            channel_id: self.channel_id,
            webhook_secret: self.webhook_secret,
            crm_webhook_url: self.crm_webhook_url,
            credential: SealedCredential {
                ciphertext: self.credential_ciphertext,
                nonce: self.credential_nonce,
            },
            created_at,
        })
    }
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            provider_message_id: row.get(2)?,
            sender_id: row.get(3)?,
            recipient_id: row.get(4)?,
            text: row.get(5)?,
            direction: row.get(6)?,
            status: row.get(7)?,
            idempotency_key: row.get(8)?,
            error_code: row.get(9)?,
            error_message: row.get(10)?,
            timestamp: row.get(11)?,
        })
    }

    pub fn into_message(self, attachments: Vec<Attachment>) -> Result<Message> {
        let direction: Direction = self
            .direction
            .parse()
            .map_err(|e| DbError::corrupt(&self.id, e))?;
        let status: DeliveryStatus = self
            .status
            .parse()
            .map_err(|e| DbError::corrupt(&self.id, e))?;
        let timestamp = parse_timestamp(&self.id, &self.timestamp)?;

        Ok(Message {
            id: self.id,
            account_id: AccountId::new(self.account_id),
            provider_message_id: self.provider_message_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            text: self.text,
            direction,
            timestamp,
            status,
            idempotency_key: self.idempotency_key,
            error_code: self.error_code,
            error_message: self.error_message,
            attachments,
        })
    }
}

impl AttachmentRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            idx: row.get(2)?,
            media_type: row.get(3)?,
            locator: row.get(4)?,
        })
    }

    pub fn into_attachment(self) -> Result<Attachment> {
        let media_type: MediaType = self
            .media_type
            .parse()
            .map_err(|e| DbError::corrupt(&self.id, e))?;
        let index = u32::try_from(self.idx).map_err(|e| DbError::corrupt(&self.id, e))?;
        Ok(Attachment {
            id: self.id,
            message_id: self.message_id,
            index,
            media_type,
            locator: self.locator,
        })
    }
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as UTC.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| DbError::corrupt(id, format!("timestamp '{raw}': {e}")))
}
