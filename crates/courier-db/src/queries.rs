use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use courier_types::models::{Account, Attachment, Message};

use crate::models::{
    ACCOUNT_COLUMNS, AccountRow, AttachmentRow, MESSAGE_COLUMNS, MessageRow, format_timestamp,
};
use crate::{Database, DbError, Result, is_unique_violation};

/// Keyset position in an account's history: the oldest row of the previous
/// page. Rows sharing its timestamp are split by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCursor {
    pub timestamp: DateTime<Utc>,
    pub id: Option<String>,
}

impl Database {
    // -- Accounts --

    /// Store a linked account. Channel id and platform account id are unique.
    pub fn insert_account(&self, account: &Account) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (id, platform_account_id, channel_id, credential_ciphertext,
                                       credential_nonce, webhook_secret, crm_webhook_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    account.id.as_str(),
                    account.platform_account_id,
                    account.channel_id,
                    account.credential.ciphertext,
                    account.credential.nonce,
                    account.webhook_secret,
                    account.crm_webhook_url,
                    format_timestamp(&account.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::DuplicateAccount(account.id.to_string())
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
    }

    pub fn get_account(&self, id: &str) -> Result<Option<Account>> {
        self.with_conn(|conn| query_account(conn, AccountColumn::Id, id))
    }

    pub fn get_account_by_channel_id(&self, channel_id: &str) -> Result<Option<Account>> {
        self.with_conn(|conn| query_account(conn, AccountColumn::ChannelId, channel_id))
    }

    pub fn get_account_by_platform_id(&self, platform_account_id: &str) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            query_account(conn, AccountColumn::PlatformAccountId, platform_account_id)
        })
    }

    // -- Messages --

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Result of an earlier send with the same idempotency key, if any.
    pub fn find_by_idempotency_key(
        &self,
        account_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>> {
        self.with_conn(|conn| query_idempotent_message(conn, account_id, idempotency_key))
    }

    /// Newest first. `before` is the timestamp of the oldest message on the
    /// previous page.
    pub fn list_messages(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<&MessageCursor>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_messages(conn, account_id, limit, before))
    }

    pub fn count_messages(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?)
        })
    }
}

#[derive(Clone, Copy)]
pub(crate) enum AccountColumn {
    Id,
    ChannelId,
    PlatformAccountId,
}

impl AccountColumn {
    fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::ChannelId => "channel_id",
            Self::PlatformAccountId => "platform_account_id",
        }
    }
}

pub(crate) fn query_account(
    conn: &Connection,
    column: AccountColumn,
    value: &str,
) -> Result<Option<Account>> {
    let sql = format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {} = ?1",
        column.name()
    );
    let row = conn
        .query_row(&sql, [value], AccountRow::from_row)
        .optional()?;

    row.map(AccountRow::into_account).transpose()
}

pub(crate) fn query_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    let Some(row) = conn.query_row(&sql, [id], MessageRow::from_row).optional()? else {
        return Ok(None);
    };

    let mut attachments = query_attachments(conn, &[row.id.clone()])?;
    let own = attachments.remove(&row.id).unwrap_or_default();
    row.into_message(own).map(Some)
}

pub(crate) fn query_message_by_provider_id(
    conn: &Connection,
    provider_message_id: &str,
) -> Result<Option<Message>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM messages WHERE provider_message_id = ?1",
            [provider_message_id],
            |r| r.get(0),
        )
        .optional()?;

    match id {
        Some(id) => query_message(conn, &id),
        None => Ok(None),
    }
}

pub(crate) fn query_idempotent_message(
    conn: &Connection,
    account_id: &str,
    idempotency_key: &str,
) -> Result<Option<Message>> {
    let message_id: Option<String> = conn
        .query_row(
            "SELECT message_id FROM idempotency_records
             WHERE account_id = ?1 AND idempotency_key = ?2",
            params![account_id, idempotency_key],
            |r| r.get(0),
        )
        .optional()?;

    match message_id {
        Some(id) => query_message(conn, &id),
        None => Ok(None),
    }
}

fn query_messages(
    conn: &Connection,
    account_id: &str,
    limit: u32,
    before: Option<&MessageCursor>,
) -> Result<Vec<Message>> {
    let rows: Vec<MessageRow> = match before {
        Some(cursor) => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE account_id = ?1
                   AND (timestamp < ?2 OR (timestamp = ?2 AND id < ?3))
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?4"
            );
            // Stored timestamps share this fixed-width form, so text order is time order.
            let timestamp = format_timestamp(&cursor.timestamp);
            let id = cursor.id.as_deref().unwrap_or_default();
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params![account_id, timestamp, id, limit], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE account_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params![account_id, limit], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut attachments = query_attachments(conn, &ids)?;

    rows.into_iter()
        .map(|row| {
            let own = attachments.remove(&row.id).unwrap_or_default();
            row.into_message(own)
        })
        .collect()
}

/// Batch-fetch attachments for a set of message ids, ordered by index.
fn query_attachments(
    conn: &Connection,
    message_ids: &[String],
) -> Result<HashMap<String, Vec<Attachment>>> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT id, message_id, idx, media_type, locator FROM attachments
         WHERE message_id IN ({})
         ORDER BY message_id, idx",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), AttachmentRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<String, Vec<Attachment>> = HashMap::new();
    for row in rows {
        let attachment = row.into_attachment()?;
        grouped
            .entry(attachment.message_id.clone())
            .or_default()
            .push(attachment);
    }
    Ok(grouped)
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use courier_types::models::{AccountId, DeliveryStatus, Direction, SealedCredential};

    use super::*;

    pub(crate) fn account(id: &str, platform_id: &str, channel_id: &str) -> Account {
        Account {
            id: AccountId::new(id),
            platform_account_id: platform_id.to_string(),
            channel_id: channel_id.to_string(),
            webhook_secret: format!("{id}-secret"),
            crm_webhook_url: None,
            credential: SealedCredential {
                ciphertext: vec![1, 2, 3],
                nonce: vec![0; 12],
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn account_lookups_by_each_identifier() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&account("acc_1", "P1", "C1")).unwrap();

        assert_eq!(db.get_account("acc_1").unwrap().unwrap().channel_id, "C1");
        assert_eq!(
            db.get_account_by_channel_id("C1").unwrap().unwrap().id.as_str(),
            "acc_1"
        );
        assert_eq!(
            db.get_account_by_platform_id("P1").unwrap().unwrap().id.as_str(),
            "acc_1"
        );
        assert!(db.get_account_by_channel_id("P1").unwrap().is_none());
    }

    #[test]
    fn channel_and_platform_ids_are_unique() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&account("acc_1", "P1", "C1")).unwrap();

        let same_channel = db.insert_account(&account("acc_2", "P2", "C1"));
        assert!(matches!(same_channel, Err(DbError::DuplicateAccount(_))));

        let same_platform = db.insert_account(&account("acc_3", "P1", "C3"));
        assert!(matches!(same_platform, Err(DbError::DuplicateAccount(_))));
    }

    fn inbound_at(id: &str, timestamp: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            account_id: AccountId::new("acc_1"),
            provider_message_id: Some(id.to_string()),
            sender_id: "u_1".into(),
            recipient_id: "P1".into(),
            text: Some("hi".into()),
            direction: Direction::Inbound,
            timestamp,
            status: DeliveryStatus::Delivered,
            idempotency_key: None,
            error_code: None,
            error_message: None,
            attachments: vec![],
        }
    }

    #[test]
    fn cursor_pages_cover_every_row_once() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&account("acc_1", "P1", "C1")).unwrap();

        let t0 = Utc::now();
        let shared = t0 - chrono::Duration::seconds(5);
        db.unit_of_work::<(), _, _>(|uow| {
            uow.insert_message(&inbound_at("m_a", shared))?;
            uow.insert_message(&inbound_at("m_b", shared))?;
            uow.insert_message(&inbound_at("m_c", shared))?;
            uow.insert_message(&inbound_at("m_d", t0))?;
            Ok(())
        })
        .unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = db.list_messages("acc_1", 2, cursor.as_ref()).unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(MessageCursor {
                timestamp: last.timestamp,
                id: Some(last.id.clone()),
            });
            seen.extend(page.into_iter().map(|m| m.id));
        }
        assert_eq!(seen, vec!["m_d", "m_c", "m_b", "m_a"]);
    }

    #[test]
    fn cursor_in_another_offset_matches_stored_rows() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&account("acc_1", "P1", "C1")).unwrap();

        let at = |rfc: &str| DateTime::parse_from_rfc3339(rfc).unwrap().with_timezone(&Utc);
        db.unit_of_work::<(), _, _>(|uow| {
            uow.insert_message(&inbound_at("early", at("2026-01-01T10:00:00Z")))?;
            uow.insert_message(&inbound_at("late", at("2026-01-01T12:00:00Z")))?;
            Ok(())
        })
        .unwrap();

        // 13:00+02:00 is 11:00Z, between the two rows
        let cursor = MessageCursor {
            timestamp: at("2026-01-01T13:00:00+02:00"),
            id: None,
        };
        let page = db.list_messages("acc_1", 10, Some(&cursor)).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "early");
    }

    #[test]
    fn sealed_credential_survives_storage() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&account("acc_1", "P1", "C1")).unwrap();

        let stored = db.get_account("acc_1").unwrap().unwrap();
        assert_eq!(stored.credential.ciphertext, vec![1, 2, 3]);
        assert_eq!(stored.credential.nonce.len(), 12);
        assert_eq!(stored.webhook_secret, "acc_1-secret");
    }
}
