//! Dual-sink persistence.
//!
//! Every entity written inside a unit of work goes to the primary SQLite
//! store first; that write must succeed or the transaction aborts. The same
//! entity is then offered to the secondary sink. Secondary failures are
//! logged and swallowed here, so they can never reach the caller or the
//! primary transaction.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info, warn};

use courier_types::models::{DeliveryStatus, IdempotencyRecord, Message};

use crate::models::format_timestamp;
use crate::{DbError, Result, is_unique_violation};

/// An entity handed to [`save`].
#[derive(Debug, Clone, Copy)]
pub enum MirrorEntity<'a> {
    Message(&'a Message),
    Idempotency(&'a IdempotencyRecord),
    StatusChange {
        message_id: &'a str,
        status: DeliveryStatus,
    },
}

impl MirrorEntity<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Idempotency(_) => "idempotency",
            Self::StatusChange { .. } => "status",
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Message(m) => &m.id,
            Self::Idempotency(r) => &r.idempotency_key,
            Self::StatusChange { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Primary accepted the write.
    Written,
    /// A uniqueness constraint already held this entity; nothing was written.
    Duplicate,
    /// The write matched no row (e.g. a status change that would go backwards).
    Unchanged,
}

/// Best-effort secondary store.
pub trait SecondarySink: Send + Sync {
    fn name(&self) -> &str;

    fn mirror(&self, entity: &MirrorEntity<'_>) -> anyhow::Result<()>;
}

/// Secondary sink that drops everything. Used when mirroring is disabled.
pub struct NullSink;

impl SecondarySink for NullSink {
    fn name(&self) -> &str {
        "none"
    }

    fn mirror(&self, _entity: &MirrorEntity<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Document-style mirror in a separate SQLite file: one JSON body per
/// `(collection, id)`, for consumers that read denormalized records.
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, &path.display().to_string())
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                collection  TEXT NOT NULL,
                id          TEXT NOT NULL,
                body        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )?;
        info!("Mirror store opened at {}", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_document(&self, collection: &str, id: &str) -> anyhow::Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Mirror lock poisoned: {}", e))?;
        Ok(conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                [collection, id],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn upsert(conn: &Connection, collection: &str, id: &str, body: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO documents (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body,
                                                       updated_at = excluded.updated_at",
            params![collection, id, body, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }
}

impl SecondarySink for SqliteMirror {
    fn name(&self) -> &str {
        "sqlite-mirror"
    }

    fn mirror(&self, entity: &MirrorEntity<'_>) -> anyhow::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Mirror lock poisoned: {}", e))?;

        match entity {
            MirrorEntity::Message(message) => {
                let body = serde_json::to_string(message)?;
                Self::upsert(&conn, "messages", &message.id, &body)?;
            }
            MirrorEntity::Idempotency(record) => {
                let id = format!("{}:{}", record.account_id, record.idempotency_key);
                let body = serde_json::json!({
                    "account_id": record.account_id,
                    "idempotency_key": record.idempotency_key,
                    "message_id": record.message_id,
                })
                .to_string();
                Self::upsert(&conn, "idempotency", &id, &body)?;
            }
            MirrorEntity::StatusChange { message_id, status } => {
                conn.execute(
                    "UPDATE documents SET body = json_set(body, '$.status', ?3), updated_at = ?4
                     WHERE collection = ?1 AND id = ?2",
                    params![
                        "messages",
                        message_id,
                        status.as_str(),
                        format_timestamp(&Utc::now())
                    ],
                )?;
            }
        }
        Ok(())
    }
}

/// Write `entity` to the primary store inside `tx`, then offer it to `sink`.
///
/// Each primary write runs in its own savepoint, so a duplicate leaves no
/// partial rows (e.g. a message without its attachments) behind.
pub(crate) fn save(
    tx: &mut Transaction<'_>,
    sink: &dyn SecondarySink,
    entity: MirrorEntity<'_>,
) -> Result<SaveOutcome> {
    let sp = tx.savepoint().map_err(DbError::PrimaryWrite)?;

    match write_primary(&sp, &entity) {
        Ok(true) => sp.commit().map_err(DbError::PrimaryWrite)?,
        Ok(false) => return Ok(SaveOutcome::Unchanged),
        Err(e) if is_unique_violation(&e) => {
            debug!(
                kind = entity.kind(),
                id = entity.id(),
                "primary write hit a uniqueness constraint"
            );
            return Ok(SaveOutcome::Duplicate);
        }
        Err(e) => return Err(DbError::PrimaryWrite(e)),
    }

    if let Err(e) = sink.mirror(&entity) {
        warn!(
            sink = sink.name(),
            kind = entity.kind(),
            id = entity.id(),
            error = %e,
            "secondary sink write failed"
        );
    }

    Ok(SaveOutcome::Written)
}

fn write_primary(conn: &Connection, entity: &MirrorEntity<'_>) -> rusqlite::Result<bool> {
    match entity {
        MirrorEntity::Message(message) => {
            conn.execute(
                "INSERT INTO messages (id, account_id, provider_message_id, sender_id, recipient_id,
                                       text, direction, status, idempotency_key, error_code,
                                       error_message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id,
                    message.account_id.as_str(),
                    message.provider_message_id,
                    message.sender_id,
                    message.recipient_id,
                    message.text,
                    message.direction.as_str(),
                    message.status.as_str(),
                    message.idempotency_key,
                    message.error_code,
                    message.error_message,
                    format_timestamp(&message.timestamp),
                ],
            )?;

            for attachment in &message.attachments {
                conn.execute(
                    "INSERT INTO attachments (id, message_id, idx, media_type, locator)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        attachment.id,
                        attachment.message_id,
                        attachment.index,
                        attachment.media_type.as_str(),
                        attachment.locator,
                    ],
                )?;
            }
            Ok(true)
        }
        MirrorEntity::Idempotency(record) => {
            conn.execute(
                "INSERT INTO idempotency_records (account_id, idempotency_key, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.account_id.as_str(),
                    record.idempotency_key,
                    record.message_id,
                    format_timestamp(&Utc::now()),
                ],
            )?;
            Ok(true)
        }
        MirrorEntity::StatusChange { message_id, status } => {
            let predecessors = status.predecessors();
            if predecessors.is_empty() {
                return Ok(false);
            }
            let allowed: Vec<String> = predecessors
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect();
            let sql = format!(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status IN ({})",
                allowed.join(", ")
            );
            let changed = conn.execute(&sql, params![message_id, status.as_str()])?;
            Ok(changed > 0)
        }
    }
}
