use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE accounts (
                id                      TEXT PRIMARY KEY,
                platform_account_id     TEXT NOT NULL UNIQUE,
                channel_id              TEXT NOT NULL UNIQUE,
                credential_ciphertext   BLOB NOT NULL,
                credential_nonce        BLOB NOT NULL,
                webhook_secret          TEXT NOT NULL,
                crm_webhook_url         TEXT,
                created_at              TEXT NOT NULL
            );

            CREATE TABLE messages (
                id                      TEXT PRIMARY KEY,
                account_id              TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                provider_message_id     TEXT UNIQUE,
                sender_id               TEXT NOT NULL,
                recipient_id            TEXT NOT NULL,
                text                    TEXT,
                direction               TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
                status                  TEXT NOT NULL
                                        CHECK (status IN ('pending', 'sent', 'delivered', 'failed')),
                idempotency_key         TEXT,
                error_code              TEXT,
                error_message           TEXT,
                timestamp               TEXT NOT NULL
            );

            CREATE UNIQUE INDEX idx_messages_idempotency
                ON messages(account_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL;

            CREATE INDEX idx_messages_account_time
                ON messages(account_id, timestamp);

            CREATE TABLE attachments (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                idx         INTEGER NOT NULL,
                media_type  TEXT NOT NULL,
                locator     TEXT NOT NULL,
                UNIQUE(message_id, idx)
            );

            -- message_id is checked at COMMIT so the record can be written in
            -- the same transaction as its message, in either order.
            CREATE TABLE idempotency_records (
                account_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                idempotency_key TEXT NOT NULL,
                message_id      TEXT NOT NULL
                                REFERENCES messages(id) ON DELETE CASCADE
                                DEFERRABLE INITIALLY DEFERRED,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (account_id, idempotency_key)
            );

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
