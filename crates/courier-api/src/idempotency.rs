//! At-most-once processing.
//!
//! Inbound deliveries are deduplicated by provider message id through the
//! messages primary key. Outbound sends are keyed by
//! `(account_id, idempotency_key)`: an in-process lease serializes requests
//! sharing a key across the check, the platform call and the commit, and the
//! storage uniqueness constraints catch anything that gets past it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use courier_db::{Database, DbError, SaveOutcome, UnitOfWork};
use courier_types::models::{IdempotencyRecord, Message};

use crate::effects::SideEffect;
use crate::error::ApiError;

type KeyLocks = HashMap<(String, String), Weak<tokio::sync::Mutex<()>>>;

/// Held while a keyed send is in flight.
pub struct KeyLease {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Clone, Default)]
pub struct IdempotencyGuard {
    locks: Arc<std::sync::Mutex<KeyLocks>>,
}

impl IdempotencyGuard {
    /// Wait for exclusive use of `(account_id, key)` within this process.
    pub async fn acquire(&self, account_id: &str, key: &str) -> KeyLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);

            let id = (account_id.to_string(), key.to_string());
            match locks.get(&id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        KeyLease {
            _guard: lock.lock_owned().await,
        }
    }

    /// The result of an earlier send with this key, if one was committed.
    pub async fn lookup(
        db: &Arc<Database>,
        account_id: &str,
        key: &str,
    ) -> Result<Option<Message>, ApiError> {
        let db = db.clone();
        let (account_id, key) = (account_id.to_string(), key.to_string());
        Ok(
            tokio::task::spawn_blocking(move || db.find_by_idempotency_key(&account_id, &key))
                .await
                .map_err(ApiError::join)??,
        )
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Store an inbound message unless its provider id was already seen.
/// Returns `false` for a redelivery; the caller must then defer nothing.
pub fn record_inbound(
    uow: &mut UnitOfWork<'_, SideEffect>,
    message: &Message,
) -> courier_db::Result<bool> {
    match uow.insert_message(message)? {
        SaveOutcome::Written => Ok(true),
        SaveOutcome::Duplicate | SaveOutcome::Unchanged => {
            debug!(mid = %message.id, "inbound redelivery ignored");
            Ok(false)
        }
    }
}

/// Store an outbound message together with its idempotency record. A
/// uniqueness violation on either means another writer won the key; the
/// error rolls the whole unit of work back.
pub fn record_outbound(
    uow: &mut UnitOfWork<'_, SideEffect>,
    message: &Message,
    record: &IdempotencyRecord,
) -> courier_db::Result<()> {
    let conflict = || DbError::IdempotencyConflict {
        account_id: record.account_id.to_string(),
        idempotency_key: record.idempotency_key.clone(),
    };

    if uow.insert_message(message)? != SaveOutcome::Written {
        return Err(conflict());
    }
    if uow.insert_idempotency_record(record)? != SaveOutcome::Written {
        return Err(conflict());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let guard = IdempotencyGuard::default();
        let lease = guard.acquire("acc_1", "k1").await;

        let contender = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _lease = guard.acquire("acc_1", "k1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let guard = IdempotencyGuard::default();
        let _a = guard.acquire("acc_1", "k1").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), guard.acquire("acc_1", "k2"))
            .await
            .unwrap();
        let _c = tokio::time::timeout(Duration::from_secs(1), guard.acquire("acc_2", "k1"))
            .await
            .unwrap();
        assert_eq!(guard.tracked_keys(), 3);
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let guard = IdempotencyGuard::default();
        drop(guard.acquire("acc_1", "k1").await);
        let _held = guard.acquire("acc_1", "k2").await;
        assert_eq!(guard.tracked_keys(), 1);
    }
}
