use std::sync::Arc;

use courier_db::{Committed, Database, UnitOfWork};

use crate::effects::{EffectDispatcher, SideEffect};
use crate::error::ApiError;

/// Runs a unit of work off the async runtime and, once it has committed,
/// hands its deferred side effects to the effect workers.
#[derive(Clone)]
pub struct TransactionCoordinator {
    db: Arc<Database>,
    effects: EffectDispatcher,
}

impl TransactionCoordinator {
    pub fn new(db: Arc<Database>, effects: EffectDispatcher) -> Self {
        Self { db, effects }
    }

    /// If `f` or the commit fails, nothing is written and no side effect runs.
    pub async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut UnitOfWork<'_, SideEffect>) -> courier_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let Committed { value, deferred } = tokio::task::spawn_blocking(move || db.unit_of_work(f))
            .await
            .map_err(ApiError::join)??;

        self.effects.submit(deferred);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use courier_crypto::credentials::CredentialVault;
    use courier_db::DbError;
    use courier_gateway::Dispatcher;
    use courier_types::events::FeedEvent;
    use courier_types::models::{
        Account, AccountId, DeliveryStatus, Direction, IdempotencyRecord, Message,
    };

    use super::*;
    use crate::effects::CrmForwarder;

    fn setup() -> (TransactionCoordinator, Dispatcher, Arc<Database>) {
        let db = Database::open_in_memory().unwrap();
        let vault = CredentialVault::new([1u8; 32]);
        db.insert_account(&Account {
            id: AccountId::new("acc_1"),
            platform_account_id: "P0".into(),
            channel_id: "C1".into(),
            webhook_secret: "s".into(),
            crm_webhook_url: None,
            credential: vault.seal("tok").unwrap(),
            created_at: Utc::now(),
        })
        .unwrap();
        let db = Arc::new(db);

        let feed = Dispatcher::new();
        let effects = EffectDispatcher::spawn(
            1,
            4,
            feed.clone(),
            CrmForwarder::new(Duration::from_secs(1)).unwrap(),
            Duration::from_secs(1),
        );
        (TransactionCoordinator::new(db.clone(), effects), feed, db)
    }

    fn outbound(id: &str, key: &str) -> Message {
        Message {
            id: id.into(),
            account_id: AccountId::new("acc_1"),
            provider_message_id: Some(format!("mid.{id}")),
            sender_id: "P0".into(),
            recipient_id: "u_1".into(),
            text: Some("hi".into()),
            direction: Direction::Outbound,
            timestamp: Utc::now(),
            status: DeliveryStatus::Sent,
            idempotency_key: Some(key.into()),
            error_code: None,
            error_message: None,
            attachments: Vec::new(),
        }
    }

    fn ready() -> SideEffect {
        SideEffect::Broadcast(FeedEvent::Ready {
            connection_id: "c".into(),
        })
    }

    #[tokio::test]
    async fn committed_batch_reaches_the_feed() {
        let (coordinator, feed, db) = setup();
        let mut rx = feed.subscribe();

        coordinator
            .run(|uow| {
                uow.insert_message(&outbound("m1", "k1"))?;
                uow.defer(ready());
                Ok(())
            })
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.json.contains("Ready"));
        assert_eq!(db.count_messages().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_commit_runs_no_side_effects() {
        let (coordinator, feed, db) = setup();
        let mut rx = feed.subscribe();

        let result = coordinator
            .run(|uow| {
                uow.insert_message(&outbound("m1", "k1"))?;
                uow.insert_idempotency_record(&IdempotencyRecord {
                    account_id: AccountId::new("acc_1"),
                    idempotency_key: "k2".into(),
                    message_id: "ghost".into(),
                })?;
                uow.defer(ready());
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ApiError::Storage(DbError::Commit(_)))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(db.count_messages().unwrap(), 0);
    }

    #[tokio::test]
    async fn closure_error_is_returned_untouched() {
        let (coordinator, _feed, db) = setup();
        let mut empty = outbound("m1", "k1");
        empty.text = None;

        let result = coordinator
            .run(move |uow| {
                uow.insert_message(&empty)?;
                uow.defer(ready());
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(ApiError::Storage(DbError::InvalidMessage { .. }))
        ));
        assert_eq!(db.count_messages().unwrap(), 0);
    }
}
