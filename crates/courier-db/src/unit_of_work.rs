//! Unit of work: one SQLite transaction plus the ordered list of actions to
//! run once it has committed.
//!
//! The action type is generic so this crate never learns what a side effect
//! is. Actions registered with [`UnitOfWork::defer`] are handed back in
//! [`Committed`] only after COMMIT succeeds; on any error the transaction
//! rolls back when the scope is dropped and the actions are discarded.

use rusqlite::{Transaction, TransactionBehavior};
use tracing::debug;

use courier_types::models::{DeliveryStatus, IdempotencyRecord, Message};

use crate::dual_sink::{self, MirrorEntity, SaveOutcome, SecondarySink};
use crate::queries::{self, AccountColumn};
use crate::{Database, DbError, Result};

pub struct UnitOfWork<'conn, A> {
    tx: Transaction<'conn>,
    sink: &'conn dyn SecondarySink,
    deferred: Vec<A>,
}

/// Value produced by a committed unit of work and its deferred actions, in
/// registration order.
#[derive(Debug)]
pub struct Committed<T, A> {
    pub value: T,
    pub deferred: Vec<A>,
}

impl<A> UnitOfWork<'_, A> {
    pub fn insert_message(&mut self, message: &Message) -> Result<SaveOutcome> {
        if !message.has_content() {
            return Err(DbError::InvalidMessage {
                id: message.id.clone(),
                reason: "message has neither text nor attachments".into(),
            });
        }
        if !message.attachments_contiguous() {
            return Err(DbError::InvalidMessage {
                id: message.id.clone(),
                reason: "attachment indices must be contiguous from 0".into(),
            });
        }
        dual_sink::save(&mut self.tx, self.sink, MirrorEntity::Message(message))
    }

    pub fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<SaveOutcome> {
        dual_sink::save(&mut self.tx, self.sink, MirrorEntity::Idempotency(record))
    }

    /// Move a message forward to `status`. Returns `false` when the message
    /// is missing or the change would not be a forward step.
    pub fn advance_status(&mut self, message_id: &str, status: DeliveryStatus) -> Result<bool> {
        let outcome = dual_sink::save(
            &mut self.tx,
            self.sink,
            MirrorEntity::StatusChange { message_id, status },
        )?;
        Ok(outcome == SaveOutcome::Written)
    }

    pub fn find_by_idempotency_key(
        &self,
        account_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>> {
        queries::query_idempotent_message(&self.tx, account_id, idempotency_key)
    }

    pub fn find_by_provider_id(&self, provider_message_id: &str) -> Result<Option<Message>> {
        queries::query_message_by_provider_id(&self.tx, provider_message_id)
    }

    pub fn account_exists(&self, account_id: &str) -> Result<bool> {
        Ok(queries::query_account(&self.tx, AccountColumn::Id, account_id)?.is_some())
    }

    /// Queue an action to run after this unit of work commits.
    pub fn defer(&mut self, action: A) {
        self.deferred.push(action);
    }

    pub fn deferred(&self) -> &[A] {
        &self.deferred
    }
}

impl Database {
    /// Run `f` inside one transaction and commit it.
    ///
    /// Returns the closure's value together with the actions it deferred. If
    /// `f` fails or COMMIT fails, nothing is applied and no actions are
    /// returned.
    pub fn unit_of_work<A, T, F>(&self, f: F) -> Result<Committed<T, A>>
    where
        F: FnOnce(&mut UnitOfWork<'_, A>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut uow = UnitOfWork {
            tx,
            sink: self.secondary.as_ref(),
            deferred: Vec::new(),
        };

        let value = match f(&mut uow) {
            Ok(value) => value,
            Err(e) => {
                debug!(discarded = uow.deferred.len(), error = %e, "unit of work rolled back");
                return Err(e);
            }
        };

        let UnitOfWork { tx, deferred, .. } = uow;
        if let Err(e) = tx.commit() {
            debug!(
                discarded = deferred.len(),
                error = %e,
                "commit failed, unit of work rolled back"
            );
            return Err(DbError::Commit(e));
        }

        Ok(Committed { value, deferred })
    }
}
