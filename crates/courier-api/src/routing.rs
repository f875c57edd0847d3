use std::sync::Arc;

use tracing::{debug, warn};

use courier_db::Database;
use courier_types::models::Account;

use crate::error::ApiError;

/// Resolves which linked account owns a message.
#[derive(Clone)]
pub struct AccountRouter {
    db: Arc<Database>,
}

impl AccountRouter {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Inbound routing: the messaging-channel id is authoritative; the
    /// platform account id is only consulted when that lookup misses.
    pub async fn resolve(
        &self,
        channel_id: &str,
        fallback_platform_id: Option<&str>,
    ) -> Result<Account, ApiError> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let fallback = fallback_platform_id.map(str::to_string);

        let found = tokio::task::spawn_blocking(move || -> courier_db::Result<Option<Account>> {
            if let Some(account) = db.get_account_by_channel_id(&channel)? {
                return Ok(Some(account));
            }
            match fallback {
                Some(platform_id) => {
                    let account = db.get_account_by_platform_id(&platform_id)?;
                    if account.is_some() {
                        debug!(
                            channel_id = %channel,
                            platform_id = %platform_id,
                            "routed by platform account id"
                        );
                    }
                    Ok(account)
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(ApiError::join)?
        .map_err(ApiError::Storage)?;

        found.ok_or_else(|| {
            warn!(channel_id, "no account for messaging channel");
            ApiError::AccountNotFound(channel_id.to_string())
        })
    }

    /// Outbound routing by internal account id.
    pub async fn resolve_id(&self, account_id: &str) -> Result<Account, ApiError> {
        let db = self.db.clone();
        let id = account_id.to_string();
        tokio::task::spawn_blocking(move || db.get_account(&id))
            .await
            .map_err(ApiError::join)??
            .ok_or_else(|| ApiError::AccountNotFound(account_id.to_string()))
    }
}
