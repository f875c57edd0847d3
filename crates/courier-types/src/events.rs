use serde::{Deserialize, Serialize};

use crate::api::MessageResponse;
use crate::models::{AccountId, DeliveryStatus};

/// Events pushed to live-feed listeners over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// Sent once after the connection is accepted
    Ready { connection_id: String },

    /// A message was committed (inbound or outbound)
    MessageCreate { message: MessageResponse },

    /// A committed message advanced its delivery status
    MessageStatus {
        message_id: String,
        account_id: AccountId,
        status: DeliveryStatus,
    },
}

impl FeedEvent {
    /// Returns the account this event is scoped to.
    /// Events that return `None` go to every listener.
    pub fn account_id(&self) -> Option<&AccountId> {
        match self {
            Self::MessageCreate { message } => Some(&message.account_id),
            Self::MessageStatus { account_id, .. } => Some(account_id),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM listener TO server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedCommand {
    /// Only forward events for these accounts. An empty list means all.
    Subscribe { account_ids: Vec<AccountId> },
}
