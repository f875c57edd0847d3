use futures_util::future::join_all;
use tracing::{debug, info, warn};

use courier_types::api::{CrmForwardPayload, MessageResponse};
use courier_types::events::FeedEvent;
use courier_types::models::{Account, Attachment, DeliveryStatus, Direction, Message};

use crate::coordinator::TransactionCoordinator;
use crate::effects::SideEffect;
use crate::error::ApiError;
use crate::extract::{self, ExtractionSkip, InboundMessage, WebhookPayload};
use crate::idempotency;
use crate::routing::AccountRouter;

/// What happened to one event of a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Stored { message_id: String },
    /// Provider id already stored; nothing written, nothing dispatched.
    Duplicate { message_id: String },
    /// Delivery receipt applied to this many outbound messages.
    StatusAdvanced { count: usize },
    Skipped(ExtractionSkip),
    Unrouted { channel_id: String },
    Failed { reason: String },
}

/// Extract, route, deduplicate and commit every event of a webhook delivery.
#[derive(Clone)]
pub struct InboundPipeline {
    router: AccountRouter,
    coordinator: TransactionCoordinator,
}

impl InboundPipeline {
    pub fn new(router: AccountRouter, coordinator: TransactionCoordinator) -> Self {
        Self {
            router,
            coordinator,
        }
    }

    /// Events of one delivery are processed concurrently; each commits on its own.
    pub async fn process(&self, payload: &WebhookPayload) -> Vec<InboundOutcome> {
        let events = extract::extract(payload);
        join_all(events.into_iter().map(|event| self.process_event(event))).await
    }

    async fn process_event(&self, event: Result<InboundMessage, ExtractionSkip>) -> InboundOutcome {
        match event {
            Ok(inbound) => self.store(inbound).await,
            Err(ExtractionSkip::DeliveryReceipt { mids }) => self.apply_delivery(mids).await,
            Err(skip) => {
                debug!(?skip, "event skipped");
                InboundOutcome::Skipped(skip)
            }
        }
    }

    async fn store(&self, inbound: InboundMessage) -> InboundOutcome {
        let account = match self
            .router
            .resolve(&inbound.channel_id, Some(&inbound.recipient_id))
            .await
        {
            Ok(account) => account,
            Err(ApiError::AccountNotFound(channel_id)) => {
                return InboundOutcome::Unrouted { channel_id };
            }
            Err(e) => {
                warn!(mid = %inbound.mid, error = %e, "routing failed");
                return InboundOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        // Some deliveries address the account's own sends by platform id, not channel id.
        if inbound.sender_id == account.platform_account_id {
            debug!(account_id = %account.id, mid = %inbound.mid, "own message echoed back");
            return InboundOutcome::Skipped(ExtractionSkip::Echo {
                mid: Some(inbound.mid),
            });
        }

        let message = to_message(&account, inbound);
        let message_id = message.id.clone();
        let crm = account
            .crm_webhook_url
            .clone()
            .map(|endpoint| (endpoint, account.webhook_secret.clone()));

        let result = self
            .coordinator
            .run(move |uow| {
                if !idempotency::record_inbound(uow, &message)? {
                    return Ok(false);
                }
                uow.defer(SideEffect::Broadcast(FeedEvent::MessageCreate {
                    message: MessageResponse::from(message.clone()),
                }));
                if let Some((endpoint, secret)) = crm {
                    uow.defer(SideEffect::CrmForward {
                        payload: CrmForwardPayload::for_message(&message),
                        endpoint,
                        secret,
                    });
                }
                Ok(true)
            })
            .await;

        match result {
            Ok(true) => {
                info!(account_id = %account.id, mid = %message_id, "inbound message stored");
                InboundOutcome::Stored { message_id }
            }
            Ok(false) => InboundOutcome::Duplicate { message_id },
            Err(e) => {
                warn!(
                    account_id = %account.id,
                    mid = %message_id,
                    error = %e,
                    "inbound message not stored"
                );
                InboundOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Advance outbound messages named by a delivery receipt to `delivered`.
    async fn apply_delivery(&self, mids: Vec<String>) -> InboundOutcome {
        let result = self
            .coordinator
            .run(move |uow| {
                let mut advanced = 0;
                for mid in &mids {
                    let Some(message) = uow.find_by_provider_id(mid)? else {
                        debug!(mid = %mid, "delivery receipt for unknown message");
                        continue;
                    };
                    if message.direction != Direction::Outbound {
                        continue;
                    }
                    if uow.advance_status(&message.id, DeliveryStatus::Delivered)? {
                        uow.defer(SideEffect::Broadcast(FeedEvent::MessageStatus {
                            message_id: message.id.clone(),
                            account_id: message.account_id.clone(),
                            status: DeliveryStatus::Delivered,
                        }));
                        advanced += 1;
                    }
                }
                Ok(advanced)
            })
            .await;

        match result {
            Ok(count) => {
                if count > 0 {
                    info!(count, "delivery receipt applied");
                }
                InboundOutcome::StatusAdvanced { count }
            }
            Err(e) => {
                warn!(error = %e, "delivery receipt not applied");
                InboundOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn to_message(account: &Account, inbound: InboundMessage) -> Message {
    let attachments = inbound
        .attachments
        .into_iter()
        .enumerate()
        .map(|(i, a)| Attachment::new(&inbound.mid, i as u32, a.media_type, a.url))
        .collect();

    Message {
        id: inbound.mid.clone(),
        account_id: account.id.clone(),
        provider_message_id: Some(inbound.mid),
        sender_id: inbound.sender_id,
        recipient_id: inbound.recipient_id,
        text: inbound.text,
        direction: Direction::Inbound,
        timestamp: inbound.timestamp,
        status: DeliveryStatus::Delivered,
        idempotency_key: None,
        error_code: None,
        error_message: None,
        attachments,
    }
}
