//! Outbound sends: idempotency short-circuit, routing, media confinement,
//! the platform call and the recording commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use courier_crypto::credentials::CredentialVault;
use courier_db::{Database, DbError};
use courier_types::api::{AttachmentUpload, CrmForwardPayload, MessageResponse};
use courier_types::events::FeedEvent;
use courier_types::models::{
    Account, Attachment, DeliveryStatus, Direction, IdempotencyRecord, MediaType, Message,
};

use crate::coordinator::TransactionCoordinator;
use crate::effects::SideEffect;
use crate::error::ApiError;
use crate::idempotency::{self, IdempotencyGuard};
use crate::media::{MediaStore, StoredMedia, allowed_media};
use crate::routing::AccountRouter;

// -- Send capability --

/// What the platform needs to deliver one message.
#[derive(Debug, Clone)]
pub struct PlatformMessage<'a> {
    pub channel_id: &'a str,
    pub access_token: &'a str,
    pub recipient_id: &'a str,
    pub text: Option<&'a str>,
    pub attachment: Option<(MediaType, &'a str)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
    /// Set when only part of the message reached the platform.
    pub partial_failure: Option<SendFailure>,
}

impl SendReceipt {
    pub fn new(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            partial_failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureKind {
    /// The platform answered with an error.
    Rejected,
    Timeout,
    /// The request never got a usable answer.
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} ({code}): {message}")]
pub struct SendFailure {
    pub kind: SendFailureKind,
    pub code: String,
    pub message: String,
}

impl SendFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: SendFailureKind::Transport,
            code: "transport".into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: SendFailureKind::Timeout,
            code: "timeout".into(),
            message: format!("platform did not answer within {after:?}"),
        }
    }
}

/// Delivers a message to the messaging platform.
#[async_trait]
pub trait SendCapability: Send + Sync {
    async fn send(&self, message: &PlatformMessage<'_>) -> Result<SendReceipt, SendFailure>;
}

/// Graph-style send API: `POST {base}/{channel_id}/messages`.
pub struct GraphApiSender {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GraphSendResponse {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: Option<String>,
    code: Option<i64>,
    error_subcode: Option<i64>,
}

impl GraphApiSender {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        message: &PlatformMessage<'_>,
        body: serde_json::Value,
    ) -> Result<SendReceipt, SendFailure> {
        let url = format!("{}/{}/messages", self.base_url, message.channel_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(message.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendFailure::transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SendFailure::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(parse_graph_error(status.as_u16(), &text));
        }

        let parsed: GraphSendResponse = serde_json::from_str(&text)
            .map_err(|e| SendFailure::transport(format!("unreadable send response: {e}")))?;
        parsed
            .message_id
            .filter(|id| !id.is_empty())
            .map(SendReceipt::new)
            .ok_or_else(|| SendFailure::transport("send response has no message_id"))
    }
}

#[async_trait]
impl SendCapability for GraphApiSender {
    async fn send(&self, message: &PlatformMessage<'_>) -> Result<SendReceipt, SendFailure> {
        let recipient = json!({ "id": message.recipient_id });

        // The platform takes text and attachments as separate messages; the
        // first one sent identifies the pair.
        let mut first: Option<SendReceipt> = None;
        if let Some((media_type, url)) = message.attachment {
            let kind = match media_type {
                MediaType::Other => "file",
                other => other.as_str(),
            };
            let body = json!({
                "recipient": recipient,
                "message": {
                    "attachment": { "type": kind, "payload": { "url": url, "is_reusable": false } }
                }
            });
            first = Some(self.post(message, body).await?);
        }
        if let Some(text) = message.text {
            let body = json!({ "recipient": recipient, "message": { "text": text } });
            match self.post(message, body).await {
                Ok(receipt) => {
                    first.get_or_insert(receipt);
                }
                Err(failure) => {
                    // An attachment already in the recipient's inbox keeps its id.
                    let Some(receipt) = first.as_mut() else {
                        return Err(failure);
                    };
                    error!(
                        reconciliation_required = true,
                        channel_id = message.channel_id,
                        provider_message_id = %receipt.provider_message_id,
                        code = %failure.code,
                        "attachment delivered but text send failed: {}",
                        failure.message
                    );
                    receipt.partial_failure = Some(failure);
                }
            }
        }

        first.ok_or_else(|| SendFailure {
            kind: SendFailureKind::Rejected,
            code: "empty".into(),
            message: "nothing to send".into(),
        })
    }
}

fn parse_graph_error(status: u16, body: &str) -> SendFailure {
    match serde_json::from_str::<GraphErrorBody>(body) {
        Ok(GraphErrorBody { error }) => {
            let code = match (error.code, error.error_subcode) {
                (Some(code), Some(sub)) => format!("{code}.{sub}"),
                (Some(code), None) => code.to_string(),
                (None, _) => status.to_string(),
            };
            SendFailure {
                kind: SendFailureKind::Rejected,
                code,
                message: error.message.unwrap_or_else(|| format!("HTTP {status}")),
            }
        }
        Err(_) => SendFailure {
            kind: SendFailureKind::Rejected,
            code: status.to_string(),
            message: body.chars().take(200).collect(),
        },
    }
}

// -- Orchestrator --

/// A validated send request.
#[derive(Debug)]
pub struct OutboundRequest {
    pub account_id: String,
    pub recipient_id: String,
    pub text: Option<String>,
    pub attachment: Option<AttachmentUpload>,
    pub idempotency_key: String,
}

/// Attachment after the pre-send checks, before it touches the filesystem.
enum PreparedAttachment {
    Upload {
        bytes: Vec<u8>,
        media: crate::media::AllowedMedia,
    },
    Stored {
        path: String,
        media: crate::media::AllowedMedia,
    },
}

pub struct OutboundOrchestrator {
    db: Arc<Database>,
    router: AccountRouter,
    guard: IdempotencyGuard,
    coordinator: TransactionCoordinator,
    media: MediaStore,
    vault: CredentialVault,
    sender: Arc<dyn SendCapability>,
    send_timeout: Duration,
}

impl OutboundOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        router: AccountRouter,
        guard: IdempotencyGuard,
        coordinator: TransactionCoordinator,
        media: MediaStore,
        vault: CredentialVault,
        sender: Arc<dyn SendCapability>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            db,
            router,
            guard,
            coordinator,
            media,
            vault,
            sender,
            send_timeout,
        }
    }

    /// Send a message, or return the committed result of an earlier send
    /// with the same idempotency key.
    ///
    /// Errors before the platform call leave no trace. Once the platform has
    /// been called the outcome is committed as a `sent` or `failed` message.
    pub async fn send(&self, request: OutboundRequest) -> Result<Message, ApiError> {
        let prepared = validate(&request)?;

        let _lease = self
            .guard
            .acquire(&request.account_id, &request.idempotency_key)
            .await;

        if let Some(existing) =
            IdempotencyGuard::lookup(&self.db, &request.account_id, &request.idempotency_key).await?
        {
            info!(
                account_id = %request.account_id,
                message_id = %existing.id,
                "idempotent replay, returning stored result"
            );
            return Ok(existing);
        }

        let account = self.router.resolve_id(&request.account_id).await?;

        let stored = match prepared {
            Some(PreparedAttachment::Stored { path, media }) => {
                Some((media.media_type, self.media.existing(&path, media).await?))
            }
            Some(PreparedAttachment::Upload { bytes, media }) => {
                Some((media.media_type, self.media.store(&bytes, media).await?))
            }
            None => None,
        };

        let access_token = self
            .vault
            .open(&account.credential)
            .map_err(|e| {
                error!(account_id = %account.id, "failed to open send credential: {}", e);
                ApiError::Internal("send credential unavailable".into())
            })?;

        let platform_message = PlatformMessage {
            channel_id: &account.channel_id,
            access_token: &access_token,
            recipient_id: &request.recipient_id,
            text: request.text.as_deref(),
            attachment: stored.as_ref().map(|(t, s)| (*t, s.url.as_str())),
        };

        let send = self.sender.send(&platform_message);
        let outcome = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(SendFailure::timeout(self.send_timeout)),
        };

        let message = build_message(&account, &request, stored.as_ref(), outcome);
        self.commit(&account, message).await
    }

    async fn commit(&self, account: &Account, message: Message) -> Result<Message, ApiError> {
        let record = IdempotencyRecord {
            account_id: account.id.clone(),
            idempotency_key: message.idempotency_key.clone().unwrap_or_default(),
            message_id: message.id.clone(),
        };
        let crm = account
            .crm_webhook_url
            .clone()
            .map(|endpoint| (endpoint, account.webhook_secret.clone()));

        let to_store = message.clone();
        let result = self
            .coordinator
            .run(move |uow| {
                idempotency::record_outbound(uow, &to_store, &record)?;
                uow.defer(SideEffect::Broadcast(FeedEvent::MessageCreate {
                    message: MessageResponse::from(to_store.clone()),
                }));
                if let Some((endpoint, secret)) = crm {
                    uow.defer(SideEffect::CrmForward {
                        payload: CrmForwardPayload::for_message(&to_store),
                        endpoint,
                        secret,
                    });
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    account_id = %message.account_id,
                    message_id = %message.id,
                    status = message.status.as_str(),
                    "outbound message recorded"
                );
                Ok(message)
            }
            Err(ApiError::Storage(DbError::IdempotencyConflict {
                account_id,
                idempotency_key,
            })) => {
                warn!(%account_id, %idempotency_key, "lost idempotency race, returning winner");
                IdempotencyGuard::lookup(&self.db, &account_id, &idempotency_key)
                    .await?
                    .ok_or_else(|| ApiError::Internal("idempotency winner not readable".into()))
            }
            Err(e) => {
                if message.status == DeliveryStatus::Sent {
                    error!(
                        reconciliation_required = true,
                        account_id = %message.account_id,
                        message_id = %message.id,
                        provider_message_id =
                            message.provider_message_id.as_deref().unwrap_or_default(),
                        error = %e,
                        "platform accepted the message but it could not be recorded"
                    );
                }
                Err(e)
            }
        }
    }
}

fn validate(request: &OutboundRequest) -> Result<Option<PreparedAttachment>, ApiError> {
    if request.idempotency_key.trim().is_empty() {
        return Err(ApiError::InvalidMessage("idempotency_key is required".into()));
    }
    if request.recipient_id.trim().is_empty() {
        return Err(ApiError::InvalidMessage("recipient_id is required".into()));
    }

    let has_text = request.text.as_deref().is_some_and(|t| !t.is_empty());
    if !has_text && request.attachment.is_none() {
        return Err(ApiError::InvalidMessage(
            "message needs text or an attachment".into(),
        ));
    }

    let Some(upload) = &request.attachment else {
        return Ok(None);
    };
    let media = allowed_media(&upload.content_type)?;

    match (&upload.data, &upload.path) {
        (Some(data), None) => {
            let bytes = B64.decode(data).map_err(|_| {
                ApiError::InvalidMessage("attachment data is not valid base64".into())
            })?;
            media.check_size(bytes.len() as u64)?;
            Ok(Some(PreparedAttachment::Upload { bytes, media }))
        }
        (None, Some(path)) => Ok(Some(PreparedAttachment::Stored {
            path: path.clone(),
            media,
        })),
        _ => Err(ApiError::InvalidMessage(
            "attachment needs exactly one of data or path".into(),
        )),
    }
}

fn build_message(
    account: &Account,
    request: &OutboundRequest,
    stored: Option<&(MediaType, StoredMedia)>,
    outcome: Result<SendReceipt, SendFailure>,
) -> Message {
    let id = Uuid::new_v4().to_string();
    let attachments = stored
        .map(|(media_type, media)| vec![Attachment::new(&id, 0, *media_type, media.url.clone())])
        .unwrap_or_default();

    let mut message = Message {
        id,
        account_id: account.id.clone(),
        provider_message_id: None,
        sender_id: account.platform_account_id.clone(),
        recipient_id: request.recipient_id.clone(),
        text: request.text.clone().filter(|t| !t.is_empty()),
        direction: Direction::Outbound,
        timestamp: Utc::now(),
        status: DeliveryStatus::Sent,
        idempotency_key: Some(request.idempotency_key.clone()),
        error_code: None,
        error_message: None,
        attachments,
    };

    match outcome {
        Ok(receipt) => {
            message.provider_message_id = Some(receipt.provider_message_id);
            if let Some(partial) = receipt.partial_failure {
                message.error_code = Some(partial.code);
                message.error_message = Some(format!("partially sent: {}", partial.message));
            }
        }
        Err(failure) => {
            warn!(
                account_id = %account.id,
                message_id = %message.id,
                kind = ?failure.kind,
                code = %failure.code,
                "platform send failed: {}",
                failure.message
            );
            message.status = DeliveryStatus::Failed;
            message.error_code = Some(failure.code);
            message.error_message = Some(failure.message);
        }
    }
    message
}
