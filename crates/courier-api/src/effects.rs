//! Post-commit side effects.
//!
//! A committed unit of work hands its deferred actions to the
//! [`EffectDispatcher`] as one batch. A bounded pool of workers drains the
//! queue; each batch runs in registration order, each action under its own
//! timeout. Failures are logged and never reach the request that committed.
//! When the queue is full a bounded number of batches wait for room; past
//! that, batches are dropped with a warning.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use courier_crypto::signature::{SIGNATURE_HEADER, sign};
use courier_gateway::Dispatcher;
use courier_types::api::CrmForwardPayload;
use courier_types::events::FeedEvent;

/// A typed action registered inside a unit of work and run after commit.
#[derive(Debug, Clone)]
pub enum SideEffect {
    /// Push an event to live-feed listeners.
    Broadcast(FeedEvent),
    /// POST a signed payload to an account's CRM webhook.
    CrmForward {
        payload: CrmForwardPayload,
        endpoint: String,
        /// The account's webhook secret, used to sign the body.
        secret: String,
    },
}

impl SideEffect {
    fn kind(&self) -> &'static str {
        match self {
            Self::Broadcast(_) => "broadcast",
            Self::CrmForward { .. } => "crm_forward",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: &'static str, after: Duration },

    #[error("CRM endpoint returned {status}")]
    Rejected { status: u16 },

    #[error("CRM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode CRM payload: {0}")]
    Encode(String),
}

/// Where a submitted batch went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Queue full; a detached task is waiting for room.
    Parked,
    Dropped,
}

/// Queues committed batches for the worker pool.
#[derive(Clone)]
pub struct EffectDispatcher {
    tx: mpsc::Sender<Vec<SideEffect>>,
    parked: Arc<AtomicUsize>,
    max_parked: usize,
}

impl EffectDispatcher {
    pub fn spawn(
        workers: usize,
        capacity: usize,
        feed: Dispatcher,
        forwarder: CrmForwarder,
        timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let runner = Arc::new(EffectRunner {
            feed,
            forwarder,
            timeout,
        });

        let workers = workers.max(1);
        for worker in 0..workers {
            let rx = rx.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                loop {
                    let batch = { rx.lock().await.recv().await };
                    let Some(batch) = batch else {
                        debug!(worker, "effect queue closed, worker exiting");
                        break;
                    };
                    runner.run_batch(batch).await;
                }
            });
        }
        info!("Side-effect dispatcher started with {} workers", workers);

        Self {
            tx,
            parked: Arc::new(AtomicUsize::new(0)),
            max_parked: capacity,
        }
    }

    /// Hand a committed batch to the workers. Never blocks the caller: when
    /// the queue is full the batch waits on a detached task, up to as many
    /// waiting batches as the queue holds.
    pub fn submit(&self, batch: Vec<SideEffect>) -> Submitted {
        if batch.is_empty() {
            return Submitted::Queued;
        }
        match self.tx.try_send(batch) {
            Ok(()) => Submitted::Queued,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                if self.parked.fetch_add(1, Ordering::SeqCst) >= self.max_parked {
                    self.parked.fetch_sub(1, Ordering::SeqCst);
                    warn!(
                        actions = batch.len(),
                        waiting = self.max_parked,
                        "side-effect queue full, batch dropped"
                    );
                    return Submitted::Dropped;
                }
                warn!(actions = batch.len(), "side-effect queue full, deferring batch");
                let tx = self.tx.clone();
                let parked = self.parked.clone();
                tokio::spawn(async move {
                    if tx.send(batch).await.is_err() {
                        warn!("side-effect queue closed, batch dropped");
                    }
                    parked.fetch_sub(1, Ordering::SeqCst);
                });
                Submitted::Parked
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                warn!(actions = batch.len(), "side-effect queue closed, batch dropped");
                Submitted::Dropped
            }
        }
    }
}

struct EffectRunner {
    feed: Dispatcher,
    forwarder: CrmForwarder,
    timeout: Duration,
}

impl EffectRunner {
    async fn run_batch(&self, batch: Vec<SideEffect>) {
        for effect in batch {
            let kind = effect.kind();
            match tokio::time::timeout(self.timeout, self.run(effect)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(effect = kind, error = %e, "side effect failed"),
                Err(_) => {
                    let e = EffectError::Timeout {
                        kind,
                        after: self.timeout,
                    };
                    warn!(effect = kind, error = %e, "side effect failed");
                }
            }
        }
    }

    async fn run(&self, effect: SideEffect) -> Result<(), EffectError> {
        match effect {
            SideEffect::Broadcast(event) => {
                let reached = self.feed.broadcast(&event);
                debug!(listeners = reached, "feed event broadcast");
                Ok(())
            }
            SideEffect::CrmForward {
                payload,
                endpoint,
                secret,
            } => self.forwarder.forward(&endpoint, &secret, &payload).await,
        }
    }
}

/// Signs and POSTs CRM payloads. One attempt, no retry.
#[derive(Clone)]
pub struct CrmForwarder {
    client: reqwest::Client,
}

impl CrmForwarder {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn forward(
        &self,
        endpoint: &str,
        secret: &str,
        payload: &CrmForwardPayload,
    ) -> Result<(), EffectError> {
        let body = serde_json::to_vec(payload).map_err(|e| EffectError::Encode(e.to_string()))?;
        let signature = sign(&body, secret).map_err(|e| EffectError::Encode(e.to_string()))?;

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EffectError::Rejected {
                status: status.as_u16(),
            });
        }

        info!(
            message_id = %payload.message_id,
            account_id = %payload.account_id,
            event = %payload.event,
            "forwarded to CRM"
        );
        Ok(())
    }
}
