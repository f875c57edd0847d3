use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use courier_crypto::credentials::CredentialVault;
use courier_db::Database;
use courier_gateway::Dispatcher;

use crate::coordinator::TransactionCoordinator;
use crate::effects::{CrmForwarder, EffectDispatcher};
use crate::idempotency::IdempotencyGuard;
use crate::inbound::InboundPipeline;
use crate::media::MediaStore;
use crate::outbound::{OutboundOrchestrator, SendCapability};
use crate::routing::AccountRouter;

/// Everything the relay needs, passed in explicitly. Nothing in this crate
/// reads the process environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Shared secret webhook deliveries are signed with.
    pub app_secret: String,
    /// Token echoed back during the subscription handshake.
    pub verify_token: String,
    /// Bearer token for the REST API and the live feed.
    pub api_token: String,
    pub graph_base_url: String,
    pub media_root: PathBuf,
    pub public_media_url: String,
    pub send_timeout: Duration,
    pub crm_timeout: Duration,
    pub effect_workers: usize,
    pub effect_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            app_secret: String::new(),
            verify_token: String::new(),
            api_token: String::new(),
            graph_base_url: "https://graph.facebook.com/v21.0".into(),
            media_root: PathBuf::from("./media"),
            public_media_url: "http://localhost:3000/media".into(),
            send_timeout: Duration::from_secs(15),
            crm_timeout: Duration::from_secs(10),
            effect_workers: 4,
            effect_queue: 256,
        }
    }
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub config: RelayConfig,
    pub vault: CredentialVault,
    pub dispatcher: Dispatcher,
    pub router: AccountRouter,
    pub inbound: InboundPipeline,
    pub outbound: OutboundOrchestrator,
}

impl AppStateInner {
    /// Wire the pipeline together and start the side-effect workers.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        db: Database,
        config: RelayConfig,
        vault: CredentialVault,
        sender: Arc<dyn SendCapability>,
    ) -> anyhow::Result<AppState> {
        let db = Arc::new(db);
        let dispatcher = Dispatcher::new();

        let forwarder = CrmForwarder::new(config.crm_timeout)?;
        let effects = EffectDispatcher::spawn(
            config.effect_workers,
            config.effect_queue,
            dispatcher.clone(),
            forwarder,
            config.crm_timeout,
        );

        let router = AccountRouter::new(db.clone());
        let coordinator = TransactionCoordinator::new(db.clone(), effects);
        let media = MediaStore::new(config.media_root.clone(), config.public_media_url.clone());

        let inbound = InboundPipeline::new(router.clone(), coordinator.clone());
        let outbound = OutboundOrchestrator::new(
            db.clone(),
            router.clone(),
            IdempotencyGuard::default(),
            coordinator,
            media,
            vault.clone(),
            sender,
            config.send_timeout,
        );

        Ok(Arc::new(Self {
            db,
            config,
            vault,
            dispatcher,
            router,
            inbound,
            outbound,
        }))
    }
}
