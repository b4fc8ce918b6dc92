//! The hub context object.
//!
//! A [`Hub`] owns everything one process needs: the canonical model behind
//! its lock, the merger, the subscription registry, the session hub and the
//! router. Transports and the ingestion worker hold an `Arc<Hub>`; there is
//! no global state.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use signalk_hub_core::query::{self, GetRequest, ListRequest, ListResponse};
use signalk_hub_core::{ConfigError, DeltaError, DeltaMerger, HubConfig, MergeReport, PatternError, SignalKModel};
use signalk_hub_protocol::{
    encode_server_message, CodecError, HelloMessage, ServerMessage, SubscribeRequest, UnsubscribeRequest,
};

use crate::delivery::{DeliveryError, SessionHub};
use crate::router::{DistributionRouter, SharedModel};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::subscription::{
    PeriodPolicy, SessionSubscription, SubscribeOutcome, SubscriptionRegistry, BROADCAST_SESSION,
};

/// Errors surfaced by the hub and its transports.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("invalid subscription path: {0}")]
    Pattern(#[from] PatternError),

    #[error("{0} requires a session")]
    NoSession(&'static str),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("ingestion queue closed")]
    IngestClosed,
}

/// Shared state of one hub process.
pub struct Hub {
    config: HubConfig,
    model: SharedModel,
    merger: DeltaMerger,
    registry: Mutex<SubscriptionRegistry>,
    sessions: Arc<SessionHub>,
    router: DistributionRouter,
    periods: PeriodPolicy,
}

impl Hub {
    /// Build a hub running its delivery jobs on tokio timers.
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        Self::with_scheduler(config, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(config: HubConfig, scheduler: Arc<dyn Scheduler>) -> Result<Arc<Self>, HubError> {
        config.validate()?;

        let model = SignalKModel::new(&config.self_id);
        let merger = DeltaMerger::new(model.resolver().clone());
        let model: SharedModel = Arc::new(RwLock::new(model));
        let sessions = Arc::new(SessionHub::new(config.session_queue));
        let router = DistributionRouter::new(model.clone(), sessions.clone(), scheduler);
        let periods = PeriodPolicy::from_millis(config.default_period_ms, config.min_period_ms);

        info!("Hub created for {}", config.self_context());
        Ok(Arc::new(Self {
            config,
            model,
            merger,
            registry: Mutex::new(SubscriptionRegistry::new()),
            sessions,
            router,
            periods,
        }))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The shared model handle.
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    pub fn sessions(&self) -> &Arc<SessionHub> {
        &self.sessions
    }

    pub fn router(&self) -> &DistributionRouter {
        &self.router
    }

    /// Hello message for a newly connected client.
    pub fn hello(&self) -> HelloMessage {
        HelloMessage::new(&self.config.name, &self.config.version, self.config.self_context())
    }

    // ========================================================================
    // Model access
    // ========================================================================

    /// Apply a delta or document under the write lock.
    pub async fn apply(&self, message: &Value) -> Result<MergeReport, DeltaError> {
        let mut model = self.model.write().await;
        self.merger.apply(&mut model, message)
    }

    /// Delete child `key` of the node at `path`.
    pub async fn delete(&self, path: &str, key: &str) -> bool {
        self.model.write().await.delete_at_path(path, key)
    }

    /// A private copy of the whole model. The read lock is held only while
    /// copying.
    pub async fn snapshot(&self) -> SignalKModel {
        self.model.read().await.duplicate()
    }

    pub async fn get(&self, request: &GetRequest) -> Value {
        let snapshot = self.snapshot().await;
        query::get(&snapshot, request)
    }

    pub async fn list(&self, request: &ListRequest) -> ListResponse {
        let snapshot = self.snapshot().await;
        query::list(&snapshot, request)
    }

    // ========================================================================
    // Sessions and subscriptions
    // ========================================================================

    /// Register a new consumer session.
    pub fn open_session(&self) -> (String, mpsc::Receiver<String>) {
        let (id, rx) = self.sessions.open();
        info!("Session {} opened", id);
        (id, rx)
    }

    /// Drop a session with all its subscriptions. Its jobs are stopped
    /// before this returns.
    pub async fn close_session(&self, session_id: &str) {
        let mut registry = self.registry.lock().await;
        let removed = registry.unsubscribe(session_id, None);
        let stopped = self.router.stop_session(session_id);
        self.sessions.unregister(session_id);
        drop(registry);
        info!(
            "Session {} closed ({} subscriptions, {} jobs)",
            session_id,
            removed.len(),
            stopped
        );
    }

    /// Register every subscription of a request for `session_id` and start
    /// its delivery job. Entries with an invalid path are skipped. A session
    /// that is no longer registered is refused.
    pub async fn subscribe(
        &self,
        session_id: &str,
        request: &SubscribeRequest,
    ) -> Result<Vec<SubscribeOutcome>, HubError> {
        let mut registry = self.registry.lock().await;
        // close_session unregisters under the same lock
        if session_id != BROADCAST_SESSION && !self.sessions.contains(session_id) {
            warn!("Session {}: subscribe after close ignored", session_id);
            return Err(HubError::SessionClosed(session_id.to_string()));
        }
        let mut outcomes = Vec::with_capacity(request.subscribe.len());

        for entry in &request.subscribe {
            let sub = match SessionSubscription::from_protocol(session_id, &request.context, entry, &self.periods) {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("Session {}: rejected subscription {:?}: {}", session_id, entry.path, e);
                    continue;
                }
            };
            self.router.start(&sub);
            let outcome = registry.subscribe(sub);
            debug!("Session {}: subscribed {} ({})", session_id, entry.path, outcome_name(&outcome));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Subscribe on behalf of every connected session.
    pub async fn subscribe_broadcast(&self, request: &SubscribeRequest) -> Result<Vec<SubscribeOutcome>, HubError> {
        self.subscribe(BROADCAST_SESSION, request).await
    }

    /// Remove subscriptions; a `"*"` path removes all of the session's.
    /// Returns how many were removed.
    pub async fn unsubscribe(&self, session_id: &str, request: &UnsubscribeRequest) -> usize {
        let mut registry = self.registry.lock().await;
        let mut removed = Vec::new();

        for entry in &request.unsubscribe {
            let filter = if entry.is_all() { None } else { Some(entry.path.as_str()) };
            removed.extend(registry.unsubscribe(session_id, filter));
        }
        for sub in &removed {
            self.router.stop(&sub.session_id, &sub.path_filter);
        }
        debug!("Session {}: {} subscriptions removed", session_id, removed.len());
        removed.len()
    }

    /// Every active subscription.
    pub async fn subscriptions(&self) -> Vec<SessionSubscription> {
        self.registry.lock().await.list_active()
    }

    /// Send a reply to one session.
    pub fn reply(&self, session_id: &str, message: &ServerMessage) -> Result<(), HubError> {
        let text = encode_server_message(message)?;
        self.sessions.send_text(session_id, text)?;
        Ok(())
    }

    /// Stop all delivery jobs.
    pub fn shutdown(&self) {
        self.router.stop_all();
        info!("Hub stopped");
    }
}

fn outcome_name(outcome: &SubscribeOutcome) -> &'static str {
    match outcome {
        SubscribeOutcome::Added => "added",
        SubscribeOutcome::Replaced(_) => "replaced",
    }
}
