//! Inbound message pipeline.
//!
//! Every inbound text, whatever transport it arrived on, goes through one
//! ordered worker:
//! 1. decode: parse the JSON
//! 2. classify: document, delta, get, list, subscribe or unsubscribe
//! 3. dispatch: merge into the model, answer the query, or update the
//!    session's subscriptions
//!
//! A single worker fed by a channel keeps application order equal to arrival
//! order, which is what last-writer-wins relies on.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use signalk_hub_protocol::{decode_inbound, InboundMessage, ServerMessage};

use crate::hub::{Hub, HubError};

/// One inbound text and the session it came from, if any. Producers that
/// only feed data (sensor gateways, the demo generator) have no session.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub session_id: Option<String>,
    pub text: String,
}

/// Sending side of the ingestion queue.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Inbound>,
}

impl IngestHandle {
    /// Queue a message, waiting for room.
    pub async fn submit(&self, session_id: Option<&str>, text: impl Into<String>) -> Result<(), HubError> {
        self.tx
            .send(Inbound {
                session_id: session_id.map(str::to_string),
                text: text.into(),
            })
            .await
            .map_err(|_| HubError::IngestClosed)
    }

    /// Queue a message if there is room.
    pub fn try_submit(&self, session_id: Option<&str>, text: impl Into<String>) -> Result<(), HubError> {
        self.tx
            .try_send(Inbound {
                session_id: session_id.map(str::to_string),
                text: text.into(),
            })
            .map_err(|_| HubError::IngestClosed)
    }
}

/// Start the ingestion worker. It runs until every [`IngestHandle`] is
/// dropped.
pub fn spawn(hub: Arc<Hub>, capacity: usize) -> (IngestHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Inbound>(capacity.max(1));

    let worker = tokio::spawn(async move {
        info!("Ingestion worker started");
        while let Some(inbound) = rx.recv().await {
            if let Err(e) = process(&hub, inbound).await {
                warn!("Inbound message rejected: {}", e);
            }
        }
        info!("Ingestion worker stopped");
    });

    (IngestHandle { tx }, worker)
}

/// Run one message through decode, classify and dispatch.
pub async fn process(hub: &Hub, inbound: Inbound) -> Result<(), HubError> {
    let message = decode_inbound(&inbound.text)?;
    debug!("Inbound {} from {:?}", message.kind(), inbound.session_id);
    dispatch(hub, inbound.session_id.as_deref(), message).await
}

async fn dispatch(hub: &Hub, session_id: Option<&str>, message: InboundMessage) -> Result<(), HubError> {
    match message {
        InboundMessage::Document(value) | InboundMessage::Delta(value) => {
            let report = hub.apply(&value).await?;
            if report.rejected > 0 {
                warn!("{} values rejected, {} applied", report.rejected, report.applied);
            }
        }
        InboundMessage::Get(request) => {
            let session_id = session_id.ok_or(HubError::NoSession("get"))?;
            let result = hub.get(&request).await;
            hub.reply(session_id, &ServerMessage::Full(result))?;
        }
        InboundMessage::List(request) => {
            let session_id = session_id.ok_or(HubError::NoSession("list"))?;
            let result = hub.list(&request).await;
            hub.reply(session_id, &ServerMessage::PathList(result))?;
        }
        InboundMessage::Subscribe(request) => {
            let session_id = session_id.ok_or(HubError::NoSession("subscribe"))?;
            hub.subscribe(session_id, &request).await?;
        }
        InboundMessage::Unsubscribe(request) => {
            let session_id = session_id.ok_or(HubError::NoSession("unsubscribe"))?;
            hub.unsubscribe(session_id, &request).await;
        }
    }
    Ok(())
}
