//! Handing payloads to connected consumers.
//!
//! The router only knows the [`Delivery`] trait: give it a payload and a
//! target, it frames and ships it. [`SessionHub`] is the implementation used
//! by the transports. Each session owns a bounded queue drained by its
//! connection task; delivery never blocks, a full queue drops the message
//! for that session only.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Who a payload is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Session(String),
    Broadcast,
}

/// Errors that can occur when handing a payload over.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session {0} is not keeping up, message dropped")]
    Backpressure(String),

    #[error("session {0} is closed")]
    Closed(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for outbound payloads.
///
/// Implementations must not block: the router calls this from its job tasks.
pub trait Delivery: Send + Sync {
    fn deliver(&self, payload: &Value, target: &Target) -> Result<(), DeliveryError>;
}

/// Registry of live sessions and their outbound queues.
#[derive(Debug)]
pub struct SessionHub {
    sessions: RwLock<HashMap<String, mpsc::Sender<String>>>,
    queue: usize,
}

impl SessionHub {
    /// Create a hub whose sessions buffer up to `queue` messages each.
    pub fn new(queue: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue: queue.max(1),
        }
    }

    /// Register a new session under a fresh id.
    pub fn open(&self) -> (String, mpsc::Receiver<String>) {
        let id = uuid::Uuid::new_v4().to_string();
        let rx = self.register(&id);
        (id, rx)
    }

    /// Register a session under a given id, replacing any previous one.
    pub fn register(&self, session_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.queue);
        self.write().insert(session_id.to_string(), tx);
        debug!("Session {} registered", session_id);
        rx
    }

    /// Forget a session. Its receiver sees the end of the stream.
    pub fn unregister(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id).is_some();
        if removed {
            debug!("Session {} unregistered", session_id);
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Queue already encoded text for one session.
    pub fn send_text(&self, session_id: &str, text: String) -> Result<(), DeliveryError> {
        let sessions = self.read();
        let tx = sessions
            .get(session_id)
            .ok_or_else(|| DeliveryError::UnknownSession(session_id.to_string()))?;
        try_queue(session_id, tx, text)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, mpsc::Sender<String>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, mpsc::Sender<String>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn try_queue(session_id: &str, tx: &mpsc::Sender<String>, text: String) -> Result<(), DeliveryError> {
    tx.try_send(text).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure(session_id.to_string()),
        mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(session_id.to_string()),
    })
}

impl Delivery for SessionHub {
    fn deliver(&self, payload: &Value, target: &Target) -> Result<(), DeliveryError> {
        let text = serde_json::to_string(payload)?;
        match target {
            Target::Session(id) => self.send_text(id, text),
            Target::Broadcast => {
                for (id, tx) in self.read().iter() {
                    if let Err(e) = try_queue(id, tx, text.clone()) {
                        warn!("Broadcast skipped: {}", e);
                    }
                }
                Ok(())
            }
        }
    }
}
