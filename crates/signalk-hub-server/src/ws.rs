//! WebSocket transport.
//!
//! This module accepts WebSocket consumers. Each connection:
//! - becomes one session in the hub
//! - receives a Hello message on connect
//! - gets a default subscription chosen by the `subscribe` query parameter
//!   (`self`, `all` or `none`; `self` when absent)
//! - has its inbound text frames fed into the ingestion pipeline
//!
//! Everything the router delivers to the session is written back as text
//! frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use signalk_hub_protocol::{encode_server_message, CodecError, ServerMessage, SubscribeRequest, Subscription};

use crate::hub::{Hub, HubError};
use crate::pipeline::IngestHandle;

/// Default subscription requested in the handshake URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeMode {
    /// Every path of the local vessel.
    #[default]
    Own,
    /// Every path of every vessel.
    All,
    /// Nothing until the client subscribes.
    Off,
}

impl SubscribeMode {
    /// Parse the `subscribe` parameter out of a query string.
    pub fn from_query(query: Option<&str>) -> Self {
        let Some(query) = query else {
            return Self::default();
        };
        for param in query.split('&') {
            if let Some(("subscribe", value)) = param.split_once('=') {
                return match value {
                    "all" => Self::All,
                    "none" => Self::Off,
                    _ => Self::Own,
                };
            }
        }
        Self::default()
    }

    /// The subscription this mode stands for.
    pub fn request(self) -> Option<SubscribeRequest> {
        let context = match self {
            Self::Own => "vessels.self",
            Self::All => "vessels.*",
            Self::Off => return None,
        };
        Some(SubscribeRequest {
            context: context.to_string(),
            subscribe: vec![Subscription {
                path: "*".to_string(),
                period: None,
                format: None,
            }],
        })
    }
}

/// Bind `addr` and serve WebSocket consumers until the listener fails.
pub async fn run(addr: SocketAddr, hub: Arc<Hub>, ingest: IngestHandle) -> Result<(), HubError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket transport listening on {}", addr);
    serve(listener, hub, ingest).await
}

/// Serve WebSocket consumers on an already bound listener.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, ingest: IngestHandle) -> Result<(), HubError> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                let ingest = ingest.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, hub, ingest).await {
                        error!("Connection error from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    ingest: IngestHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("New connection from {}", addr);

    let mut mode = SubscribeMode::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        mode = SubscribeMode::from_query(req.uri().query());
        Ok(resp)
    })
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let hello = encode_server_message(&ServerMessage::Hello(hub.hello()))?;
    ws_tx.send(Message::Text(hello)).await?;
    debug!("Sent Hello to {}", addr);

    let (session_id, mut outbound) = hub.open_session();
    if let Some(request) = mode.request() {
        if let Err(e) = hub.subscribe(&session_id, &request).await {
            warn!("Default subscription for {} failed: {}", addr, e);
        }
    }

    let result = pump(&session_id, addr, &mut ws_tx, &mut ws_rx, &mut outbound, &ingest).await;
    hub.close_session(&session_id).await;
    result
}

async fn pump<Tx, Rx>(
    session_id: &str,
    addr: SocketAddr,
    ws_tx: &mut Tx,
    ws_rx: &mut Rx,
    outbound: &mut tokio::sync::mpsc::Receiver<String>,
    ingest: &IngestHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    Tx: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    Rx: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if ingest.submit(Some(session_id), text).await.is_err() {
                            warn!("Ingestion closed, dropping {}", addr);
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring frame from {}: {}", addr, CodecError::BinaryFrame);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }

            // Handle payloads delivered to this session
            payload = outbound.recv() => {
                match payload {
                    Some(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            error!("Failed to send to {}: {}", addr, e);
                            break;
                        }
                    }
                    None => {
                        debug!("Session {} unregistered", session_id);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
