//! Line-delimited TCP transport.
//!
//! One JSON message per line in both directions. Inbound lines may end in
//! LF or CRLF; outbound lines always end in CRLF. A TCP session starts with
//! no subscriptions.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use signalk_hub_protocol::frame_line;

use crate::hub::{Hub, HubError};
use crate::pipeline::IngestHandle;

/// Longest accepted inbound line, in bytes.
pub const MAX_LINE: usize = 64 * 1024;

/// Bind `addr` and serve TCP clients until the listener fails.
pub async fn run(addr: SocketAddr, hub: Arc<Hub>, ingest: IngestHandle) -> Result<(), HubError> {
    let listener = TcpListener::bind(addr).await?;
    info!("TCP transport listening on {}", addr);
    serve(listener, hub, ingest).await
}

/// Serve TCP clients on an already bound listener.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, ingest: IngestHandle) -> Result<(), HubError> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                let ingest = ingest.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, hub, ingest).await {
                        error!("TCP connection error from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    ingest: IngestHandle,
) -> Result<(), HubError> {
    info!("New TCP connection from {}", addr);
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE));
    let (session_id, mut outbound) = hub.open_session();

    let result: Result<(), HubError> = async {
        loop {
            tokio::select! {
                line = lines.next() => {
                    match line {
                        Some(Ok(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            ingest.submit(Some(session_id.as_str()), line).await?;
                        }
                        Some(Err(e)) => {
                            warn!("Dropping TCP client {}: {}", addr, e);
                            break;
                        }
                        None => {
                            info!("TCP client {} disconnected", addr);
                            break;
                        }
                    }
                }
                payload = outbound.recv() => {
                    match payload {
                        Some(text) => write_half.write_all(frame_line(&text).as_bytes()).await?,
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
    .await;

    hub.close_session(&session_id).await;
    result
}
