//! Per-connection handling
//!
//! One reader loop applies the peer's messages strictly in arrival order;
//! one writer task sends the initial snapshot and then drains the peer's
//! outbound queue. The connection ends when either side stops, and the hub
//! then withdraws the peer's services.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{write_frame, FrameReader, SyncMessage};

use super::config::ServerConfig;
use super::hub::RegistryHub;
use super::peers::PeerInfo;

/// Longest a single frame may take to reach the socket
const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

async fn write_timed<W: AsyncWrite + Unpin>(writer: &mut W, msg: &SyncMessage) -> Result<()> {
    tokio::time::timeout(FRAME_WRITE_TIMEOUT, write_frame(writer, msg))
        .await
        .map_err(|_| Error::Transport("peer stopped reading".into()))?
}

/// Write `snapshot`, then everything queued on `rx` until it closes
async fn sync_then_drain<W: AsyncWrite + Unpin>(
    mut writer: W,
    snapshot: Vec<SyncMessage>,
    mut rx: mpsc::Receiver<SyncMessage>,
) -> Result<()> {
    for msg in &snapshot {
        write_timed(&mut writer, msg).await?;
    }
    while let Some(msg) = rx.recv().await {
        write_timed(&mut writer, &msg).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Serve one peer until it disconnects or is evicted
pub(crate) async fn serve(
    hub: Arc<RegistryHub>,
    socket: TcpStream,
    peer: PeerInfo,
    config: &ServerConfig,
) {
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::channel(config.outbound_queue);

    // Broadcasts queue up on `rx` behind the snapshot until the writer starts
    let snapshot = hub.on_new_client(&peer, tx).await;

    let session_id = peer.session_id;
    let mut writer = tokio::spawn(async move {
        if let Err(e) = sync_then_drain(write_half, snapshot, rx).await {
            tracing::debug!(session_id = session_id, error = %e, "Write failed");
        }
    });

    let mut reader = FrameReader::new(read_half, config.max_frame_size);
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Ok(Some(msg)) => {
                    tracing::debug!(
                        session_id = session_id,
                        kind = %msg.kind,
                        service = %msg.id,
                        "Message received"
                    );
                    hub.on_message(&peer, msg).await;
                }
                Ok(None) => {
                    tracing::debug!(session_id = session_id, "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::debug!(session_id = session_id, error = %e, "Read failed");
                    break;
                }
            },
            _ = &mut writer => {
                tracing::debug!(session_id = session_id, "Outbound side closed");
                break;
            }
        }
    }

    writer.abort();
    hub.on_client_quit(&peer).await;
}
