//! Per-connection lifecycle.
//!
//! Each accepted socket gets one task reading 4-byte-length frames and a
//! writer task flushing responses. Kafka clients pipeline requests, so a
//! response slot (a oneshot) is allocated at dispatch time and the writer
//! resolves slots strictly in request-arrival order, no matter which
//! handler finishes first. Closing the connection cancels every parked
//! handler through the connection's token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::dispatcher;
use crate::BrokerContext;

const PIPELINE_DEPTH: usize = 128;

pub async fn run_connection(ctx: Arc<BrokerContext>, stream: TcpStream, peer: SocketAddr) {
    debug!(peer = %peer, "Connection opened");
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %err, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let cancel = ctx.shutdown.child_token();

    let (slot_tx, slot_rx) = mpsc::channel::<oneshot::Receiver<Option<Bytes>>>(PIPELINE_DEPTH);
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(write_loop(writer, slot_rx, writer_cancel));

    read_loop(&ctx, reader, peer, &cancel, slot_tx).await;

    // Tearing down: wake any parked handler owned by this connection.
    cancel.cancel();
    let _ = writer_task.await;
    debug!(peer = %peer, "Connection closed");
}

async fn read_loop(
    ctx: &Arc<BrokerContext>,
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    cancel: &tokio_util::sync::CancellationToken,
    slot_tx: mpsc::Sender<oneshot::Receiver<Option<Bytes>>>,
) {
    let idle_timeout = Duration::from_millis(ctx.config.network.idle_timeout_ms);
    let max_frame = ctx.config.network.max_frame_bytes;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = tokio::time::timeout(idle_timeout, read_frame(&mut reader, max_frame)) => {
                match frame {
                    Err(_) => {
                        debug!(peer = %peer, "Closing idle connection");
                        break;
                    }
                    Ok(Err(err)) => {
                        if err.kind() != std::io::ErrorKind::UnexpectedEof {
                            debug!(peer = %peer, error = %err, "Read error");
                        }
                        break;
                    }
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(frame))) => frame,
                }
            }
        };

        telemetry::metrics().requests_received.inc();
        telemetry::metrics().bytes_in.inc_by(frame.len() as u64);

        // Allocate the response slot before the handler runs so responses
        // flush in arrival order even when handlers park.
        let (resolve, slot) = oneshot::channel();
        if slot_tx.send(slot).await.is_err() {
            break;
        }
        let ctx = ctx.clone();
        let handler_cancel = cancel.clone();
        tokio::spawn(async move {
            match dispatcher::dispatch(&ctx, frame, peer.ip().to_string(), handler_cancel).await {
                dispatcher::Outcome::Respond(bytes) => {
                    let _ = resolve.send(Some(bytes));
                }
                dispatcher::Outcome::NoResponse => {
                    let _ = resolve.send(None);
                }
                // Dropping the slot makes the writer close the connection.
                dispatcher::Outcome::Close => drop(resolve),
            }
        });
    }
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    max_frame: usize,
) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_frame {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} outside (0, {max_frame}]"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Flushes responses in slot order. A `None` response (acks=0 produce, or
/// a fatal protocol error) writes nothing; the latter also closes the
/// connection because the slot sender is dropped.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut slots: mpsc::Receiver<oneshot::Receiver<Option<Bytes>>>,
    cancel: tokio_util::sync::CancellationToken,
) {
    while let Some(slot) = slots.recv().await {
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = slot => response,
        };
        match response {
            Ok(Some(bytes)) => {
                let len = (bytes.len() as u32).to_be_bytes();
                if writer.write_all(&len).await.is_err()
                    || writer.write_all(&bytes).await.is_err()
                {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
                telemetry::metrics().responses_sent.inc();
                telemetry::metrics().bytes_out.inc_by(bytes.len() as u64 + 4);
            }
            // No response owed for this request (acks=0).
            Ok(None) => {}
            // Protocol violation: the dispatcher asked for a close.
            Err(_) => {
                warn!("Closing connection after protocol error");
                break;
            }
        }
    }
    cancel.cancel();
    let _ = writer.shutdown().await;
}
