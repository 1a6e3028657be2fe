//! Per-connection protocol engine.
//!
//! One task owns the read side: it feeds TLS bytes through the staged
//! frame codec, dispatches each decoded request, and enqueues the
//! encoded response. A companion writer task drains the bounded queue
//! and performs the TLS shutdown once the reader is done. Responses
//! leave in request arrival order because the single reader is the only
//! producer.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use keyless_crypto::KeyStore;
use keyless_protocol::{
    Decoded, ErrorCode, Frame, FrameCodec, Items, ProtocolError, HEADER_SIZE, SEND_QUEUE_DEPTH,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{Decoder, Encoder};

/// Run one accepted connection to completion.
///
/// Returns when the peer closes, the transport fails, a server-internal
/// error poisons the stream, or `shutdown` fires.
pub async fn run(
    stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    keystore: Arc<KeyStore>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (queue_tx, queue_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);
    let writer_task = tokio::spawn(drain_queue(writer, queue_rx));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(4 * 1024);

    'conn: loop {
        // Drain every event already buffered before reading more bytes.
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(event)) => {
                    if !handle_event(&keystore, &mut codec, event, &queue_tx, peer) {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%peer, "frame decode failed: {e}");
                    break 'conn;
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(%peer, "connection closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%peer, "read failed: {e}");
                    break;
                }
            },
            _ = shutdown.recv() => {
                tracing::debug!(%peer, "closing connection for shutdown");
                break;
            }
        }
    }

    // Dropping the sender lets the writer flush whatever is queued, send
    // close_notify, and exit.
    drop(queue_tx);
    let _ = writer_task.await;
}

/// Dispatch one decoded event and enqueue its response.
///
/// Returns false when the connection must terminate: the writer is gone,
/// or the response could not be built (a server-side condition that is
/// never reported to the peer).
fn handle_event(
    keystore: &KeyStore,
    codec: &mut FrameCodec,
    event: Decoded,
    queue: &mpsc::Sender<Vec<u8>>,
    peer: SocketAddr,
) -> bool {
    let response = match event {
        Decoded::BadVersion { id } => {
            tracing::warn!(%peer, id, "unsupported protocol major version");
            Frame::error(id, ErrorCode::VersionMismatch)
        }
        Decoded::Frame(frame) => match respond(keystore, &frame) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(%peer, id = frame.header.id, "failed to build response: {e}");
                return false;
            }
        },
    };
    enqueue(codec, queue, response, peer)
}

/// Produce the response frame for one request: a RESPONSE on success,
/// otherwise an ERROR carrying the wire code. Both echo the request id.
fn respond(keystore: &KeyStore, frame: &Frame) -> Result<Frame, ProtocolError> {
    let id = frame.header.id;
    let items = match Items::parse(&frame.payload) {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(id, "malformed request payload: {e}");
            return Ok(Frame::error(id, ErrorCode::Format));
        }
    };
    match keyless_crypto::dispatch(keystore, &items) {
        Ok(result) => Frame::response(id, &result),
        Err(code) => Ok(Frame::error(id, code)),
    }
}

/// Encode and enqueue a response buffer.
///
/// The queue bound is a safety net: the workload is one response per
/// request, serial per connection, so a full queue means the peer has
/// stopped reading far beyond anything the protocol produces. The buffer
/// is dropped with an error log and the connection stays open.
fn enqueue(
    codec: &mut FrameCodec,
    queue: &mpsc::Sender<Vec<u8>>,
    frame: Frame,
    peer: SocketAddr,
) -> bool {
    let mut out = BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
    if let Err(e) = codec.encode(frame, &mut out) {
        tracing::error!(%peer, "failed to encode response: {e}");
        return false;
    }
    match queue.try_send(out.to_vec()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::error!(%peer, "outbound queue full, response dropped");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Writer half: drain queued buffers in FIFO order, then shut the TLS
/// session down once the reader is finished with the connection.
async fn drain_queue(
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut queue: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(buf) = queue.recv().await {
        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!("write failed: {e}");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!("flush failed: {e}");
            return;
        }
    }
    // Sends close_notify before closing the transport.
    let _ = writer.shutdown().await;
}
