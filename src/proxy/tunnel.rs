//! CONNECT tunnels.
//!
//! Once the upstream transport is open the client gets a `200` and bytes
//! are relayed untouched. Each direction ends on its own: the client's end
//! of stream shuts down the upstream write half, and upstream EOF ends the
//! response while the client may keep sending.

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::codec::{LocalReply, RequestHead, ResetReason, ResponseHead, StreamEvent};
use crate::proxy::state::RouterState;
use crate::proxy::Downstream;
use crate::upstream::{BoxedIo, Cluster};

const READ_CHUNK: usize = 16 * 1024;

pub async fn run(cluster: &Cluster, head: RequestHead, downstream: Downstream) -> RouterState {
    let authority = head.authority.unwrap_or_default();
    let Some(host) = cluster.select_host() else {
        downstream.reply(LocalReply::upstream_unavailable()).await;
        return RouterState::Failed;
    };
    let io = match host.pool.open_tunnel().await {
        Ok(io) => io,
        Err(e) => {
            warn!(authority = %authority, host = %host.addr, error = %e, "Tunnel connect failed");
            downstream.reply(LocalReply::upstream_unavailable()).await;
            return RouterState::Failed;
        }
    };
    info!(authority = %authority, host = %host.addr, "Tunnel established");

    let established = StreamEvent::Headers {
        head: ResponseHead::new(StatusCode::OK),
        end_stream: false,
    };
    if !downstream.send(established).await {
        return RouterState::Reset;
    }
    let state = relay(io, downstream).await;
    debug!(authority = %authority, state = %state, "Tunnel closed");
    state
}

async fn relay(io: BoxedIo, mut downstream: Downstream) -> RouterState {
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut client_done = false;
    let mut upstream_done = false;

    while !(client_done && upstream_done) {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            event = downstream.requests.recv(), if !client_done => match event {
                Some(StreamEvent::Data { bytes, end_stream }) => {
                    if !bytes.is_empty() && writer.write_all(&bytes).await.is_err() {
                        downstream.send(StreamEvent::Reset(ResetReason::ConnectionTermination)).await;
                        return RouterState::Reset;
                    }
                    if end_stream {
                        if let Err(e) = writer.shutdown().await {
                            debug!(error = %e, "Tunnel upstream shutdown failed");
                        }
                        client_done = true;
                    }
                }
                Some(StreamEvent::Trailers(_)) => {
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "Tunnel upstream shutdown failed");
                    }
                    client_done = true;
                }
                Some(StreamEvent::Headers { .. }) | Some(StreamEvent::Reset(_)) | None => {
                    return RouterState::Reset;
                }
            },
            read = reader.read_buf(&mut buf), if !upstream_done => match read {
                Ok(0) => {
                    upstream_done = true;
                    let end = StreamEvent::Data { bytes: Bytes::new(), end_stream: true };
                    if !downstream.send(end).await {
                        return RouterState::Reset;
                    }
                }
                Ok(_) => {
                    let chunk = StreamEvent::Data { bytes: buf.split().freeze(), end_stream: false };
                    if !downstream.send(chunk).await {
                        return RouterState::Reset;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Tunnel upstream read failed");
                    downstream.send(StreamEvent::Reset(ResetReason::ConnectionTermination)).await;
                    return RouterState::Reset;
                }
            },
        }
    }
    RouterState::Complete
}
