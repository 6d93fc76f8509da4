//! HTTP/2 downstream connection manager.
//!
//! # Data Flow
//! ```text
//! h2 server connection (accept loop, GOAWAY on drain)
//!     → one task per stream:
//!         request pump:  RecvBody → router channel, window released per chunk
//!         router task:   proxy::forward
//!         reply pump:    router replies → send_response / data / trailers / reset
//! ```
//!
//! # Design Decisions
//! - The listener buffer limit is the stream flow-control window, so a
//!   slow router stops the client instead of growing a buffer
//! - Conflicting `content-length` values reset the stream with
//!   `PROTOCOL_ERROR`; h2 itself checks the body against a single value

use std::future::poll_fn;
use std::sync::Arc;

use bytes::Bytes;
use h2::server::{self, SendResponse};
use h2::{Reason, RecvStream, SendStream};
use http::Request;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::framing;
use crate::codec::http2::{self, RecvBody};
use crate::codec::{LocalReply, RequestHead, ResetReason, StreamEvent};
use crate::http::{ConnectionSettings, ServerError};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::proxy::{self, downstream_channel, DownstreamHandle, ProxyContext, Reply};

/// Largest legal HTTP/2 window.
const MAX_WINDOW: usize = (1 << 31) - 1;

/// Serve HTTP/2 streams on `io` until the client goes away or a drain
/// finishes the connection.
pub async fn serve<S>(
    io: S,
    ctx: Arc<ProxyContext>,
    settings: &ConnectionSettings,
    connection_id: ConnectionId,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let window = settings.buffer_limit.clamp(1, MAX_WINDOW) as u32;
    let mut conn = server::Builder::new()
        .initial_window_size(window)
        .initial_connection_window_size(window)
        .max_header_list_size(settings.max_request_headers_bytes.min(u32::MAX as usize) as u32)
        .max_concurrent_streams(settings.max_concurrent_streams)
        .handshake::<_, Bytes>(io)
        .await?;

    let mut drain = ctx.drain.subscribe();
    let mut drain_open = true;
    let mut goaway_sent = false;
    if ctx.drain.is_draining() {
        conn.graceful_shutdown();
        goaway_sent = true;
    }

    loop {
        tokio::select! {
            accepted = conn.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    let stream_id = respond.stream_id().as_u32();
                    tokio::spawn(serve_stream(
                        Arc::clone(&ctx),
                        request,
                        respond,
                        settings.buffer_limit,
                        connection_id,
                        stream_id,
                    ));
                }
                Some(Err(e)) if e.is_io() || e.is_go_away() => {
                    debug!(connection_id = %connection_id, error = %e, "HTTP/2 connection closed");
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            changed = drain.changed(), if drain_open => match changed {
                Ok(()) => {
                    if *drain.borrow_and_update() && !goaway_sent {
                        debug!(connection_id = %connection_id, "Sending GOAWAY for drain");
                        conn.graceful_shutdown();
                        goaway_sent = true;
                    }
                }
                Err(_) => drain_open = false,
            },
        }
    }
    Ok(())
}

async fn serve_stream(
    ctx: Arc<ProxyContext>,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    buffer_limit: usize,
    connection_id: ConnectionId,
    stream_id: u32,
) {
    let (parts, body) = request.into_parts();
    let head = http2::request_head(parts);
    if let Err(e) = framing::content_length(&head.headers) {
        debug!(connection_id = %connection_id, stream_id, error = %e, "Rejecting stream");
        metrics::record_stream_reset(ResetReason::ProtocolError);
        respond.send_reset(Reason::PROTOCOL_ERROR);
        return;
    }
    trace!(
        connection_id = %connection_id,
        stream_id,
        method = %head.method,
        authority = ?head.authority,
        path = %head.path,
        "Stream opened"
    );

    let end_stream = body.is_end_stream();
    let mut body = RecvBody::new(body);
    if end_stream {
        body.mark_finished();
    }

    let (handle, downstream) = downstream_channel(buffer_limit);
    let DownstreamHandle { requests, replies } = handle;
    if requests
        .send(StreamEvent::Headers { head, end_stream })
        .await
        .is_err()
    {
        return;
    }
    tokio::spawn(proxy::forward(ctx, downstream));

    let pump = pump_request(body, &requests);
    tokio::pin!(pump);
    let reply = pump_replies(replies, &mut respond);
    tokio::pin!(reply);
    let mut pump_done = false;
    let outcome = loop {
        tokio::select! {
            _ = &mut pump, if !pump_done => pump_done = true,
            outcome = &mut reply => break outcome,
        }
    };
    match outcome {
        Outcome::Complete => metrics::record_stream_complete(),
        Outcome::ClientReset(reason) => {
            let _ = requests.send(StreamEvent::Reset(reason)).await;
            metrics::record_stream_reset(reason);
        }
        Outcome::Reset(reason) => metrics::record_stream_reset(reason),
    }
    trace!(connection_id = %connection_id, stream_id, outcome = ?outcome, "Stream closed");
}

/// Hand request body events to the router; window is returned per chunk
/// once the router's channel has taken it.
async fn pump_request(mut body: RecvBody, requests: &mpsc::Sender<StreamEvent<RequestHead>>) {
    while let Some(event) = body.next_event().await {
        let released = match &event {
            StreamEvent::Data { bytes, .. } => bytes.len(),
            _ => 0,
        };
        if requests.send(event).await.is_err() {
            return;
        }
        body.release(released);
    }
}

#[derive(Debug)]
enum Outcome {
    Complete,
    /// The client reset the stream before the response finished.
    ClientReset(ResetReason),
    Reset(ResetReason),
}

async fn pump_replies(mut replies: mpsc::Receiver<Reply>, respond: &mut SendResponse<Bytes>) -> Outcome {
    let mut sink: Option<SendStream<Bytes>> = None;
    loop {
        let reply = tokio::select! {
            reply = replies.recv() => reply,
            // Once headers are out the reset arrives on the body half.
            reset = poll_fn(|cx| match sink.as_mut() {
                Some(stream) => stream.poll_reset(cx),
                None => respond.poll_reset(cx),
            }) => {
                let reason = match reset {
                    Ok(_) => ResetReason::RemoteReset,
                    Err(e) => http2::reset_reason(&e),
                };
                return Outcome::ClientReset(reason);
            }
        };

        let Some(reply) = reply else {
            // Router went away without finishing the response.
            reset_stream(respond, sink.as_mut(), ResetReason::LocalReset);
            return Outcome::Reset(ResetReason::LocalReset);
        };

        match reply {
            Reply::Local(reply) => return send_local(respond, reply).await,
            Reply::Event(StreamEvent::Headers { head, end_stream }) => {
                match respond.send_response(http2::build_response(head), end_stream) {
                    Ok(stream) if end_stream => {
                        drop(stream);
                        return Outcome::Complete;
                    }
                    Ok(stream) => sink = Some(stream),
                    Err(e) => return Outcome::ClientReset(http2::reset_reason(&e)),
                }
            }
            Reply::Event(StreamEvent::Reset(reason)) => {
                reset_stream(respond, sink.as_mut(), reason);
                return Outcome::Reset(reason);
            }
            Reply::Event(event) => {
                let Some(stream) = sink.as_mut() else {
                    reset_stream(respond, None, ResetReason::ProtocolError);
                    return Outcome::Reset(ResetReason::ProtocolError);
                };
                let end_stream = event.is_end_stream();
                if let Err(e) = http2::send_event(stream, event).await {
                    return Outcome::ClientReset(http2::reset_reason(&e));
                }
                if end_stream {
                    return Outcome::Complete;
                }
            }
        }
    }
}

async fn send_local(respond: &mut SendResponse<Bytes>, reply: LocalReply) -> Outcome {
    metrics::record_local_reply(reply.status.as_u16());
    let empty = reply.body.is_empty();
    let mut stream = match respond.send_response(http2::build_response(reply.head()), empty) {
        Ok(stream) => stream,
        Err(e) => return Outcome::ClientReset(http2::reset_reason(&e)),
    };
    if !empty {
        if let Err(e) = http2::send_data(&mut stream, reply.body, true).await {
            return Outcome::ClientReset(http2::reset_reason(&e));
        }
    }
    Outcome::Complete
}

fn reset_stream(respond: &mut SendResponse<Bytes>, sink: Option<&mut SendStream<Bytes>>, reason: ResetReason) {
    match sink {
        Some(stream) => stream.send_reset(http2::h2_reason(reason)),
        None => respond.send_reset(http2::h2_reason(reason)),
    }
}
