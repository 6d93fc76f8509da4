//! HTTP/1 downstream connection manager.
//!
//! # Responsibilities
//! - Decode requests into the stream arena and feed them to a router task
//! - Encode router replies, and fixed local replies for protocol errors
//! - Keep-alive, drain-triggered close and CONNECT half-close
//!
//! # Design Decisions
//! - One exchange at a time; pipelined bytes wait in the read buffer
//! - The socket is not read while buffered body bytes sit at the listener
//!   limit
//! - A client that closes mid-exchange resets its stream; only tunnels
//!   treat EOF as a half-close

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::codec::http1::ServerCodec;
use crate::codec::{Codec, LocalReply, ProtocolError, RequestHead, ResetReason, StreamEvent, StreamId};
use crate::http::{ConnectionSettings, ServerError};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::proxy::{self, downstream_channel, ProxyContext, Reply};
use crate::stream::StreamManager;

const READ_CHUNK: usize = 8 * 1024;

/// Serve HTTP/1 exchanges on `io` until either side closes.
pub async fn serve<S>(
    io: S,
    ctx: Arc<ProxyContext>,
    settings: &ConnectionSettings,
    connection_id: ConnectionId,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut drain = ctx.drain.subscribe();
    let mut conn = Connection {
        io,
        ctx,
        codec: ServerCodec::new(settings.http1.clone()),
        streams: StreamManager::new(settings.buffer_limit),
        read_buf: BytesMut::with_capacity(READ_CHUNK),
        write_buf: BytesMut::new(),
        buffer_limit: settings.buffer_limit,
        current: None,
        requests: None,
        replies: None,
        next_id: 1,
        read_eof: false,
        write_shutdown: false,
        connection_id,
    };
    let result = conn.run(&mut drain).await;
    conn.retire(ResetReason::ConnectionTermination);
    result
}

/// What woke the connection up.
enum Step {
    Read(io::Result<usize>),
    Reply(Option<Reply>),
    Fed,
    RouterGone,
    Drain(bool),
}

struct Connection<S> {
    io: S,
    ctx: Arc<ProxyContext>,
    codec: ServerCodec,
    streams: StreamManager<RequestHead>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    buffer_limit: usize,
    /// Stream of the exchange in progress.
    current: Option<StreamId>,
    requests: Option<mpsc::Sender<StreamEvent<RequestHead>>>,
    replies: Option<mpsc::Receiver<Reply>>,
    next_id: StreamId,
    read_eof: bool,
    write_shutdown: bool,
    connection_id: ConnectionId,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self, drain: &mut watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut drain_open = true;
        loop {
            if let Err(err) = self.decode_available() {
                return self.reject(err).await;
            }

            if self.codec.is_closing() {
                if !self.tunnel_open() {
                    break;
                }
                if !self.write_shutdown {
                    self.io.shutdown().await?;
                    self.write_shutdown = true;
                }
            } else if self.read_eof && !self.codec.is_tunnel() {
                if self.current.is_some() {
                    debug!(connection_id = %self.connection_id, "Client closed mid-exchange");
                    self.retire(ResetReason::RemoteReset);
                }
                break;
            }

            let can_read = !self.read_eof
                && self.streams.should_read()
                && self.read_buf.len() < self.buffer_limit;
            let has_pending = self.current.is_some_and(|id| self.streams.has_pending(id));
            let current = self.current;

            let step = tokio::select! {
                read = self.io.read_buf(&mut self.read_buf), if can_read => Step::Read(read),
                reply = next_reply(self.replies.as_mut()), if self.replies.is_some() => Step::Reply(reply),
                permit = reserve(self.requests.as_ref()), if has_pending => match permit {
                    Some(permit) => {
                        if let Some(event) = current.and_then(|id| self.streams.pop(id)) {
                            permit.send(event);
                        }
                        Step::Fed
                    }
                    None => Step::RouterGone,
                },
                changed = drain.changed(), if drain_open => Step::Drain(changed.is_ok()),
            };

            match step {
                Step::Read(Ok(0)) => self.read_eof = true,
                Step::Read(Ok(n)) => trace!(connection_id = %self.connection_id, bytes = n, "Read"),
                Step::Read(Err(e)) => {
                    self.retire(ResetReason::ConnectionTermination);
                    return Err(e.into());
                }
                Step::Reply(Some(reply)) => self.on_reply(reply).await?,
                Step::Reply(None) => self.on_router_exit().await?,
                Step::Fed => {}
                Step::RouterGone => {
                    self.requests = None;
                    if let Some(id) = self.current {
                        while self.streams.pop(id).is_some() {}
                    }
                }
                Step::Drain(open) => {
                    drain_open = open;
                    if open && *drain.borrow_and_update() {
                        if self.current.is_none() && self.read_buf.is_empty() {
                            debug!(connection_id = %self.connection_id, "Closing idle connection for drain");
                            break;
                        }
                        self.codec.force_close();
                    }
                }
            }
        }

        self.flush().await?;
        if !self.write_shutdown {
            if let Err(e) = self.io.shutdown().await {
                debug!(connection_id = %self.connection_id, error = %e, "Shutdown failed");
            }
        }
        Ok(())
    }

    /// Move every complete event out of the read buffer.
    fn decode_available(&mut self) -> Result<(), ProtocolError> {
        loop {
            let event = if self.read_eof {
                self.codec.decode_eof(&mut self.read_buf)?
            } else {
                self.codec.decode(&mut self.read_buf)?
            };
            let Some(event) = event else {
                return Ok(());
            };
            match event {
                StreamEvent::Headers { head, end_stream } => self.begin_exchange(head, end_stream)?,
                event => {
                    let id = self
                        .current
                        .ok_or(ProtocolError::Malformed("body without request"))?;
                    // Discarded once the router has stopped listening.
                    if self.requests.is_some() {
                        self.streams.push(id, event)?;
                    }
                }
            }
        }
    }

    fn begin_exchange(&mut self, head: RequestHead, end_stream: bool) -> Result<(), ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;
        debug!(
            connection_id = %self.connection_id,
            stream_id = id,
            method = %head.method,
            authority = ?head.authority,
            path = %head.path,
            "Request received"
        );
        self.streams.begin_stream(id)?;
        self.streams.push_headers(id, head, end_stream)?;

        let (handle, downstream) = downstream_channel(self.buffer_limit);
        tokio::spawn(proxy::forward(Arc::clone(&self.ctx), downstream));
        self.current = Some(id);
        self.requests = Some(handle.requests);
        self.replies = Some(handle.replies);
        Ok(())
    }

    async fn on_reply(&mut self, reply: Reply) -> Result<(), ServerError> {
        let ended = match reply {
            Reply::Event(event) => {
                if matches!(event, StreamEvent::Headers { .. }) && self.ctx.drain.is_draining() {
                    self.codec.force_close();
                }
                if let StreamEvent::Reset(reason) = &event {
                    debug!(connection_id = %self.connection_id, %reason, "Response reset");
                }
                let ended = event.is_end_stream() || matches!(event, StreamEvent::Reset(_));
                if let Err(e) = self.codec.encode(event, &mut self.write_buf) {
                    warn!(connection_id = %self.connection_id, error = %e, "Dropping out-of-order response event");
                    if let Err(e) = self
                        .codec
                        .encode(StreamEvent::Reset(ResetReason::ProtocolError), &mut self.write_buf)
                    {
                        debug!(connection_id = %self.connection_id, error = %e, "Could not reset response");
                    }
                    true
                } else {
                    ended
                }
            }
            Reply::Local(reply) => {
                if self.ctx.drain.is_draining() {
                    self.codec.force_close();
                }
                self.encode_local(reply)?;
                true
            }
        };
        self.flush().await?;
        if ended {
            self.end_response();
        }
        Ok(())
    }

    /// The router finished without ending the response.
    async fn on_router_exit(&mut self) -> Result<(), ServerError> {
        self.replies = None;
        if self.codec.is_tunnel() || self.current.is_none() {
            return Ok(());
        }
        if let Err(e) = self
            .codec
            .encode(StreamEvent::Reset(ResetReason::LocalReset), &mut self.write_buf)
        {
            debug!(connection_id = %self.connection_id, error = %e, "Could not reset response");
        }
        self.retire(ResetReason::LocalReset);
        Ok(())
    }

    fn end_response(&mut self) {
        let Some(id) = self.current else {
            return;
        };
        if let Err(e) = self.streams.end_response(id) {
            debug!(connection_id = %self.connection_id, stream_id = id, error = %e, "Response ended on unknown stream");
        }
        if self.codec.is_tunnel() && self.codec.request_in_progress() {
            // The client may keep sending after the upstream has finished.
            self.replies = None;
            return;
        }
        self.retire(ResetReason::LocalReset);
    }

    /// Drop the current exchange. A stream that did not complete counts as reset.
    fn retire(&mut self, reason: ResetReason) {
        if let Some(id) = self.current.take() {
            if let Some(mut stream) = self.streams.remove(id) {
                stream.reset(reason);
            }
        }
        self.requests = None;
        self.replies = None;
    }

    fn tunnel_open(&self) -> bool {
        self.requests.is_some()
            && self.codec.is_tunnel()
            && (self.codec.request_in_progress()
                || self.current.is_some_and(|id| self.streams.has_pending(id)))
    }

    async fn reject(&mut self, err: ProtocolError) -> Result<(), ServerError> {
        debug!(connection_id = %self.connection_id, error = %err, "Rejecting request");
        self.retire(ResetReason::ProtocolError);
        if err == ProtocolError::UnexpectedEof || self.codec.response_started() {
            return Ok(());
        }
        self.codec.force_close();
        self.encode_local(LocalReply::from_protocol_error(&err))?;
        self.flush().await?;
        if let Err(e) = self.io.shutdown().await {
            debug!(connection_id = %self.connection_id, error = %e, "Shutdown failed");
        }
        Ok(())
    }

    fn encode_local(&mut self, reply: LocalReply) -> Result<(), ServerError> {
        metrics::record_local_reply(reply.status.as_u16());
        if reply.close {
            self.codec.force_close();
        }
        let head = reply.head();
        let empty = reply.body.is_empty();
        let encoded = self
            .codec
            .encode(StreamEvent::Headers { head, end_stream: empty }, &mut self.write_buf)
            .and_then(|()| {
                if empty {
                    return Ok(());
                }
                self.codec.encode(
                    StreamEvent::Data { bytes: reply.body, end_stream: true },
                    &mut self.write_buf,
                )
            });
        if let Err(e) = encoded {
            warn!(connection_id = %self.connection_id, error = %e, "Local reply after response start");
            self.codec.force_close();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.io.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.io.flush().await?;
        Ok(())
    }
}

async fn next_reply(replies: Option<&mut mpsc::Receiver<Reply>>) -> Option<Reply> {
    match replies {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reserve<T>(tx: Option<&mpsc::Sender<T>>) -> Option<mpsc::Permit<'_, T>> {
    match tx {
        Some(tx) => tx.reserve().await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::lifecycle::DrainCoordinator;
    use crate::upstream::TcpConnector;
    use tokio::io::DuplexStream;

    fn context() -> Arc<ProxyContext> {
        Arc::new(ProxyContext::new(
            &ProxyConfig::default(),
            Arc::new(TcpConnector),
            DrainCoordinator::new(),
        ))
    }

    fn spawn_connection(ctx: Arc<ProxyContext>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let settings = ConnectionSettings::default();
            serve(server, ctx, &settings, ConnectionId::new()).await
        });
        client
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn malformed_request_gets_fixed_400() {
        let mut client = spawn_connection(context());
        client.write_all(b"hello\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn no_route_keeps_connection_open() {
        let mut client = spawn_connection(context());
        client
            .write_all(b"GET /a HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .await
            .unwrap();
        let first = read_response(&mut client).await;
        assert!(first.starts_with("HTTP/1.1 404 Not Found\r\n"), "{first}");
        assert!(!first.contains("connection: close"));

        client
            .write_all(b"GET /b HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .await
            .unwrap();
        let second = read_response(&mut client).await;
        assert!(second.starts_with("HTTP/1.1 404 Not Found\r\n"), "{second}");
    }

    #[tokio::test]
    async fn drain_closes_after_next_response() {
        let ctx = context();
        ctx.drain.start_draining();
        let mut client = spawn_connection(Arc::clone(&ctx));
        client
            .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8_lossy(&out);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
        assert!(out.contains("connection: close\r\n"));
    }
}
