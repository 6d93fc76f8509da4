//! Per-host upstream connection pool.
//!
//! # Responsibilities
//! - Hand out an upstream stream, reusing a connection when possible
//! - Open new connections up to the per-host ceiling
//! - Wait for a release at the ceiling, bounded by the connect timeout
//! - Retire connections on drain, `GOAWAY` or failure
//!
//! # Design Decisions
//! - HTTP/1 idle connections are a LIFO stack; the most recently used one
//!   is the likeliest to still be open
//! - An idle HTTP/1 connection is checked for EOF before it is handed out
//! - `open` counts idle, in-use and still-connecting connections alike
//! - Every connection carries the drain generation it was opened in; one
//!   released after a drain is closed instead of pooled
//! - A reserved connection or stream slot is held by a [`Slot`] until an
//!   exchange takes it over, so a cancelled `acquire` gives it back

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use h2::client::SendRequest;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::codec::http1::ClientCodec;
use crate::codec::Protocol;
use crate::config::ClusterConfig;
use crate::observability::metrics;
use crate::upstream::client::{Http1Exchange, Http2Exchange, UpstreamStream};
use crate::upstream::{BoxedIo, Connector, UpstreamError};

const MAX_RESPONSE_HEADERS_BYTES: usize = 64 * 1024;

/// Limits applied by one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub protocol: Protocol,
    pub max_connections: usize,
    pub max_streams_per_connection: usize,
    pub connect_timeout: Duration,
    pub max_response_headers_bytes: usize,
}

impl PoolSettings {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        Self {
            protocol: config.protocol,
            max_connections: config.max_connections_per_host,
            max_streams_per_connection: config.max_streams_per_connection,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_response_headers_bytes: MAX_RESPONSE_HEADERS_BYTES,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_cluster(&ClusterConfig::default())
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub multiplexed: usize,
}

/// A pooled HTTP/1 connection.
pub(crate) struct Http1Connection {
    pub(crate) id: u64,
    pub(crate) io: BoxedIo,
    pub(crate) codec: ClientCodec,
    pub(crate) read_buf: BytesMut,
    generation: u64,
}

impl Http1Connection {
    /// True when the peer closed or sent unsolicited bytes while idle.
    fn closed_while_idle(&mut self) -> bool {
        match self.io.read_buf(&mut self.read_buf).now_or_never() {
            None => false,
            Some(Ok(_)) | Some(Err(_)) => true,
        }
    }
}

impl fmt::Debug for Http1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug)]
struct Http2Entry {
    id: u64,
    sender: SendRequest<Bytes>,
    active: usize,
    draining: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Http1Connection>,
    multiplexed: Vec<Http2Entry>,
    open: usize,
    generation: u64,
    next_id: u64,
}

enum Checkout {
    Idle(Http1Connection),
    Multiplexed { id: u64, sender: SendRequest<Bytes> },
    Connect { id: u64, generation: u64 },
    Wait,
}

#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Connection,
    Stream(u64),
}

/// A reservation against the pool's counters. Dropped while still armed it
/// undoes the reservation.
struct Slot {
    pool: ConnectionPool,
    kind: SlotKind,
    armed: bool,
}

impl Slot {
    fn new(pool: &ConnectionPool, kind: SlotKind) -> Self {
        Self {
            pool: pool.clone(),
            kind,
            armed: true,
        }
    }

    /// The reservation now belongs to an exchange or a pooled entry.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.kind {
            SlotKind::Connection => self.pool.discard(),
            SlotKind::Stream(id) => self.pool.finish_stream(id, false),
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    cluster: String,
    addr: SocketAddr,
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    released: Notify,
}

/// Connections to one upstream host.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        cluster: impl Into<String>,
        addr: SocketAddr,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cluster: cluster.into(),
                addr,
                settings,
                connector,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            multiplexed: state.multiplexed.len(),
        }
    }

    /// Obtain a stream on a ready connection to this host.
    pub async fn acquire(&self) -> Result<UpstreamStream, UpstreamError> {
        let deadline = Instant::now() + self.inner.settings.connect_timeout;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout() {
                Checkout::Idle(mut conn) => {
                    if conn.closed_while_idle() {
                        debug!(host = %self.inner.addr, connection = conn.id, "Idle connection closed by peer");
                        self.discard();
                        continue;
                    }
                    debug!(host = %self.inner.addr, connection = conn.id, "Reusing idle connection");
                    return Ok(UpstreamStream::Http1(Http1Exchange::new(self.clone(), conn, true)));
                }
                Checkout::Multiplexed { id, sender } => {
                    let slot = Slot::new(self, SlotKind::Stream(id));
                    match timeout_at(deadline, sender.ready()).await {
                        Ok(Ok(sender)) => {
                            slot.disarm();
                            return Ok(UpstreamStream::Http2(Http2Exchange::new(
                                self.clone(),
                                id,
                                sender,
                                true,
                            )));
                        }
                        Ok(Err(e)) => {
                            debug!(host = %self.inner.addr, connection = id, error = %e, "Connection no longer accepts streams");
                            slot.disarm();
                            self.finish_stream(id, true);
                        }
                        Err(_) => {
                            drop(slot);
                            return Err(UpstreamError::Overflow(self.inner.addr));
                        }
                    }
                }
                Checkout::Connect { id, generation } => {
                    let slot = Slot::new(self, SlotKind::Connection);
                    return self.connect(slot, id, generation, deadline).await;
                }
                Checkout::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        warn!(
                            cluster = %self.inner.cluster,
                            host = %self.inner.addr,
                            "Connection pool at capacity"
                        );
                        return Err(UpstreamError::Overflow(self.inner.addr));
                    }
                }
            }
        }
    }

    /// Open a raw transport outside the pool, for CONNECT tunnels.
    pub async fn open_tunnel(&self) -> Result<BoxedIo, UpstreamError> {
        let addr = self.inner.addr;
        let connect = self.inner.connector.connect(addr);
        match tokio::time::timeout(self.inner.settings.connect_timeout, connect).await {
            Ok(Ok(io)) => Ok(io),
            Ok(Err(source)) => {
                metrics::record_connect_failure(&self.inner.cluster);
                Err(UpstreamError::Connect { addr, source })
            }
            Err(_) => {
                metrics::record_connect_failure(&self.inner.cluster);
                Err(UpstreamError::ConnectTimeout(addr))
            }
        }
    }

    /// Close idle connections and mark the rest draining.
    pub fn drain_connections(&self) {
        let (idle, retired) = {
            let mut state = self.lock();
            state.generation += 1;
            let idle = std::mem::take(&mut state.idle);
            let (busy, retired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.multiplexed)
                .into_iter()
                .map(|mut entry| {
                    entry.draining = true;
                    entry
                })
                .partition(|entry| entry.active > 0);
            state.multiplexed = busy;
            state.open = state.open.saturating_sub(idle.len() + retired.len());
            (idle, retired)
        };
        debug!(
            host = %self.inner.addr,
            closed = idle.len() + retired.len(),
            "Draining upstream connections"
        );
        drop(idle);
        drop(retired);
        self.inner.released.notify_waiters();
    }

    fn checkout(&self) -> Checkout {
        let max_streams = self.inner.settings.max_streams_per_connection;
        let mut state = self.lock();
        match self.inner.settings.protocol {
            Protocol::Http1 => {
                if let Some(conn) = state.idle.pop() {
                    return Checkout::Idle(conn);
                }
            }
            Protocol::Http2 => {
                let entry = state
                    .multiplexed
                    .iter_mut()
                    .find(|e| !e.draining && e.active < max_streams);
                if let Some(entry) = entry {
                    entry.active += 1;
                    return Checkout::Multiplexed {
                        id: entry.id,
                        sender: entry.sender.clone(),
                    };
                }
            }
        }
        if state.open < self.inner.settings.max_connections {
            state.open += 1;
            state.next_id += 1;
            return Checkout::Connect {
                id: state.next_id,
                generation: state.generation,
            };
        }
        Checkout::Wait
    }

    async fn connect(
        &self,
        slot: Slot,
        id: u64,
        generation: u64,
        deadline: Instant,
    ) -> Result<UpstreamStream, UpstreamError> {
        let addr = self.inner.addr;
        let io = match timeout_at(deadline, self.inner.connector.connect(addr)).await {
            Ok(Ok(io)) => io,
            Ok(Err(source)) => {
                self.connect_failed();
                return Err(UpstreamError::Connect { addr, source });
            }
            Err(_) => {
                self.connect_failed();
                return Err(UpstreamError::ConnectTimeout(addr));
            }
        };
        debug!(cluster = %self.inner.cluster, host = %addr, connection = id, "Upstream connection established");

        match self.inner.settings.protocol {
            Protocol::Http1 => {
                let conn = Http1Connection {
                    id,
                    io,
                    codec: ClientCodec::new(self.inner.settings.max_response_headers_bytes),
                    read_buf: BytesMut::with_capacity(8 * 1024),
                    generation,
                };
                slot.disarm();
                Ok(UpstreamStream::Http1(Http1Exchange::new(self.clone(), conn, false)))
            }
            Protocol::Http2 => {
                let handshake = h2::client::Builder::new().handshake::<_, Bytes>(io);
                let (sender, connection) = match timeout_at(deadline, handshake).await {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(source)) => {
                        self.connect_failed();
                        return Err(UpstreamError::Handshake { addr, source });
                    }
                    Err(_) => {
                        self.connect_failed();
                        return Err(UpstreamError::ConnectTimeout(addr));
                    }
                };

                let pool = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(host = %pool.inner.addr, connection = id, error = %e, "Upstream connection error");
                    }
                    pool.connection_closed(id);
                });

                // The connection slot becomes the entry; this stream holds one
                // of its stream slots.
                {
                    let mut state = self.lock();
                    let draining = generation != state.generation;
                    state.multiplexed.push(Http2Entry {
                        id,
                        sender: sender.clone(),
                        active: 1,
                        draining,
                    });
                }
                slot.disarm();
                let slot = Slot::new(self, SlotKind::Stream(id));

                match timeout_at(deadline, sender.ready()).await {
                    Ok(Ok(sender)) => {
                        slot.disarm();
                        Ok(UpstreamStream::Http2(Http2Exchange::new(self.clone(), id, sender, false)))
                    }
                    Ok(Err(e)) => {
                        slot.disarm();
                        self.finish_stream(id, true);
                        Err(UpstreamError::Reset(crate::codec::http2::reset_reason(&e)))
                    }
                    Err(_) => Err(UpstreamError::ConnectTimeout(addr)),
                }
            }
        }
    }

    /// Return an HTTP/1 connection after its exchange ends.
    pub(crate) fn release_http1(&self, conn: Http1Connection, reusable: bool) {
        let dropped = {
            let mut state = self.lock();
            if reusable && conn.generation == state.generation {
                state.idle.push(conn);
                None
            } else {
                state.open = state.open.saturating_sub(1);
                Some(conn)
            }
        };
        if let Some(conn) = dropped {
            debug!(host = %self.inner.addr, connection = conn.id, "Closing upstream connection");
        }
        self.inner.released.notify_one();
    }

    /// Give back one stream slot on an HTTP/2 connection. `retire` stops
    /// new streams from landing on it.
    pub(crate) fn finish_stream(&self, id: u64, retire: bool) {
        let removed = {
            let mut state = self.lock();
            let Some(pos) = state.multiplexed.iter().position(|e| e.id == id) else {
                return;
            };
            let entry = &mut state.multiplexed[pos];
            entry.active = entry.active.saturating_sub(1);
            entry.draining |= retire;
            if entry.draining && entry.active == 0 {
                state.open = state.open.saturating_sub(1);
                Some(state.multiplexed.swap_remove(pos))
            } else {
                None
            }
        };
        drop(removed);
        self.inner.released.notify_one();
    }

    fn connection_closed(&self, id: u64) {
        let removed = {
            let mut state = self.lock();
            let Some(pos) = state.multiplexed.iter().position(|e| e.id == id) else {
                return;
            };
            let entry = &mut state.multiplexed[pos];
            entry.draining = true;
            if entry.active == 0 {
                state.open = state.open.saturating_sub(1);
                Some(state.multiplexed.swap_remove(pos))
            } else {
                None
            }
        };
        debug!(host = %self.inner.addr, connection = id, "Upstream connection closed");
        drop(removed);
        self.inner.released.notify_one();
    }

    /// The caller's connection slot is given back when it drops.
    fn connect_failed(&self) {
        metrics::record_connect_failure(&self.inner.cluster);
        warn!(cluster = %self.inner.cluster, host = %self.inner.addr, "Upstream connect failed");
    }

    fn discard(&self) {
        {
            let mut state = self.lock();
            state.open = state.open.saturating_sub(1);
        }
        self.inner.released.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // State stays consistent even if a holder panicked; nothing awaits under it.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
