//! Listener loops and connection dispatch.
//!
//! # Responsibilities
//! - Bind every configured listener
//! - Accept connections and hand each to the HTTP/1 or HTTP/2 manager
//! - On shutdown: stop accepting, drain, wait for connections up to the
//!   drain timeout

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::Protocol;
use crate::config::ProxyConfig;
use crate::http::{h1, h2, ConnectionSettings, ServerError};
use crate::lifecycle::{DrainCoordinator, Shutdown};
use crate::net::{ConnectionId, ConnectionTracker, Listener, ListenerError};
use crate::proxy::ProxyContext;
use crate::upstream::Connector;

#[derive(Debug)]
struct BoundListener {
    listener: Listener,
    protocol: Protocol,
    settings: Arc<ConnectionSettings>,
}

/// The downstream side of the proxy: every listener plus shared state.
#[derive(Debug)]
pub struct HttpServer {
    ctx: Arc<ProxyContext>,
    listeners: Vec<BoundListener>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl HttpServer {
    /// Build the routing state and bind all listeners.
    pub async fn bind(config: &ProxyConfig, connector: Arc<dyn Connector>) -> Result<Self, ServerError> {
        let ctx = Arc::new(ProxyContext::new(config, connector, DrainCoordinator::new()));
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            listeners.push(BoundListener {
                listener: Listener::bind(listener_config).await?,
                protocol: listener_config.protocol,
                settings: Arc::new(ConnectionSettings::from_listener(listener_config)),
            });
        }
        Ok(Self {
            ctx,
            listeners,
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(config.drain.timeout_secs),
        })
    }

    /// Address a named listener ended up on.
    pub fn local_addr(&self, name: &str) -> Result<SocketAddr, ServerError> {
        let bound = self
            .listeners
            .iter()
            .find(|b| b.listener.name() == name)
            .ok_or_else(|| ServerError::UnknownListener(name.to_string()))?;
        Ok(bound.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ProxyContext> {
        Arc::clone(&self.ctx)
    }

    /// Handle on live downstream connections.
    pub fn connections(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Enter drain mode without stopping the listeners.
    pub fn drain(&self) {
        self.ctx.start_draining();
    }

    /// Accept until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let mut loops = JoinSet::new();
        for bound in self.listeners {
            loops.spawn(accept_loop(
                bound,
                Arc::clone(&self.ctx),
                self.tracker.clone(),
                shutdown.clone(),
            ));
        }

        let mut result = Ok(());
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Listener failed");
                    shutdown.trigger();
                    result = Err(e);
                }
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }

        self.ctx.start_draining();
        let remaining = self.tracker.active_count();
        info!(connections = remaining, timeout = ?self.drain_timeout, "Waiting for connections to finish");
        match tokio::time::timeout(self.drain_timeout, self.tracker.wait_idle()).await {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                connections = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            ),
        }
        result
    }
}

async fn accept_loop(
    bound: BoundListener,
    ctx: Arc<ProxyContext>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
) -> Result<(), ServerError> {
    let mut stop = shutdown.subscribe();
    if shutdown.is_triggered() {
        info!(listener = %bound.listener.name(), "Listener stopped");
        return Ok(());
    }
    loop {
        tokio::select! {
            _ = stop.recv() => {
                info!(listener = %bound.listener.name(), "Listener stopped");
                return Ok(());
            }
            accepted = bound.listener.accept() => {
                let (stream, peer, permit) = match accepted {
                    Ok(accepted) => accepted,
                    Err(ListenerError::Accept(e)) => {
                        warn!(listener = %bound.listener.name(), error = %e, "Accept failed");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let guard = tracker.track();
                let ctx = Arc::clone(&ctx);
                let settings = Arc::clone(&bound.settings);
                let protocol = bound.protocol;
                tokio::spawn(async move {
                    let _permit = permit;
                    let connection_id = guard.id();
                    debug!(connection_id = %connection_id, peer_addr = %peer, %protocol, "Connection opened");
                    if let Err(e) = serve_connection(stream, protocol, ctx, &settings, guard.id()).await {
                        debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
                    }
                    drop(guard);
                });
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    protocol: Protocol,
    ctx: Arc<ProxyContext>,
    settings: &ConnectionSettings,
    connection_id: ConnectionId,
) -> Result<(), ServerError> {
    match protocol {
        Protocol::Http1 => h1::serve(stream, ctx, settings, connection_id).await,
        Protocol::Http2 => h2::serve(stream, ctx, settings, connection_id).await,
    }
}
