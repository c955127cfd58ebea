//! Port-forward tunnels: a local TCP listener per session, a relay pair per
//! accepted connection.
//!
//! [`PortForwardManager::start`] checks the pod, reserves the local port in
//! the registry, binds the listener and spawns the accept loop. Each accepted
//! connection opens a fresh upstream through the [`TargetResolver`] and is
//! relayed by [`relay::relay_connection`]. Relay failures (upstream refused,
//! connection reset) are logged and counted on the session; they never
//! change its status.
//!
//! Stopping a session cancels the accept loop: the listener is dropped at
//! once and every relay task is aborted rather than drained. The registry
//! releases the port reservation only after the loop has exited.

pub mod relay;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortForwardConfig;
use crate::error::SessionError;
use crate::sessions::handle::RelayHandle;
use crate::sessions::session::{PortForwardParams, SessionParams, SessionStats};
use crate::sessions::{validate, SessionRegistry};
use crate::target::{TargetError, TargetResolver, TargetState};
use relay::ActiveGuard;

/// How long `start` waits for an accept loop it could not attach.
const DETACHED_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Back-off after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Starts port-forward sessions and owns their accept loops.
#[derive(Clone)]
pub struct PortForwardManager {
    registry: SessionRegistry,
    resolver: Arc<dyn TargetResolver>,
    config: PortForwardConfig,
}

impl PortForwardManager {
    pub fn new(
        registry: SessionRegistry,
        resolver: Arc<dyn TargetResolver>,
        config: PortForwardConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
        }
    }

    fn bind_ip(&self) -> Result<IpAddr, SessionError> {
        self.config.bind_address.parse().map_err(|_| {
            SessionError::Internal(format!(
                "invalid bind address {:?}",
                self.config.bind_address
            ))
        })
    }

    /// Whether `port` could be used for a new tunnel right now: not reserved
    /// by a session and bindable on the host.
    pub async fn is_port_available(&self, port: u16) -> Result<bool, SessionError> {
        if self.registry.is_port_reserved(port).await {
            return Ok(false);
        }
        let ip = self.bind_ip()?;
        Ok(TcpListener::bind(SocketAddr::new(ip, port)).await.is_ok())
    }

    /// Establish a tunnel `bind_address:localPort -> namespace/pod:remotePort`.
    ///
    /// On error nothing is left behind: no registry entry, no bound port.
    pub async fn start(
        &self,
        namespace: &str,
        pod: &str,
        params: PortForwardParams,
    ) -> Result<String, SessionError> {
        validate::validate_target(namespace, pod)?;
        SessionParams::PortForward(params).validate()?;
        let ip = self.bind_ip()?;

        match self.resolver.probe(namespace, pod).await {
            Ok(TargetState::Running) => {}
            Ok(state) => {
                return Err(SessionError::TargetUnavailable(format!(
                    "pod {namespace}/{pod} is {state}"
                )));
            }
            Err(TargetError::PodNotFound { .. }) => {
                return Err(SessionError::TargetUnavailable(format!(
                    "pod {namespace}/{pod} not found"
                )));
            }
            Err(e) => return Err(SessionError::TargetUnavailable(e.to_string())),
        }

        let id = self
            .registry
            .create(namespace, pod, SessionParams::PortForward(params))
            .await?;

        let addr = SocketAddr::new(ip, params.local_port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Port-forward {id}: bind {addr} failed: {e}");
                self.registry.abandon(&id).await;
                return Err(SessionError::PortInUse(params.local_port));
            }
        };

        // NotFound here means the session was removed while we were binding.
        let stats = self.registry.record(&id).await?.stats;
        let tunnel = Arc::new(Tunnel {
            id: id.clone(),
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            remote_port: params.remote_port,
            resolver: Arc::clone(&self.resolver),
            stats,
            max_connections: self.config.max_connections_per_session,
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(tunnel, listener, cancel.clone()));
        if let Err(handle) = self
            .registry
            .attach_handle(&id, RelayHandle::new(cancel, task))
            .await
        {
            // Stopped while starting: close the listener before giving the
            // port back.
            handle.shutdown(DETACHED_SHUTDOWN_TIMEOUT).await;
            self.registry.release_port(&id).await;
            self.registry.get(&id).await?;
            return Ok(id);
        }

        self.registry.mark_running(&id).await;
        info!(
            "Port-forward {id} started: {addr} -> {namespace}/{pod}:{}",
            params.remote_port
        );
        Ok(id)
    }
}

/// What every relay pair of one session needs.
struct Tunnel {
    id: String,
    namespace: String,
    pod: String,
    remote_port: u16,
    resolver: Arc<dyn TargetResolver>,
    stats: Arc<SessionStats>,
    max_connections: usize,
    connect_timeout: Duration,
}

async fn accept_loop(tunnel: Arc<Tunnel>, listener: TcpListener, cancel: CancellationToken) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tunnel.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    let active = tunnel.stats.active_connections.load(Ordering::Relaxed);
                    if active >= tunnel.max_connections as u64 {
                        tunnel.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Port-forward {}: rejecting {peer}, {active} connections already open",
                            tunnel.id
                        );
                        drop(socket);
                    } else {
                        let guard = ActiveGuard::new(Arc::clone(&tunnel.stats));
                        relays.spawn(relay_task(Arc::clone(&tunnel), socket, peer, guard));
                    }
                }
                Err(e) => {
                    warn!("Port-forward {}: accept failed: {e}", tunnel.id);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    relays.abort_all();
    while relays.join_next().await.is_some() {}
    debug!("Port-forward {}: listener closed", tunnel.id);
}

async fn relay_task(tunnel: Arc<Tunnel>, socket: TcpStream, peer: SocketAddr, _guard: ActiveGuard) {
    let _ = socket.set_nodelay(true);
    let connect = tunnel
        .resolver
        .connect(&tunnel.namespace, &tunnel.pod, tunnel.remote_port);
    let upstream = match tokio::time::timeout(tunnel.connect_timeout, connect).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            tunnel.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
            warn!("Port-forward {}: connection from {peer} failed: {e}", tunnel.id);
            return;
        }
        Err(_) => {
            tunnel.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Port-forward {}: connecting to {}/{}:{} timed out",
                tunnel.id, tunnel.namespace, tunnel.pod, tunnel.remote_port
            );
            return;
        }
    };

    debug!("Port-forward {}: relaying {peer}", tunnel.id);
    if let Err(e) = relay::relay_connection(socket, upstream, &tunnel.stats).await {
        tunnel.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
        debug!("Port-forward {}: relay for {peer} ended: {e}", tunnel.id);
    }
}
