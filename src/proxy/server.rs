//! Proxy server lifecycle
//!
//! ```text
//!            start()                 bind ok
//! Stopped ───────────▶ Starting ───────────────▶ Listening
//!    ▲                    │ bind error               │
//!    └────────────────────┴──────────────────────────┘
//!                                     stop()
//! ```
//!
//! Transitions are serialized by one async mutex, so concurrent `start()`
//! calls bind exactly once and the losers get
//! [`ProxyError::AlreadyStarted`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{handle_connection, HandlerContext, SessionTable};
use super::stats::{ProxyStats, ProxyStatsSnapshot};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::event::EventSink;
use crate::fakedns::FakeDnsManager;
use crate::rules::{RuleEngine, RuleSet};

const LISTEN_BACKLOG: i32 = 1024;

/// Proxy lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    /// No listener
    Stopped,
    /// Binding
    Starting,
    /// Accepting connections
    Listening,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Listening => write!(f, "listening"),
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Local HTTP proxy server
pub struct ProxyServer {
    listen_addr: SocketAddr,
    ctx: HandlerContext,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    state: RwLock<ProxyState>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    /// Create a stopped server
    #[must_use]
    pub fn new(config: &ProxyConfig, rules: Arc<RuleEngine>, fake_dns: Option<Arc<FakeDnsManager>>) -> Self {
        Self {
            listen_addr: config.listen_socket_addr(),
            ctx: HandlerContext {
                rules,
                fake_dns,
                sink: None,
                stats: Arc::new(ProxyStats::new()),
                sessions: Arc::new(SessionTable::new()),
                request_timeout: config.request_timeout(),
            },
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            state: RwLock::new(ProxyState::Stopped),
            running: Mutex::new(None),
        }
    }

    /// Report telemetry to `sink` instead of the process-wide sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.ctx.sink = Some(sink);
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ProxyState {
        *self.state.read()
    }

    /// Configured listen address (port may be 0)
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Bound address while listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Rule engine
    #[must_use]
    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.ctx.rules
    }

    /// Swap in a new rule set; connections already routed keep their adapter
    pub fn reload_rules(&self, rules: RuleSet) {
        info!("reloading rules (version {})", rules.version());
        self.ctx.rules.reload(rules);
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &ProxyStats {
        &self.ctx.stats
    }

    /// Counters at this instant
    #[must_use]
    pub fn stats_snapshot(&self) -> ProxyStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Number of sessions currently relaying
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Bind and start accepting.
    ///
    /// # Errors
    ///
    /// [`ProxyError::AlreadyStarted`] if listening, or
    /// [`ProxyError::BindError`] if the address cannot be bound. A bind
    /// failure leaves the server stopped.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }
        *self.state.write() = ProxyState::Starting;

        let listener = match bind_listener(self.listen_addr) {
            Ok(l) => l,
            Err(e) => {
                *self.state.write() = ProxyState::Stopped;
                error!("proxy bind on {} failed: {}", self.listen_addr, e);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().map_err(|e| {
            *self.state.write() = ProxyState::Stopped;
            ProxyError::IoError(e)
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            Arc::clone(&self.semaphore),
            self.max_connections,
            shutdown_rx,
        ));

        *running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        *self.state.write() = ProxyState::Listening;
        info!("proxy listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and release the port.
    ///
    /// Live sessions are reported as disconnected by the proxy but their
    /// relays are left to finish.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NotStarted`] if not listening.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Err(ProxyError::NotStarted);
        };

        let _ = current.shutdown_tx.send(true);
        if let Err(e) = current.accept_task.await {
            warn!("accept loop ended abnormally: {}", e);
        }

        let disconnected = self.ctx.disconnect_all();
        *self.state.write() = ProxyState::Stopped;
        info!(
            "proxy on {} stopped ({} sessions still relaying)",
            current.local_addr, disconnected
        );
        Ok(())
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listen_addr", &self.listen_addr)
            .field("state", &self.state())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// Bind with `SO_REUSEADDR` so a restart can take the port back at once
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProxyError::bind(addr, e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ProxyError::bind(addr, format!("SO_REUSEADDR: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ProxyError::bind(addr, e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ProxyError::bind(addr, e.to_string()))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ProxyError::bind(addr, e.to_string()))?;

    TcpListener::from_std(socket.into()).map_err(|e| ProxyError::bind(addr, e.to_string()))
}

async fn accept_loop(
    listener: TcpListener,
    ctx: HandlerContext,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            ctx.stats.record_rejected();
            warn!(
                "connection limit reached ({}), rejecting {}",
                max_connections, peer
            );
            continue;
        };

        ctx.stats.record_accepted();
        debug!(%peer, active = ctx.stats.active(), "accepted connection");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(ctx, stream, peer).await;
        });
    }
    debug!("accept loop exiting");
}
