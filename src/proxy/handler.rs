//! Per-connection handling
//!
//! One accepted client goes through:
//!
//! 1. Read the proxy request head.
//! 2. Build a [`ConnectSession`]; a fake-IP host is mapped back to its
//!    domain here.
//! 3. Ask the rule engine for an adapter.
//! 4. Connect through the adapter and answer the client.
//! 5. Relay until one side closes, then attribute the disconnect.
//!
//! A CONNECT tunnel is relayed both ways until either side closes. A
//! forwarded request gets exactly one exchange: its head and declared
//! body go out, the response comes back, and the client connection
//! closes with the remote.
//!
//! A request that yields no session or no rule is closed without a
//! response.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::http::{read_request, ProxyRequest, RequestError};
use super::stats::ProxyStats;
use crate::adapter::AdapterFactory;
use crate::event::{self, EventSink, ProxyEvent};
use crate::fakedns::FakeDnsManager;
use crate::io::{relay, RelayOutcome, RelaySide};
use crate::rules::RuleEngine;
use crate::session::{ConnectSession, ErrorSource};
use crate::socket::BoxedStream;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const LENGTH_REQUIRED: &[u8] =
    b"HTTP/1.1 411 Length Required\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Live sessions by id
pub type SessionTable = DashMap<u64, Arc<ConnectSession>>;

/// Everything a connection task needs, shared across tasks
#[derive(Clone)]
pub struct HandlerContext {
    /// Rule engine
    pub rules: Arc<RuleEngine>,
    /// Fake-IP table, when fake-IP translation is on
    pub fake_dns: Option<Arc<FakeDnsManager>>,
    /// Telemetry override; the process-wide sink otherwise
    pub sink: Option<Arc<dyn EventSink>>,
    /// Counters
    pub stats: Arc<ProxyStats>,
    /// Sessions still relaying
    pub sessions: Arc<SessionTable>,
    /// Time allowed for the request head
    pub request_timeout: Duration,
}

impl HandlerContext {
    fn emit(&self, event: &ProxyEvent) {
        event::emit_to(self.sink.as_ref(), event);
    }

    fn disconnect(&self, session: &ConnectSession, source: ErrorSource) {
        if session.mark_disconnected(source) {
            self.emit(&ProxyEvent::Disconnected {
                session: session.id(),
                source,
                error: session.error(),
            });
        }
    }

    /// Report every live session as ended by the proxy.
    ///
    /// Relays keep running; their own end is not reported again.
    pub fn disconnect_all(&self) -> usize {
        let mut count = 0;
        for entry in self.sessions.iter() {
            if entry.value().mark_disconnected(ErrorSource::Proxy) {
                count += 1;
                self.emit(&ProxyEvent::Disconnected {
                    session: *entry.key(),
                    source: ErrorSource::Proxy,
                    error: entry.value().error(),
                });
            }
        }
        count
    }
}

/// Serve one accepted client connection to completion
pub async fn handle_connection(ctx: HandlerContext, mut client: TcpStream, peer: SocketAddr) {
    let (request, early_data) = match timeout(ctx.request_timeout, read_request(&mut client)).await {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(RequestError::LengthRequired)) => {
            debug!(%peer, "refusing forward request without Content-Length");
            ctx.stats.record_error();
            let _ = client.write_all(LENGTH_REQUIRED).await;
            let _ = client.shutdown().await;
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, "dropping client: {}", e);
            ctx.stats.record_error();
            return;
        }
        Err(_) => {
            debug!(%peer, "dropping client: request head timed out");
            ctx.stats.record_error();
            return;
        }
    };

    let fake_dns = ctx.fake_dns.as_deref();
    let fake_ip_enabled = fake_dns.is_some_and(FakeDnsManager::is_enabled);
    let Some(session) = ConnectSession::new(request.host(), request.port(), fake_ip_enabled, fake_dns) else {
        ctx.emit(&ProxyEvent::ConnectionRejected {
            host: request.host().to_string(),
            port: request.port(),
            reason: "unknown fake ip".to_string(),
        });
        ctx.stats.record_error();
        return;
    };
    let session = Arc::new(session);

    let Some(adapter) = ctx.rules.evaluate(&session).await else {
        debug!(session = session.id(), "no rule for {}, closing", session.authority());
        ctx.emit(&ProxyEvent::ConnectionRejected {
            host: session.host().to_string(),
            port: session.port(),
            reason: "no rule matched".to_string(),
        });
        ctx.stats.record_error();
        return;
    };

    ctx.sessions.insert(session.id(), Arc::clone(&session));
    run_session(&ctx, &session, adapter, client, peer, request, early_data).await;
    ctx.sessions.remove(&session.id());
}

async fn run_session(
    ctx: &HandlerContext,
    session: &Arc<ConnectSession>,
    adapter: Arc<dyn AdapterFactory>,
    mut client: TcpStream,
    peer: SocketAddr,
    request: ProxyRequest,
    early_data: Vec<u8>,
) {
    let connection = match adapter.connect(session, ctx.rules.resolver().as_ref()).await {
        Ok(c) => c,
        Err(e) => {
            warn!(
                session = session.id(),
                adapter = adapter.id(),
                "connect to {} failed: {}",
                session.authority(),
                e
            );
            session.record_error(ErrorSource::Adapter, e.to_string());
            ctx.disconnect(session, ErrorSource::Adapter);
            ctx.stats.record_error();
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return;
        }
    };

    ctx.emit(&ProxyEvent::ConnectionAccepted {
        session: session.id(),
        host: session.host().to_string(),
        port: session.port(),
        adapter: adapter.id().to_string(),
    });
    info!(
        session = session.id(),
        %peer,
        adapter = adapter.id(),
        "proxying to {} via {}",
        session.authority(),
        connection.remote()
    );

    let mut remote = connection.into_stream();
    // Body bytes still to come from the client; `None` for a tunnel
    let (preamble, body_remaining) = match request {
        ProxyRequest::Connect { .. } => {
            if let Err(e) = client.write_all(CONNECT_ESTABLISHED).await {
                session.record_error(ErrorSource::Proxy, e.to_string());
                ctx.disconnect(session, ErrorSource::Proxy);
                ctx.stats.record_error();
                return;
            }
            (early_data, None)
        }
        ProxyRequest::Forward { mut head, body_len, .. } => {
            let prefix = usize::try_from(body_len).map_or(early_data.len(), |n| n.min(early_data.len()));
            if early_data.len() > prefix {
                debug!(
                    session = session.id(),
                    "discarding {} pipelined bytes after the request body",
                    early_data.len() - prefix
                );
            }
            head.extend_from_slice(&early_data[..prefix]);
            (head, Some(body_len - prefix as u64))
        }
    };

    if !preamble.is_empty() {
        if let Err(e) = remote.write_all(&preamble).await {
            session.record_error(ErrorSource::Adapter, e.to_string());
            ctx.disconnect(session, ErrorSource::Adapter);
            ctx.stats.record_error();
            return;
        }
    }

    let outcome = match body_remaining {
        None => relay(&mut client, &mut remote).await,
        Some(body) => forward_exchange(&mut client, remote, body).await,
    };
    let source = match outcome.closed_by {
        RelaySide::Client => ErrorSource::Proxy,
        RelaySide::Remote => ErrorSource::Adapter,
    };
    if let Some(e) = &outcome.error {
        session.record_error(source, e.to_string());
    }

    debug!(
        session = session.id(),
        up = outcome.client_to_remote,
        down = outcome.remote_to_client,
        "relay closed by {}",
        outcome.closed_by
    );
    let up = outcome.client_to_remote + preamble.len() as u64;
    ctx.stats.record_completed(up, outcome.remote_to_client);
    ctx.disconnect(session, source);
}

/// Finish one forwarded request.
///
/// Copies at most `body` more bytes from the client, and the response
/// until the remote closes. Client bytes beyond the body are never sent.
async fn forward_exchange(client: &mut TcpStream, remote: BoxedStream, body: u64) -> RelayOutcome {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let sent = AtomicU64::new(0);

    let upload = async {
        let n = tokio::io::copy(&mut (&mut client_rd).take(body), &mut remote_wr).await?;
        sent.store(n, Ordering::Relaxed);
        remote_wr.flush().await
    };
    let download = async {
        let n = tokio::io::copy(&mut remote_rd, &mut client_wr).await?;
        client_wr.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    tokio::pin!(upload, download);

    let mut upload_done = body == 0;
    let (closed_by, received, error) = loop {
        tokio::select! {
            result = &mut upload, if !upload_done => {
                upload_done = true;
                if let Err(e) = result {
                    break (RelaySide::Client, 0, Some(e));
                }
            }
            result = &mut download => match result {
                Ok(n) => break (RelaySide::Remote, n, None),
                Err(e) => break (RelaySide::Remote, 0, Some(e)),
            },
        }
    };

    RelayOutcome {
        client_to_remote: sent.load(Ordering::Relaxed),
        remote_to_client: received,
        closed_by,
        error,
    }
}
