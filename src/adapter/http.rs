//! HTTP proxy adapter
//!
//! Tunnels the session through an upstream HTTP proxy with
//! `CONNECT host:port`. The upstream resolves the host, so a session
//! recovered from a fake IP sends its domain, never the fake address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::direct::DEFAULT_CONNECT_TIMEOUT;
use super::traits::{AdapterConnection, AdapterFactory, AdapterKind};
use crate::error::AdapterError;
use crate::io::PrefixedStream;
use crate::session::{ConnectSession, HostResolver};
use crate::socket::{BoxedStream, RawSocketFactory};

/// Largest response header accepted from the upstream
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Upstream HTTP proxy adapter factory
pub struct HttpAdapterFactory {
    id: String,
    server: SocketAddr,
    credentials: Option<(String, String)>,
    sockets: Arc<RawSocketFactory>,
    connect_timeout: Duration,
}

impl HttpAdapterFactory {
    /// Create an adapter for the proxy at `server`
    pub fn new(id: impl Into<String>, server: SocketAddr, sockets: Arc<RawSocketFactory>) -> Self {
        Self {
            id: id.into(),
            server,
            credentials: None,
            sockets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Authenticate with HTTP basic auth
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Override the connect timeout (covers connect and handshake)
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upstream proxy address
    #[must_use]
    pub const fn server(&self) -> SocketAddr {
        self.server
    }

    fn connect_request(&self, authority: &str) -> String {
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some((user, pass)) = &self.credentials {
            let token = STANDARD.encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        request
    }
}

impl std::fmt::Debug for HttpAdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapterFactory")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("auth", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// Send `request` and read the upstream's reply header.
///
/// Returns any bytes the upstream sent after the header; they belong to
/// the tunnelled stream.
async fn http_connect<S>(stream: &mut S, server: SocketAddr, request: &str) -> Result<Vec<u8>, AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AdapterError::handshake(server, "connection closed before response"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let code = response.code.unwrap_or(0);
                if !(200..300).contains(&code) {
                    return Err(AdapterError::handshake(
                        server,
                        format!("CONNECT refused with status {code}"),
                    ));
                }
                return Ok(buf.split_off(header_len));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_RESPONSE_HEADER {
                    return Err(AdapterError::handshake(server, "response header too large"));
                }
            }
            Err(e) => {
                return Err(AdapterError::handshake(server, format!("malformed response: {e}")));
            }
        }
    }
}

#[async_trait]
impl AdapterFactory for HttpAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Http
    }

    async fn connect(
        &self,
        session: &ConnectSession,
        _resolver: &dyn HostResolver,
    ) -> Result<AdapterConnection, AdapterError> {
        let (mut stream, kind) = self
            .sockets
            .connect(self.server, None, self.connect_timeout)
            .await?;

        let authority = session.authority();
        debug!("{} CONNECT {} via {}", self.id, authority, self.server);
        let request = self.connect_request(&authority);

        let leftover = timeout(self.connect_timeout, http_connect(&mut stream, self.server, &request))
            .await
            .map_err(|_| AdapterError::Timeout {
                target: self.server.to_string(),
                timeout_secs: self.connect_timeout.as_secs(),
            })??;

        let stream: BoxedStream = if leftover.is_empty() {
            stream
        } else {
            Box::new(PrefixedStream::new(leftover, stream))
        };
        Ok(AdapterConnection::new(stream, self.server.to_string(), kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SystemResolver;
    use crate::socket::TunnelProviderSlot;
    use tokio::net::TcpListener;

    fn sockets() -> Arc<RawSocketFactory> {
        Arc::new(RawSocketFactory::with_slot(Arc::new(TunnelProviderSlot::new())))
    }

    /// Accept one connection, capture the request header and answer with `reply`
    async fn fake_proxy(reply: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(reply).await.unwrap();
            // Keep the socket open until the client has read the reply
            let _ = stream.read(&mut chunk).await;
            String::from_utf8(buf).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let (addr, proxy) = fake_proxy(b"HTTP/1.1 200 Connection Established\r\n\r\nearly").await;
        let adapter = HttpAdapterFactory::new("upstream", addr, sockets()).with_credentials("user", "pass");
        let session = ConnectSession::new("example.com", 443, false, None).unwrap();

        let conn = adapter.connect(&session, &SystemResolver).await.unwrap();
        let mut stream = conn.into_stream();
        let mut early = [0u8; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");
        drop(stream);

        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        // base64("user:pass")
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_connect_refused_by_upstream() {
        let (addr, _proxy) = fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let adapter = HttpAdapterFactory::new("upstream", addr, sockets());
        let session = ConnectSession::new("example.com", 443, false, None).unwrap();

        let err = adapter.connect(&session, &SystemResolver).await.unwrap_err();
        assert!(
            matches!(err, AdapterError::Handshake { ref reason, .. } if reason.contains("407")),
            "{err}"
        );
    }

    #[test]
    fn test_request_without_auth() {
        let adapter = HttpAdapterFactory::new("up", "127.0.0.1:8080".parse().unwrap(), sockets());
        let request = adapter.connect_request("[2001:db8::1]:443");
        assert_eq!(
            request,
            "CONNECT [2001:db8::1]:443 HTTP/1.1\r\nHost: [2001:db8::1]:443\r\n\r\n"
        );
    }
}
