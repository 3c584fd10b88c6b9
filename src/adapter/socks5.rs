//! SOCKS5 adapter
//!
//! Tunnels the session through an upstream SOCKS5 server (RFC 1928) with
//! optional username/password authentication (RFC 1929).
//!
//! Domain hosts are sent as `ATYP_DOMAIN` so the upstream resolves them;
//! IP hosts are sent as IPv4/IPv6 addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::direct::DEFAULT_CONNECT_TIMEOUT;
use super::traits::{AdapterConnection, AdapterFactory, AdapterKind};
use crate::error::AdapterError;
use crate::packet::parse_ip_literal;
use crate::session::{ConnectSession, HostResolver};
use crate::socket::RawSocketFactory;

// Wire values used by the client side of the handshake
const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_PASSWORD: u8 = 0x02;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Text for a non-success REP code
const fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// SOCKS5 specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Invalid protocol version
    InvalidVersion { expected: u8, actual: u8 },
    /// No acceptable authentication method
    NoAcceptableMethod,
    /// Authentication failed
    AuthFailed,
    /// Server returned error reply
    ServerReply { code: u8, message: String },
    /// Invalid address type
    InvalidAddressType(u8),
    /// Protocol error (malformed message)
    ProtocolError(String),
    /// Connection error
    ConnectionError(String),
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidVersion { expected, actual } => {
                write!(f, "Invalid SOCKS version: expected {expected}, got {actual}")
            }
            Self::NoAcceptableMethod => write!(f, "No acceptable authentication method"),
            Self::AuthFailed => write!(f, "SOCKS5 authentication failed"),
            Self::ServerReply { code, message } => {
                write!(f, "SOCKS5 server error (code {code:#04x}): {message}")
            }
            Self::InvalidAddressType(atyp) => write!(f, "Invalid address type: {atyp:#04x}"),
            Self::ProtocolError(msg) => write!(f, "SOCKS5 protocol error: {msg}"),
            Self::ConnectionError(msg) => write!(f, "SOCKS5 connection error: {msg}"),
        }
    }
}

impl std::error::Error for Socks5Error {}

// ============================================================================
// Protocol Helpers
// ============================================================================

/// Method selection, then RFC 1929 sub-negotiation if the server asks for it
async fn negotiate<S>(stream: &mut S, auth: Option<&(String, String)>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let methods: Vec<u8> = if auth.is_some() {
        vec![SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };

    trace!("Sending SOCKS5 method selection: {:?}", methods);
    stream
        .write_all(&methods)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("write methods failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("read method response failed: {e}")))?;

    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match response[1] {
        AUTH_METHOD_NONE => Ok(()),
        AUTH_METHOD_PASSWORD => {
            let (username, password) = auth.ok_or(Socks5Error::AuthFailed)?;
            authenticate(stream, username, password).await
        }
        AUTH_METHOD_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        other => Err(Socks5Error::ProtocolError(format!(
            "unsupported auth method: {other:#04x}"
        ))),
    }
}

/// Username/password authentication (RFC 1929)
async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let ulen = u8::try_from(username.len())
        .map_err(|_| Socks5Error::ProtocolError("username too long (max 255)".into()))?;
    let plen = u8::try_from(password.len())
        .map_err(|_| Socks5Error::ProtocolError("password too long (max 255)".into()))?;

    // VER | ULEN | USERNAME | PLEN | PASSWORD
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(ulen);
    request.extend_from_slice(username.as_bytes());
    request.push(plen);
    request.extend_from_slice(password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("write auth failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("read auth response failed: {e}")))?;

    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::ProtocolError(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthFailed);
    }
    Ok(())
}

/// Build a CONNECT request for `host:port`
fn build_connect_request(host: &str, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut request = Vec::with_capacity(7 + host.len());

    // VER | CMD | RSV
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);

    match parse_ip_literal(host) {
        Some(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        None => {
            let len = u8::try_from(host.len())
                .map_err(|_| Socks5Error::ProtocolError("domain too long (max 255)".into()))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Read a CONNECT reply, discarding the bound address
async fn read_connect_reply<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + Unpin + ?Sized,
{
    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("read reply header failed: {e}")))?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::ServerReply {
            code: header[1],
            message: reply_message(header[1]).to_string(),
        });
    }

    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| Socks5Error::ConnectionError(format!("read domain len failed: {e}")))?;
            usize::from(len[0])
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    // BND.ADDR | BND.PORT
    let mut rest = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut rest)
        .await
        .map_err(|e| Socks5Error::ConnectionError(format!("read bound address failed: {e}")))?;
    Ok(())
}

// ============================================================================
// SOCKS5 Adapter
// ============================================================================

/// Upstream SOCKS5 adapter factory
pub struct Socks5AdapterFactory {
    id: String,
    server: SocketAddr,
    auth: Option<(String, String)>,
    sockets: Arc<RawSocketFactory>,
    connect_timeout: Duration,
}

impl Socks5AdapterFactory {
    /// Create an adapter for the SOCKS5 server at `server`
    pub fn new(id: impl Into<String>, server: SocketAddr, sockets: Arc<RawSocketFactory>) -> Self {
        Self {
            id: id.into(),
            server,
            auth: None,
            sockets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Offer username/password authentication
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Override the connect timeout (covers connect and handshake)
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upstream server address
    #[must_use]
    pub const fn server(&self) -> SocketAddr {
        self.server
    }

    /// Whether credentials are configured
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }
}

impl fmt::Debug for Socks5AdapterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5AdapterFactory")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("auth", &self.has_auth())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AdapterFactory for Socks5AdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Socks5
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

        let server = self.server;
        let request = build_connect_request(session.host(), session.port())
            .map_err(|e| AdapterError::handshake(server, e.to_string()))?;

        let handshake = async {
            negotiate(&mut stream, self.auth.as_ref()).await?;
            stream
                .write_all(&request)
                .await
                .map_err(|e| Socks5Error::ConnectionError(format!("write connect failed: {e}")))?;
            read_connect_reply(&mut stream).await
        };

        match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AdapterError::handshake(server, e.to_string())),
            Err(_) => {
                return Err(AdapterError::Timeout {
                    target: server.to_string(),
                    timeout_secs: self.connect_timeout.as_secs(),
                })
            }
        }

        debug!("{} tunnel to {} via {} established", self.id, session.authority(), server);
        Ok(AdapterConnection::new(stream, server.to_string(), kind))
    }
}
