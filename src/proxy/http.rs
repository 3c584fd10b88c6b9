//! HTTP proxy request parsing
//!
//! Two request forms are accepted:
//!
//! - `CONNECT host:port HTTP/1.1`, after which the connection becomes an
//!   opaque tunnel;
//! - an absolute-form request such as `GET http://host/path HTTP/1.1`,
//!   which is rewritten to origin form (`GET /path HTTP/1.1`) and sent to
//!   the remote as the first bytes of the exchange.
//!
//! A forwarded request is a single exchange: the rewritten head carries
//! `Connection: close` and only the declared body follows it. Anything
//! the client pipelines after that is never sent, so every request to a
//! new origin arrives on a fresh connection and goes through the rules.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::packet::parse_ip_literal;

/// Largest request head we buffer
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers that only concern the proxy hop
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
];

/// Request parsing errors
#[derive(Debug, Error)]
pub enum RequestError {
    /// Client closed before a full request head arrived
    #[error("connection closed before request head was complete")]
    Incomplete,

    /// Request head exceeds [`MAX_REQUEST_HEAD`]
    #[error("request head exceeds {MAX_REQUEST_HEAD} bytes")]
    TooLarge,

    /// Not parseable as HTTP/1.x
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Parsed, but the target is not something we can proxy
    #[error("unsupported request target '{0}'")]
    UnsupportedTarget(String),

    /// Forwarded request body without a `Content-Length`
    #[error("request body needs a Content-Length")]
    LengthRequired,

    /// Read failure
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// What the client asked the proxy to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// Open a tunnel
    Connect {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },
    /// Forward a plain HTTP request
    Forward {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Rewritten request head, origin form, ending in a blank line
        head: Vec<u8>,
        /// Body bytes that follow the head
        body_len: u64,
    },
}

impl ProxyRequest {
    /// Target host
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Connect { host, .. } | Self::Forward { host, .. } => host,
        }
    }

    /// Target port
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Connect { port, .. } | Self::Forward { port, .. } => *port,
        }
    }

    /// Whether this is a CONNECT tunnel
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Read and parse one proxy request head from `stream`.
///
/// Returns the request and whatever the client sent after the head
/// (a request body or an eager TLS ClientHello).
///
/// # Errors
///
/// See [`RequestError`].
pub async fn read_request<S>(stream: &mut S) -> Result<(ProxyRequest, Vec<u8>), RequestError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((request, head_len)) = parse_request(&buf)? {
            let rest = buf.split_off(head_len);
            return Ok((request, rest));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(RequestError::TooLarge);
        }
    }
}

/// Parse a request head from `buf`.
///
/// `Ok(None)` means more bytes are needed. On success the head length is
/// returned alongside the request.
///
/// # Errors
///
/// [`RequestError::Malformed`], [`RequestError::UnsupportedTarget`], or
/// [`RequestError::LengthRequired`] for a chunked forward request.
pub fn parse_request(buf: &[u8]) -> Result<Option<(ProxyRequest, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };

    let method = req.method.ok_or_else(|| RequestError::Malformed("missing method".into()))?;
    let target = req.path.ok_or_else(|| RequestError::Malformed("missing target".into()))?;
    let version = req.version.unwrap_or(1);

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(target, None)
            .ok_or_else(|| RequestError::UnsupportedTarget(target.to_string()))?;
        return Ok(Some((ProxyRequest::Connect { host, port }, head_len)));
    }

    let (authority, path) = split_absolute_uri(target)
        .ok_or_else(|| RequestError::UnsupportedTarget(target.to_string()))?;
    let (host, port) = split_authority(authority, Some(80))
        .ok_or_else(|| RequestError::UnsupportedTarget(target.to_string()))?;

    let mut head = Vec::with_capacity(head_len);
    head.extend_from_slice(format!("{method} {path} HTTP/1.{version}\r\n").as_bytes());
    let mut has_host = false;
    let mut body_len = 0;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(RequestError::LengthRequired);
        }
        if header.name.eq_ignore_ascii_case("content-length") {
            body_len = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| RequestError::Malformed("invalid Content-Length".into()))?;
        }
        if HOP_HEADERS.iter().any(|h| header.name.eq_ignore_ascii_case(h)) {
            continue;
        }
        has_host |= header.name.eq_ignore_ascii_case("host");
        head.extend_from_slice(header.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(header.value);
        head.extend_from_slice(b"\r\n");
    }
    if !has_host {
        head.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");

    Ok(Some((
        ProxyRequest::Forward {
            host,
            port,
            head,
            body_len,
        },
        head_len,
    )))
}

/// `http://authority/path?query` -> (`authority`, `/path?query`)
fn split_absolute_uri(target: &str) -> Option<(&str, String)> {
    let scheme_end = target.find("://")?;
    if !target[..scheme_end].eq_ignore_ascii_case("http") {
        return None;
    }
    let rest = &target[scheme_end + 3..];
    match rest.find(['/', '?']) {
        Some(i) if rest.as_bytes()[i] == b'/' => Some((&rest[..i], rest[i..].to_string())),
        // Bare query: the path is still "/"
        Some(i) => Some((&rest[..i], format!("/{}", &rest[i..]))),
        None => Some((rest, "/".to_string())),
    }
}

/// `host:port`, `[v6]:port` or a bare host when `default_port` is set
fn split_authority(authority: &str, default_port: Option<u16>) -> Option<(String, u16)> {
    // Strip userinfo
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        parse_ip_literal(host)?;
        let port = match &rest[end + 1..] {
            "" => default_port?,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
            Some(_) => return None,
            None => (authority, default_port?),
        }
    };

    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_ascii_lowercase(), port))
}
