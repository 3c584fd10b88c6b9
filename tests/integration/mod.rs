//! Integration tests for intercept-proxy
//!
//! These tests drive the public API over real loopback sockets.
//!
//! # Test Organization
//!
//! - `proxy_server`: HTTP CONNECT and forward relays, rejection, shutdown
//! - `fake_ip_routing`: DNS fake answers followed by connections to the fake address
//! - `config_loading`: configuration files compiled into adapters and rules
//!
//! # Test Requirements
//!
//! - Everything binds to 127.0.0.1 with ephemeral ports
//! - No external network access is needed

pub mod config_loading;
pub mod fake_ip_routing;
pub mod proxy_server;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use intercept_proxy::adapter::{AdapterFactory, DirectAdapterFactory, RejectAdapterFactory};
use intercept_proxy::config::ProxyConfig;
use intercept_proxy::socket::{RawSocketFactory, TunnelProviderSlot};

/// Socket factory with a private, empty tunnel slot
pub fn kernel_sockets() -> Arc<RawSocketFactory> {
    Arc::new(RawSocketFactory::with_slot(Arc::new(TunnelProviderSlot::new())))
}

pub fn direct() -> Arc<dyn AdapterFactory> {
    Arc::new(DirectAdapterFactory::new("direct", kernel_sockets()))
}

pub fn reject() -> Arc<dyn AdapterFactory> {
    Arc::new(RejectAdapterFactory::new("reject"))
}

/// Proxy config on an ephemeral loopback port
pub fn loopback_config() -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        ..ProxyConfig::default()
    }
}

/// Echo server accepting any number of connections
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Send `CONNECT authority` and return the stream plus the status line
pub async fn connect_through(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let status = read_head(&mut stream).await;
    (stream, status)
}

/// Read a response head byte by byte; empty on close
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
