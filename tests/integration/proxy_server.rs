//! Proxy server integration tests
//!
//! Clients speak HTTP proxy requests to a running `ProxyServer` and the
//! tests observe both the byte stream and the emitted events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use intercept_proxy::event::{CollectingSink, ProxyEvent};
use intercept_proxy::proxy::{ProxyServer, ProxyState};
use intercept_proxy::rules::{DomainSet, IpRangeSet, Rule, RuleEngine, RuleSet};
use intercept_proxy::session::ErrorSource;

use super::{connect_through, direct, loopback_config, read_head, reject, spawn_echo_server};

fn start_server(rules: Vec<Rule>) -> (Arc<ProxyServer>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let engine = Arc::new(RuleEngine::new(RuleSet::new(rules)).with_sink(sink.clone()));
    let server = ProxyServer::new(&loopback_config(), engine, None).with_sink(sink.clone());
    (Arc::new(server), sink)
}

/// Poll the sink until an event satisfies `pred`
async fn wait_for(sink: &CollectingSink, pred: impl Fn(&ProxyEvent) -> bool) -> bool {
    for _ in 0..100 {
        if sink.count(&pred) > 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_connect_relays_through_direct_adapter() {
    let echo = spawn_echo_server().await;
    let (server, sink) = start_server(vec![Rule::all(direct()).with_description("catch-all")]);
    let proxy = server.start().await.unwrap();

    let (mut client, status) = connect_through(proxy, &echo.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"), "unexpected status: {status}");

    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    assert_eq!(
        sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { adapter, port, .. }
            if adapter == "direct" && *port == echo.port())),
        1
    );
    assert_eq!(
        sink.count(|e| matches!(e, ProxyEvent::RuleMatched { rule, .. } if rule == "catch-all")),
        1
    );

    drop(client);
    assert!(
        wait_for(&sink, |e| matches!(
            e,
            ProxyEvent::Disconnected { source: ErrorSource::Proxy, .. }
        ))
        .await
    );

    let stats = server.stats_snapshot();
    assert_eq!(stats.total_accepted, 1);
    assert!(stats.bytes_up >= 24);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_forward_request_is_rewritten_to_origin_form() {
    let echo = spawn_echo_server().await;
    let (server, _sink) = start_server(vec![Rule::all(direct())]);
    let proxy = server.start().await.unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://{echo}/status?verbose=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // The echo server reflects the head the proxy sent upstream.
    let head = read_head(&mut client).await;
    assert!(head.starts_with("GET /status?verbose=1 HTTP/1.1\r\n"), "got: {head}");
    assert!(head.to_ascii_lowercase().contains(&format!("host: {echo}")));
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    assert!(head.contains("Accept: */*"));
    assert!(head.ends_with("Connection: close\r\n\r\n"));

    server.stop().await.unwrap();
}

/// Origin serving one response, then reporting the head it answered and
/// any bytes that arrived after it
async fn spawn_single_response_origin() -> (SocketAddr, oneshot::Receiver<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut extra = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(300), stream.read_to_end(&mut extra)).await;
        let _ = tx.send((head, extra));
    });
    (addr, rx)
}

#[tokio::test]
async fn test_forward_connection_serves_one_request() {
    let (origin, report) = spawn_single_response_origin().await;
    let (server, sink) = start_server(vec![Rule::all(direct())]);
    let proxy = server.start().await.unwrap();

    // Two requests for different hosts on one client connection.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let requests = format!(
        "GET http://{origin}/first HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
         GET http://127.0.0.1:9/second HTTP/1.1\r\n\r\n"
    );
    client.write_all(requests.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "got: {head}");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"ok");

    let (origin_head, extra) = report.await.unwrap();
    assert!(origin_head.starts_with("GET /first HTTP/1.1\r\n"), "got: {origin_head}");
    assert!(origin_head.contains("Connection: close"));
    assert!(!origin_head.contains("keep-alive"));
    assert!(extra.is_empty(), "origin received {} extra bytes", extra.len());

    assert_eq!(sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { .. })), 1);
    assert_eq!(
        sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { port, .. } if *port == 9)),
        0
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_private_range_rejected_before_catch_all() {
    let echo = spawn_echo_server().await;
    let ranges = IpRangeSet::parse(&["10.0.0.0/8"]).unwrap();
    let (server, sink) = start_server(vec![
        Rule::ip_range_list(ranges, reject()).with_description("private"),
        Rule::all(direct()).with_description("catch-all"),
    ]);
    let proxy = server.start().await.unwrap();

    let (_blocked, status) = connect_through(proxy, "10.1.2.3:80").await;
    assert!(status.starts_with("HTTP/1.1 502"), "unexpected status: {status}");
    assert!(
        wait_for(&sink, |e| matches!(
            e,
            ProxyEvent::Disconnected { source: ErrorSource::Adapter, error: Some(_), .. }
        ))
        .await
    );

    let (_allowed, status) = connect_through(proxy, &echo.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"));

    assert_eq!(sink.count(|e| matches!(e, ProxyEvent::RuleMatched { rule, .. } if rule == "private")), 1);
    assert_eq!(
        sink.count(|e| matches!(e, ProxyEvent::RuleDidNotMatch { rule, .. } if rule == "private")),
        1
    );
    assert_eq!(sink.count(|e| matches!(e, ProxyEvent::RuleMatched { rule, .. } if rule == "catch-all")), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_connection_closed_without_response() {
    let domains = DomainSet::builder().add_exact("only.example").build().unwrap();
    let (server, sink) = start_server(vec![Rule::domain_list(domains, direct())]);
    let proxy = server.start().await.unwrap();

    let (_client, status) = connect_through(proxy, "elsewhere.example:443").await;
    assert!(status.is_empty(), "expected a silent close, got: {status}");
    assert_eq!(
        sink.count(|e| matches!(e, ProxyEvent::ConnectionRejected { host, reason, .. }
            if host == "elsewhere.example" && reason == "no rule matched")),
        1
    );
    assert_eq!(sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { .. })), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_reports_live_sessions_once() {
    let echo = spawn_echo_server().await;
    let (server, sink) = start_server(vec![Rule::all(direct())]);
    let proxy = server.start().await.unwrap();

    let (mut client, status) = connect_through(proxy, &echo.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"));
    client.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).await.unwrap();
    assert_eq!(server.active_sessions(), 1);

    server.stop().await.unwrap();
    assert_eq!(server.state(), ProxyState::Stopped);
    let proxy_disconnects = |e: &ProxyEvent| matches!(e, ProxyEvent::Disconnected { source: ErrorSource::Proxy, .. });
    assert_eq!(sink.count(proxy_disconnects), 1);

    // The relay finishing afterwards does not report the session again.
    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(|e| matches!(e, ProxyEvent::Disconnected { .. })), 1);
}

#[tokio::test]
async fn test_restart_accepts_again() {
    let echo = spawn_echo_server().await;
    let (server, _sink) = start_server(vec![Rule::all(direct())]);

    let first = server.start().await.unwrap();
    server.stop().await.unwrap();
    assert!(TcpStream::connect(first).await.is_err());

    let second = server.start().await.unwrap();
    let (_client, status) = connect_through(second, &echo.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"));
    server.stop().await.unwrap();
}
