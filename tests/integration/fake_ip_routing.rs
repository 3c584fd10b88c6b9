//! Fake-IP routing integration tests
//!
//! A DNS query hands out a fake address; a later proxy request for that
//! address must be routed as the original domain.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use intercept_proxy::adapter::{AdapterFactory, HttpAdapterFactory};
use intercept_proxy::event::{CollectingSink, ProxyEvent};
use intercept_proxy::fakedns::{DnsServer, DnsUpstream, FakeDnsManager, FakeIpConfig};
use intercept_proxy::packet::DnsMessage;
use intercept_proxy::proxy::ProxyServer;
use intercept_proxy::rules::{DomainSet, Rule, RuleEngine, RuleSet};

use super::{connect_through, direct, kernel_sockets, loopback_config, reject};

const REAL_ADDR: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Upstream resolver answering every A query with `REAL_ADDR`
struct FixedUpstream;

#[async_trait]
impl DnsUpstream for FixedUpstream {
    async fn query(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let request = Message::from_vec(query).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut response = Message::new();
        response.set_header(Header::response_from_request(request.header()));
        response.add_queries(request.queries().iter().cloned());
        if let Some(q) = request.queries().first() {
            if q.query_type() == RecordType::A {
                response.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(REAL_ADDR))));
            }
        }
        response.to_vec().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn a_query(domain: &str) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(7)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
    msg.to_vec().unwrap()
}

fn first_answer(response: &[u8]) -> IpAddr {
    DnsMessage::parse(response).unwrap().answer_ips()[0]
}

/// Upstream HTTP proxy that reports the CONNECT head it received, then echoes
async fn spawn_upstream_proxy() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                return;
            }
            head.push(byte[0]);
        }
        let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });
    (addr, rx)
}

struct Harness {
    dns: DnsServer,
    proxy: ProxyServer,
    manager: Arc<FakeDnsManager>,
    sink: Arc<CollectingSink>,
}

fn harness(config: &FakeIpConfig, rules: Vec<Rule>) -> Harness {
    let manager = Arc::new(FakeDnsManager::new(config));
    let sink = Arc::new(CollectingSink::new());
    let engine = Arc::new(RuleEngine::new(RuleSet::new(rules)).with_sink(sink.clone()));
    let dns = DnsServer::new(Arc::clone(&manager), Arc::clone(&engine), Arc::new(FixedUpstream))
        .with_sink(sink.clone());
    let proxy = ProxyServer::new(&loopback_config(), engine, Some(Arc::clone(&manager))).with_sink(sink.clone());
    Harness {
        dns,
        proxy,
        manager,
        sink,
    }
}

fn tracker_rules(upstream: SocketAddr) -> Vec<Rule> {
    let trackers = DomainSet::builder().add_suffix("tracker.example").build().unwrap();
    let via_upstream: Arc<dyn AdapterFactory> =
        Arc::new(HttpAdapterFactory::new("upstream", upstream, kernel_sockets()));
    vec![
        Rule::domain_list(trackers, via_upstream).with_description("trackers"),
        Rule::all(direct()).with_description("catch-all"),
    ]
}

#[tokio::test]
async fn test_fake_ip_connection_routed_as_domain() {
    let (upstream, head_rx) = spawn_upstream_proxy().await;
    let h = harness(&FakeIpConfig::new(), tracker_rules(upstream));

    let response = h.dns.handle_query(&a_query("cdn.tracker.example.")).await.unwrap();
    let fake = first_answer(&response);
    assert!(h.manager.is_fake_ip(fake));
    assert_ne!(fake, IpAddr::V4(REAL_ADDR));

    let proxy = h.proxy.start().await.unwrap();
    let (mut client, status) = connect_through(proxy, &format!("{fake}:443")).await;
    assert!(status.starts_with("HTTP/1.1 200"), "unexpected status: {status}");

    let head = head_rx.await.unwrap();
    assert!(head.starts_with("CONNECT cdn.tracker.example:443 HTTP/1.1\r\n"), "got: {head}");

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert_eq!(
        h.sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { host, adapter, .. }
            if host == "cdn.tracker.example" && adapter == "upstream")),
        1
    );
    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_reload_reroutes_outstanding_fake_ip() {
    let (upstream, head_rx) = spawn_upstream_proxy().await;
    let h = harness(&FakeIpConfig::new(), tracker_rules(upstream));

    // The answer is handed out while trackers still go upstream.
    let fake = first_answer(&h.dns.handle_query(&a_query("cdn.tracker.example.")).await.unwrap());
    assert!(h.manager.is_fake_ip(fake));

    let proxy = h.proxy.start().await.unwrap();
    let trackers = DomainSet::builder().add_suffix("tracker.example").build().unwrap();
    h.proxy.reload_rules(
        RuleSet::new(vec![
            Rule::domain_list(trackers, reject()).with_description("trackers"),
            Rule::all(direct()).with_description("catch-all"),
        ])
        .with_version(2),
    );

    let (_client, status) = connect_through(proxy, &format!("{fake}:443")).await;
    assert!(status.starts_with("HTTP/1.1 502"), "unexpected status: {status}");

    assert_eq!(
        h.sink.count(|e| matches!(e, ProxyEvent::ConnectionAccepted { adapter, .. } if adapter == "upstream")),
        0
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), head_rx).await.is_err(),
        "upstream proxy was contacted after the reload"
    );
    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_same_domain_reuses_fake_ip() {
    let h = harness(&FakeIpConfig::new(), tracker_rules("127.0.0.1:9".parse().unwrap()));

    let first = first_answer(&h.dns.handle_query(&a_query("ads.tracker.example.")).await.unwrap());
    let second = first_answer(&h.dns.handle_query(&a_query("ADS.tracker.example.")).await.unwrap());
    assert_eq!(first, second);
    assert_eq!(h.manager.len(), 1);

    // A domain for the direct adapter gets its real address.
    let real = first_answer(&h.dns.handle_query(&a_query("example.org.")).await.unwrap());
    assert_eq!(real, IpAddr::V4(REAL_ADDR));
}

#[tokio::test]
async fn test_unknown_fake_ip_is_dropped() {
    let h = harness(&FakeIpConfig::new(), tracker_rules("127.0.0.1:9".parse().unwrap()));
    let proxy = h.proxy.start().await.unwrap();

    let (_client, status) = connect_through(proxy, "198.18.0.99:443").await;
    assert!(status.is_empty(), "expected a silent close, got: {status}");
    assert_eq!(
        h.sink.count(|e| matches!(e, ProxyEvent::ConnectionRejected { reason, .. } if reason == "unknown fake ip")),
        1
    );
    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_expired_fake_ip_is_dropped() {
    let config = FakeIpConfig::new().with_ttl(Duration::from_secs(1));
    let h = harness(&config, tracker_rules("127.0.0.1:9".parse().unwrap()));

    let fake = first_answer(&h.dns.handle_query(&a_query("pixel.tracker.example.")).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(h.manager.lookup_fake_ip(fake).is_none());

    let proxy = h.proxy.start().await.unwrap();
    let (_client, status) = connect_through(proxy, &format!("{fake}:443")).await;
    assert!(status.is_empty());
    assert_eq!(h.sink.count(|e| matches!(e, ProxyEvent::ConnectionRejected { .. })), 1);
    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_disabled_manager_answers_real_addresses() {
    let config = FakeIpConfig::new().enabled(false);
    let h = harness(&config, tracker_rules("127.0.0.1:9".parse().unwrap()));

    let answer = first_answer(&h.dns.handle_query(&a_query("cdn.tracker.example.")).await.unwrap());
    assert_eq!(answer, IpAddr::V4(REAL_ADDR));
    assert!(h.manager.is_empty());
}
