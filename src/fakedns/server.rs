//! DNS server flow
//!
//! Decides, per query, whether the client gets a fake IP or the real
//! answer:
//!
//! 1. The rules classify the query by name (domain phase). The first rule
//!    that does not `Pass` decides.
//! 2. `Fake` is answered locally from the fake-IP pool.
//! 3. Everything else is forwarded upstream. If the deciding rule said
//!    `Unknown`, the rules from that one onward are asked again with the
//!    real answer in hand (IP phase); a `Fake` verdict then replaces the
//!    real answer with a fake IP, and the session keeps the real address.
//!
//! Only A and AAAA queries take part; every other type is forwarded.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Header, Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tracing::{debug, trace, warn};

use super::manager::FakeDnsManager;
use super::session::DnsSession;
use super::upstream::DnsUpstream;
use crate::error::FakeDnsError;
use crate::event::{self, EventSink, ProxyEvent};
use crate::packet::{build_udp_reply, DnsMessage, IpPacket, Transport};
use crate::rules::{DnsMatchResult, DnsPhase, RuleEngine};

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Answers DNS queries using the rules, the fake-IP table and an upstream
pub struct DnsServer {
    manager: Arc<FakeDnsManager>,
    rules: Arc<RuleEngine>,
    upstream: Arc<dyn DnsUpstream>,
    sink: Option<Arc<dyn EventSink>>,
}

impl DnsServer {
    /// Create a server
    pub fn new(
        manager: Arc<FakeDnsManager>,
        rules: Arc<RuleEngine>,
        upstream: Arc<dyn DnsUpstream>,
    ) -> Self {
        Self {
            manager,
            rules,
            upstream,
            sink: None,
        }
    }

    /// Report resolutions to `sink` instead of the process-wide sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The fake-IP table this server fills
    #[must_use]
    pub fn manager(&self) -> &Arc<FakeDnsManager> {
        &self.manager
    }

    /// Answer one DNS query in wire format.
    ///
    /// Returns `None` for input that is not a single-question query.
    pub async fn handle_query(&self, query: &[u8]) -> Option<Vec<u8>> {
        let request = match DnsMessage::parse(query) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping unparseable dns query: {}", e);
                return None;
            }
        };
        let session = DnsSession::new(request, None)?;
        self.resolve(session, query).await
    }

    /// Answer a DNS query carried in a raw IP packet.
    ///
    /// The packet must be UDP to port 53. The reply is a complete IP
    /// packet addressed back to the sender.
    pub async fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let packet = match IpPacket::parse(packet) {
            Ok(p) => p,
            Err(e) => {
                trace!("dropping unparseable packet: {}", e);
                return None;
            }
        };
        let Transport::Udp { dst_port: DNS_PORT, .. } = packet.transport() else {
            return None;
        };
        let payload = packet.udp_payload()?.to_vec();
        let request = DnsMessage::parse(&payload).ok()?;
        let session = DnsSession::new(request, Some(packet.clone()))?;

        let response = self.resolve(session, &payload).await?;
        match build_udp_reply(&packet, &response) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("failed to build dns reply packet: {}", e);
                None
            }
        }
    }

    async fn resolve(&self, mut session: DnsSession, raw: &[u8]) -> Option<Vec<u8>> {
        if !matches!(session.query_type(), RecordType::A | RecordType::AAAA) {
            trace!("forwarding {} query for {}", session.query_type(), session.domain());
            return self.forward(&session, raw).await.map(|(bytes, _)| bytes);
        }

        // One snapshot for both phases so rule indexes stay meaningful
        let rules = self.rules.load();
        let domain_match = rules.match_dns(&session, DnsPhase::Domain, 0);

        let mut result = domain_match.as_ref().map(|m| m.result);
        if let Some(m) = &domain_match {
            session.set_match(Some(Arc::clone(&m.rule)), self.effective(m.result));
        }

        if result == Some(DnsMatchResult::Fake) && self.manager.is_enabled() {
            return self.answer_fake(session);
        }

        let (bytes, response) = self.forward(&session, raw).await?;
        if let Some(response) = response {
            session.set_real_response(response);
        }

        if let Some(m) = domain_match.filter(|m| m.result == DnsMatchResult::Unknown) {
            match rules.match_dns(&session, DnsPhase::Ip, m.index) {
                Some(ip_match) => {
                    result = Some(ip_match.result);
                    session.set_match(Some(ip_match.rule), self.effective(ip_match.result));
                }
                None => {
                    result = Some(DnsMatchResult::Pass);
                    session.set_match(None, DnsMatchResult::Pass);
                }
            }
            if result == Some(DnsMatchResult::Fake) && self.manager.is_enabled() {
                return self.answer_fake(session);
            }
        }

        self.report(&session, None, result.map_or(DnsMatchResult::Pass, |r| self.effective(r)));
        Some(bytes)
    }

    /// `Fake` degrades to `Real` when fake IPs are turned off
    fn effective(&self, result: DnsMatchResult) -> DnsMatchResult {
        if result == DnsMatchResult::Fake && !self.manager.is_enabled() {
            DnsMatchResult::Real
        } else {
            result
        }
    }

    /// Forward to the upstream; SERVFAIL if it fails
    async fn forward(&self, session: &DnsSession, raw: &[u8]) -> Option<(Vec<u8>, Option<DnsMessage>)> {
        match self.upstream.query(raw).await {
            Ok(bytes) => {
                let parsed = DnsMessage::parse(&bytes)
                    .inspect_err(|e| debug!("upstream answer for {} unparseable: {}", session.domain(), e))
                    .ok();
                Some((bytes, parsed))
            }
            Err(e) => {
                warn!("upstream query for {} failed: {}", session.domain(), e);
                let request = session.request().as_message();
                let mut failure = Message::error_msg(request.id(), request.op_code(), ResponseCode::ServFail);
                failure.add_queries(request.queries().iter().cloned());
                encode(&failure).map(|bytes| (bytes, None))
            }
        }
    }

    fn answer_fake(&self, session: DnsSession) -> Option<Vec<u8>> {
        let request = session.request().as_message().clone();
        let mut response = Message::new();
        response.set_header(Header::response_from_request(request.header()));
        response.set_recursion_available(true);
        response.add_queries(request.queries().iter().cloned());

        let domain = session.domain().to_string();
        let real_ip = session.real_ip();
        match self.manager.assign_session(session) {
            Ok(session) => {
                let name = request.queries()[0].name().clone();
                let ttl = u32::try_from(self.manager.ttl().as_secs()).unwrap_or(u32::MAX);
                let rdata = match session.fake_ip() {
                    Some(IpAddr::V4(v4)) => RData::A(A(v4)),
                    Some(IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                    None => return None,
                };
                response.add_answer(Record::from_rdata(name, ttl, rdata));
                self.report(&session, session.fake_ip(), DnsMatchResult::Fake);
            }
            Err(FakeDnsError::Ipv6Disabled) => {
                // Empty NOERROR answer; the client falls back to A
                debug!("no ipv6 fake pool, empty AAAA answer for {}", domain);
            }
            Err(e) => {
                warn!("fake ip for {} unavailable: {}", domain, e);
                response.set_response_code(ResponseCode::ServFail);
            }
        }
        trace!("fake answer for {} (real ip {:?})", domain, real_ip);
        encode(&response)
    }

    fn report(&self, session: &DnsSession, fake_ip: Option<IpAddr>, result: DnsMatchResult) {
        event::emit_to(
            self.sink.as_ref(),
            &ProxyEvent::DnsResolved {
                domain: session.domain().to_string(),
                fake_ip,
                real_ip: session.real_ip(),
                result,
            },
        );
    }
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    message
        .to_vec()
        .inspect_err(|e| warn!("dns response encode error: {}", e))
        .ok()
}
