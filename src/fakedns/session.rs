//! DNS session: one query and everything learned while answering it

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::rr::RecordType;

use crate::packet::{DnsMessage, DnsMessageType, IpPacket};
use crate::rules::{DnsMatchResult, Rule};

/// Correlates one outstanding DNS query with its eventual answer.
///
/// Only a query carrying exactly one question can become a session; see
/// [`DnsSession::new`]. The session is filled in as the answer is decided
/// (matched rule, real response, fake IP) and handed to the fake-IP table
/// once a synthetic address has been chosen.
#[derive(Clone)]
pub struct DnsSession {
    request: DnsMessage,
    domain: String,
    query_type: RecordType,
    request_packet: Option<IpPacket>,
    real_ip: Option<IpAddr>,
    fake_ip: Option<IpAddr>,
    real_response: Option<DnsMessage>,
    matched_rule: Option<Arc<Rule>>,
    match_result: Option<DnsMatchResult>,
    expire_at: Option<Instant>,
}

impl DnsSession {
    /// Build a session from a parsed query.
    ///
    /// Returns `None` unless `request` is a query with exactly one
    /// question.
    #[must_use]
    pub fn new(request: DnsMessage, request_packet: Option<IpPacket>) -> Option<Self> {
        if request.message_type() != DnsMessageType::Query || request.queries().len() != 1 {
            return None;
        }
        let query_type = request.queries()[0].query_type();
        let domain = request.query_domain()?;

        Some(Self {
            request,
            domain,
            query_type,
            request_packet,
            real_ip: None,
            fake_ip: None,
            real_response: None,
            matched_rule: None,
            match_result: None,
            expire_at: None,
        })
    }

    /// The original query
    #[must_use]
    pub fn request(&self) -> &DnsMessage {
        &self.request
    }

    /// Queried domain, lowercased, no trailing dot
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Record type of the single question
    #[must_use]
    pub fn query_type(&self) -> RecordType {
        self.query_type
    }

    /// IP packet the query arrived in, when it came off the tunnel
    #[must_use]
    pub fn request_packet(&self) -> Option<&IpPacket> {
        self.request_packet.as_ref()
    }

    /// First address from the real resolver, if one was asked
    #[must_use]
    pub fn real_ip(&self) -> Option<IpAddr> {
        self.real_ip
    }

    /// Synthetic address answered for this query
    #[must_use]
    pub fn fake_ip(&self) -> Option<IpAddr> {
        self.fake_ip
    }

    /// Response from the real resolver
    #[must_use]
    pub fn real_response(&self) -> Option<&DnsMessage> {
        self.real_response.as_ref()
    }

    /// Rule that decided how this query was answered
    #[must_use]
    pub fn matched_rule(&self) -> Option<&Arc<Rule>> {
        self.matched_rule.as_ref()
    }

    /// Outcome of the rule that decided this query
    #[must_use]
    pub fn match_result(&self) -> Option<DnsMatchResult> {
        self.match_result
    }

    /// When the fake-IP mapping for this session lapses
    #[must_use]
    pub fn expire_at(&self) -> Option<Instant> {
        self.expire_at
    }

    /// Whether the session's mapping has lapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }

    /// Record the real resolver's answer; the first A/AAAA becomes `real_ip`
    pub fn set_real_response(&mut self, response: DnsMessage) {
        self.real_ip = response.answer_ips().first().copied();
        self.real_response = Some(response);
    }

    /// Record which rule decided this query and how
    pub fn set_match(&mut self, rule: Option<Arc<Rule>>, result: DnsMatchResult) {
        self.matched_rule = rule;
        self.match_result = Some(result);
    }

    pub(crate) fn set_fake_ip(&mut self, ip: IpAddr, expire_at: Instant) {
        self.fake_ip = Some(ip);
        self.expire_at = Some(expire_at);
    }
}

impl fmt::Debug for DnsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsSession")
            .field("domain", &self.domain)
            .field("query_type", &self.query_type)
            .field("real_ip", &self.real_ip)
            .field("fake_ip", &self.fake_ip)
            .field("matched_rule", &self.matched_rule.as_ref().map(|r| r.description()))
            .field("match_result", &self.match_result)
            .field("expire_at", &self.expire_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn message(kind: MessageType, domains: &[&str]) -> DnsMessage {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(kind);
        msg.set_op_code(OpCode::Query);
        for domain in domains {
            msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        }
        DnsMessage::from_message(msg)
    }

    #[test]
    fn test_single_query_accepted() {
        let session = DnsSession::new(message(MessageType::Query, &["tracker.example."]), None)
            .expect("single query is a valid session");
        assert_eq!(session.domain(), "tracker.example");
        assert_eq!(session.query_type(), RecordType::A);
        assert!(session.fake_ip().is_none());
        assert!(session.expire_at().is_none());
        assert!(!session.is_expired(Instant::now()));
    }

    #[test]
    fn test_rejects_zero_or_many_queries() {
        assert!(DnsSession::new(message(MessageType::Query, &[]), None).is_none());
        assert!(DnsSession::new(
            message(MessageType::Query, &["a.example.", "b.example."]),
            None
        )
        .is_none());
    }

    #[test]
    fn test_rejects_response() {
        assert!(DnsSession::new(message(MessageType::Response, &["a.example."]), None).is_none());
    }

    #[test]
    fn test_real_response_sets_real_ip() {
        let mut session =
            DnsSession::new(message(MessageType::Query, &["a.example."]), None).unwrap();

        let mut rsp = Message::new();
        rsp.set_message_type(MessageType::Response);
        rsp.add_answer(Record::from_rdata(
            Name::from_str("a.example.").unwrap(),
            60,
            RData::A(A("203.0.113.9".parse().unwrap())),
        ));
        session.set_real_response(DnsMessage::from_message(rsp));

        assert_eq!(session.real_ip(), Some("203.0.113.9".parse().unwrap()));
        assert!(session.real_response().is_some());
    }
}
