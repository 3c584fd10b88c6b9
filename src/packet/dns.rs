//! DNS wire-format messages

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{RData, Record};

use crate::error::PacketError;

/// Whether a message is a query or a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMessageType {
    Query,
    Response,
}

impl From<MessageType> for DnsMessageType {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Query => Self::Query,
            MessageType::Response => Self::Response,
        }
    }
}

/// A parsed DNS message
#[derive(Debug, Clone)]
pub struct DnsMessage {
    inner: Message,
}

impl DnsMessage {
    /// Parse a DNS message from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Dns`] if the bytes are not a valid message.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        Message::from_vec(bytes)
            .map(|inner| Self { inner })
            .map_err(|e| PacketError::Dns(e.to_string()))
    }

    /// Wrap an already-built message
    #[must_use]
    pub fn from_message(inner: Message) -> Self {
        Self { inner }
    }

    /// Query or response
    #[must_use]
    pub fn message_type(&self) -> DnsMessageType {
        self.inner.message_type().into()
    }

    /// Transaction id
    #[must_use]
    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    /// Question section
    #[must_use]
    pub fn queries(&self) -> &[Query] {
        self.inner.queries()
    }

    /// Answer section
    #[must_use]
    pub fn answers(&self) -> &[Record] {
        self.inner.answers()
    }

    /// Domain of the first question, lowercased and without the trailing dot
    #[must_use]
    pub fn query_domain(&self) -> Option<String> {
        self.inner.queries().first().map(|q| {
            q.name()
                .to_utf8()
                .trim_end_matches('.')
                .to_ascii_lowercase()
        })
    }

    /// A and AAAA addresses in the answer section, in order
    #[must_use]
    pub fn answer_ips(&self) -> Vec<IpAddr> {
        self.inner
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect()
    }

    /// Smallest TTL among the answers
    #[must_use]
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.inner.answers().iter().map(Record::ttl).min()
    }

    /// The underlying `hickory-proto` message
    #[must_use]
    pub fn as_message(&self) -> &Message {
        &self.inner
    }
}
