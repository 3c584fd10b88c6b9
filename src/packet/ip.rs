//! IPv4/IPv6 packet parsing
//!
//! Parses just enough of the IP header to classify a packet: version,
//! transport protocol, addresses and, for TCP/UDP, the ports. UDP payloads
//! are exposed so DNS queries can be lifted straight out of the tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::PacketError;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

// IPv6 extension headers we know how to skip
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_DEST_OPTS: u8 = 60;

/// IP version of a parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Transport layer view of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP segment; only ports are decoded
    Tcp { src_port: u16, dst_port: u16 },
    /// UDP datagram; `payload` is the byte range of the UDP body
    Udp {
        src_port: u16,
        dst_port: u16,
        payload_offset: usize,
        payload_len: usize,
    },
    /// Any other protocol, or a truncated TCP/UDP header
    Other,
}

/// A parsed IP packet
///
/// Owns its bytes so it can outlive the tunnel read buffer (a DNS session
/// keeps the query packet around to address its reply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    data: Vec<u8>,
    version: IpVersion,
    protocol: u8,
    source: IpAddr,
    destination: IpAddr,
    transport: Transport,
}

impl IpPacket {
    /// Parse a raw IP packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] if the buffer is shorter than its
    /// header and [`PacketError::UnsupportedVersion`] for anything that is
    /// not IPv4 or IPv6.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let first = *bytes.first().ok_or(PacketError::truncated(1, 0))?;
        match first >> 4 {
            4 => Self::parse_v4(bytes),
            6 => Self::parse_v6(bytes),
            v => Err(PacketError::UnsupportedVersion(v)),
        }
    }

    fn parse_v4(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::truncated(IPV4_MIN_HEADER_LEN, bytes.len()));
        }

        let header_len = usize::from(bytes[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || bytes.len() < header_len {
            return Err(PacketError::truncated(header_len.max(IPV4_MIN_HEADER_LEN), bytes.len()));
        }

        // Trust the total length field only when it fits the buffer
        let total_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let end = if total_len >= header_len && total_len <= bytes.len() {
            total_len
        } else {
            bytes.len()
        };

        let protocol = bytes[9];
        let source = IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]));
        let destination = IpAddr::V4(Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]));
        let transport = parse_transport(protocol, bytes, header_len, end);

        Ok(Self {
            data: bytes[..end].to_vec(),
            version: IpVersion::V4,
            protocol,
            source,
            destination,
            transport,
        })
    }

    fn parse_v6(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < IPV6_HEADER_LEN {
            return Err(PacketError::truncated(IPV6_HEADER_LEN, bytes.len()));
        }

        let payload_len = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        let end = (IPV6_HEADER_LEN + payload_len).min(bytes.len());

        let mut src = [0u8; 16];
        src.copy_from_slice(&bytes[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&bytes[24..40]);

        // Walk the extension header chain until we hit a transport header
        let mut next_header = bytes[6];
        let mut offset = IPV6_HEADER_LEN;
        while matches!(next_header, IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS) {
            if offset + 2 > end {
                return Err(PacketError::truncated(offset + 2, end));
            }
            let ext_len = (usize::from(bytes[offset + 1]) + 1) * 8;
            next_header = bytes[offset];
            offset += ext_len;
        }

        let transport = parse_transport(next_header, bytes, offset, end);

        Ok(Self {
            data: bytes[..end].to_vec(),
            version: IpVersion::V6,
            protocol: next_header,
            source: IpAddr::V6(Ipv6Addr::from(src)),
            destination: IpAddr::V6(Ipv6Addr::from(dst)),
            transport,
        })
    }

    /// IP version
    #[must_use]
    pub const fn version(&self) -> IpVersion {
        self.version
    }

    /// Transport protocol number (after IPv6 extension headers)
    #[must_use]
    pub const fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Source address
    #[must_use]
    pub const fn source(&self) -> IpAddr {
        self.source
    }

    /// Destination address
    #[must_use]
    pub const fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Transport header view
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// Source port for TCP/UDP packets
    #[must_use]
    pub const fn source_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => Some(src_port),
            Transport::Other => None,
        }
    }

    /// Destination port for TCP/UDP packets
    #[must_use]
    pub const fn destination_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => Some(dst_port),
            Transport::Other => None,
        }
    }

    /// UDP body, if this is a UDP packet
    #[must_use]
    pub fn udp_payload(&self) -> Option<&[u8]> {
        match self.transport {
            Transport::Udp {
                payload_offset,
                payload_len,
                ..
            } => self.data.get(payload_offset..payload_offset + payload_len),
            _ => None,
        }
    }

    /// The packet bytes as parsed
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

fn parse_transport(protocol: u8, bytes: &[u8], offset: usize, end: usize) -> Transport {
    if offset + 4 > end {
        return Transport::Other;
    }
    let src_port = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
    let dst_port = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]);

    match protocol {
        IPPROTO_TCP => Transport::Tcp { src_port, dst_port },
        IPPROTO_UDP => {
            if offset + UDP_HEADER_LEN > end {
                return Transport::Other;
            }
            let udp_len = usize::from(u16::from_be_bytes([bytes[offset + 4], bytes[offset + 5]]));
            let available = end - offset;
            let udp_len = if udp_len >= UDP_HEADER_LEN && udp_len <= available {
                udp_len
            } else {
                available
            };
            Transport::Udp {
                src_port,
                dst_port,
                payload_offset: offset + UDP_HEADER_LEN,
                payload_len: udp_len - UDP_HEADER_LEN,
            }
        }
        _ => Transport::Other,
    }
}

/// Build the UDP reply to `request` carrying `payload`.
///
/// Addresses and ports are swapped. The IPv4 header checksum and the UDP
/// checksum (mandatory on IPv6) are filled in.
///
/// # Errors
///
/// Returns [`PacketError::Truncated`] if `request` is not a UDP packet and
/// [`PacketError::TooLarge`] if `payload` overflows the 16-bit length fields.
pub fn build_udp_reply(request: &IpPacket, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let Transport::Udp {
        src_port, dst_port, ..
    } = request.transport
    else {
        return Err(PacketError::truncated(UDP_HEADER_LEN, 0));
    };

    let udp_len = UDP_HEADER_LEN + payload.len();
    let udp_len_field =
        u16::try_from(udp_len).map_err(|_| PacketError::TooLarge(payload.len()))?;
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&udp_len_field.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    match (request.destination, request.source) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total_len = u16::try_from(IPV4_MIN_HEADER_LEN + udp_len)
                .map_err(|_| PacketError::TooLarge(payload.len()))?;
            let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
            packet[0] = 0x45;
            packet[2..4].copy_from_slice(&total_len.to_be_bytes());
            packet[6] = 0x40; // DF
            packet[8] = DEFAULT_TTL;
            packet[9] = IPPROTO_UDP;
            packet[12..16].copy_from_slice(&src.octets());
            packet[16..20].copy_from_slice(&dst.octets());
            let checksum = fold_checksum(sum_words(&packet, 0));
            packet[10..12].copy_from_slice(&checksum.to_be_bytes());

            let mut pseudo = Vec::with_capacity(12);
            pseudo.extend_from_slice(&src.octets());
            pseudo.extend_from_slice(&dst.octets());
            pseudo.extend_from_slice(&[0, IPPROTO_UDP]);
            pseudo.extend_from_slice(&udp_len_field.to_be_bytes());
            set_udp_checksum(&mut udp, &pseudo);

            packet.extend_from_slice(&udp);
            Ok(packet)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut packet = vec![0u8; IPV6_HEADER_LEN];
            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&udp_len_field.to_be_bytes());
            packet[6] = IPPROTO_UDP;
            packet[7] = DEFAULT_TTL;
            packet[8..24].copy_from_slice(&src.octets());
            packet[24..40].copy_from_slice(&dst.octets());

            let mut pseudo = Vec::with_capacity(40);
            pseudo.extend_from_slice(&src.octets());
            pseudo.extend_from_slice(&dst.octets());
            pseudo.extend_from_slice(&u32::from(udp_len_field).to_be_bytes());
            pseudo.extend_from_slice(&[0, 0, 0, IPPROTO_UDP]);
            set_udp_checksum(&mut udp, &pseudo);

            packet.extend_from_slice(&udp);
            Ok(packet)
        }
        // parse() never yields mixed families
        _ => Err(PacketError::UnsupportedVersion(0)),
    }
}

fn set_udp_checksum(udp: &mut [u8], pseudo_header: &[u8]) {
    let sum = sum_words(pseudo_header, 0);
    let mut checksum = fold_checksum(sum_words(udp, sum));
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());
}

fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
