//! Raw IPv4/UDP/DNS frame handling for the tunnel.
//!
//! Frames read from the virtual interface are bare IPv4 datagrams (no link
//! layer). Every function here treats its input as adversarial: a short or
//! malformed frame yields `false`/`None`/`Err`, never a panic.

// DNS frames are bounded by the tunnel MTU, so usize -> u16 casts below are
// guarded by the `u16::try_from` on the total length.
#![allow(clippy::cast_possible_truncation)]

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};

use crate::error::{NetworkError, Result};

/// IPv4 header size in bytes (without options).
pub const IPV4_HEADER_SIZE: usize = 20;
/// UDP header size in bytes.
pub const UDP_HEADER_SIZE: usize = 8;
/// DNS message header size in bytes.
pub const DNS_HEADER_SIZE: usize = 12;
/// Smallest frame that can carry a DNS query.
pub const MIN_DNS_FRAME_SIZE: usize = IPV4_HEADER_SIZE + UDP_HEADER_SIZE + DNS_HEADER_SIZE;
/// Well-known DNS port.
pub const DNS_PORT: u16 = 53;

/// TTL of the synthetic answer, in seconds.
const BLOCKED_ANSWER_TTL: u32 = 300;
/// Address handed out for blocked names.
const BLOCKED_ANSWER_ADDR: [u8; 4] = [127, 0, 0, 1];
/// Compression pointer to the question name at DNS offset 12.
const QUESTION_NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

/// Length of the IPv4 header as advertised by the IHL nibble.
///
/// Returns `None` for an empty frame or an IHL below the 5-word minimum.
fn ip_header_len(frame: &[u8]) -> Option<usize> {
    let ihl = usize::from(frame.first()? & 0x0F) * 4;
    (ihl >= IPV4_HEADER_SIZE).then_some(ihl)
}

/// Returns `true` when the frame is an IPv4/UDP datagram bound for port 53.
pub fn is_dns_query(frame: &[u8]) -> bool {
    if frame.len() < MIN_DNS_FRAME_SIZE {
        return false;
    }

    let Some(ipv4) = Ipv4Packet::new(frame) else {
        return false;
    };
    if ipv4.get_version() != 4 {
        return false;
    }
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return false;
    }

    let Some(ihl) = ip_header_len(frame) else {
        return false;
    };
    if frame.len() < ihl + UDP_HEADER_SIZE + DNS_HEADER_SIZE {
        return false;
    }

    UdpPacket::new(&frame[ihl..]).is_some_and(|udp| udp.get_destination() == DNS_PORT)
}

/// Extracts the first question name of a DNS query frame, lowercased.
///
/// Labels are read as raw bytes, one code point each. Compression pointers
/// are not followed: a query never needs them, so a pointer (or any walk past
/// the end of the frame) yields `None`.
pub fn extract_domain(frame: &[u8]) -> Option<String> {
    let ihl = ip_header_len(frame)?;
    let mut offset = ihl + UDP_HEADER_SIZE + DNS_HEADER_SIZE;
    let mut domain = String::new();

    loop {
        let label_len = *frame.get(offset)?;
        if label_len == 0 {
            break;
        }
        if label_len & 0xC0 != 0 {
            return None;
        }

        let start = offset + 1;
        let label = frame.get(start..start + usize::from(label_len))?;
        if !domain.is_empty() {
            domain.push('.');
        }
        domain.extend(label.iter().copied().map(char::from));
        offset = start + usize::from(label_len);
    }

    if domain.is_empty() {
        None
    } else {
        Some(domain.to_lowercase())
    }
}

/// Returns the DNS message carried by the frame (header onwards).
pub fn extract_dns_payload(frame: &[u8]) -> Option<&[u8]> {
    let ihl = ip_header_len(frame)?;
    let payload = frame.get(ihl + UDP_HEADER_SIZE..)?;
    (payload.len() >= DNS_HEADER_SIZE).then_some(payload)
}

/// Offset just past the first question (name, QTYPE, QCLASS) of a DNS message.
fn question_end(dns: &[u8]) -> Option<usize> {
    let mut offset = DNS_HEADER_SIZE;
    loop {
        let label_len = *dns.get(offset)?;
        if label_len == 0 {
            offset += 1;
            break;
        }
        if label_len & 0xC0 != 0 {
            return None;
        }
        offset += 1 + usize::from(label_len);
    }
    let end = offset + 4;
    (end <= dns.len()).then_some(end)
}

/// Builds the DNS answer for a blocked query: the original header and
/// question followed by one `A 127.0.0.1` record.
fn blocked_dns_message(query_dns: &[u8]) -> Option<Vec<u8>> {
    let end = question_end(query_dns)?;

    let mut message = Vec::with_capacity(end + 16);
    message.extend_from_slice(&query_dns[..end]);

    // QR=1, AA=1
    message[2] |= 0x84;
    // RA=1
    message[3] |= 0x80;
    // QDCOUNT=1 (only the first question is echoed), ANCOUNT=1,
    // NSCOUNT=0, ARCOUNT=0 (additional records were cut off)
    message[4..12].copy_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);

    message.extend_from_slice(&QUESTION_NAME_POINTER);
    // TYPE A, CLASS IN
    message.extend_from_slice(&[0, 1, 0, 1]);
    message.extend_from_slice(&BLOCKED_ANSWER_TTL.to_be_bytes());
    message.extend_from_slice(&(BLOCKED_ANSWER_ADDR.len() as u16).to_be_bytes());
    message.extend_from_slice(&BLOCKED_ANSWER_ADDR);

    Some(message)
}

/// Synthesizes the full response frame for a blocked query.
pub fn build_blocked_response(query_frame: &[u8]) -> Result<Vec<u8>> {
    let query_dns = extract_dns_payload(query_frame)
        .ok_or_else(|| NetworkError::PacketConstruction("query frame too short".into()))?;
    let answer = blocked_dns_message(query_dns)
        .ok_or_else(|| NetworkError::PacketConstruction("malformed question section".into()))?;
    wrap_in_ip_udp(query_frame, &answer)
}

/// Wraps a DNS answer obtained from the upstream resolver for delivery back
/// to the application that sent `query_frame`.
pub fn build_forwarded_response(query_frame: &[u8], upstream_dns: &[u8]) -> Result<Vec<u8>> {
    wrap_in_ip_udp(query_frame, upstream_dns)
}

/// Builds a fresh IPv4/UDP header pair addressed back to the query's sender.
///
/// The IPv4 header carries a real checksum; the UDP checksum is left at zero,
/// which IPv4 permits.
fn wrap_in_ip_udp(query_frame: &[u8], dns_payload: &[u8]) -> Result<Vec<u8>> {
    let construction = |reason: &str| NetworkError::PacketConstruction(reason.into());

    let ihl = ip_header_len(query_frame).ok_or_else(|| construction("invalid IPv4 header"))?;
    let query_ip = Ipv4Packet::new(query_frame).ok_or_else(|| construction("short IPv4 header"))?;
    let query_udp = query_frame
        .get(ihl..)
        .and_then(UdpPacket::new)
        .ok_or_else(|| construction("short UDP header"))?;

    let udp_len = UDP_HEADER_SIZE + dns_payload.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    let total_len_field =
        u16::try_from(total_len).map_err(|_| construction("response exceeds IPv4 size"))?;

    let mut frame = vec![0u8; total_len];

    {
        let mut udp = MutableUdpPacket::new(&mut frame[IPV4_HEADER_SIZE..])
            .ok_or_else(|| construction("UDP packet creation failed"))?;
        udp.set_source(DNS_PORT);
        udp.set_destination(query_udp.get_source());
        udp.set_length(udp_len as u16);
        udp.set_checksum(0);
        udp.set_payload(dns_payload);
    }

    {
        let mut ip = MutableIpv4Packet::new(&mut frame)
            .ok_or_else(|| construction("IPv4 packet creation failed"))?;
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total_len_field);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        // Swap: the tunnel's DNS address answers the requesting app
        ip.set_source(query_ip.get_destination());
        ip.set_destination(query_ip.get_source());
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    Ok(frame)
}
