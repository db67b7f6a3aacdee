//! Raw-socket ICMP probe transport.
//!
//! One raw ICMPv4 socket serves every probe. The TTL is set per probe;
//! the answering router is identified from either an echo reply (the
//! target itself) or a time-exceeded notice quoting our echo request.
//! Requires CAP_NET_RAW or equivalent at bind time.

use crate::trace::ProbeTransport;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::trace;

const ECHO_REPLY: u8 = 0;
const ECHO_REQUEST: u8 = 8;
const TIME_EXCEEDED: u8 = 11;

/// Echo payload size; 16 zero bytes keeps the quoted request intact in
/// time-exceeded notices.
const ECHO_PAYLOAD: usize = 16;

pub struct IcmpProbeTransport {
    socket: UdpSocket,
    ident: u16,
}

impl IcmpProbeTransport {
    pub fn new() -> io::Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        raw.set_nonblocking(true)?;
        let std_sock: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_sock)?;
        let ident = (std::process::id() & 0xFFFF) as u16;
        Ok(Self { socket, ident })
    }
}

impl ProbeTransport for IcmpProbeTransport {
    async fn probe(&self, target: Ipv4Addr, ttl: u32, seq: u16) -> io::Result<Option<Ipv4Addr>> {
        self.socket.set_ttl(ttl)?;
        let packet = build_echo_request(self.ident, seq);
        self.socket.send_to(&packet, (target, 0)).await?;

        let mut buf = [0u8; 1600];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let SocketAddr::V4(from) = from else { continue };
            match parse_reply(&buf[..len]) {
                Some(reply) if reply.ident == self.ident && reply.seq == seq => {
                    trace!(kind = reply.kind, router = %from.ip(), "probe answered");
                    return Ok(Some(*from.ip()));
                }
                _ => continue,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Reply {
    kind: u8,
    ident: u16,
    seq: u16,
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 8 + ECHO_PAYLOAD];
    pkt[0] = ECHO_REQUEST;
    pkt[4..6].copy_from_slice(&ident.to_be_bytes());
    pkt[6..8].copy_from_slice(&seq.to_be_bytes());
    let ck = checksum(&pkt);
    pkt[2..4].copy_from_slice(&ck.to_be_bytes());
    pkt
}

/// Parse a raw-socket datagram (outer IP header included) into the
/// identifier/sequence pair it answers, if it answers one at all.
fn parse_reply(raw: &[u8]) -> Option<Reply> {
    let icmp = strip_ip_header(raw)?;
    match *icmp.first()? {
        ECHO_REPLY => Some(Reply {
            kind: ECHO_REPLY,
            ident: be_u16(icmp.get(4..6)?),
            seq: be_u16(icmp.get(6..8)?),
        }),
        TIME_EXCEEDED => {
            // The notice quotes the offending IP packet after its own
            // 8-byte header; our echo request sits inside that quote.
            let quoted = strip_ip_header(icmp.get(8..)?)?;
            if *quoted.first()? != ECHO_REQUEST {
                return None;
            }
            Some(Reply {
                kind: TIME_EXCEEDED,
                ident: be_u16(quoted.get(4..6)?),
                seq: be_u16(quoted.get(6..8)?),
            })
        }
        _ => None,
    }
}

fn strip_ip_header(raw: &[u8]) -> Option<&[u8]> {
    let ihl = usize::from(raw.first()? & 0x0F) * 4;
    if ihl < 20 {
        return None;
    }
    raw.get(ihl..)
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap_ip(payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45; // v4, 20-byte header
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn echo_request_checksum_verifies() {
        let pkt = build_echo_request(0x1234, 7);
        assert_eq!(pkt[0], ECHO_REQUEST);
        // Re-summing a checksummed packet folds to zero.
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn parses_echo_reply() {
        let mut icmp = build_echo_request(42, 9);
        icmp[0] = ECHO_REPLY;
        let reply = parse_reply(&wrap_ip(&icmp)).unwrap();
        assert_eq!(reply.kind, ECHO_REPLY);
        assert_eq!(reply.ident, 42);
        assert_eq!(reply.seq, 9);
    }

    #[test]
    fn parses_time_exceeded_quoting_our_request() {
        let request = build_echo_request(42, 3);
        let quoted = wrap_ip(&request);

        let mut icmp = vec![TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&quoted);
        let reply = parse_reply(&wrap_ip(&icmp)).unwrap();
        assert_eq!(reply.kind, TIME_EXCEEDED);
        assert_eq!(reply.ident, 42);
        assert_eq!(reply.seq, 3);
    }

    #[test]
    fn foreign_icmp_ignored() {
        let icmp = [3u8, 0, 0, 0, 0, 0, 0, 0]; // destination unreachable
        assert_eq!(parse_reply(&wrap_ip(&icmp)), None);
        assert_eq!(parse_reply(&[]), None);
    }
}
