//! Overlay datagram wire codec.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! offset  size  field
//!   0      4    magic (UP = 0xDEADFACE, DOWN = 0xCAFEBABE)
//!   4      4    hop_count H
//!   8      4    current_hop I  (0 <= I <= H)
//!  12      4    content_size S
//!  16      4    src_ip
//!  20      4    src_port
//!  24      4    dst_ip
//!  28      4    dst_port
//!  32     4*H   hop vector (TD ids, first hop at element 0)
//! 32+4H    64   signature area (zero-filled, reserved)
//! 96+4H    S    payload
//! ```

use crate::types::TdId;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

/// Request-direction magic.
pub const MAGIC_UP: u32 = 0xDEAD_FACE;
/// Reply-direction magic.
pub const MAGIC_DOWN: u32 = 0xCAFE_BABE;

/// Fixed header bytes before the hop vector.
pub const HEADER_LEN: usize = 32;
/// Reserved signature area following the hop vector.
pub const SIGNATURE_LEN: usize = 64;
/// Bytes of the embedded send timestamp at the start of a payload.
pub const SEND_TIME_LEN: usize = 8;

/// Codec errors. Every variant maps to a silent drop in handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unknown magic: {0:#010x}")]
    BadMagic(u32),
    #[error("current hop {current} beyond hop count {count}")]
    HopOutOfRange { current: u32, count: u32 },
}

/// Traversal direction, carried in the magic word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn magic(self) -> u32 {
        match self {
            Direction::Up => MAGIC_UP,
            Direction::Down => MAGIC_DOWN,
        }
    }
}

/// A source-routed overlay datagram.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayDatagram {
    pub direction: Direction,
    pub current_hop: u32,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub hops: Vec<TdId>,
    pub payload: Vec<u8>,
}

impl OverlayDatagram {
    pub fn hop_count(&self) -> u32 {
        self.hops.len() as u32
    }

    /// Encoded length in bytes.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + 4 * self.hops.len() + SIGNATURE_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32_le(self.direction.magic());
        buf.put_u32_le(self.hop_count());
        buf.put_u32_le(self.current_hop);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(u32::from(*self.src.ip()));
        buf.put_u32_le(u32::from(self.src.port()));
        buf.put_u32_le(u32::from(*self.dst.ip()));
        buf.put_u32_le(u32::from(self.dst.port()));
        for hop in &self.hops {
            buf.put_u32_le(*hop);
        }
        buf.put_bytes(0, SIGNATURE_LEN);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                got: raw.len(),
            });
        }

        let mut buf = raw;
        let magic = buf.get_u32_le();
        let direction = match magic {
            MAGIC_UP => Direction::Up,
            MAGIC_DOWN => Direction::Down,
            other => return Err(WireError::BadMagic(other)),
        };

        let hop_count = buf.get_u32_le();
        let current_hop = buf.get_u32_le();
        let content_size = buf.get_u32_le() as usize;
        let src_ip = Ipv4Addr::from(buf.get_u32_le());
        let src_port = buf.get_u32_le() as u16;
        let dst_ip = Ipv4Addr::from(buf.get_u32_le());
        let dst_port = buf.get_u32_le() as u16;

        let needed = HEADER_LEN + 4 * hop_count as usize + SIGNATURE_LEN + content_size;
        if raw.len() < needed {
            return Err(WireError::Truncated {
                needed,
                got: raw.len(),
            });
        }
        if current_hop > hop_count {
            return Err(WireError::HopOutOfRange {
                current: current_hop,
                count: hop_count,
            });
        }

        let mut hops = Vec::with_capacity(hop_count as usize);
        for _ in 0..hop_count {
            hops.push(buf.get_u32_le());
        }
        buf.advance(SIGNATURE_LEN);
        let payload = buf[..content_size].to_vec();

        Ok(OverlayDatagram {
            direction,
            current_hop,
            src: SocketAddrV4::new(src_ip, src_port),
            dst: SocketAddrV4::new(dst_ip, dst_port),
            hops,
            payload,
        })
    }
}

/// Stamp a send time (microseconds) into the head of a payload.
pub fn embed_send_time(payload: &mut [u8], micros: i64) {
    payload[..SEND_TIME_LEN].copy_from_slice(&micros.to_le_bytes());
}

/// Read back the send time a peer echoed untouched.
pub fn read_send_time(payload: &[u8]) -> Option<i64> {
    let bytes = payload.get(..SEND_TIME_LEN)?;
    Some(i64::from_le_bytes(bytes.try_into().ok()?))
}

/// Convenience for last-mile and reply delivery targets.
pub fn to_socket_addr(addr: SocketAddrV4) -> SocketAddr {
    SocketAddr::V4(addr)
}
