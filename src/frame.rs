//! ICMP Echo framing for tunnel traffic.
//!
//! Every frame is an 8-byte Echo header followed by the embedded IP packet:
//!
//! ```text
//! 0       1       2               4               6               8
//! +-------+-------+---------------+---------------+---------------+----
//! | type  | code  |   checksum    |  identifier   |   sequence    | payload
//! +-------+-------+---------------+---------------+---------------+----
//! ```
//!
//! The identifier carries the tag telling tunnel payload, keepalive probes and
//! unrelated ping traffic apart.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use crate::checksum::{checksum, verify};
use crate::role::Role;

pub const ICMP_HEADER_SIZE: usize = 8;
/// Smallest IPv4 header; shorter payloads cannot be an IP packet.
pub const MIN_IP_HEADER_SIZE: usize = 20;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Identifier marking a frame that carries tunnel payload ("tp").
pub const TUNNEL_TAG: u16 = 0x7470;
/// Identifier marking an empty keepalive probe ("bt").
pub const BEAT_TAG: u16 = 0x6274;

const IPPROTO_ICMP: u8 = 1;

/// Why an inbound datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Fewer bytes than an ICMP header.
    Truncated(usize),
    UnexpectedType(u8),
    UnexpectedCode(u8),
    BadChecksum,
    /// Tunnel frame whose payload is too short to be an IP packet.
    ShortPayload(usize),
    /// The enclosing IPv4 header is missing, not IPv4, or not ICMP.
    BadIpHeader,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "truncated frame ({} bytes)", len),
            Self::UnexpectedType(t) => write!(f, "unexpected ICMP type {}", t),
            Self::UnexpectedCode(c) => write!(f, "unexpected ICMP code {}", c),
            Self::BadChecksum => write!(f, "checksum mismatch"),
            Self::ShortPayload(len) => write!(f, "payload too short for IP ({} bytes)", len),
            Self::BadIpHeader => write!(f, "invalid IPv4 header"),
        }
    }
}

/// Classification of an inbound ICMP message.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// Tunnel frame; the slice is the embedded IP packet.
    Payload(&'a [u8]),
    /// Keepalive probe from the peer.
    Beat,
    /// Someone else's ping, carrying this identifier.
    Foreign(u16),
    Malformed(Malformed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EchoHeader {
    typ: u8,
    code: u8,
    checksum: u16,
    identifier: u16,
    sequence: u16,
}

impl EchoHeader {
    fn tunnel(typ: u8) -> Self {
        Self {
            typ,
            code: 0,
            checksum: 0,
            identifier: TUNNEL_TAG,
            sequence: 0,
        }
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ICMP_HEADER_SIZE {
            return None;
        }
        Some(Self {
            typ: bytes[0],
            code: bytes[1],
            checksum: BigEndian::read_u16(&bytes[2..4]),
            identifier: BigEndian::read_u16(&bytes[4..6]),
            sequence: BigEndian::read_u16(&bytes[6..8]),
        })
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.typ;
        buf[1] = self.code;
        BigEndian::write_u16(&mut buf[2..4], self.checksum);
        BigEndian::write_u16(&mut buf[4..6], self.identifier);
        BigEndian::write_u16(&mut buf[6..8], self.sequence);
    }
}

/// Build a frame from a header and payload, filling in the checksum.
fn build(header: EchoHeader, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
    header.write(&mut frame[..ICMP_HEADER_SIZE]);
    frame[ICMP_HEADER_SIZE..].copy_from_slice(payload);

    // The header was written with a zero checksum field.
    let sum = checksum(&frame);
    BigEndian::write_u16(&mut frame[2..4], sum);
    frame
}

/// The Echo type this role puts on the wire.
pub fn echo_type(role: Role) -> u8 {
    match role {
        Role::Initiator => ECHO_REQUEST,
        Role::Responder => ECHO_REPLY,
    }
}

/// Encapsulate an IP packet read from the virtual interface.
pub fn encode(role: Role, payload: &[u8]) -> Vec<u8> {
    build(EchoHeader::tunnel(echo_type(role)), payload)
}

/// An empty keepalive probe.
pub fn encode_beat() -> Vec<u8> {
    let header = EchoHeader {
        identifier: BEAT_TAG,
        ..EchoHeader::tunnel(ECHO_REQUEST)
    };
    build(header, &[])
}

/// Options controlling how strict [`Decoder`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    pub verify_checksum: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            verify_checksum: true,
        }
    }
}

impl Decoder {
    pub fn new(verify_checksum: bool) -> Self {
        Self { verify_checksum }
    }

    /// Classify an ICMP message (no IP header in front).
    ///
    /// Only Echo Requests are accepted: that is all the divert path is
    /// configured to deliver.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Decoded<'a> {
        let header = match EchoHeader::parse(bytes) {
            Some(header) => header,
            None => return Decoded::Malformed(Malformed::Truncated(bytes.len())),
        };
        if header.typ != ECHO_REQUEST {
            return Decoded::Malformed(Malformed::UnexpectedType(header.typ));
        }
        if header.code != 0 {
            return Decoded::Malformed(Malformed::UnexpectedCode(header.code));
        }
        if header.identifier != BEAT_TAG && header.identifier != TUNNEL_TAG {
            // Foreign pings are classified without checksum verification.
            return Decoded::Foreign(header.identifier);
        }
        if self.verify_checksum && !verify(bytes) {
            return Decoded::Malformed(Malformed::BadChecksum);
        }

        match header.identifier {
            BEAT_TAG => Decoded::Beat,
            _ => {
                let payload = &bytes[ICMP_HEADER_SIZE..];
                if payload.len() < MIN_IP_HEADER_SIZE {
                    Decoded::Malformed(Malformed::ShortPayload(payload.len()))
                } else {
                    Decoded::Payload(payload)
                }
            }
        }
    }

    /// Classify a datagram that still carries its IPv4 header.
    pub fn decode_datagram<'a>(&self, datagram: &'a [u8]) -> Decoded<'a> {
        match strip_ip_header(datagram) {
            Ok(icmp) => self.decode(icmp),
            Err(malformed) => Decoded::Malformed(malformed),
        }
    }
}

/// Decode with the default (checksum-verifying) decoder.
pub fn decode(bytes: &[u8]) -> Decoded<'_> {
    Decoder::default().decode(bytes)
}

/// Return the ICMP message inside an IPv4 datagram.
pub fn strip_ip_header(datagram: &[u8]) -> Result<&[u8], Malformed> {
    if datagram.len() < MIN_IP_HEADER_SIZE {
        return Err(Malformed::BadIpHeader);
    }
    let version = datagram[0] >> 4;
    let header_len = ((datagram[0] & 0x0F) as usize) * 4;
    if version != 4 || header_len < MIN_IP_HEADER_SIZE || datagram.len() < header_len {
        return Err(Malformed::BadIpHeader);
    }
    if datagram[9] != IPPROTO_ICMP {
        return Err(Malformed::BadIpHeader);
    }

    // Trust the total length only when it is consistent with what was read.
    let total_len = BigEndian::read_u16(&datagram[2..4]) as usize;
    let end = if total_len >= header_len && total_len <= datagram.len() {
        total_len
    } else {
        datagram.len()
    };
    Ok(&datagram[header_len..end])
}
