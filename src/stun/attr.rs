//! Typed STUN/TURN attributes and their TLV codec.
//!
//! Attributes preserve insertion order on a [`Message`](super::Message);
//! ordering is load-bearing because MESSAGE-INTEGRITY and FINGERPRINT cover
//! all attributes that precede them.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use super::{StunError, TransactionId, MAGIC};

pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const USERNAME: u16 = 0x0006;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const CHANNEL_NUMBER: u16 = 0x000C;
pub const LIFETIME: u16 = 0x000D;
pub const XOR_PEER_ADDRESS: u16 = 0x0012;
pub const DATA: u16 = 0x0013;
pub const REALM: u16 = 0x0014;
pub const NONCE: u16 = 0x0015;
pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const EVEN_PORT: u16 = 0x0018;
pub const REQUESTED_TRANSPORT: u16 = 0x0019;
pub const DONT_FRAGMENT: u16 = 0x001A;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const RESERVATION_TOKEN: u16 = 0x0022;
pub const PRIORITY: u16 = 0x0024;
pub const USE_CANDIDATE: u16 = 0x0025;
pub const SOFTWARE: u16 = 0x8022;
pub const ALTERNATE_SERVER: u16 = 0x8023;
pub const FINGERPRINT: u16 = 0x8028;
pub const ICE_CONTROLLED: u16 = 0x8029;
pub const ICE_CONTROLLING: u16 = 0x802A;

/// UDP, the only REQUESTED-TRANSPORT value we ever ask for.
pub const TRANSPORT_UDP: u8 = 17;

const MAX_USERNAME: usize = 513;
const MAX_TEXT: usize = 763;

/// A single decoded STUN attribute.
///
/// Comprehension-optional attributes we do not know are preserved verbatim in
/// [`Attribute::Other`] so a re-encoded message is bit-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    AlternateServer(SocketAddr),
    Priority(u32),
    UseCandidate,
    IceControlled(u64),
    IceControlling(u64),
    Lifetime(Duration),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Data(Vec<u8>),
    RequestedTransport(u8),
    DontFragment,
    ReservationToken([u8; 8]),
    ChannelNumber(u16),
    /// The reserve-next-port flag of EVEN-PORT.
    EvenPort(bool),
    Other { typ: u16, value: Vec<u8> },
}

impl Attribute {
    pub fn typ(&self) -> u16 {
        use Attribute::*;
        match self {
            MappedAddress(_) => MAPPED_ADDRESS,
            XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Username(_) => USERNAME,
            Realm(_) => REALM,
            Nonce(_) => NONCE,
            Software(_) => SOFTWARE,
            MessageIntegrity(_) => MESSAGE_INTEGRITY,
            Fingerprint(_) => FINGERPRINT,
            ErrorCode { .. } => ERROR_CODE,
            UnknownAttributes(_) => UNKNOWN_ATTRIBUTES,
            AlternateServer(_) => ALTERNATE_SERVER,
            Priority(_) => PRIORITY,
            UseCandidate => USE_CANDIDATE,
            IceControlled(_) => ICE_CONTROLLED,
            IceControlling(_) => ICE_CONTROLLING,
            Lifetime(_) => LIFETIME,
            XorPeerAddress(_) => XOR_PEER_ADDRESS,
            XorRelayedAddress(_) => XOR_RELAYED_ADDRESS,
            Data(_) => DATA,
            RequestedTransport(_) => REQUESTED_TRANSPORT,
            DontFragment => DONT_FRAGMENT,
            ReservationToken(_) => RESERVATION_TOKEN,
            ChannelNumber(_) => CHANNEL_NUMBER,
            EvenPort(_) => EVEN_PORT,
            Other { typ, .. } => *typ,
        }
    }

    /// Length of the value on the wire, before padding.
    fn value_len(&self) -> usize {
        use Attribute::*;
        match self {
            MappedAddress(a) | AlternateServer(a) => address_len(a),
            XorMappedAddress(a) | XorPeerAddress(a) | XorRelayedAddress(a) => address_len(a),
            Username(s) | Realm(s) | Nonce(s) | Software(s) => s.len(),
            MessageIntegrity(_) => 20,
            Fingerprint(_) | Priority(_) | Lifetime(_) | RequestedTransport(_)
            | ChannelNumber(_) => 4,
            ErrorCode { reason, .. } => 4 + reason.len(),
            UnknownAttributes(list) => 2 * list.len(),
            UseCandidate | DontFragment => 0,
            IceControlled(_) | IceControlling(_) | ReservationToken(_) => 8,
            Data(d) => d.len(),
            EvenPort(_) => 1,
            Other { value, .. } => value.len(),
        }
    }

    /// Size of the whole TLV on the wire: the 4-byte header plus the value
    /// padded to the next 32-bit boundary.
    pub(super) fn padded_len(&self) -> usize {
        4 + pad4(self.value_len())
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, trans_id: &TransactionId) {
        use Attribute::*;

        buf.put_u16(self.typ());
        buf.put_u16(self.value_len() as u16);

        match self {
            MappedAddress(a) | AlternateServer(a) => put_address(buf, *a),
            XorMappedAddress(a) | XorPeerAddress(a) | XorRelayedAddress(a) => {
                put_xor_address(buf, *a, trans_id)
            }
            Username(s) | Realm(s) | Nonce(s) | Software(s) => buf.put_slice(s.as_bytes()),
            MessageIntegrity(tag) => buf.put_slice(tag),
            Fingerprint(crc) => buf.put_u32(*crc),
            ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            UnknownAttributes(list) => {
                for typ in list {
                    buf.put_u16(*typ);
                }
            }
            Priority(v) => buf.put_u32(*v),
            ChannelNumber(n) => {
                buf.put_u16(*n);
                buf.put_u16(0);
            }
            UseCandidate | DontFragment => {}
            IceControlled(v) | IceControlling(v) => buf.put_u64(*v),
            ReservationToken(token) => buf.put_slice(token),
            Lifetime(d) => buf.put_u32(d.as_secs() as u32),
            RequestedTransport(proto) => {
                buf.put_u8(*proto);
                buf.put_bytes(0, 3);
            }
            Data(d) => buf.put_slice(d),
            EvenPort(reserve) => buf.put_u8(if *reserve { 0x80 } else { 0 }),
            Other { value, .. } => buf.put_slice(value),
        }

        let pad = pad4(self.value_len()) - self.value_len();
        buf.put_bytes(0, pad);
    }

    /// Decodes one attribute value.
    ///
    /// `value` is exactly `length` bytes, padding already stripped by the
    /// caller. Returns `None` for unknown comprehension-required types so the
    /// caller can collect them into an UNKNOWN-ATTRIBUTES error.
    pub(super) fn parse(
        typ: u16,
        value: &[u8],
        trans_id: &TransactionId,
    ) -> Result<Option<Attribute>, StunError> {
        let attr = match typ {
            MAPPED_ADDRESS | ALTERNATE_SERVER => {
                let addr = get_address(typ, value)?;
                if typ == MAPPED_ADDRESS {
                    Attribute::MappedAddress(addr)
                } else {
                    Attribute::AlternateServer(addr)
                }
            }
            XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(get_xor_address(typ, value, trans_id)?),
            XOR_PEER_ADDRESS => Attribute::XorPeerAddress(get_xor_address(typ, value, trans_id)?),
            XOR_RELAYED_ADDRESS => {
                Attribute::XorRelayedAddress(get_xor_address(typ, value, trans_id)?)
            }
            USERNAME => Attribute::Username(get_text(typ, value, MAX_USERNAME)?),
            REALM => Attribute::Realm(get_text(typ, value, MAX_TEXT)?),
            NONCE => Attribute::Nonce(get_text(typ, value, MAX_TEXT)?),
            SOFTWARE => Attribute::Software(get_text(typ, value, MAX_TEXT)?),
            MESSAGE_INTEGRITY => {
                let tag: [u8; 20] = value.try_into().map_err(|_| StunError::BadAttrLength {
                    typ,
                    expected: 20,
                    got: value.len(),
                })?;
                Attribute::MessageIntegrity(tag)
            }
            FINGERPRINT => Attribute::Fingerprint(get_u32(typ, value)?),
            ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::UnexpectedEof);
                }
                let class = (value[2] & 0b0000_0111) as u16;
                let number = value[3] as u16;
                if !(3..=6).contains(&class) || number >= 100 {
                    return Err(StunError::MalformedAttribute {
                        typ,
                        reason: "error class not in 300..=699",
                    });
                }
                Attribute::ErrorCode {
                    code: class * 100 + number,
                    reason: get_text(typ, &value[4..], MAX_TEXT)?,
                }
            }
            UNKNOWN_ATTRIBUTES => {
                if value.len() % 2 != 0 {
                    return Err(StunError::BadAttrLength {
                        typ,
                        expected: value.len() + 1,
                        got: value.len(),
                    });
                }
                let list = value
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Attribute::UnknownAttributes(list)
            }
            PRIORITY => Attribute::Priority(get_u32(typ, value)?),
            USE_CANDIDATE => {
                expect_len(typ, value, 0)?;
                Attribute::UseCandidate
            }
            DONT_FRAGMENT => {
                expect_len(typ, value, 0)?;
                Attribute::DontFragment
            }
            ICE_CONTROLLED => Attribute::IceControlled(get_u64(typ, value)?),
            ICE_CONTROLLING => Attribute::IceControlling(get_u64(typ, value)?),
            LIFETIME => Attribute::Lifetime(Duration::from_secs(get_u32(typ, value)? as u64)),
            DATA => Attribute::Data(value.to_vec()),
            REQUESTED_TRANSPORT => {
                expect_len(typ, value, 4)?;
                Attribute::RequestedTransport(value[0])
            }
            RESERVATION_TOKEN => {
                let token: [u8; 8] = value.try_into().map_err(|_| StunError::BadAttrLength {
                    typ,
                    expected: 8,
                    got: value.len(),
                })?;
                Attribute::ReservationToken(token)
            }
            CHANNEL_NUMBER => {
                expect_len(typ, value, 4)?;
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            EVEN_PORT => {
                expect_len(typ, value, 1)?;
                Attribute::EvenPort(value[0] & 0x80 != 0)
            }
            // Comprehension-required and unknown: the caller turns these
            // into an UnknownAttributes error.
            typ if typ < 0x8000 => return Ok(None),
            typ => Attribute::Other {
                typ,
                value: value.to_vec(),
            },
        };

        Ok(Some(attr))
    }
}

/// Default reason phrases for the error codes this crate produces or
/// understands (RFC 5389 §15.6, RFC 5766 §15, RFC 5245 §21.2).
pub mod errors {
    pub const TRY_ALTERNATE: u16 = 300;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const UNKNOWN_ATTRIBUTE: u16 = 420;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    pub const STALE_NONCE: u16 = 438;
    pub const WRONG_CREDENTIALS: u16 = 441;
    pub const UNSUPPORTED_TRANSPORT: u16 = 442;
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const SERVER_ERROR: u16 = 500;
    pub const INSUFFICIENT_CAPACITY: u16 = 508;

    pub fn reason(code: u16) -> &'static str {
        match code {
            TRY_ALTERNATE => "Try Alternate",
            BAD_REQUEST => "Bad Request",
            UNAUTHORIZED => "Unauthorized",
            FORBIDDEN => "Forbidden",
            UNKNOWN_ATTRIBUTE => "Unknown Attribute",
            ALLOCATION_MISMATCH => "Allocation Mismatch",
            STALE_NONCE => "Stale Nonce",
            WRONG_CREDENTIALS => "Wrong Credentials",
            UNSUPPORTED_TRANSPORT => "Unsupported Transport Protocol",
            ALLOCATION_QUOTA_REACHED => "Allocation Quota Reached",
            ROLE_CONFLICT => "Role Conflict",
            SERVER_ERROR => "Server Error",
            INSUFFICIENT_CAPACITY => "Insufficient Capacity",
            _ => "",
        }
    }
}

const FAMILY_IPV4: u8 = 1;
const FAMILY_IPV6: u8 = 2;

fn address_len(addr: &SocketAddr) -> usize {
    if addr.is_ipv4() {
        8
    } else {
        20
    }
}

fn put_address(buf: &mut BytesMut, addr: SocketAddr) {
    buf.put_u8(0);
    buf.put_u8(if addr.is_ipv4() {
        FAMILY_IPV4
    } else {
        FAMILY_IPV6
    });
    buf.put_u16(addr.port());
    match addr.ip() {
        IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
}

/// The port is XORed with the high 16 bits of the magic cookie, an IPv4
/// address with the full cookie and an IPv6 address with the cookie
/// concatenated with the transaction id.
fn put_xor_address(buf: &mut BytesMut, addr: SocketAddr, trans_id: &TransactionId) {
    buf.put_u8(0);
    buf.put_u8(if addr.is_ipv4() {
        FAMILY_IPV4
    } else {
        FAMILY_IPV6
    });
    buf.put_u16(addr.port() ^ 0x2112);
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (b, m) in octets.iter_mut().zip(MAGIC) {
                *b ^= m;
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            for (i, b) in octets.iter_mut().enumerate() {
                *b ^= if i < 4 { MAGIC[i] } else { trans_id.0[i - 4] };
            }
            buf.put_slice(&octets);
        }
    }
}

fn get_address(typ: u16, value: &[u8]) -> Result<SocketAddr, StunError> {
    let (family, port, ip_bytes) = split_address(typ, value)?;
    let ip = match family {
        FAMILY_IPV4 => {
            let octets: [u8; 4] = ip_bytes.try_into().expect("length checked");
            IpAddr::from(octets)
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = ip_bytes.try_into().expect("length checked");
            IpAddr::from(octets)
        }
        _ => unreachable!(),
    };
    Ok(SocketAddr::new(ip, port))
}

fn get_xor_address(
    typ: u16,
    value: &[u8],
    trans_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let (family, xport, ip_bytes) = split_address(typ, value)?;
    let port = xport ^ 0x2112;
    let ip = match family {
        FAMILY_IPV4 => {
            let mut octets: [u8; 4] = ip_bytes.try_into().expect("length checked");
            for (b, m) in octets.iter_mut().zip(MAGIC) {
                *b ^= m;
            }
            IpAddr::from(octets)
        }
        FAMILY_IPV6 => {
            let mut octets: [u8; 16] = ip_bytes.try_into().expect("length checked");
            for (i, b) in octets.iter_mut().enumerate() {
                *b ^= if i < 4 { MAGIC[i] } else { trans_id.0[i - 4] };
            }
            IpAddr::from(octets)
        }
        _ => unreachable!(),
    };
    Ok(SocketAddr::new(ip, port))
}

fn split_address(typ: u16, value: &[u8]) -> Result<(u8, u16, &[u8]), StunError> {
    if value.len() < 4 {
        return Err(StunError::UnexpectedEof);
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    let expected = match family {
        FAMILY_IPV4 => 8,
        FAMILY_IPV6 => 20,
        _ => {
            return Err(StunError::MalformedAttribute {
                typ,
                reason: "unknown address family",
            })
        }
    };
    if value.len() != expected {
        return Err(StunError::BadAttrLength {
            typ,
            expected,
            got: value.len(),
        });
    }
    Ok((family, port, &value[4..]))
}

fn get_text(typ: u16, value: &[u8], max: usize) -> Result<String, StunError> {
    if value.len() > max {
        return Err(StunError::AttrOverflow {
            typ,
            max,
            got: value.len(),
        });
    }
    String::from_utf8(value.to_vec()).map_err(|_| StunError::MalformedAttribute {
        typ,
        reason: "malformed utf-8",
    })
}

fn get_u32(typ: u16, value: &[u8]) -> Result<u32, StunError> {
    expect_len(typ, value, 4)?;
    Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

fn get_u64(typ: u16, value: &[u8]) -> Result<u64, StunError> {
    expect_len(typ, value, 8)?;
    let bytes: [u8; 8] = value.try_into().expect("length checked");
    Ok(u64::from_be_bytes(bytes))
}

fn expect_len(typ: u16, value: &[u8], expected: usize) -> Result<(), StunError> {
    if value.len() != expected {
        return Err(StunError::BadAttrLength {
            typ,
            expected,
            got: value.len(),
        });
    }
    Ok(())
}

pub(super) fn pad4(len: usize) -> usize {
    (len + 3) & !3
}
