//! STUN message codec (RFC 5389) and the transaction agent.
//!
//! [`Message`] is an owned representation of a STUN message: class, method,
//! transaction id and an ordered list of attributes. Encoding is bit-exact;
//! decoding preserves unknown comprehension-optional attributes so that
//! `parse(encode(m)) == m` holds attribute by attribute.

pub mod agent;
pub mod attr;

pub use agent::{Agent, AgentError, TransactionError};
pub use attr::Attribute;

use std::fmt;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use sha1::Sha1;
use thiserror::Error;

/// The fixed magic cookie of every RFC 5389 message, bytes 4..8 of the header.
pub const MAGIC: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

pub const HEADER_LEN: usize = 20;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Possible failures when decoding or authenticating a STUN message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("magic cookie mismatch")]
    BadMagicCookie,
    #[error("not a STUN message")]
    NotStun,
    #[error("attribute 0x{0:04x} not found")]
    AttributeNotFound(u16),
    #[error("attribute 0x{typ:04x} length: expected {expected}, got {got}")]
    BadAttrLength {
        typ: u16,
        expected: usize,
        got: usize,
    },
    #[error("attribute 0x{typ:04x} overflows: {got} > {max}")]
    AttrOverflow { typ: u16, max: usize, got: usize },
    #[error("malformed attribute 0x{typ:04x}: {reason}")]
    MalformedAttribute { typ: u16, reason: &'static str },
    #[error("message integrity check failed")]
    IntegrityCheckFailed,
    #[error("fingerprint mismatch")]
    FingerprintMismatch,
    #[error("unknown comprehension-required attributes: {0:04x?}")]
    UnknownAttributes(Vec<u16>),
}

/// The 96-bit transaction identifier that ties requests to responses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub(crate) [u8; 12]);

impl TransactionId {
    /// A fresh, cryptographically random id.
    pub fn new() -> Self {
        TransactionId(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The class bits of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn from_typ(typ: u16) -> Self {
        match ((typ >> 8) & 1, (typ >> 4) & 1) {
            (0, 0) => MessageClass::Request,
            (0, 1) => MessageClass::Indication,
            (1, 0) => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    fn typ_bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b0_0000_0000,
            MessageClass::Indication => 0b0_0001_0000,
            MessageClass::SuccessResponse => 0b1_0000_0000,
            MessageClass::ErrorResponse => 0b1_0001_0000,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        )
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageClass::Request => "request",
            MessageClass::Indication => "indication",
            MessageClass::SuccessResponse => "success response",
            MessageClass::ErrorResponse => "error response",
        };
        f.write_str(s)
    }
}

/// A STUN method (RFC 5389 §18.1, RFC 5766 §13).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Method(u16);

impl Method {
    pub const BINDING: Method = Method(0x001);
    pub const ALLOCATE: Method = Method(0x003);
    pub const REFRESH: Method = Method(0x004);
    pub const SEND: Method = Method(0x006);
    pub const DATA: Method = Method(0x007);
    pub const CREATE_PERMISSION: Method = Method(0x008);
    pub const CHANNEL_BIND: Method = Method(0x009);

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// The method bits are split across the type field around the class bits:
    /// `M11..M7 | C1 | M6..M4 | C0 | M3..M0`.
    fn from_typ(typ: u16) -> Self {
        Method(((typ >> 2) & 0x0F80) | ((typ >> 1) & 0x0070) | (typ & 0x000F))
    }

    fn typ_bits(self) -> u16 {
        ((self.0 & 0x0F80) << 2) | ((self.0 & 0x0070) << 1) | (self.0 & 0x000F)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Method::BINDING => f.write_str("binding"),
            Method::ALLOCATE => f.write_str("allocate"),
            Method::REFRESH => f.write_str("refresh"),
            Method::SEND => f.write_str("send"),
            Method::DATA => f.write_str("data"),
            Method::CREATE_PERMISSION => f.write_str("create-permission"),
            Method::CHANNEL_BIND => f.write_str("channel-bind"),
            Method(other) => write!(f, "method(0x{other:03x})"),
        }
    }
}

/// Key for MESSAGE-INTEGRITY.
///
/// Short-term credentials (ICE connectivity checks) use the raw password;
/// long-term credentials (TURN) use `MD5(username ":" realm ":" password)`.
#[derive(Clone)]
pub struct IntegrityKey(Vec<u8>);

impl IntegrityKey {
    pub fn short_term(password: &str) -> Self {
        IntegrityKey(password.as_bytes().to_vec())
    }

    pub fn long_term(username: &str, realm: &str, password: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(username.as_bytes());
        hasher.update(b":");
        hasher.update(realm.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        IntegrityKey(hasher.finalize().to_vec())
    }

    fn sign(&self, data: &[u8]) -> [u8; 20] {
        let mut mac =
            Hmac::<Sha1>::new_from_slice(&self.0).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time comparison through the HMAC construction itself.
    fn verify(&self, data: &[u8], tag: &[u8; 20]) -> bool {
        let mut mac =
            Hmac::<Sha1>::new_from_slice(&self.0).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IntegrityKey(..)")
    }
}

/// An owned STUN message: header fields plus an ordered attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    class: MessageClass,
    method: Method,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        Message {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Signs everything added so far and appends MESSAGE-INTEGRITY.
    ///
    /// The HMAC input is the message with its length field rewritten as if
    /// MESSAGE-INTEGRITY (24 bytes on the wire) were already present, which
    /// is why this must be the last attribute except for a trailing
    /// FINGERPRINT.
    pub fn add_message_integrity(&mut self, key: &IntegrityKey) {
        let input = self.encode_through(self.attributes.len(), 24);
        self.attributes
            .push(Attribute::MessageIntegrity(key.sign(&input)));
    }

    /// Appends FINGERPRINT, the CRC-32 of the whole message so far XORed with
    /// `0x5354554e`. Must be the final attribute.
    pub fn add_fingerprint(&mut self) {
        let input = self.encode_through(self.attributes.len(), 8);
        self.attributes
            .push(Attribute::Fingerprint(CRC32.checksum(&input) ^ FINGERPRINT_XOR));
    }

    /// Verifies MESSAGE-INTEGRITY against `key`.
    ///
    /// The covered bytes are recomputed from the attribute list, which is
    /// bit-exact with the received wire format.
    pub fn verify_integrity(&self, key: &IntegrityKey) -> Result<(), StunError> {
        let (idx, tag) = self
            .attributes
            .iter()
            .enumerate()
            .find_map(|(i, a)| match a {
                Attribute::MessageIntegrity(tag) => Some((i, tag)),
                _ => None,
            })
            .ok_or(StunError::AttributeNotFound(attr::MESSAGE_INTEGRITY))?;

        let input = self.encode_through(idx, 24);
        if key.verify(&input, tag) {
            Ok(())
        } else {
            Err(StunError::IntegrityCheckFailed)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_through(self.attributes.len(), 0)
    }

    /// Encodes the header and the first `count` attributes, with the header
    /// length field covering those attributes plus `extra_len` bytes.
    fn encode_through(&self, count: usize, extra_len: usize) -> Vec<u8> {
        let attrs = &self.attributes[..count];
        let attr_len: usize = attrs.iter().map(Attribute::padded_len).sum();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + attr_len);
        buf.put_u16(self.class.typ_bits() | self.method.typ_bits());
        buf.put_u16((attr_len + extra_len) as u16);
        buf.put_slice(&MAGIC);
        buf.put_slice(&self.transaction_id.0);
        for attribute in attrs {
            attribute.encode(&mut buf, &self.transaction_id);
        }

        buf.to_vec()
    }

    /// Decodes a message from one datagram.
    ///
    /// Attribute values that follow MESSAGE-INTEGRITY are ignored per RFC
    /// 5389 §15.4, with the exception of FINGERPRINT which, when present,
    /// must be the final attribute and is checked here.
    pub fn parse(buf: &[u8]) -> Result<Message, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::UnexpectedEof);
        }

        let typ = u16::from_be_bytes([buf[0], buf[1]]);
        if typ & 0xC000 != 0 {
            return Err(StunError::NotStun);
        }
        if buf[4..8] != MAGIC {
            return Err(StunError::BadMagicCookie);
        }

        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len % 4 != 0 || len != buf.len() - HEADER_LEN {
            return Err(StunError::UnexpectedEof);
        }

        let mut trans_id = [0u8; 12];
        trans_id.copy_from_slice(&buf[8..20]);
        let transaction_id = TransactionId(trans_id);

        let mut attributes = Vec::new();
        let mut unknown = Vec::new();
        let mut seen_integrity = false;
        let mut offset = HEADER_LEN;

        while offset < buf.len() {
            if buf.len() - offset < 4 {
                return Err(StunError::UnexpectedEof);
            }
            let typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let value_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let value_end = offset + 4 + value_len;
            if value_end > buf.len() {
                return Err(StunError::UnexpectedEof);
            }
            let value = &buf[offset + 4..value_end];

            if typ == attr::FINGERPRINT {
                // FINGERPRINT covers everything before it, with the header
                // length as transmitted (it already includes FINGERPRINT).
                let expected = CRC32.checksum(&buf[..offset]) ^ FINGERPRINT_XOR;
                let got = u32::from_be_bytes(value.try_into().map_err(|_| {
                    StunError::BadAttrLength {
                        typ,
                        expected: 4,
                        got: value.len(),
                    }
                })?);
                if got != expected || offset + 8 != buf.len() {
                    return Err(StunError::FingerprintMismatch);
                }
                attributes.push(Attribute::Fingerprint(got));
            } else if !seen_integrity {
                match Attribute::parse(typ, value, &transaction_id)? {
                    Some(attribute) => {
                        seen_integrity = matches!(attribute, Attribute::MessageIntegrity(_));
                        attributes.push(attribute);
                    }
                    None => unknown.push(typ),
                }
            }

            offset += 4 + attr::pad4(value_len);
        }

        if !unknown.is_empty() {
            return Err(StunError::UnknownAttributes(unknown));
        }

        Ok(Message {
            class: MessageClass::from_typ(typ),
            method: Method::from_typ(typ),
            transaction_id,
            attributes,
        })
    }

    fn find<'a, T, F: Fn(&'a Attribute) -> Option<T>>(&'a self, f: F) -> Option<T> {
        self.attributes.iter().find_map(f)
    }

    pub fn xor_mapped_address(&self) -> Option<std::net::SocketAddr> {
        self.find(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-MAPPED-ADDRESS with a fallback to the legacy MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<std::net::SocketAddr> {
        self.xor_mapped_address().or_else(|| {
            self.find(|a| match a {
                Attribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    pub fn xor_relayed_address(&self) -> Option<std::net::SocketAddr> {
        self.find(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_peer_address(&self) -> Option<std::net::SocketAddr> {
        self.find(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.find(|a| match a {
            Attribute::Username(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.find(|a| match a {
            Attribute::Realm(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&str> {
        self.find(|a| match a {
            Attribute::Nonce(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.find(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn lifetime(&self) -> Option<std::time::Duration> {
        self.find(|a| match a {
            Attribute::Lifetime(d) => Some(*d),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.find(|a| match a {
            Attribute::Data(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.find(|a| match a {
            Attribute::ChannelNumber(n) => Some(*n),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.find(|a| match a {
            Attribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.find(|a| match a {
            Attribute::UseCandidate => Some(()),
            _ => None,
        })
        .is_some()
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.find(|a| match a {
            Attribute::IceControlling(tb) => Some(*tb),
            _ => None,
        })
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.find(|a| match a {
            Attribute::IceControlled(tb) => Some(*tb),
            _ => None,
        })
    }

    pub fn is_binding_request(&self) -> bool {
        self.method == Method::BINDING && self.class == MessageClass::Request
    }

    pub fn is_response(&self) -> bool {
        self.class.is_response()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} tid={:?}",
            self.method, self.class, self.transaction_id
        )
    }
}
