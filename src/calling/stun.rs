//! STUN message codec (RFC 5389) for ICE connectivity checks.
//!
//! Messages are built with [`StunMessage`] and serialized with
//! [`StunMessage::encode`], which appends MESSAGE-INTEGRITY and FINGERPRINT
//! when a key is given. Decoding is tolerant: unknown attributes are kept
//! as raw bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

/// type + length + cookie + transaction id
pub const HEADER_LEN: usize = 20;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const INTEGRITY_ATTR_LEN: usize = 4 + 20;
const FINGERPRINT_ATTR_LEN: usize = 4 + 4;

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    if getrandom::getrandom(&mut id).is_err() {
        // Uniqueness is all that matters here
        id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    }
    id
}

/// CRC-32 (IEEE, reflected) for the FINGERPRINT attribute.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl StunMessage {
    pub fn new(msg_type: u16, transaction_id: TransactionId) -> Self {
        Self {
            msg_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// ICE connectivity check request.
    ///
    /// `username` is `<remote ufrag>:<local ufrag>`.
    pub fn binding_request(
        transaction_id: TransactionId,
        username: &str,
        priority: u32,
        controlling: bool,
        tie_breaker: u64,
    ) -> Self {
        let mut msg = Self::new(BINDING_REQUEST, transaction_id)
            .with_attr(ATTR_USERNAME, username.as_bytes().to_vec())
            .with_attr(ATTR_PRIORITY, priority.to_be_bytes().to_vec());
        if controlling {
            msg = msg
                .with_attr(ATTR_ICE_CONTROLLING, tie_breaker.to_be_bytes().to_vec())
                .with_attr(ATTR_USE_CANDIDATE, Vec::new());
        } else {
            msg = msg.with_attr(ATTR_ICE_CONTROLLED, tie_breaker.to_be_bytes().to_vec());
        }
        msg
    }

    pub fn binding_success(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        let xma = encode_xor_address(mapped, &transaction_id);
        Self::new(BINDING_SUCCESS, transaction_id).with_attr(ATTR_XOR_MAPPED_ADDRESS, xma)
    }

    pub fn with_attr(mut self, attr_type: u16, value: Vec<u8>) -> Self {
        self.attributes.push((attr_type, value));
        self
    }

    pub fn attr(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_request(&self) -> bool {
        self.msg_type == BINDING_REQUEST
    }

    pub fn is_success(&self) -> bool {
        self.msg_type == BINDING_SUCCESS
    }

    pub fn username(&self) -> Option<&str> {
        self.attr(ATTR_USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        if let Some(v) = self.attr(ATTR_XOR_MAPPED_ADDRESS) {
            return decode_xor_address(v, &self.transaction_id);
        }
        self.attr(ATTR_MAPPED_ADDRESS).and_then(decode_plain_address)
    }

    /// Serialize. With a key, MESSAGE-INTEGRITY and FINGERPRINT are appended.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.msg_type.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        for (t, v) in &self.attributes {
            push_attr(&mut buf, *t, v);
        }

        let Some(key) = integrity_key else {
            set_length(&mut buf, 0);
            return buf;
        };

        // The length covers each trailer attribute at the time it is computed
        set_length(&mut buf, INTEGRITY_ATTR_LEN);
        let digest = hmac_sha1(key, &buf);
        push_attr(&mut buf, ATTR_MESSAGE_INTEGRITY, &digest);

        set_length(&mut buf, FINGERPRINT_ATTR_LEN);
        let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
        push_attr(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if !is_stun(data) {
            return None;
        }
        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let end = (HEADER_LEN + body_len).min(data.len());
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_LEN]);

        let attributes = walk_attrs(&data[..end])
            .map(|(t, _, v)| (t, v.to_vec()))
            .collect();
        Some(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }
}

/// Cheap check used to demultiplex STUN from RTP on a shared socket.
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Check MESSAGE-INTEGRITY of a raw message against `key`.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
    let Some((offset, received)) = walk_attrs(data)
        .find(|(t, _, v)| *t == ATTR_MESSAGE_INTEGRITY && v.len() == 20)
        .map(|(_, offset, v)| (offset, v.to_vec()))
    else {
        return false;
    };
    let mut covered = data[..offset].to_vec();
    let len = (offset - HEADER_LEN + INTEGRITY_ATTR_LEN) as u16;
    covered[2..4].copy_from_slice(&len.to_be_bytes());
    hmac_sha1(key, &covered) == received.as_slice()
}

/// Iterate over (type, offset of the attribute header, value).
fn walk_attrs<'a>(data: &'a [u8]) -> impl Iterator<Item = (u16, usize, &'a [u8])> + 'a {
    let mut pos = HEADER_LEN;
    std::iter::from_fn(move || {
        if pos + 4 > data.len() {
            return None;
        }
        let t = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        if start + len > data.len() {
            return None;
        }
        let item = (t, pos, &data[start..start + len]);
        pos = start + ((len + 3) & !3);
        Some(item)
    })
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + (4 - value.len() % 4) % 4, 0);
}

fn set_length(buf: &mut [u8], trailing: usize) {
    let len = (buf.len() - HEADER_LEN + trailing) as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 20],
    };
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, octets): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
    };
    let mut out = vec![0, family];
    out.extend_from_slice(&port.to_be_bytes());
    out.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    out
}

fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let key = xor_key(transaction_id);
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match value[1] {
        0x01 => {
            let mut o = [0u8; 4];
            for (i, b) in o.iter_mut().enumerate() {
                *b = value[4 + i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(o))
        }
        0x02 if value.len() >= 20 => {
            let mut o = [0u8; 16];
            for (i, b) in o.iter_mut().enumerate() {
                *b = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(o))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn decode_plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
