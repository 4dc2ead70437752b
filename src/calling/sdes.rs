//! SDES key exchange (RFC 4568) and SRTP session-key derivation (RFC 3711).
//!
//! Crypto attributes travel in SDP as
//! `a=crypto:<tag> <suite> inline:<base64 key||salt>[|lifetime][|MKI:len]`.

use std::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine;
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Master key length for AES-128 (16 bytes).
pub const MASTER_KEY_LEN: usize = 16;

/// Master salt length (14 bytes per RFC 3711).
pub const MASTER_SALT_LEN: usize = 14;

/// Total keying material: 16 bytes key + 14 bytes salt = 30 bytes.
pub const KEYING_MATERIAL_LEN: usize = MASTER_KEY_LEN + MASTER_SALT_LEN;

/// SRTP key derivation labels (RFC 3711, section 4.3.1).
const LABEL_CIPHER_KEY: u8 = 0x00;
const LABEL_AUTH_KEY: u8 = 0x01;
const LABEL_SALT: u8 = 0x02;

/// SRTCP key derivation labels (RFC 3711, section 3.4).
const LABEL_SRTCP_CIPHER_KEY: u8 = 0x03;
const LABEL_SRTCP_AUTH_KEY: u8 = 0x04;
const LABEL_SRTCP_SALT: u8 = 0x05;

/// Supported crypto suites, most preferred first. Offers use the first one.
pub const CRYPTO_SUITES: &[CryptoSuite] = &[
    CryptoSuite {
        name: "AES_CM_128_HMAC_SHA1_80",
        master_key_len: MASTER_KEY_LEN,
        master_salt_len: MASTER_SALT_LEN,
        auth_tag_len: 10,
    },
    CryptoSuite {
        name: "AES_CM_128_HMAC_SHA1_32",
        master_key_len: MASTER_KEY_LEN,
        master_salt_len: MASTER_SALT_LEN,
        auth_tag_len: 4,
    },
    CryptoSuite {
        name: "F8_128_HMAC_SHA1_80",
        master_key_len: MASTER_KEY_LEN,
        master_salt_len: MASTER_SALT_LEN,
        auth_tag_len: 10,
    },
];

#[derive(Debug, Error)]
pub enum SdesError {
    #[error("malformed crypto attribute: {0}")]
    Malformed(String),

    #[error("unsupported crypto suite: {0}")]
    UnsupportedSuite(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("random source unavailable: {0}")]
    Random(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSuite {
    pub name: &'static str,
    pub master_key_len: usize,
    pub master_salt_len: usize,
    /// Authentication tag length in bytes.
    pub auth_tag_len: usize,
}

pub fn find_suite(name: &str) -> Option<&'static CryptoSuite> {
    CRYPTO_SUITES.iter().find(|s| s.name == name)
}

/// One `a=crypto` attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAttribute {
    pub tag: u32,
    pub suite: String,
    /// Full key-params, e.g. `inline:<b64>|2^31|1:1`.
    pub key_params: String,
    pub session_params: Vec<String>,
}

impl CryptoAttribute {
    /// Parse the value of an `a=crypto` attribute. The `a=crypto:` prefix is
    /// accepted but not required.
    pub fn parse(value: &str) -> Result<Self, SdesError> {
        let value = value.trim();
        let value = value.strip_prefix("a=").unwrap_or(value);
        let value = value.strip_prefix("crypto:").unwrap_or(value);

        let mut parts = value.split_whitespace();
        let tag = parts
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| SdesError::Malformed(value.to_string()))?;
        let suite = parts
            .next()
            .ok_or_else(|| SdesError::Malformed(value.to_string()))?
            .to_string();
        let key_params = parts
            .next()
            .filter(|k| k.starts_with("inline:"))
            .ok_or_else(|| SdesError::Malformed(value.to_string()))?
            .to_string();
        let session_params = parts.map(str::to_string).collect();

        Ok(Self {
            tag,
            suite,
            key_params,
            session_params,
        })
    }

    /// Base64 part of the inline key, without lifetime or MKI.
    pub fn inline_key(&self) -> &str {
        let key = self.key_params.trim_start_matches("inline:");
        key.split('|').next().unwrap_or(key)
    }

    /// Decode the inline key into master key and salt.
    pub fn keying_material(&self) -> Result<SrtpKeyingMaterial, SdesError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(self.inline_key())
            .map_err(|e| SdesError::InvalidKey(e.to_string()))?;

        if decoded.len() < KEYING_MATERIAL_LEN {
            return Err(SdesError::InvalidKey(format!(
                "keying material too short: {} bytes (need {})",
                decoded.len(),
                KEYING_MATERIAL_LEN
            )));
        }

        let mut master_key = [0u8; MASTER_KEY_LEN];
        let mut master_salt = [0u8; MASTER_SALT_LEN];
        master_key.copy_from_slice(&decoded[..MASTER_KEY_LEN]);
        master_salt.copy_from_slice(&decoded[MASTER_KEY_LEN..KEYING_MATERIAL_LEN]);

        Ok(SrtpKeyingMaterial {
            master_key,
            master_salt,
            tag: self.tag,
        })
    }
}

impl fmt::Display for CryptoAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.tag, self.suite, self.key_params)?;
        for p in &self.session_params {
            write!(f, " {}", p)?;
        }
        Ok(())
    }
}

/// Generate a fresh local crypto attribute for the preferred suite.
pub fn generate_crypto_attribute() -> Result<CryptoAttribute, SdesError> {
    let suite = &CRYPTO_SUITES[0];
    let mut material = vec![0u8; suite.master_key_len + suite.master_salt_len];
    getrandom::getrandom(&mut material).map_err(|e| SdesError::Random(e.to_string()))?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(&material);
    Ok(CryptoAttribute {
        tag: 1,
        suite: suite.name.to_string(),
        key_params: format!("inline:{}", b64),
        session_params: Vec::new(),
    })
}

/// Picks the first remote crypto line whose suite is locally supported.
#[derive(Debug, Clone)]
pub struct SdesNegotiator {
    local_suites: Vec<&'static CryptoSuite>,
}

impl Default for SdesNegotiator {
    fn default() -> Self {
        Self {
            local_suites: CRYPTO_SUITES.iter().collect(),
        }
    }
}

impl SdesNegotiator {
    pub fn new(local_suites: Vec<&'static CryptoSuite>) -> Self {
        Self { local_suites }
    }

    /// Returns `None` when no remote line is usable.
    pub fn negotiate<S: AsRef<str>>(&self, remote_lines: &[S]) -> Option<CryptoAttribute> {
        for line in remote_lines {
            let attr = match CryptoAttribute::parse(line.as_ref()) {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::debug!("Skipping crypto line: {}", e);
                    continue;
                }
            };
            if !self.local_suites.iter().any(|s| s.name == attr.suite) {
                tracing::debug!("Crypto suite {} not supported", attr.suite);
                continue;
            }
            if attr.keying_material().is_err() {
                tracing::warn!("Crypto line with tag {} has an invalid key", attr.tag);
                continue;
            }
            return Some(attr);
        }
        None
    }
}

/// Master key and salt carried by one crypto attribute.
#[derive(Debug, Clone)]
pub struct SrtpKeyingMaterial {
    pub master_key: [u8; MASTER_KEY_LEN],
    pub master_salt: [u8; MASTER_SALT_LEN],
    pub tag: u32,
}

/// Session keys derived for one direction of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpSessionKeys {
    pub cipher_key: [u8; 16],
    pub auth_key: [u8; 20],
    pub salt: [u8; 14],
}

/// RTP and RTCP keys for both directions of one media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpStreamKeys {
    pub suite: &'static CryptoSuite,
    pub local_rtp: SrtpSessionKeys,
    pub local_rtcp: SrtpSessionKeys,
    pub remote_rtp: SrtpSessionKeys,
    pub remote_rtcp: SrtpSessionKeys,
}

/// Derive the keys for one stream from the local and remote crypto attributes.
pub fn derive_stream_keys(
    local: &CryptoAttribute,
    remote: &CryptoAttribute,
) -> Result<SrtpStreamKeys, SdesError> {
    let suite =
        find_suite(&remote.suite).ok_or_else(|| SdesError::UnsupportedSuite(remote.suite.clone()))?;
    let local_material = local.keying_material()?;
    let remote_material = remote.keying_material()?;
    Ok(SrtpStreamKeys {
        suite,
        local_rtp: derive_session_keys(&local_material, Direction::Rtp),
        local_rtcp: derive_session_keys(&local_material, Direction::Rtcp),
        remote_rtp: derive_session_keys(&remote_material, Direction::Rtp),
        remote_rtcp: derive_session_keys(&remote_material, Direction::Rtcp),
    })
}

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Rtp,
    Rtcp,
}

/// Derive session keys from master key + salt using AES-128-CM PRF (RFC 3711, 4.3.1).
///
/// key_derivation_rate = 0, so index DIV key_derivation_rate = 0.
pub fn derive_session_keys(material: &SrtpKeyingMaterial, kind: Direction) -> SrtpSessionKeys {
    let (l_cipher, l_auth, l_salt) = match kind {
        Direction::Rtp => (LABEL_CIPHER_KEY, LABEL_AUTH_KEY, LABEL_SALT),
        Direction::Rtcp => (
            LABEL_SRTCP_CIPHER_KEY,
            LABEL_SRTCP_AUTH_KEY,
            LABEL_SRTCP_SALT,
        ),
    };

    let mut keys = SrtpSessionKeys {
        cipher_key: [0u8; 16],
        auth_key: [0u8; 20],
        salt: [0u8; 14],
    };
    prf_derive(material, l_cipher, &mut keys.cipher_key);
    prf_derive(material, l_auth, &mut keys.auth_key);
    prf_derive(material, l_salt, &mut keys.salt);
    keys
}

/// x = label at byte 7 of a 14-byte block; IV = (salt XOR x) || 0x0000.
fn prf_derive(material: &SrtpKeyingMaterial, label: u8, output: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(&material.master_salt);
    iv[7] ^= label;

    output.fill(0);
    let mut cipher = Aes128Ctr::new((&material.master_key).into(), (&iv).into());
    cipher.apply_keystream(output);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_material() -> SrtpKeyingMaterial {
        let mut key = [0u8; 16];
        let mut salt = [0u8; 14];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in salt.iter_mut().enumerate() {
            *b = (16 + i) as u8;
        }
        SrtpKeyingMaterial {
            master_key: key,
            master_salt: salt,
            tag: 1,
        }
    }

    #[test]
    fn test_parse_crypto_attribute() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([0xABu8; 30]);
        let line = format!("a=crypto:2 AES_CM_128_HMAC_SHA1_80 inline:{}|2^31|1:1", b64);
        let attr = CryptoAttribute::parse(&line).unwrap();
        assert_eq!(attr.tag, 2);
        assert_eq!(attr.suite, "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(attr.inline_key(), b64);
        let mat = attr.keying_material().unwrap();
        assert_eq!(mat.master_key, [0xAB; 16]);
        assert_eq!(mat.master_salt, [0xAB; 14]);
    }

    #[test]
    fn test_parse_rejects_missing_inline() {
        assert!(CryptoAttribute::parse("1 AES_CM_128_HMAC_SHA1_80").is_err());
        assert!(CryptoAttribute::parse("x AES_CM_128_HMAC_SHA1_80 inline:abc").is_err());
    }

    #[test]
    fn test_generate_uses_preferred_suite() {
        let attr = generate_crypto_attribute().unwrap();
        assert_eq!(attr.tag, 1);
        assert_eq!(attr.suite, "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(attr.inline_key().len(), 40, "30 bytes base64 encoded");
        let reparsed = CryptoAttribute::parse(&attr.to_string()).unwrap();
        assert_eq!(reparsed, attr);
    }

    #[test]
    fn test_negotiate_first_supported() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8; 30]);
        let lines = vec![
            format!("1 AES_256_CM_HMAC_SHA1_80 inline:{}", b64),
            format!("2 AES_CM_128_HMAC_SHA1_32 inline:{}", b64),
            format!("3 AES_CM_128_HMAC_SHA1_80 inline:{}", b64),
        ];
        let chosen = SdesNegotiator::default().negotiate(&lines).unwrap();
        assert_eq!(chosen.tag, 2);
    }

    #[test]
    fn test_negotiate_none() {
        let lines = vec!["1 AES_256_CM_HMAC_SHA1_80 inline:AAAA".to_string()];
        assert!(SdesNegotiator::default().negotiate(&lines).is_none());
        let empty: Vec<String> = Vec::new();
        assert!(SdesNegotiator::default().negotiate(&empty).is_none());
    }

    #[test]
    fn test_key_derivation() {
        let mat = make_test_material();
        let rtp = derive_session_keys(&mat, Direction::Rtp);
        let rtcp = derive_session_keys(&mat, Direction::Rtcp);
        assert!(rtp.cipher_key.iter().any(|&b| b != 0));
        assert_ne!(rtp.cipher_key, rtcp.cipher_key);
        assert_ne!(rtp.salt, rtcp.salt);
    }

    #[test]
    fn test_derive_stream_keys() {
        let local = generate_crypto_attribute().unwrap();
        let remote = generate_crypto_attribute().unwrap();
        let keys = derive_stream_keys(&local, &remote).unwrap();
        assert_eq!(keys.suite.auth_tag_len, 10);
        assert_ne!(keys.local_rtp.cipher_key, keys.remote_rtp.cipher_key);
    }
}
