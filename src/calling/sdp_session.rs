//! SDP session text model (RFC 4566): parse, print, validate.
//!
//! Only the lines a call needs are modelled as fields (`o=`, `s=`, `c=`,
//! `b=`, `t=`, `m=`, `a=`). Anything else is accepted on parse and dropped.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use super::media_attribute::MediaType;
use super::ports::PortError;
use super::sdes::SdesError;

/// Maximum number of media sections in one session.
pub const MAX_MEDIA: usize = 16;

/// Maximum number of formats on one `m=` line.
pub const MAX_FORMATS: usize = 32;

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("SDP parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid SDP: {0}")]
    Validation(String),

    #[error("too many media: {0}")]
    TooManyMedia(usize),

    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("no remote session")]
    NoRemoteSession,

    #[error("no negotiator")]
    NoNegotiator,

    #[error("negotiator in unexpected state: {0}")]
    InvalidState(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("no active remote session after negotiation")]
    NoActiveSession,

    #[error(transparent)]
    Crypto(#[from] SdesError),

    #[error(transparent)]
    Ports(#[from] PortError),
}

/// Media direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
    Unknown,
}

impl MediaDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
            MediaDirection::Unknown => "unknown",
        }
    }

    pub fn from_attr_name(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    pub fn is_send_capable(self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::SendOnly)
    }

    pub fn is_receive_capable(self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::RecvOnly)
    }

    /// A media described with this direction is holding its peer.
    pub fn is_on_hold(self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }

    /// Direction to put in an answer (RFC 3264 §6.1).
    pub fn answer_to(offer: MediaDirection, local: MediaDirection) -> MediaDirection {
        match offer {
            MediaDirection::SendOnly => {
                if local.is_receive_capable() {
                    MediaDirection::RecvOnly
                } else {
                    MediaDirection::Inactive
                }
            }
            MediaDirection::RecvOnly => {
                if local.is_send_capable() {
                    MediaDirection::SendOnly
                } else {
                    MediaDirection::Inactive
                }
            }
            MediaDirection::Inactive => MediaDirection::Inactive,
            MediaDirection::SendRecv | MediaDirection::Unknown => local,
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl SdpConnection {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            net_type: "IN".into(),
            addr_type: if addr.is_ipv4() { "IP4" } else { "IP6" }.into(),
            address: addr.to_string(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let conn = Self {
            net_type: parts.next()?.to_string(),
            addr_type: parts.next()?.to_string(),
            // TTL / count suffixes (multicast) are dropped
            address: parts.next()?.split('/').next()?.to_string(),
        };
        Some(conn)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

impl fmt::Display for SdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.net_type, self.addr_type, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: u64,
    pub version: u64,
    pub connection: SdpConnection,
}

impl fmt::Display for SdpOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.username, self.session_id, self.version, self.connection
        )
    }
}

/// `a=<name>[:<value>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((name, value)) => Self::new(name, value),
            None => Self::flag(text),
        }
    }

    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    /// First token of the value, the payload type for rtpmap/fmtp.
    pub fn fmt_token(&self) -> &str {
        self.value_str().split_whitespace().next().unwrap_or("")
    }
}

impl fmt::Display for SdpAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Parsed `a=rtpmap` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpmap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub params: Option<String>,
}

impl Rtpmap {
    pub fn parse(value: &str) -> Option<Self> {
        let (pt, rest) = value.trim().split_once(' ')?;
        let mut enc = rest.trim().split('/');
        Some(Self {
            payload_type: pt.parse().ok()?,
            encoding: enc.next()?.to_string(),
            clock_rate: enc.next()?.parse().ok()?,
            params: enc.next().map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media: String,
    pub port: u16,
    pub transport: String,
    pub formats: Vec<String>,
    pub connection: Option<SdpConnection>,
    pub bandwidth: Vec<String>,
    pub attributes: Vec<SdpAttribute>,
}

impl SdpMedia {
    pub fn new(media_type: MediaType, port: u16, transport: &str) -> Self {
        Self {
            media: media_type.as_sdp_str().to_string(),
            port,
            transport: transport.to_string(),
            formats: Vec::new(),
            connection: None,
            bandwidth: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        MediaType::from_sdp_str(&self.media)
    }

    pub fn is_secure_transport(&self) -> bool {
        self.transport.contains("SAVP")
    }

    pub fn find_attr(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Attribute `name` whose value starts with the payload type `fmt`.
    pub fn find_attr_with_fmt(&self, name: &str, fmt: &str) -> Option<&SdpAttribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name && a.fmt_token() == fmt)
    }

    pub fn attrs_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SdpAttribute> + 'a {
        self.attributes.iter().filter(move |a| a.name == name)
    }

    pub fn add_attr(&mut self, attr: SdpAttribute) {
        self.attributes.push(attr);
    }

    pub fn remove_all_attr(&mut self, name: &str) {
        self.attributes.retain(|a| a.name != name);
    }

    pub fn remove_attr_with_fmt(&mut self, name: &str, fmt: &str) {
        self.attributes
            .retain(|a| !(a.name == name && a.fmt_token() == fmt));
    }

    pub fn rtpmap(&self, fmt: &str) -> Option<Rtpmap> {
        self.find_attr_with_fmt("rtpmap", fmt)
            .and_then(|a| Rtpmap::parse(a.value_str()))
    }

    /// fmtp parameters for a payload type, without the payload prefix.
    pub fn fmtp(&self, fmt: &str) -> Option<String> {
        self.find_attr_with_fmt("fmtp", fmt).map(|a| {
            let v = a.value_str();
            v.split_once(' ')
                .map(|(_, params)| params.trim().to_string())
                .unwrap_or_default()
        })
    }

    /// Direction attribute, `SendRecv` when absent.
    pub fn direction(&self) -> MediaDirection {
        self.attributes
            .iter()
            .find_map(|a| MediaDirection::from_attr_name(&a.name))
            .unwrap_or(MediaDirection::SendRecv)
    }

    pub fn set_direction(&mut self, dir: MediaDirection) {
        self.attributes
            .retain(|a| MediaDirection::from_attr_name(&a.name).is_none());
        if dir != MediaDirection::Unknown {
            self.attributes.push(SdpAttribute::flag(dir.as_str()));
        }
    }

    /// Reject the media: port 0, no attributes but `a=inactive`.
    pub fn deactivate(&mut self) {
        self.port = 0;
        self.attributes.clear();
        self.attributes.push(SdpAttribute::flag("inactive"));
    }

    pub fn crypto_lines(&self) -> Vec<String> {
        self.attrs_named("crypto")
            .map(|a| a.value_str().to_string())
            .collect()
    }

    /// RTCP port from `a=rtcp`, else RTP port + 1.
    pub fn rtcp_port(&self) -> u16 {
        self.find_attr("rtcp")
            .and_then(|a| a.fmt_token().parse().ok())
            .unwrap_or_else(|| self.port.saturating_add(1))
    }
}

impl fmt::Display for SdpMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media, self.port, self.transport)?;
        for fmt in &self.formats {
            write!(f, " {}", fmt)?;
        }
        f.write_str("\r\n")?;
        if let Some(c) = &self.connection {
            write!(f, "c={}\r\n", c)?;
        }
        for b in &self.bandwidth {
            write!(f, "b={}\r\n", b)?;
        }
        for a in &self.attributes {
            write!(f, "a={}\r\n", a)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub origin: SdpOrigin,
    pub name: String,
    pub connection: Option<SdpConnection>,
    pub bandwidth: Vec<String>,
    pub time: (u64, u64),
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<SdpMedia>,
}

impl SdpSession {
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut origin: Option<SdpOrigin> = None;
        let mut name = String::new();
        let mut connection = None;
        let mut bandwidth = Vec::new();
        let mut time = (0, 0);
        let mut attributes = Vec::new();
        let mut media: Vec<SdpMedia> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let err = |reason: &str| SdpError::Parse {
                line: idx + 1,
                reason: reason.to_string(),
            };
            let (kind, value) = line
                .split_once('=')
                .filter(|(k, _)| k.len() == 1)
                .ok_or_else(|| err("expected <type>=<value>"))?;

            match kind {
                "v" => {
                    if value.trim() != "0" {
                        return Err(err("unsupported version"));
                    }
                }
                "o" => {
                    let p: Vec<&str> = value.split_whitespace().collect();
                    if p.len() != 6 {
                        return Err(err("malformed origin"));
                    }
                    origin = Some(SdpOrigin {
                        username: p[0].to_string(),
                        session_id: p[1].parse().map_err(|_| err("bad session id"))?,
                        version: p[2].parse().map_err(|_| err("bad session version"))?,
                        connection: SdpConnection {
                            net_type: p[3].to_string(),
                            addr_type: p[4].to_string(),
                            address: p[5].to_string(),
                        },
                    });
                }
                "s" => name = value.to_string(),
                "c" => {
                    let conn = SdpConnection::parse(value)
                        .ok_or_else(|| err("malformed connection"))?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(conn),
                        None => connection = Some(conn),
                    }
                }
                "b" => match media.last_mut() {
                    Some(m) => m.bandwidth.push(value.to_string()),
                    None => bandwidth.push(value.to_string()),
                },
                "t" => {
                    let mut p = value.split_whitespace();
                    let start = p.next().and_then(|v| v.parse().ok());
                    let stop = p.next().and_then(|v| v.parse().ok());
                    match (start, stop) {
                        (Some(a), Some(b)) => time = (a, b),
                        _ => return Err(err("malformed time")),
                    }
                }
                "m" => {
                    let mut p = value.split_whitespace();
                    let media_name = p.next().ok_or_else(|| err("missing media"))?;
                    let port_str = p.next().ok_or_else(|| err("missing port"))?;
                    let port = port_str
                        .split('/')
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| err("bad port"))?;
                    let transport = p.next().ok_or_else(|| err("missing transport"))?;
                    let formats: Vec<String> = p.map(str::to_string).collect();
                    if formats.len() > MAX_FORMATS {
                        return Err(err("too many formats"));
                    }
                    media.push(SdpMedia {
                        media: media_name.to_string(),
                        port,
                        transport: transport.to_string(),
                        formats,
                        connection: None,
                        bandwidth: Vec::new(),
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    let attr = SdpAttribute::parse(value);
                    match media.last_mut() {
                        Some(m) => m.attributes.push(attr),
                        None => attributes.push(attr),
                    }
                }
                _ => {}
            }
        }

        let origin = origin.ok_or(SdpError::Parse {
            line: 0,
            reason: "missing origin line".into(),
        })?;

        Ok(Self {
            origin,
            name,
            connection,
            bandwidth,
            time,
            attributes,
            media,
        })
    }

    /// Structural checks applied before a session is used in negotiation.
    pub fn validate(&self) -> Result<(), SdpError> {
        if self.media.len() > MAX_MEDIA {
            return Err(SdpError::TooManyMedia(self.media.len()));
        }
        if self.origin.connection.address.is_empty() {
            return Err(SdpError::Validation("empty origin address".into()));
        }
        for (i, m) in self.media.iter().enumerate() {
            if m.formats.is_empty() {
                return Err(SdpError::Validation(format!("media #{} has no format", i)));
            }
            if self.connection.is_none() && m.connection.is_none() {
                return Err(SdpError::Validation(format!(
                    "media #{} has no connection line",
                    i
                )));
            }
            if m.port == 0 {
                continue;
            }
            for fmt in &m.formats {
                let dynamic = fmt.parse::<u8>().map(|pt| pt >= 96).unwrap_or(false);
                if dynamic && m.rtpmap(fmt).is_none() {
                    return Err(SdpError::Validation(format!(
                        "media #{} dynamic format {} without rtpmap",
                        i, fmt
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find_attr(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn remove_all_attr(&mut self, name: &str) {
        self.attributes.retain(|a| a.name != name);
    }

    /// Connection of a media, falling back to the session connection.
    pub fn media_connection(&self, index: usize) -> Option<&SdpConnection> {
        self.media
            .get(index)
            .and_then(|m| m.connection.as_ref())
            .or(self.connection.as_ref())
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("v=0\r\n")?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={}\r\n", c)?;
        }
        for b in &self.bandwidth {
            write!(f, "b={}\r\n", b)?;
        }
        write!(f, "t={} {}\r\n", self.time.0, self.time.1)?;
        for a in &self.attributes {
            write!(f, "a={}\r\n", a)?;
        }
        for m in &self.media {
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}
