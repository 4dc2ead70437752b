//! RTP sessions driven by a call.
//!
//! A call holds one [`RtpSession`] per media stream. The session keeps the
//! negotiated endpoint, codec and SRTP keys of its stream; the audio and video
//! variants add what only their pipeline needs (capture source, fmtp, decoder
//! bootstrap SDP).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use super::ice::IceTransport;
use super::media_attribute::MediaType;
use super::sdes::{derive_stream_keys, SdesError, SrtpStreamKeys};
use super::sdp::MediaDescription;

/// Default path MTU for outgoing packets.
pub const DEFAULT_MTU: u16 = 1280;

/// Smallest MTU that still fits an RTP header, SRTP tag and a payload.
const MIN_MTU: u16 = 576;

#[derive(Debug, Error)]
pub enum RtpSessionError {
    #[error("no negotiated media description")]
    NotConfigured,

    #[error("no codec negotiated for {0} stream")]
    NoCodec(MediaType),

    #[error("no remote endpoint")]
    NoRemote,

    #[error("SRTP setup failed: {0}")]
    Srtp(#[from] SdesError),
}

/// Transport an RTP session sends and receives on.
#[derive(Clone)]
pub enum MediaSocket {
    /// One component of an ICE transport.
    Ice {
        transport: Arc<dyn IceTransport>,
        component: u16,
    },
    /// Plain UDP to the address from the remote SDP.
    Udp { local_port: u16, remote: SocketAddr },
}

impl MediaSocket {
    pub fn remote_address(&self) -> Option<SocketAddr> {
        match self {
            MediaSocket::Ice {
                transport,
                component,
            } => transport.remote_address(*component),
            MediaSocket::Udp { remote, .. } => Some(*remote),
        }
    }
}

impl fmt::Debug for MediaSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSocket::Ice {
                transport,
                component,
            } => write!(f, "Ice({}#{})", transport.name(), component),
            MediaSocket::Udp { local_port, remote } => {
                write!(f, "Udp({} -> {})", local_port, remote)
            }
        }
    }
}

/// State shared by both session kinds.
#[derive(Debug)]
struct StreamState {
    call_id: String,
    ssrc: u32,
    local: Option<MediaDescription>,
    remote: Option<MediaDescription>,
    rtp: Option<MediaSocket>,
    rtcp: Option<MediaSocket>,
    keys: Option<SrtpStreamKeys>,
    muted: bool,
    mtu: u16,
    running: bool,
    starts: u32,
}

impl StreamState {
    fn new(call_id: &str) -> Self {
        let id = uuid::Uuid::new_v4();
        let bytes = id.as_bytes();
        Self {
            call_id: call_id.to_string(),
            ssrc: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            local: None,
            remote: None,
            rtp: None,
            rtcp: None,
            keys: None,
            muted: false,
            mtu: DEFAULT_MTU,
            running: false,
            starts: 0,
        }
    }

    fn start(
        &mut self,
        media_type: MediaType,
        rtp: MediaSocket,
        rtcp: Option<MediaSocket>,
    ) -> Result<(), RtpSessionError> {
        let (local, remote) = match (&self.local, &self.remote) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(RtpSessionError::NotConfigured),
        };
        if remote.codec.is_none() {
            return Err(RtpSessionError::NoCodec(media_type));
        }
        let remote_addr = rtp.remote_address().ok_or(RtpSessionError::NoRemote)?;

        self.keys = match (&local.crypto, &remote.crypto) {
            (Some(l), Some(r)) => Some(derive_stream_keys(l, r)?),
            _ => None,
        };
        tracing::info!(
            "[call:{}] Starting {} RTP session ssrc={:08x} {} -> {} ({}, srtp={})",
            self.call_id,
            media_type,
            self.ssrc,
            remote.codec.as_ref().map(|c| c.name.as_str()).unwrap_or("?"),
            remote_addr,
            local.direction,
            self.keys.is_some()
        );
        self.rtp = Some(rtp);
        self.rtcp = rtcp;
        self.running = true;
        self.starts += 1;
        Ok(())
    }

    fn stop(&mut self, media_type: MediaType) {
        if !self.running {
            return;
        }
        tracing::debug!("[call:{}] Stopping {} RTP session", self.call_id, media_type);
        self.running = false;
        self.rtp = None;
        self.rtcp = None;
        self.keys = None;
    }

    fn is_sending(&self) -> bool {
        self.running
            && self
                .local
                .as_ref()
                .map(|l| l.direction.is_send_capable())
                .unwrap_or(false)
    }
}

/// Audio pipeline state.
#[derive(Debug)]
pub struct AudioRtpSession {
    state: StreamState,
}

impl AudioRtpSession {
    pub fn new(call_id: &str) -> Self {
        Self {
            state: StreamState::new(call_id),
        }
    }

    /// Sample rate the decoder runs at (16 kHz for G.722).
    pub fn sample_rate(&self) -> Option<u32> {
        self.state
            .remote
            .as_ref()
            .and_then(|r| r.codec.as_ref())
            .map(|c| c.clock_rate)
    }
}

/// Video pipeline state.
#[derive(Debug)]
pub struct VideoRtpSession {
    state: StreamState,
    source: String,
    /// SDP the decoder is opened with.
    receiving_sdp: String,
}

impl VideoRtpSession {
    pub fn new(call_id: &str, source: &str) -> Self {
        Self {
            state: StreamState::new(call_id),
            source: source.to_string(),
            receiving_sdp: String::new(),
        }
    }

    pub fn receiving_sdp(&self) -> &str {
        &self.receiving_sdp
    }

    pub fn fmtp(&self) -> Option<&str> {
        self.state
            .remote
            .as_ref()
            .map(|r| r.parameters.as_str())
            .filter(|p| !p.is_empty())
    }
}

/// One media stream's RTP session.
#[derive(Debug)]
pub enum RtpSession {
    Audio(AudioRtpSession),
    Video(VideoRtpSession),
}

impl RtpSession {
    /// Session for a media type, `None` for `MediaType::None`.
    pub fn create(call_id: &str, media_type: MediaType, source: &str) -> Option<Self> {
        match media_type {
            MediaType::Audio => Some(RtpSession::Audio(AudioRtpSession::new(call_id))),
            MediaType::Video => Some(RtpSession::Video(VideoRtpSession::new(call_id, source))),
            MediaType::None => None,
        }
    }

    fn state(&self) -> &StreamState {
        match self {
            RtpSession::Audio(s) => &s.state,
            RtpSession::Video(s) => &s.state,
        }
    }

    fn state_mut(&mut self) -> &mut StreamState {
        match self {
            RtpSession::Audio(s) => &mut s.state,
            RtpSession::Video(s) => &mut s.state,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            RtpSession::Audio(_) => MediaType::Audio,
            RtpSession::Video(_) => MediaType::Video,
        }
    }

    /// Apply the negotiated descriptions of this stream's slot.
    pub fn update_media(&mut self, remote: &MediaDescription, local: &MediaDescription) {
        if let RtpSession::Video(v) = self {
            v.receiving_sdp = local.receiving_sdp.clone();
        }
        let state = self.state_mut();
        state.remote = Some(remote.clone());
        state.local = Some(local.clone());
    }

    pub fn start(
        &mut self,
        rtp: MediaSocket,
        rtcp: Option<MediaSocket>,
    ) -> Result<(), RtpSessionError> {
        let media_type = self.media_type();
        self.state_mut().start(media_type, rtp, rtcp)
    }

    pub fn stop(&mut self) {
        let media_type = self.media_type();
        self.state_mut().stop(media_type);
    }

    /// Muted audio keeps sending silence; muted video stops the encoder.
    pub fn set_muted(&mut self, muted: bool) {
        let state = self.state_mut();
        if state.muted != muted {
            tracing::debug!(
                "[call:{}] {} {}",
                state.call_id,
                if muted { "Muting" } else { "Unmuting" },
                state.ssrc
            );
        }
        state.muted = muted;
    }

    pub fn set_media_source(&mut self, source: &str) {
        match self {
            RtpSession::Video(v) => {
                if v.source != source {
                    tracing::info!(
                        "[call:{}] Video source {} -> {}",
                        v.state.call_id,
                        v.source,
                        source
                    );
                    v.source = source.to_string();
                }
            }
            RtpSession::Audio(_) => {}
        }
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.state_mut().mtu = mtu.max(MIN_MTU);
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_sending(&self) -> bool {
        self.state().is_sending()
    }

    pub fn is_muted(&self) -> bool {
        self.state().muted
    }

    pub fn is_secure(&self) -> bool {
        self.state().keys.is_some()
    }

    /// SRTP keys derived when the session started.
    pub fn srtp_keys(&self) -> Option<&SrtpStreamKeys> {
        self.state().keys.as_ref()
    }

    pub fn mtu(&self) -> u16 {
        self.state().mtu
    }

    pub fn ssrc(&self) -> u32 {
        self.state().ssrc
    }

    /// How many times the session was started.
    pub fn start_count(&self) -> u32 {
        self.state().starts
    }

    pub fn media_source(&self) -> Option<&str> {
        match self {
            RtpSession::Video(v) => Some(&v.source),
            RtpSession::Audio(_) => None,
        }
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.state().rtp.as_ref().and_then(MediaSocket::remote_address)
    }

    pub fn remote_description(&self) -> Option<&MediaDescription> {
        self.state().remote.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::codec::default_audio_codecs;
    use crate::calling::sdes::generate_crypto_attribute;
    use crate::calling::sdp_session::MediaDirection;

    fn descr(port: u16, secure: bool) -> MediaDescription {
        let codec = default_audio_codecs()
            .into_iter()
            .find(|c| c.is_g722())
            .unwrap();
        MediaDescription {
            media_type: MediaType::Audio,
            enabled: true,
            addr: Some(SocketAddr::from(([127, 0, 0, 1], port))),
            direction: MediaDirection::SendRecv,
            codec: Some(codec),
            payload_type: 9,
            rtp_clockrate: 8000,
            crypto: secure.then(|| generate_crypto_attribute().unwrap()),
            ..Default::default()
        }
    }

    fn udp(port: u16) -> MediaSocket {
        MediaSocket::Udp {
            local_port: 5000,
            remote: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn test_start_requires_configuration() {
        let mut s = RtpSession::create("t", MediaType::Audio, "").unwrap();
        assert!(matches!(
            s.start(udp(6000), None),
            Err(RtpSessionError::NotConfigured)
        ));
        assert!(!s.is_running());
    }

    #[test]
    fn test_start_stop_secure_audio() {
        let mut s = RtpSession::create("t", MediaType::Audio, "").unwrap();
        s.update_media(&descr(6000, true), &descr(5000, true));
        s.start(udp(6000), Some(udp(6001))).unwrap();
        assert!(s.is_running());
        assert!(s.is_sending());
        assert!(s.is_secure());
        assert_eq!(s.remote_address().unwrap().port(), 6000);
        if let RtpSession::Audio(a) = &s {
            assert_eq!(a.sample_rate(), Some(16000));
        }
        s.stop();
        assert!(!s.is_running());
        assert!(!s.is_secure());
        assert_eq!(s.start_count(), 1);
    }

    #[test]
    fn test_plain_rtp_without_crypto() {
        let mut s = RtpSession::create("t", MediaType::Audio, "").unwrap();
        s.update_media(&descr(6000, false), &descr(5000, true));
        s.start(udp(6000), None).unwrap();
        assert!(!s.is_secure());
    }

    #[test]
    fn test_missing_codec() {
        let mut s = RtpSession::create("t", MediaType::Audio, "").unwrap();
        let mut remote = descr(6000, false);
        remote.codec = None;
        s.update_media(&remote, &descr(5000, false));
        assert!(matches!(
            s.start(udp(6000), None),
            Err(RtpSessionError::NoCodec(MediaType::Audio))
        ));
    }

    #[test]
    fn test_video_source_and_mtu() {
        let mut s = RtpSession::create("t", MediaType::Video, "camera://0").unwrap();
        assert_eq!(s.media_source(), Some("camera://0"));
        s.set_media_source("file://clip.mp4");
        assert_eq!(s.media_source(), Some("file://clip.mp4"));
        s.set_mtu(100);
        assert_eq!(s.mtu(), MIN_MTU);
        s.set_muted(true);
        assert!(s.is_muted());
        assert!(RtpSession::create("t", MediaType::None, "").is_none());
    }
}
