//! Per-call SDP engine.
//!
//! `Sdp` owns the local and remote sessions of one call across every
//! offer/answer round, the negotiator for the round in progress, the
//! negotiated (active) sessions, and the RTP ports reserved for the call.
//!
//! Typical rounds:
//! - we offer: `create_offer` → send `local_session` → `receive_answer` →
//!   `start_negotiation`
//! - peer offers: `set_received_offer` → `process_incoming_offer` →
//!   `start_negotiation` → send `active_local_session`

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::codec::{
    AccountCodecInfo, TELEPHONE_EVENT_CLOCK_RATE, TELEPHONE_EVENT_EVENTS, TELEPHONE_EVENT_NAME,
    TELEPHONE_EVENT_PAYLOAD,
};
use super::ice::IceAttributes;
use super::media_attribute::{generate_label, MediaAttribute, MediaType};
use super::ports::{PortRange, PortReservation, AUDIO_PORT_RANGE, VIDEO_PORT_RANGE};
use super::sdes::{generate_crypto_attribute, CryptoAttribute, SdesNegotiator};
use super::sdp_negotiator::{NegoState, SdpNegotiator};
use super::sdp_session::{
    MediaDirection, SdpAttribute, SdpConnection, SdpError, SdpMedia, SdpOrigin, SdpSession,
    MAX_MEDIA,
};

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const SESSION_NAME: &str = "ringd";

/// Which side of the current round we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdpDirection {
    #[default]
    None,
    Offer,
    Answer,
}

/// One media of a negotiated session, decoded for the RTP layer.
#[derive(Debug, Clone, Default)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub enabled: bool,
    /// RTP endpoint.
    pub addr: Option<SocketAddr>,
    pub rtcp_addr: Option<SocketAddr>,
    pub direction: MediaDirection,
    /// Derived from `direction` (sendonly or inactive).
    pub on_hold: bool,
    pub codec: Option<AccountCodecInfo>,
    pub payload_type: u8,
    pub rtp_clockrate: u32,
    /// Negotiated SDES crypto.
    pub crypto: Option<CryptoAttribute>,
    /// fmtp parameters of the selected video codec.
    pub parameters: String,
    /// Standalone SDP describing only this media and payload, for the decoder.
    pub receiving_sdp: String,
    /// Label of the local stream this media was built from (local side only).
    pub label: String,
}

/// Local and remote description of the same media index.
pub type MediaSlot = (MediaDescription, MediaDescription);

pub struct Sdp {
    call_id: String,

    local_session: Option<SdpSession>,
    remote_session: Option<SdpSession>,
    active_local: Option<SdpSession>,
    active_remote: Option<SdpSession>,
    negotiator: Option<SdpNegotiator>,
    sdp_direction: SdpDirection,

    /// Label of the attribute behind each local media section.
    local_labels: Vec<String>,

    published_addr: IpAddr,
    session_id: u64,
    session_version: u64,

    ports: Arc<PortReservation>,
    audio_range: PortRange,
    video_range: PortRange,
    local_audio_port: u16,
    local_video_port: u16,

    audio_codecs: Vec<AccountCodecInfo>,
    video_codecs: Vec<AccountCodecInfo>,
    telephone_event_payload: u8,
    sdes: SdesNegotiator,
}

impl Sdp {
    pub fn new(
        call_id: impl Into<String>,
        ports: Arc<PortReservation>,
        published_addr: IpAddr,
    ) -> Self {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Self {
            call_id: call_id.into(),
            local_session: None,
            remote_session: None,
            active_local: None,
            active_remote: None,
            negotiator: None,
            sdp_direction: SdpDirection::None,
            local_labels: Vec::new(),
            published_addr,
            session_id: now + NTP_UNIX_OFFSET,
            session_version: 0,
            ports,
            audio_range: AUDIO_PORT_RANGE,
            video_range: VIDEO_PORT_RANGE,
            local_audio_port: 0,
            local_video_port: 0,
            audio_codecs: Vec::new(),
            video_codecs: Vec::new(),
            telephone_event_payload: TELEPHONE_EVENT_PAYLOAD,
            sdes: SdesNegotiator::default(),
        }
    }

    pub fn with_port_ranges(mut self, audio: PortRange, video: PortRange) -> Self {
        self.audio_range = audio;
        self.video_range = video;
        self
    }

    // ── Capabilities ────────────────────────────────────────────

    /// Replace the codec list of one media type. Order is preference order.
    pub fn set_local_media_capabilities(
        &mut self,
        media_type: MediaType,
        codecs: Vec<AccountCodecInfo>,
    ) {
        match media_type {
            MediaType::Audio => self.audio_codecs = codecs,
            MediaType::Video => self.video_codecs = codecs,
            MediaType::None => {
                tracing::warn!("[call:{}] Ignoring codecs for media type NONE", self.call_id)
            }
        }
    }

    pub fn audio_codecs(&self) -> &[AccountCodecInfo] {
        &self.audio_codecs
    }

    pub fn video_codecs(&self) -> &[AccountCodecInfo] {
        &self.video_codecs
    }

    /// Codec matching an rtpmap encoding name and clock rate.
    ///
    /// G.722 is advertised at 8000 Hz although it runs at 16000 Hz. Video
    /// codecs are matched by name only.
    pub fn find_codec_by_rtpmap(&self, name: &str, clock_rate: u32) -> Option<&AccountCodecInfo> {
        self.audio_codecs
            .iter()
            .chain(self.video_codecs.iter())
            .find(|c| c.matches_rtpmap(name, clock_rate))
    }

    pub fn find_codec_by_payload(&self, payload_type: u8) -> Option<&AccountCodecInfo> {
        self.audio_codecs
            .iter()
            .chain(self.video_codecs.iter())
            .find(|c| c.payload_type == payload_type)
    }

    // ── Ports ───────────────────────────────────────────────────

    /// Release the current RTP ports and reserve new ones.
    pub fn generate_media_ports(&mut self) -> Result<(), SdpError> {
        self.release_ports();
        self.local_audio_port = self.ports.acquire(self.audio_range)?;
        match self.ports.acquire(self.video_range) {
            Ok(port) => self.local_video_port = port,
            Err(e) => {
                self.release_ports();
                return Err(e.into());
            }
        }
        tracing::debug!(
            "[call:{}] Local ports: audio {}/{}, video {}/{}",
            self.call_id,
            self.local_audio_port,
            self.local_audio_port + 1,
            self.local_video_port,
            self.local_video_port + 1
        );
        Ok(())
    }

    pub fn release_ports(&mut self) {
        for port in [&mut self.local_audio_port, &mut self.local_video_port] {
            if *port != 0 {
                self.ports.release(*port);
                *port = 0;
            }
        }
    }

    pub fn local_audio_port(&self) -> u16 {
        self.local_audio_port
    }

    pub fn local_video_port(&self) -> u16 {
        self.local_video_port
    }

    fn local_port(&self, media_type: MediaType) -> u16 {
        match media_type {
            MediaType::Audio => self.local_audio_port,
            MediaType::Video => self.local_video_port,
            MediaType::None => 0,
        }
    }

    // ── Published address ───────────────────────────────────────

    pub fn published_address(&self) -> IpAddr {
        self.published_addr
    }

    /// Change the address advertised in `o=` and `c=` lines.
    pub fn set_published_ip(&mut self, addr: IpAddr) {
        self.published_addr = addr;
        if let Some(local) = self.local_session.as_mut() {
            local.origin.connection = SdpConnection::new(addr);
            local.connection = Some(SdpConnection::new(addr));
            for m in &mut local.media {
                update_rtcp_address(m, addr);
            }
            if let Err(e) = local.validate() {
                tracing::error!("[call:{}] Could not validate SDP: {}", self.call_id, e);
            }
        }
    }

    // ── Session construction ────────────────────────────────────

    /// Direction advertised for a media.
    ///
    /// Mute never changes the audio direction, the RTP layer sends silence
    /// instead. Hold does, so the peer can tell it is being held.
    pub fn media_direction(attr: &MediaAttribute) -> MediaDirection {
        if attr.media_type != MediaType::Video {
            return match (attr.enabled, attr.on_hold) {
                (false, _) => MediaDirection::Inactive,
                (true, true) => MediaDirection::SendOnly,
                (true, false) => MediaDirection::SendRecv,
            };
        }
        match (attr.enabled, attr.muted, attr.on_hold) {
            (false, _, _) => MediaDirection::Inactive,
            (true, true, true) => MediaDirection::Inactive,
            (true, true, false) => MediaDirection::RecvOnly,
            (true, false, true) => MediaDirection::SendOnly,
            (true, false, false) => MediaDirection::SendRecv,
        }
    }

    fn new_local_session(&mut self) -> SdpSession {
        self.session_version += 1;
        let conn = SdpConnection::new(self.published_addr);
        SdpSession {
            origin: SdpOrigin {
                username: "-".into(),
                session_id: self.session_id,
                version: self.session_version,
                connection: conn.clone(),
            },
            name: SESSION_NAME.into(),
            connection: Some(conn),
            bandwidth: Vec::new(),
            time: (0, 0),
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    fn build_media(&self, attr: &MediaAttribute) -> Result<SdpMedia, SdpError> {
        let codecs = match attr.media_type {
            MediaType::Audio => &self.audio_codecs,
            MediaType::Video => &self.video_codecs,
            MediaType::None => {
                return Err(SdpError::UnsupportedMedia(attr.media_type.to_string()))
            }
        };
        let port = self.local_port(attr.media_type);
        let transport = if attr.secure { "RTP/SAVP" } else { "RTP/AVP" };
        let mut media = SdpMedia::new(attr.media_type, port, transport);

        for codec in codecs {
            let pt = codec.payload_type.to_string();
            media.add_attr(SdpAttribute::new(
                "rtpmap",
                format!("{} {}", pt, codec.rtpmap_encoding()),
            ));
            if !codec.parameters.is_empty() {
                media.add_attr(SdpAttribute::new("fmtp", format!("{} {}", pt, codec.parameters)));
            }
            media.formats.push(pt);
        }

        if attr.media_type == MediaType::Audio {
            let pt = self.telephone_event_payload.to_string();
            media.add_attr(SdpAttribute::new(
                "rtpmap",
                format!("{} {}/{}", pt, TELEPHONE_EVENT_NAME, TELEPHONE_EVENT_CLOCK_RATE),
            ));
            media.add_attr(SdpAttribute::new(
                "fmtp",
                format!("{} {}", pt, TELEPHONE_EVENT_EVENTS),
            ));
            media.formats.push(pt);
        }

        if port != 0 {
            let conn = SdpConnection::new(self.published_addr);
            media.add_attr(SdpAttribute::new(
                "rtcp",
                format!("{} {}", port + 1, conn),
            ));
        }

        media.set_direction(Self::media_direction(attr));

        if attr.secure {
            let crypto = generate_crypto_attribute()?;
            media.add_attr(SdpAttribute::new("crypto", crypto.to_string()));
        }
        Ok(media)
    }

    /// Build a fresh local offer and a negotiator for it.
    ///
    /// Disabled attributes produce no media section. Any previous local
    /// session and negotiator are replaced.
    pub fn create_offer(&mut self, media_list: &[MediaAttribute]) -> Result<(), SdpError> {
        let enabled: Vec<&MediaAttribute> = media_list.iter().filter(|m| m.enabled).collect();
        if enabled.len() > MAX_MEDIA {
            return Err(SdpError::TooManyMedia(enabled.len()));
        }

        let mut session = self.new_local_session();
        let mut labels = Vec::with_capacity(enabled.len());
        for attr in enabled {
            session.media.push(self.build_media(attr)?);
            labels.push(attr.label.clone());
        }

        let negotiator = SdpNegotiator::with_local_offer(&session)?;
        self.print_session(&session, "Local SDP offer");
        self.local_session = Some(session);
        self.local_labels = labels;
        self.negotiator = Some(negotiator);
        self.sdp_direction = SdpDirection::Offer;
        Ok(())
    }

    /// Store a peer offer for [`Sdp::process_incoming_offer`].
    pub fn set_received_offer(&mut self, offer: SdpSession) {
        self.print_session(&offer, "Remote SDP offer");
        self.remote_session = Some(offer);
    }

    /// Build the local answer to the stored peer offer.
    ///
    /// The answer has one section per offered media. An offered media with no
    /// enabled local attribute of the same type gets a rejected section.
    pub fn process_incoming_offer(
        &mut self,
        media_list: &[MediaAttribute],
    ) -> Result<(), SdpError> {
        let remote = self
            .remote_session
            .clone()
            .ok_or(SdpError::NoRemoteSession)?;
        if remote.media.len() > MAX_MEDIA {
            return Err(SdpError::TooManyMedia(remote.media.len()));
        }

        let mut session = self.new_local_session();
        let mut labels = Vec::with_capacity(remote.media.len());
        let mut used = vec![false; media_list.len()];

        for rm in &remote.media {
            let rtype = rm.media_type();
            let found = media_list.iter().enumerate().find(|(i, attr)| {
                !used[*i] && attr.enabled && attr.media_type == rtype && rm.port != 0
            });
            match found {
                Some((i, attr)) => {
                    used[i] = true;
                    session.media.push(self.build_media(attr)?);
                    labels.push(attr.label.clone());
                }
                None => {
                    let mut m = rm.clone();
                    m.connection = None;
                    m.bandwidth.clear();
                    if m.formats.is_empty() {
                        m.formats.push("0".into());
                    }
                    m.deactivate();
                    session.media.push(m);
                    labels.push(String::new());
                }
            }
        }

        let mut negotiator = SdpNegotiator::with_remote_offer(&remote)?;
        negotiator.set_local_answer(&session)?;
        self.print_session(&session, "Local SDP answer");
        self.local_session = Some(session);
        self.local_labels = labels;
        self.negotiator = Some(negotiator);
        self.sdp_direction = SdpDirection::Answer;
        Ok(())
    }

    /// Store the peer answer to our pending offer.
    pub fn receive_answer(&mut self, answer: SdpSession) -> Result<(), SdpError> {
        let negotiator = self.negotiator.as_mut().ok_or(SdpError::NoNegotiator)?;
        negotiator.set_remote_answer(&answer)?;
        self.print_session(&answer, "Remote SDP answer");
        self.remote_session = Some(answer);
        Ok(())
    }

    /// Negotiate the current round and capture the active sessions.
    pub fn start_negotiation(&mut self) -> Result<(), SdpError> {
        let negotiator = self.negotiator.as_mut().ok_or(SdpError::NoNegotiator)?;
        if negotiator.state() != NegoState::WaitNego {
            return Err(SdpError::InvalidState(format!("{:?}", negotiator.state())));
        }
        let local = self
            .local_session
            .as_ref()
            .ok_or_else(|| SdpError::Validation("no local session".into()))?;
        let remote = self.remote_session.as_ref().ok_or(SdpError::NoRemoteSession)?;

        let (active_local, active_remote) = negotiator.negotiate(local, remote)?;
        if active_remote.media.is_empty() {
            return Err(SdpError::NoActiveSession);
        }
        self.print_session(&active_local, "Active local SDP");
        self.active_local = Some(active_local);
        self.active_remote = Some(active_remote);
        Ok(())
    }

    /// Drop a pending local offer, back to the last negotiated state.
    pub fn cancel_offer(&mut self) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.cancel_offer();
        }
        if self.sdp_direction == SdpDirection::Offer {
            self.local_session = self.active_local.clone();
            self.sdp_direction = SdpDirection::None;
        }
    }

    pub fn negotiator_state(&self) -> Option<NegoState> {
        self.negotiator.as_ref().map(SdpNegotiator::state)
    }

    pub fn sdp_direction(&self) -> SdpDirection {
        self.sdp_direction
    }

    pub fn local_session(&self) -> Option<&SdpSession> {
        self.local_session.as_ref()
    }

    pub fn remote_session(&self) -> Option<&SdpSession> {
        self.remote_session.as_ref()
    }

    pub fn active_local_session(&self) -> Option<&SdpSession> {
        self.active_local.as_ref()
    }

    pub fn active_remote_session(&self) -> Option<&SdpSession> {
        self.active_remote.as_ref()
    }

    /// Session to put in the next outgoing SIP message body.
    pub fn local_sdp_to_send(&self) -> Option<&SdpSession> {
        match self.sdp_direction {
            SdpDirection::Answer => self.active_local.as_ref().or(self.local_session.as_ref()),
            _ => self.local_session.as_ref(),
        }
    }

    pub fn local_media_label(&self, index: usize) -> Option<&str> {
        self.local_labels
            .get(index)
            .map(String::as_str)
            .filter(|l| !l.is_empty())
    }

    // ── Decoding ────────────────────────────────────────────────

    /// What a session describes, as media attributes.
    ///
    /// Labels are `<type>_<n>` counted per type over every media of the
    /// session, so they stay aligned whether or not disabled media are kept.
    pub fn get_media_attribute_list_from_sdp(
        session: &SdpSession,
        ignore_disabled: bool,
    ) -> Vec<MediaAttribute> {
        let mut audio_idx = 0;
        let mut video_idx = 0;
        let mut list = Vec::with_capacity(session.media.len());

        for media in &session.media {
            let media_type = media.media_type();
            let idx = match media_type {
                MediaType::Audio => &mut audio_idx,
                MediaType::Video => &mut video_idx,
                MediaType::None => {
                    tracing::warn!("Ignoring unsupported media '{}'", media.media);
                    continue;
                }
            };
            let label = generate_label(media_type, *idx);
            *idx += 1;

            let enabled = media.port > 0;
            if ignore_disabled && !enabled {
                continue;
            }
            let direction = media.direction();
            let secure = media.is_secure_transport() && media.find_attr("crypto").is_some();

            let mut attr = MediaAttribute::new(media_type)
                .with_label(label)
                .with_secure(secure)
                .with_enabled(enabled)
                .with_muted(!direction.is_send_capable());
            attr.on_hold = direction.is_on_hold();
            list.push(attr);
        }
        list
    }

    /// Decode every media of a session.
    ///
    /// A media whose codec cannot be resolved is kept with `enabled = false`
    /// so indexes stay aligned with the peer.
    pub fn get_media_descriptions(
        &self,
        session: &SdpSession,
        remote: bool,
    ) -> Vec<MediaDescription> {
        let mut ret = Vec::with_capacity(session.media.len());

        for (i, media) in session.media.iter().enumerate() {
            let mut descr = MediaDescription {
                media_type: media.media_type(),
                ..Default::default()
            };
            if !remote {
                descr.label = self.local_media_label(i).unwrap_or_default().to_string();
            }
            if descr.media_type == MediaType::None {
                ret.push(descr);
                continue;
            }
            descr.enabled = media.port != 0;
            if !descr.enabled {
                ret.push(descr);
                continue;
            }

            let Some(ip) = session.media_connection(i).and_then(SdpConnection::ip) else {
                tracing::error!(
                    "[call:{}] Could not find connection information for media #{}",
                    self.call_id,
                    i
                );
                descr.enabled = false;
                ret.push(descr);
                continue;
            };
            descr.addr = Some(SocketAddr::new(ip, media.port));
            descr.rtcp_addr = Some(rtcp_address(media, ip));
            descr.direction = media.direction();
            descr.on_hold = descr.direction.is_on_hold();

            // Only the first usable codec is kept
            for fmt in &media.formats {
                let Some(rtpmap) = media.rtpmap(fmt) else {
                    tracing::error!(
                        "[call:{}] Could not find rtpmap for payload {}",
                        self.call_id,
                        fmt
                    );
                    descr.enabled = false;
                    continue;
                };
                descr.rtp_clockrate = rtpmap.clock_rate;
                let Some(codec) = self.find_codec_by_rtpmap(&rtpmap.encoding, rtpmap.clock_rate)
                else {
                    tracing::error!(
                        "[call:{}] Could not find codec {}",
                        self.call_id,
                        rtpmap.encoding
                    );
                    descr.enabled = false;
                    continue;
                };
                descr.codec = Some(codec.clone());
                descr.payload_type = rtpmap.payload_type;
                if descr.media_type == MediaType::Video {
                    descr.parameters = media.fmtp(fmt).unwrap_or_default();
                }
                descr.enabled = true;
                break;
            }

            if !remote {
                descr.receiving_sdp = Self::get_filtered_sdp(session, i, descr.payload_type);
            }

            descr.crypto = self.sdes.negotiate(&media.crypto_lines());
            ret.push(descr);
        }
        ret
    }

    /// Local and remote descriptions of the active sessions, paired by index.
    pub fn get_media_slots(&self) -> Vec<MediaSlot> {
        let (Some(local), Some(remote)) = (&self.active_local, &self.active_remote) else {
            return Vec::new();
        };
        let loc = self.get_media_descriptions(local, false);
        let rem = self.get_media_descriptions(remote, true);
        loc.into_iter().zip(rem).collect()
    }

    /// A copy of `session` keeping only media `media_keep` and payload
    /// `pt_keep`, without crypto. Empty when the media does not exist.
    pub fn get_filtered_sdp(session: &SdpSession, media_keep: usize, pt_keep: u8) -> String {
        if media_keep >= session.media.len() {
            tracing::debug!("No media to keep present in SDP");
            return String::new();
        }
        let mut cloned = session.clone();
        for (i, media) in cloned.media.iter_mut().enumerate() {
            if i != media_keep {
                media.deactivate();
            }
        }
        cloned.media.retain(|m| m.port != 0);

        let keep = pt_keep.to_string();
        for media in &mut cloned.media {
            let dropped: Vec<String> = media
                .formats
                .iter()
                .filter(|f| **f != keep)
                .cloned()
                .collect();
            for fmt in &dropped {
                media.remove_attr_with_fmt("rtpmap", fmt);
                media.remove_attr_with_fmt("fmtp", fmt);
            }
            media.formats.retain(|f| *f == keep);
            media.remove_all_attr("crypto");
        }
        cloned.to_string()
    }

    // ── ICE ─────────────────────────────────────────────────────

    pub fn add_ice_attributes(&mut self, attrs: &IceAttributes) -> Result<(), SdpError> {
        let local = self
            .local_session
            .as_mut()
            .ok_or_else(|| SdpError::Validation("no local session".into()))?;
        local.attributes.push(SdpAttribute::new("ice-ufrag", attrs.ufrag.clone()));
        local.attributes.push(SdpAttribute::new("ice-pwd", attrs.pwd.clone()));
        Ok(())
    }

    /// Peer ICE credentials from the active remote session, else the last
    /// received one.
    pub fn get_ice_attributes(&self) -> IceAttributes {
        self.active_remote
            .as_ref()
            .or(self.remote_session.as_ref())
            .map(Self::ice_attributes_of)
            .unwrap_or_default()
    }

    /// Session-level credentials, falling back to the first media carrying
    /// them.
    pub fn ice_attributes_of(session: &SdpSession) -> IceAttributes {
        let read = |attrs: &[SdpAttribute]| {
            let mut ice = IceAttributes::default();
            for a in attrs {
                match a.name.as_str() {
                    "ice-ufrag" => ice.ufrag = a.value_str().to_string(),
                    "ice-pwd" => ice.pwd = a.value_str().to_string(),
                    _ => {}
                }
            }
            ice
        };
        let ice = read(&session.attributes);
        if !ice.is_empty() {
            return ice;
        }
        session
            .media
            .iter()
            .map(|m| read(&m.attributes))
            .find(|ice| !ice.is_empty())
            .unwrap_or(ice)
    }

    pub fn add_ice_candidates(
        &mut self,
        media_index: usize,
        candidates: &[String],
    ) -> Result<(), SdpError> {
        let local = self
            .local_session
            .as_mut()
            .ok_or_else(|| SdpError::Validation("no local session".into()))?;
        let media = local.media.get_mut(media_index).ok_or_else(|| {
            SdpError::Validation(format!("cannot access media #{} to add candidates", media_index))
        })?;
        for c in candidates {
            media.add_attr(SdpAttribute::new("candidate", c.clone()));
        }
        Ok(())
    }

    /// Peer candidates of one media. Empty when either side disabled it.
    pub fn get_ice_candidates(&self, media_index: usize) -> Vec<String> {
        let Some(session) = self.active_remote.as_ref().or(self.remote_session.as_ref()) else {
            tracing::error!("[call:{}] getIceCandidates failed: no remote session", self.call_id);
            return Vec::new();
        };
        let Some(local) = self.active_local.as_ref().or(self.local_session.as_ref()) else {
            return Vec::new();
        };
        let (Some(media), Some(local_media)) =
            (session.media.get(media_index), local.media.get(media_index))
        else {
            tracing::error!(
                "[call:{}] getIceCandidates failed: cannot access media #{}",
                self.call_id,
                media_index
            );
            return Vec::new();
        };
        if media.port == 0 || local_media.port == 0 {
            tracing::debug!("[call:{}] Media #{} is disabled", self.call_id, media_index);
            return Vec::new();
        }
        media
            .attrs_named("candidate")
            .map(|a| a.value_str().to_string())
            .collect()
    }

    /// Strip ICE attributes from both sessions and forget the active ones.
    pub fn clear_ice(&mut self) {
        for session in [self.local_session.as_mut(), self.remote_session.as_mut()]
            .into_iter()
            .flatten()
        {
            session.remove_all_attr("ice-ufrag");
            session.remove_all_attr("ice-pwd");
            session.remove_all_attr("candidate");
            for media in &mut session.media {
                media.remove_all_attr("candidate");
            }
        }
        self.active_local = None;
        self.active_remote = None;
    }

    // ── Logging ─────────────────────────────────────────────────

    /// Debug-log a session with its crypto lines removed.
    pub fn print_session(&self, session: &SdpSession, header: &str) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let text: String = session
            .to_string()
            .split_inclusive("\r\n")
            .filter(|l| !l.starts_with("a=crypto"))
            .collect();
        tracing::debug!("[call:{}] {}:\n{}", self.call_id, header, text);
    }
}

impl Drop for Sdp {
    fn drop(&mut self) {
        self.release_ports();
    }
}

fn rtcp_address(media: &SdpMedia, fallback: IpAddr) -> SocketAddr {
    let port = media.rtcp_port();
    let ip = media
        .find_attr("rtcp")
        .and_then(|a| a.value_str().split_whitespace().nth(3).map(str::to_string))
        .and_then(|addr| addr.parse().ok())
        .unwrap_or(fallback);
    SocketAddr::new(ip, port)
}

fn update_rtcp_address(media: &mut SdpMedia, addr: IpAddr) {
    if let Some(attr) = media.attributes.iter_mut().find(|a| a.name == "rtcp") {
        let port = attr.fmt_token().to_string();
        attr.value = Some(format!("{} {}", port, SdpConnection::new(addr)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::codec::{default_audio_codecs, default_video_codecs};

    fn sdp(id: &str, pool: &Arc<PortReservation>) -> Sdp {
        let mut s = Sdp::new(id, pool.clone(), "127.0.0.1".parse().unwrap());
        s.set_local_media_capabilities(MediaType::Audio, default_audio_codecs());
        s.set_local_media_capabilities(MediaType::Video, default_video_codecs(false));
        s.generate_media_ports().unwrap();
        s
    }

    fn audio(idx: usize) -> MediaAttribute {
        MediaAttribute::new(MediaType::Audio).with_label(generate_label(MediaType::Audio, idx))
    }

    fn video(idx: usize) -> MediaAttribute {
        MediaAttribute::new(MediaType::Video).with_label(generate_label(MediaType::Video, idx))
    }

    /// Run a full round: `a` offers, `b` answers.
    fn exchange(a: &mut Sdp, a_media: &[MediaAttribute], b: &mut Sdp, b_media: &[MediaAttribute]) {
        a.create_offer(a_media).unwrap();
        let offer = SdpSession::parse(&a.local_sdp_to_send().unwrap().to_string()).unwrap();
        b.set_received_offer(offer);
        b.process_incoming_offer(b_media).unwrap();
        b.start_negotiation().unwrap();
        let answer = SdpSession::parse(&b.local_sdp_to_send().unwrap().to_string()).unwrap();
        a.receive_answer(answer).unwrap();
        a.start_negotiation().unwrap();
    }

    #[test]
    fn test_offer_sections() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let media = vec![audio(0), video(0).with_enabled(false)];
        a.create_offer(&media).unwrap();

        let local = a.local_session().unwrap();
        assert_eq!(local.media.len(), 1, "disabled media are not offered");
        let m = &local.media[0];
        assert_eq!(m.port, a.local_audio_port());
        assert_eq!(m.transport, "RTP/SAVP");
        assert_eq!(m.formats.last().map(String::as_str), Some("101"));
        assert_eq!(m.rtpmap("101").unwrap().encoding, TELEPHONE_EVENT_NAME);
        assert_eq!(m.fmtp("101").as_deref(), Some("0-15"));
        assert_eq!(m.rtpmap("9").unwrap().clock_rate, 8000, "G722 advertised at 8 kHz");
        assert_eq!(m.rtcp_port(), a.local_audio_port() + 1);
        assert_eq!(m.crypto_lines().len(), 1);
        assert_eq!(m.direction(), MediaDirection::SendRecv);
        assert_eq!(a.sdp_direction(), SdpDirection::Offer);
        assert_eq!(a.negotiator_state(), Some(NegoState::LocalOffer));
        assert_eq!(a.local_media_label(0), Some("audio_0"));
    }

    #[test]
    fn test_offer_version_increments() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        a.create_offer(&[audio(0)]).unwrap();
        let v1 = a.local_session().unwrap().origin.version;
        let id = a.local_session().unwrap().origin.session_id;
        a.create_offer(&[audio(0)]).unwrap();
        assert_eq!(a.local_session().unwrap().origin.version, v1 + 1);
        assert_eq!(a.local_session().unwrap().origin.session_id, id);
        assert!(id > NTP_UNIX_OFFSET);
    }

    #[test]
    fn test_media_direction_policy() {
        let v = video(0);
        assert_eq!(Sdp::media_direction(&v), MediaDirection::SendRecv);
        assert_eq!(Sdp::media_direction(&v.clone().with_muted(true)), MediaDirection::RecvOnly);
        let mut held = v.clone();
        held.on_hold = true;
        assert_eq!(Sdp::media_direction(&held), MediaDirection::SendOnly);
        assert_eq!(Sdp::media_direction(&held.with_muted(true)), MediaDirection::Inactive);
        assert_eq!(
            Sdp::media_direction(&v.with_enabled(false)),
            MediaDirection::Inactive
        );

        let mut a = audio(0).with_muted(true);
        assert_eq!(Sdp::media_direction(&a), MediaDirection::SendRecv);
        a.on_hold = true;
        assert_eq!(Sdp::media_direction(&a), MediaDirection::SendOnly);
    }

    #[test]
    fn test_attribute_list_round_trip() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let mut held = video(1).with_muted(true).with_secure(false);
        held.on_hold = true;
        let media = vec![
            audio(0).with_muted(true),
            video(0).with_muted(true),
            held,
            video(2),
        ];
        a.create_offer(&media).unwrap();
        let parsed = SdpSession::parse(&a.local_session().unwrap().to_string()).unwrap();
        let back = Sdp::get_media_attribute_list_from_sdp(&parsed, false);

        assert_eq!(back.len(), media.len());
        for (orig, got) in media.iter().zip(&back) {
            assert_eq!(got.media_type, orig.media_type);
            assert_eq!(got.enabled, orig.enabled);
            assert_eq!(got.secure, orig.secure);
            let dir = Sdp::media_direction(orig);
            assert_eq!(got.muted, !dir.is_send_capable());
            assert_eq!(got.on_hold, dir.is_on_hold());
        }
        assert!(!back[0].muted, "audio mute does not change direction");
        assert_eq!(back[3].label, "video_2");
    }

    #[test]
    fn test_attribute_list_ignore_disabled() {
        let text = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
m=audio 4000 RTP/SAVP 0\r\na=rtpmap:0 PCMU/8000\r\n\
m=video 0 RTP/AVP 96\r\n\
m=video 4002 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let s = SdpSession::parse(text).unwrap();
        let all = Sdp::get_media_attribute_list_from_sdp(&s, false);
        assert_eq!(all.len(), 3);
        assert!(!all[0].secure, "SAVP without crypto is not secure");
        assert!(!all[1].enabled);
        let enabled = Sdp::get_media_attribute_list_from_sdp(&s, true);
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[1].label, "video_1");
    }

    #[test]
    fn test_exchange_audio_only_answer() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let mut b = sdp("b", &pool);
        exchange(
            &mut a,
            &[audio(0), video(0)],
            &mut b,
            &[audio(0), video(0).with_enabled(false)],
        );

        let answer = b.local_sdp_to_send().unwrap();
        assert_eq!(answer.media.len(), 2, "answer aligned with offer");
        assert_eq!(answer.media[1].port, 0);

        for side in [&a, &b] {
            let slots = side.get_media_slots();
            assert_eq!(slots.len(), 2);
            let enabled: Vec<_> = slots
                .iter()
                .filter(|(l, r)| l.enabled && r.enabled)
                .collect();
            assert_eq!(enabled.len(), 1);
            let (local, remote) = enabled[0];
            assert_eq!(local.media_type, MediaType::Audio);
            assert_eq!(remote.media_type, MediaType::Audio);
            assert!(local.crypto.is_some() && remote.crypto.is_some());
            assert_eq!(local.codec.as_ref().unwrap().name, "opus");
            assert!(!local.receiving_sdp.is_empty());
        }
        assert_eq!(a.get_media_slots()[0].0.label, "audio_0");
        assert_eq!(
            a.get_media_slots()[0].1.addr.unwrap().port(),
            b.local_audio_port()
        );
    }

    #[test]
    fn test_exchange_peer_holding_direction() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let mut b = sdp("b", &pool);
        let mut held = video(0);
        held.on_hold = true;
        exchange(&mut a, &[audio(0), held], &mut b, &[audio(0), video(0)]);

        let slots = b.get_media_slots();
        assert_eq!(slots[1].1.direction, MediaDirection::SendOnly);
        assert!(slots[1].1.on_hold);
        assert_eq!(slots[1].0.direction, MediaDirection::RecvOnly);
        assert!(!slots[0].1.on_hold);
    }

    #[test]
    fn test_process_offer_without_remote() {
        let pool = Arc::new(PortReservation::new());
        let mut b = sdp("b", &pool);
        assert!(matches!(
            b.process_incoming_offer(&[audio(0)]),
            Err(SdpError::NoRemoteSession)
        ));
        assert!(matches!(b.start_negotiation(), Err(SdpError::NoNegotiator)));
    }

    #[test]
    fn test_too_many_media() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let media: Vec<_> = (0..=MAX_MEDIA).map(audio).collect();
        assert!(matches!(a.create_offer(&media), Err(SdpError::TooManyMedia(_))));
        assert!(a.local_session().is_none());
    }

    #[test]
    fn test_unresolved_codec_disables_media() {
        let pool = Arc::new(PortReservation::new());
        let a = sdp("a", &pool);
        let text = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
m=audio 4000 RTP/AVP 120\r\na=rtpmap:120 speex/16000\r\n\
m=audio 4002 RTP/AVP 9\r\na=rtpmap:9 G722/8000\r\n";
        let s = SdpSession::parse(text).unwrap();
        let descr = a.get_media_descriptions(&s, true);
        assert_eq!(descr.len(), 2);
        assert!(!descr[0].enabled);
        assert_eq!(descr[0].media_type, MediaType::Audio);
        assert!(descr[1].enabled);
        assert_eq!(descr[1].codec.as_ref().unwrap().clock_rate, 16000);
        assert_eq!(descr[1].rtp_clockrate, 8000);
        assert_eq!(descr[1].rtcp_addr.unwrap().port(), 4003);
    }

    #[test]
    fn test_find_codec() {
        let pool = Arc::new(PortReservation::new());
        let a = sdp("a", &pool);
        assert!(a.find_codec_by_rtpmap("G722", 8000).is_some());
        assert!(a.find_codec_by_rtpmap("G722", 16000).is_none());
        assert!(a.find_codec_by_rtpmap("opus", 48000).is_some());
        assert!(a.find_codec_by_rtpmap("PCMU", 16000).is_none());
        assert!(a.find_codec_by_rtpmap("h264", 90000).is_some());
        assert_eq!(a.find_codec_by_payload(0).unwrap().name, "PCMU");
        assert_eq!(a.find_codec_by_payload(96).unwrap().name, "H264");
        assert!(a.find_codec_by_payload(127).is_none());
    }

    #[test]
    fn test_filtered_sdp() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        a.create_offer(&[audio(0), video(0)]).unwrap();
        let session = a.local_session().unwrap().clone();

        let filtered = Sdp::get_filtered_sdp(&session, 1, 96);
        let parsed = SdpSession::parse(&filtered).unwrap();
        assert_eq!(parsed.media.len(), 1);
        let m = &parsed.media[0];
        assert_eq!(m.media_type(), MediaType::Video);
        assert_eq!(m.formats, vec!["96"]);
        assert!(m.rtpmap("97").is_none());
        assert!(m.find_attr("crypto").is_none());
        assert!(parsed.validate().is_ok());

        assert!(Sdp::get_filtered_sdp(&session, 5, 0).is_empty());
    }

    #[test]
    fn test_ice_attributes_and_candidates() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let mut b = sdp("b", &pool);
        a.create_offer(&[audio(0)]).unwrap();
        let creds = IceAttributes {
            ufrag: "abcd".into(),
            pwd: "0123456789abcdef01234567".into(),
        };
        a.add_ice_attributes(&creds).unwrap();
        a.add_ice_candidates(0, &["1 1 UDP 2130706431 127.0.0.1 5000 typ host".into()])
            .unwrap();
        assert!(a.add_ice_candidates(3, &[]).is_err());

        b.set_received_offer(SdpSession::parse(&a.local_session().unwrap().to_string()).unwrap());
        b.process_incoming_offer(&[audio(0)]).unwrap();
        assert_eq!(b.get_ice_attributes(), creds);
        assert_eq!(b.get_ice_candidates(0).len(), 1);
        assert!(b.get_ice_candidates(1).is_empty());

        b.clear_ice();
        assert!(b.get_ice_attributes().is_empty());
        assert!(b.get_ice_candidates(0).is_empty());
        assert!(b.active_local_session().is_none());
    }

    #[test]
    fn test_ice_attributes_media_level_fallback() {
        let text = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\na=ice-ufrag:wxyz\r\na=ice-pwd:secretsecretsecret\r\n";
        let s = SdpSession::parse(text).unwrap();
        let ice = Sdp::ice_attributes_of(&s);
        assert_eq!(ice.ufrag, "wxyz");
        assert_eq!(ice.pwd, "secretsecretsecret");
    }

    #[test]
    fn test_regenerate_ports_releases_old() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let (old_audio, old_video) = (a.local_audio_port(), a.local_video_port());
        assert!(pool.is_reserved(old_audio) && pool.is_reserved(old_video));
        a.generate_media_ports().unwrap();
        assert_eq!(pool.len(), 2);
        if a.local_audio_port() != old_audio {
            assert!(!pool.is_reserved(old_audio));
        }
        drop(a);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cancel_offer_restores_active() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        let mut b = sdp("b", &pool);
        exchange(&mut a, &[audio(0)], &mut b, &[audio(0)]);
        let active = a.active_local_session().unwrap().clone();

        a.create_offer(&[audio(0), video(0)]).unwrap();
        a.cancel_offer();
        assert_eq!(a.local_session(), Some(&active));
        assert_eq!(a.negotiator_state(), Some(NegoState::Done));
    }

    #[test]
    fn test_set_published_ip() {
        let pool = Arc::new(PortReservation::new());
        let mut a = sdp("a", &pool);
        a.create_offer(&[audio(0)]).unwrap();
        a.set_published_ip("192.0.2.7".parse().unwrap());
        let local = a.local_session().unwrap();
        assert_eq!(local.origin.connection.address, "192.0.2.7");
        assert_eq!(local.connection.as_ref().unwrap().address, "192.0.2.7");
        assert!(local.media[0].find_attr("rtcp").unwrap().value_str().ends_with("192.0.2.7"));
    }
}
