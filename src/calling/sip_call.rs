//! Media side of a SIP call.
//!
//! [`SipCall`] owns the SDP state, the RTP sessions and the ICE transports of
//! one call. It is not thread-safe: every method runs on the call's actor
//! task (see [`super::call_actor`]), and asynchronous notifications (ICE
//! progress, peer messages) come back in as [`CallEvent`]s on the same queue.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use super::codec::{default_audio_codecs, default_video_codecs, AccountCodecInfo};
use super::ice::{
    IceCandidate, IceError, IceEvent, IceEventSink, IceTransport, IceTransportFactory,
    IceTransportOptions, ICE_INIT_TIMEOUT,
};
use super::media_attribute::{
    build_media_attributes_list, media_attributes_to_media_maps, MediaAttribute, MediaMap,
    MediaType,
};
use super::ports::{PortRange, PortReservation, AUDIO_PORT_RANGE, VIDEO_PORT_RANGE};
use super::rtp_session::{MediaSocket, RtpSession, DEFAULT_MTU};
use super::sdes::SrtpStreamKeys;
use super::sdp::Sdp;
use super::sdp_session::{SdpError, SdpSession};
use super::signaling::{
    InviteSession, InviteState, SignalingError, SIP_BUSY_HERE, SIP_DECLINE,
    SIP_NOT_ACCEPTABLE_HERE, SIP_OK, SIP_REQUEST_TERMINATED,
};
use super::{CallState, ConnectionState, MediaState};

/// Failure causes reported with [`CallState::Error`].
pub const EIO: i32 = 5;
pub const ETIMEDOUT: i32 = 110;

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Sdp(#[from] SdpError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Ice(#[from] IceError),

    #[error("no invite session")]
    NoInvite,

    #[error("call is terminated")]
    Terminated,

    #[error("operation not allowed in state {0}")]
    InvalidState(CallState),

    #[error("ICE initialization timed out")]
    IceInitTimeout,

    #[error("empty media list")]
    EmptyMediaList,

    #[error("dialog cannot carry a re-invite in state {0:?}")]
    DialogNotReady(InviteState),

    #[error("call task has ended")]
    Closed,
}

impl CallError {
    /// Cause reported when this error ends the call.
    pub fn failure_code(&self) -> i32 {
        match self {
            CallError::IceInitTimeout => ETIMEDOUT,
            _ => EIO,
        }
    }

    /// Whether the call cannot go on after this error. Misuse by the client
    /// (wrong state, bad media list) leaves the call as it was.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CallError::InvalidState(_)
                | CallError::NoInvite
                | CallError::Terminated
                | CallError::EmptyMediaList
                | CallError::DialogNotReady(_)
                | CallError::Closed
        )
    }
}

/// Per-call settings, usually derived from the account configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub published_addr: IpAddr,
    pub audio_range: PortRange,
    pub video_range: PortRange,
    pub audio_codecs: Vec<AccountCodecInfo>,
    pub video_codecs: Vec<AccountCodecInfo>,
    /// Offer SRTP (SDES) on every media.
    pub secure: bool,
    pub ice_enabled: bool,
    pub ice_init_timeout: Duration,
    pub mtu: u16,
    pub stun_server: Option<String>,
    pub bind_address: IpAddr,
    /// Capture source of video streams that don't name one.
    pub default_video_source: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            published_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            audio_range: AUDIO_PORT_RANGE,
            video_range: VIDEO_PORT_RANGE,
            audio_codecs: default_audio_codecs(),
            video_codecs: default_video_codecs(false),
            secure: true,
            ice_enabled: true,
            ice_init_timeout: ICE_INIT_TIMEOUT,
            mtu: DEFAULT_MTU,
            stun_server: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_video_source: String::new(),
        }
    }
}

/// Notifications for the client of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    StateChanged {
        call_state: CallState,
        connection_state: ConnectionState,
        code: i32,
    },
    /// Media were (re)negotiated; carries the current local media list.
    MediaNegotiated(Vec<MediaMap>),
    PeerHold(bool),
    /// The peer wants media we don't have; answer with
    /// [`SipCall::answer_media_change_request`].
    MediaChangeRequested(Vec<MediaMap>),
    AudioMuted(bool),
    VideoMuted(bool),
}

/// Inputs coming from the network side.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Ice { transport: String, event: IceEvent },
    InviteStateChanged(InviteState),
    /// Peer re-INVITE carrying a new offer.
    OfferReceived(SdpSession),
    /// Peer answer to our INVITE or re-INVITE.
    AnswerReceived(SdpSession),
    /// Peer refused our re-INVITE.
    ReinviteRejected(u16),
    PeerHungup,
    PeerBusy,
}

/// Posts an event back on the call's own queue.
pub type EventPoster = Arc<dyn Fn(CallEvent) + Send + Sync>;

/// Completion of a hold or unhold request.
pub type HoldCallback = Box<dyn FnOnce(bool) + Send>;

/// Request deferred while waiting for a renegotiation to finish. Only the
/// last one is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemainingRequest {
    #[default]
    NoRequest,
    HoldOn,
    HoldOff,
    SwitchInput,
}

/// One local media stream.
#[derive(Debug)]
pub struct RtpStream {
    pub media_attr: MediaAttribute,
    pub rtp_session: RtpSession,
    /// What the peer announced for this stream in the last negotiation.
    pub remote_media_attr: Option<MediaAttribute>,
}

/// Read-only view of a stream for clients.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub label: String,
    pub media_type: MediaType,
    pub running: bool,
    pub sending: bool,
    pub muted: bool,
    pub secure: bool,
    pub remote: Option<SocketAddr>,
    pub starts: u32,
    pub ssrc: u32,
    pub srtp: Option<SrtpStreamKeys>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub id: String,
    pub state: CallState,
    pub connection_state: ConnectionState,
    pub media_state: MediaState,
    pub media: Vec<MediaMap>,
    pub peer_holding: bool,
    pub waiting_for_media: bool,
    pub ice_running: bool,
    pub reinvites: u32,
    pub streams: Vec<StreamInfo>,
}

pub struct SipCall {
    id: String,
    config: CallConfig,
    state: CallState,
    connection_state: ConnectionState,
    media_state: MediaState,

    sdp: Sdp,
    rtp_streams: Vec<RtpStream>,
    invite: Option<Arc<dyn InviteSession>>,

    ice_factory: Arc<dyn IceTransportFactory>,
    /// Transport carrying media.
    ice_transport: Option<Arc<dyn IceTransport>>,
    /// Transport of an ongoing renegotiation, promoted once connected.
    tmp_ice_transport: Option<Arc<dyn IceTransport>>,
    ice_generation: u32,
    wait_for_ice_init: bool,

    waiting_for_ice_and_media: bool,
    remaining_request: RemainingRequest,
    hold_cb: Option<HoldCallback>,
    peer_holding: bool,
    reinvites: u32,

    signals: mpsc::UnboundedSender<CallSignal>,
    poster: EventPoster,
}

impl SipCall {
    pub fn new(
        id: impl Into<String>,
        config: CallConfig,
        ports: Arc<PortReservation>,
        ice_factory: Arc<dyn IceTransportFactory>,
        signals: mpsc::UnboundedSender<CallSignal>,
        poster: EventPoster,
    ) -> Self {
        let id = id.into();
        let mut sdp = Sdp::new(id.clone(), ports, config.published_addr)
            .with_port_ranges(config.audio_range, config.video_range);
        sdp.set_local_media_capabilities(MediaType::Audio, config.audio_codecs.clone());
        sdp.set_local_media_capabilities(MediaType::Video, config.video_codecs.clone());

        Self {
            id,
            config,
            state: CallState::Inactive,
            connection_state: ConnectionState::Disconnected,
            media_state: MediaState::Idle,
            sdp,
            rtp_streams: Vec::new(),
            invite: None,
            ice_factory,
            ice_transport: None,
            tmp_ice_transport: None,
            ice_generation: 0,
            wait_for_ice_init: false,
            waiting_for_ice_and_media: false,
            remaining_request: RemainingRequest::NoRequest,
            hold_cb: None,
            peer_holding: false,
            reinvites: 0,
            signals,
            poster,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn media_state(&self) -> MediaState {
        self.media_state
    }

    pub fn sdp(&self) -> &Sdp {
        &self.sdp
    }

    pub fn rtp_streams(&self) -> &[RtpStream] {
        &self.rtp_streams
    }

    pub fn is_peer_holding(&self) -> bool {
        self.peer_holding
    }

    pub fn is_waiting_for_ice_and_media(&self) -> bool {
        self.waiting_for_ice_and_media
    }

    pub fn remaining_request(&self) -> RemainingRequest {
        self.remaining_request
    }

    /// Current local media list.
    pub fn media_attribute_list(&self) -> Vec<MediaAttribute> {
        self.rtp_streams.iter().map(|s| s.media_attr.clone()).collect()
    }

    /// What the peer announced in the last negotiation, per stream.
    pub fn remote_media_attribute_list(&self) -> Vec<MediaAttribute> {
        self.rtp_streams
            .iter()
            .filter_map(|s| s.remote_media_attr.clone())
            .collect()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id.clone(),
            state: self.state,
            connection_state: self.connection_state,
            media_state: self.media_state,
            media: media_attributes_to_media_maps(&self.media_attribute_list()),
            peer_holding: self.peer_holding,
            waiting_for_media: self.waiting_for_ice_and_media,
            ice_running: self.ice_transport.as_ref().is_some_and(|t| t.is_running()),
            reinvites: self.reinvites,
            streams: self
                .rtp_streams
                .iter()
                .map(|s| StreamInfo {
                    label: s.media_attr.label.clone(),
                    media_type: s.media_attr.media_type,
                    running: s.rtp_session.is_running(),
                    sending: s.rtp_session.is_sending(),
                    muted: s.rtp_session.is_muted(),
                    secure: s.rtp_session.is_secure(),
                    remote: s.rtp_session.remote_address(),
                    starts: s.rtp_session.start_count(),
                    ssrc: s.rtp_session.ssrc(),
                    srtp: s.rtp_session.srtp_keys().cloned(),
                })
                .collect(),
        }
    }

    // ── State ───────────────────────────────────────────────────

    fn emit(&self, signal: CallSignal) {
        if self.signals.send(signal).is_err() {
            tracing::trace!("[call:{}] No signal listener", self.id);
        }
    }

    fn set_state(&mut self, call_state: CallState, connection_state: ConnectionState, code: i32) {
        if self.state == call_state && self.connection_state == connection_state {
            return;
        }
        tracing::info!(
            "[call:{}] {} / {} -> {} / {} (code {})",
            self.id,
            self.state,
            self.connection_state,
            call_state,
            connection_state,
            code
        );
        self.state = call_state;
        self.connection_state = connection_state;
        self.emit(CallSignal::StateChanged {
            call_state,
            connection_state,
            code,
        });
    }

    fn set_call_state(&mut self, call_state: CallState) {
        let connection_state = self.connection_state;
        self.set_state(call_state, connection_state, 0);
    }

    fn set_connection_state(&mut self, connection_state: ConnectionState) {
        let call_state = self.state;
        self.set_state(call_state, connection_state, 0);
    }

    fn set_media_state(&mut self, media_state: MediaState) {
        if self.media_state != media_state {
            tracing::debug!("[call:{}] media {:?} -> {:?}", self.id, self.media_state, media_state);
            self.media_state = media_state;
        }
    }

    fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    fn invite(&self) -> Result<Arc<dyn InviteSession>, CallError> {
        self.invite.clone().ok_or(CallError::NoInvite)
    }

    // ── Streams ─────────────────────────────────────────────────

    /// Replace every stream by one per attribute.
    fn init_media_streams(&mut self, media_list: &[MediaAttribute]) {
        for stream in &mut self.rtp_streams {
            stream.rtp_session.stop();
        }
        self.rtp_streams.clear();
        for attr in media_list {
            self.add_media_stream(attr.clone());
        }
        tracing::debug!(
            "[call:{}] Created {} media stream(s)",
            self.id,
            self.rtp_streams.len()
        );
    }

    fn add_media_stream(&mut self, mut attr: MediaAttribute) {
        if attr.media_type == MediaType::Video && attr.source_uri.is_empty() {
            attr.source_uri = self.config.default_video_source.clone();
        }
        let Some(rtp_session) = RtpSession::create(&self.id, attr.media_type, &attr.source_uri)
        else {
            tracing::warn!("[call:{}] Ignoring media of type {}", self.id, attr.media_type);
            return;
        };
        self.rtp_streams.push(RtpStream {
            media_attr: attr,
            rtp_session,
            remote_media_attr: None,
        });
    }

    /// Apply a media list: known labels are updated, new ones added. Streams
    /// missing from the list are kept.
    fn update_all_media_streams(&mut self, media_list: &[MediaAttribute]) {
        for attr in media_list {
            match self
                .rtp_streams
                .iter()
                .position(|s| s.media_attr.label == attr.label)
            {
                Some(idx) => self.update_media_stream(idx, attr),
                None => {
                    tracing::debug!("[call:{}] Adding media stream {}", self.id, attr.label);
                    self.add_media_stream(attr.clone());
                }
            }
        }
    }

    fn update_media_stream(&mut self, idx: usize, new_attr: &MediaAttribute) {
        let (muted_changed, media_type) = {
            let stream = &mut self.rtp_streams[idx];
            let current = &stream.media_attr;
            if current.media_type != new_attr.media_type {
                tracing::error!(
                    "[call:{}] Media type mismatch for {}: {} != {}",
                    self.id,
                    current.label,
                    current.media_type,
                    new_attr.media_type
                );
                return;
            }
            let muted_changed = current.muted != new_attr.muted;
            if muted_changed {
                stream.rtp_session.set_muted(new_attr.muted);
            }
            if current.source_uri != new_attr.source_uri {
                stream.rtp_session.set_media_source(&new_attr.source_uri);
            }
            stream.media_attr.update_from(new_attr);
            (muted_changed, new_attr.media_type)
        };

        if muted_changed {
            match media_type {
                MediaType::Audio => self.emit(CallSignal::AudioMuted(new_attr.muted)),
                MediaType::Video => self.emit(CallSignal::VideoMuted(new_attr.muted)),
                MediaType::None => {}
            }
        }
    }

    fn is_reinvite_required(&self, media_list: &[MediaAttribute]) -> bool {
        if media_list.len() != self.rtp_streams.len() {
            return true;
        }
        media_list.iter().any(|attr| {
            match self
                .rtp_streams
                .iter()
                .find(|s| s.media_attr.label == attr.label)
            {
                None => true,
                Some(stream) => {
                    let current = &stream.media_attr;
                    current.enabled != attr.enabled
                        || (attr.media_type == MediaType::Video && current.muted != attr.muted)
                }
            }
        })
    }

    /// Whether a peer offer carries media we don't have.
    fn offer_changes_media(&self, remote_list: &[MediaAttribute]) -> bool {
        if remote_list.len() > self.rtp_streams.len() {
            return true;
        }
        remote_list
            .iter()
            .zip(&self.rtp_streams)
            .any(|(remote, local)| {
                remote.media_type != local.media_attr.media_type
                    || (remote.enabled && !local.media_attr.enabled)
            })
    }

    fn stop_all_media(&mut self) {
        for stream in &mut self.rtp_streams {
            stream.rtp_session.stop();
        }
    }

    // ── Outgoing call ───────────────────────────────────────────

    /// Offer `media_list` to the peer over `invite`.
    pub async fn start_outgoing(
        &mut self,
        invite: Arc<dyn InviteSession>,
        media_list: Vec<MediaAttribute>,
    ) -> Result<(), CallError> {
        if media_list.is_empty() {
            return Err(CallError::EmptyMediaList);
        }
        tracing::info!("[call:{}] Outgoing call with {} media", self.id, media_list.len());
        self.invite = Some(invite.clone());
        self.init_media_streams(&media_list);
        self.sdp.generate_media_ports()?;
        self.sdp.create_offer(&self.media_attribute_list())?;

        if self.config.ice_enabled {
            let count = self.sdp.local_session().map_or(0, |s| s.media.len());
            self.init_ice_media_transport(true, count)?;
            self.add_local_ice_attributes().await?;
        }

        let offer = self
            .sdp
            .local_session()
            .ok_or(CallError::Sdp(SdpError::NoActiveSession))?;
        invite.send_invite(offer)?;
        self.set_connection_state(ConnectionState::Progressing);
        self.set_media_state(MediaState::Negotiating);
        Ok(())
    }

    // ── Incoming call ───────────────────────────────────────────

    /// A peer INVITE arrived. Streams mirror the offered media until the
    /// client answers.
    pub fn on_incoming_call(
        &mut self,
        invite: Arc<dyn InviteSession>,
        offer: SdpSession,
    ) -> Result<(), CallError> {
        let mut media_list = Sdp::get_media_attribute_list_from_sdp(&offer, true);
        for attr in &mut media_list {
            attr.secure = self.config.secure;
            attr.muted = false;
            attr.on_hold = false;
        }
        tracing::info!("[call:{}] Incoming call with {} media", self.id, media_list.len());
        self.invite = Some(invite);
        self.init_media_streams(&media_list);
        self.sdp.set_received_offer(offer);
        self.sdp.generate_media_ports()?;
        self.set_connection_state(ConnectionState::Ringing);
        Ok(())
    }

    /// Accept the incoming call, optionally with a different media list.
    pub async fn answer(
        &mut self,
        media_list: Option<Vec<MediaAttribute>>,
    ) -> Result<(), CallError> {
        if self.state != CallState::Inactive {
            return Err(CallError::InvalidState(self.state));
        }
        let invite = self.invite()?;
        if invite.state().is_terminated() {
            return Err(CallError::Terminated);
        }
        if let Some(list) = media_list {
            self.update_all_media_streams(&list);
        }

        if let Err(e) = self.negotiate_incoming_offer().await {
            tracing::error!("[call:{}] Could not answer: {}", self.id, e);
            let _ = invite.answer(SIP_NOT_ACCEPTABLE_HERE, None);
            return Err(e);
        }

        let answer = self
            .sdp
            .local_sdp_to_send()
            .ok_or(CallError::Sdp(SdpError::NoActiveSession))?;
        invite.answer(SIP_OK, Some(answer))?;
        self.set_state(CallState::Active, ConnectionState::Connected, 0);
        self.media_negotiation_complete().await;
        Ok(())
    }

    /// Build our answer to the stored peer offer, with ICE when the peer
    /// offered it, and negotiate.
    async fn negotiate_incoming_offer(&mut self) -> Result<(), CallError> {
        self.sdp.process_incoming_offer(&self.media_attribute_list())?;

        let remote_has_ice = self
            .sdp
            .remote_session()
            .is_some_and(|s| !Sdp::ice_attributes_of(s).is_empty());
        if self.config.ice_enabled && remote_has_ice {
            let count = self.sdp.remote_session().map_or(0, |s| s.media.len());
            self.init_ice_media_transport(false, count)?;
            self.add_local_ice_attributes().await?;
        }
        self.sdp.start_negotiation()?;
        self.set_media_state(MediaState::Negotiating);
        Ok(())
    }

    // ── Renegotiation ───────────────────────────────────────────

    /// Client-driven media change (add, mute, replace source).
    pub async fn request_media_change(&mut self, media_list: &[MediaMap]) -> Result<(), CallError> {
        let list = build_media_attributes_list(media_list, self.config.secure);
        self.apply_media_change(list).await
    }

    async fn apply_media_change(
        &mut self,
        media_list: Vec<MediaAttribute>,
    ) -> Result<(), CallError> {
        if media_list.is_empty() {
            return Err(CallError::EmptyMediaList);
        }
        if self.state.is_terminal() {
            return Err(CallError::Terminated);
        }
        let required = self.is_reinvite_required(&media_list);
        self.update_all_media_streams(&media_list);
        if !required {
            tracing::debug!("[call:{}] Media change needs no re-invite", self.id);
            return Ok(());
        }
        self.reinvite_or_queue().await
    }

    pub async fn mute_media(&mut self, media_type: MediaType, mute: bool) -> Result<(), CallError> {
        let mut list = self.media_attribute_list();
        let mut found = false;
        for attr in list.iter_mut().filter(|a| a.media_type == media_type) {
            attr.muted = mute;
            found = true;
        }
        if !found {
            tracing::warn!("[call:{}] No {} media to mute", self.id, media_type);
            return Ok(());
        }
        self.apply_media_change(list).await
    }

    /// Replace the capture source of the video streams.
    pub async fn switch_input(&mut self, source: &str) -> Result<(), CallError> {
        for stream in &mut self.rtp_streams {
            if stream.media_attr.media_type == MediaType::Video {
                stream.media_attr.source_uri = source.to_string();
                stream.rtp_session.set_media_source(source);
            }
        }
        self.reinvite_or_queue().await
    }

    /// Whether the dialog can carry a re-INVITE right now.
    fn can_reinvite(&self) -> bool {
        self.invite
            .as_ref()
            .is_some_and(|i| i.state() == InviteState::Confirmed && !i.has_pending_reinvite())
    }

    /// Re-invite with the current media, or defer it until the running
    /// negotiation settles or the dialog is confirmed. Before the call is
    /// connected the next offer or answer carries the change.
    async fn reinvite_or_queue(&mut self) -> Result<(), CallError> {
        if !self.is_connected() {
            tracing::debug!("[call:{}] Not connected, no re-invite", self.id);
            return Ok(());
        }
        if self.waiting_for_ice_and_media || !self.can_reinvite() {
            tracing::debug!("[call:{}] Media change queued", self.id);
            self.queue_request(RemainingRequest::SwitchInput, None);
            return Ok(());
        }
        self.request_reinvite().await
    }

    async fn request_reinvite(&mut self) -> Result<(), CallError> {
        tracing::debug!("[call:{}] Sending re-invite to update media", self.id);
        let list = self.media_attribute_list();
        self.sip_session_reinvite(&list).await
    }

    /// Offer `media_list` in a re-INVITE.
    async fn sip_session_reinvite(
        &mut self,
        media_list: &[MediaAttribute],
    ) -> Result<(), CallError> {
        let invite = self.invite()?;
        if invite.state() != InviteState::Confirmed || invite.has_pending_reinvite() {
            tracing::debug!("[call:{}] Dialog not ready for a re-invite", self.id);
            return Err(CallError::DialogNotReady(invite.state()));
        }

        self.sdp.generate_media_ports()?;
        self.sdp.clear_ice();
        self.sdp.create_offer(media_list)?;

        if self.config.ice_enabled {
            let count = self.sdp.local_session().map_or(0, |s| s.media.len());
            let ice = self
                .init_ice_media_transport(true, count)
                .map_err(CallError::from);
            let ice = match ice {
                Ok(()) => self.add_local_ice_attributes().await,
                Err(e) => Err(e),
            };
            if let Err(e) = ice {
                tracing::error!("[call:{}] ICE setup for re-invite failed: {}", self.id, e);
                self.sdp.cancel_offer();
                self.drop_tmp_ice_transport();
                return Err(e);
            }
        }

        let offer = self
            .sdp
            .local_session()
            .ok_or(CallError::Sdp(SdpError::NoActiveSession))?;
        if let Err(e) = invite.send_reinvite(offer) {
            tracing::warn!("[call:{}] Re-invite failed: {}", self.id, e);
            invite.cancel_reinvite();
            self.sdp.cancel_offer();
            self.waiting_for_ice_and_media = false;
            self.drop_tmp_ice_transport();
            return Err(e.into());
        }
        self.reinvites += 1;
        self.waiting_for_ice_and_media = true;
        self.set_media_state(MediaState::Negotiating);
        Ok(())
    }

    /// Peer re-INVITE. Auto-answered unless it brings media we don't
    /// have, in which case the client decides.
    pub async fn on_reinvite_received(&mut self, offer: SdpSession) -> Result<(), CallError> {
        let invite = self.invite()?;
        if self.state.is_terminal() {
            let _ = invite.answer(SIP_REQUEST_TERMINATED, None);
            return Err(CallError::Terminated);
        }
        self.sdp.clear_ice();
        let remote_list = Sdp::get_media_attribute_list_from_sdp(&offer, false);
        self.sdp.set_received_offer(offer);

        if self.offer_changes_media(&remote_list) {
            tracing::info!("[call:{}] Peer requests a media change", self.id);
            self.emit(CallSignal::MediaChangeRequested(media_attributes_to_media_maps(
                &remote_list,
            )));
            return Ok(());
        }
        let current = self.media_attribute_list();
        self.answer_media_change_request(current).await
    }

    /// Answer a pending peer re-INVITE with `media_list`.
    pub async fn answer_media_change_request(
        &mut self,
        media_list: Vec<MediaAttribute>,
    ) -> Result<(), CallError> {
        let invite = self.invite()?;
        self.update_all_media_streams(&media_list);

        if let Err(e) = self.negotiate_incoming_offer().await {
            tracing::error!("[call:{}] Could not answer re-invite: {}", self.id, e);
            let _ = invite.answer(SIP_NOT_ACCEPTABLE_HERE, None);
            self.drop_tmp_ice_transport();
            return Err(e);
        }
        let answer = self
            .sdp
            .local_sdp_to_send()
            .ok_or(CallError::Sdp(SdpError::NoActiveSession))?;
        invite.answer(SIP_OK, Some(answer))?;
        self.media_negotiation_complete().await;
        Ok(())
    }

    /// Peer answered our pending offer.
    pub async fn on_answer_received(&mut self, answer: SdpSession) -> Result<(), CallError> {
        self.sdp.receive_answer(answer)?;
        self.sdp.start_negotiation()?;
        if self.state == CallState::Inactive {
            self.set_state(CallState::Active, ConnectionState::Connected, 0);
        }
        self.media_negotiation_complete().await;
        Ok(())
    }

    async fn on_reinvite_rejected(&mut self, code: u16) {
        tracing::warn!("[call:{}] Re-invite rejected with {}", self.id, code);
        self.sdp.cancel_offer();
        self.drop_tmp_ice_transport();
        self.waiting_for_ice_and_media = false;
        self.replay_remaining_request().await;
    }

    /// Negotiation round finished: start media directly, or once ICE
    /// connects.
    async fn media_negotiation_complete(&mut self) {
        if self.state.is_terminal()
            || self
                .invite
                .as_ref()
                .is_some_and(|i| i.state().is_terminated())
        {
            return;
        }
        let remote_ice = self.sdp.get_ice_attributes();
        if remote_ice.is_empty() || self.media_transport().is_none() {
            if self.tmp_ice_transport.is_some() {
                tracing::debug!("[call:{}] Peer has no ICE, using plain RTP", self.id);
                self.drop_tmp_ice_transport();
            }
            self.stop_all_media();
            self.start_all_media().await;
        } else {
            self.start_ice_media().await;
        }
    }

    // ── ICE ─────────────────────────────────────────────────────

    /// Transport of the current round: the pending one if any.
    fn media_transport(&self) -> Option<Arc<dyn IceTransport>> {
        self.tmp_ice_transport
            .clone()
            .or_else(|| self.ice_transport.clone())
    }

    fn init_ice_media_transport(
        &mut self,
        master: bool,
        media_count: usize,
    ) -> Result<(), IceError> {
        self.ice_generation += 1;
        let name = format!("{}:{}", self.id, self.ice_generation);
        let poster = self.poster.clone();
        let transport = name.clone();
        let sink: IceEventSink = Arc::new(move |event| {
            poster(CallEvent::Ice {
                transport: transport.clone(),
                event,
            })
        });
        let options = IceTransportOptions {
            component_count: media_count.max(1) * 2,
            master,
            bind_address: self.config.bind_address,
            stun_server: self.config.stun_server.clone(),
        };
        tracing::debug!(
            "[call:{}] Creating ICE transport {} ({} components, master={})",
            self.id,
            name,
            options.component_count,
            master
        );
        let ice = self.ice_factory.create(&name, options, sink)?;
        if let Some(old) = self.tmp_ice_transport.replace(ice) {
            shutdown_later(old);
        }
        Ok(())
    }

    /// Put the transport's credentials and candidates in the local SDP.
    async fn add_local_ice_attributes(&mut self) -> Result<(), CallError> {
        let Some(ice) = self.media_transport() else {
            return Ok(());
        };
        if !ice.wait_for_initialization(self.config.ice_init_timeout).await {
            tracing::error!("[call:{}] ICE {} did not initialize", self.id, ice.name());
            return Err(CallError::IceInitTimeout);
        }
        self.sdp.add_ice_attributes(&ice.local_attributes())?;

        let count = self.sdp.local_session().map_or(0, |s| s.media.len());
        for idx in 0..count {
            let rtp = (idx * 2 + 1) as u16;
            let candidates: Vec<String> = [rtp, rtp + 1]
                .into_iter()
                .flat_map(|comp| ice.local_candidates(comp))
                .map(|c| c.to_string())
                .collect();
            self.sdp.add_ice_candidates(idx, &candidates)?;
        }
        Ok(())
    }

    async fn start_ice_media(&mut self) {
        let Some(ice) = self.media_transport() else {
            return;
        };
        if ice.is_started() {
            return;
        }
        if !ice.is_initialized() {
            tracing::debug!("[call:{}] ICE not initialized yet, delaying start", self.id);
            self.wait_for_ice_init = true;
            return;
        }

        let remote = self.sdp.get_ice_attributes();
        let count = self
            .sdp
            .active_remote_session()
            .map_or(0, |s| s.media.len());
        let mut candidates = Vec::new();
        for idx in 0..count {
            for line in self.sdp.get_ice_candidates(idx) {
                match IceCandidate::from_str(&line) {
                    Ok(c) => candidates.push(c),
                    Err(e) => tracing::debug!("[call:{}] {}", self.id, e),
                }
            }
        }

        self.set_media_state(MediaState::IceNegotiating);
        if !ice.start_ice(&remote, candidates) {
            tracing::error!("[call:{}] ICE start failed", self.id);
            self.on_failure(EIO).await;
        }
    }

    async fn on_ice_nego_succeed(&mut self) {
        if let Some(tmp) = self.tmp_ice_transport.take() {
            tracing::debug!("[call:{}] ICE transport {} now carries media", self.id, tmp.name());
            if let Some(old) = self.ice_transport.replace(tmp) {
                shutdown_later(old);
            }
        }
        self.stop_all_media();
        self.start_all_media().await;
    }

    fn drop_tmp_ice_transport(&mut self) {
        self.wait_for_ice_init = false;
        if let Some(tmp) = self.tmp_ice_transport.take() {
            shutdown_later(tmp);
        }
    }

    fn is_current_transport(&self, name: &str) -> bool {
        [&self.tmp_ice_transport, &self.ice_transport]
            .into_iter()
            .flatten()
            .any(|t| t.name() == name)
    }

    // ── Media start ─────────────────────────────────────────────

    /// Configure every stream from the negotiated sessions and start them,
    /// then replay a request deferred during the negotiation.
    async fn start_all_media(&mut self) {
        let slots = self.sdp.get_media_slots();
        if slots.is_empty() {
            tracing::warn!("[call:{}] No negotiated media to start", self.id);
        }

        let ice = self.ice_transport.clone().filter(|t| t.is_running());
        let hold = self.state == CallState::Hold;
        let mtu = self.config.mtu;
        let mut usable = 0;
        let mut all_on_hold = true;

        for (idx, (local, remote)) in slots.iter().enumerate() {
            if local.media_type != remote.media_type {
                tracing::error!(
                    "[call:{}] Inconsistent media types between local and remote for media #{}",
                    self.id,
                    idx
                );
                continue;
            }
            if !local.enabled || !remote.enabled {
                tracing::debug!("[call:{}] Media #{} is disabled", self.id, idx);
                continue;
            }
            let Some(stream) = self
                .rtp_streams
                .iter_mut()
                .find(|s| s.media_attr.label == local.label)
            else {
                tracing::error!(
                    "[call:{}] No stream for media #{} ({})",
                    self.id,
                    idx,
                    local.label
                );
                continue;
            };
            if local.codec.is_none() || remote.codec.is_none() {
                tracing::warn!("[call:{}] Media #{} has no codec", self.id, idx);
                continue;
            }
            if stream.media_attr.secure && (local.crypto.is_none() || remote.crypto.is_none()) {
                tracing::error!("[call:{}] Secure media #{} without crypto", self.id, idx);
                continue;
            }

            usable += 1;
            all_on_hold &= remote.on_hold;
            let mut remote_attr = MediaAttribute::new(remote.media_type)
                .with_label(stream.media_attr.label.clone())
                .with_secure(remote.crypto.is_some())
                .with_muted(!remote.direction.is_send_capable());
            remote_attr.on_hold = remote.on_hold;
            stream.remote_media_attr = Some(remote_attr);

            let rtp = &mut stream.rtp_session;
            rtp.update_media(remote, local);
            rtp.set_mtu(mtu);
            rtp.set_muted(stream.media_attr.muted);
            rtp.set_media_source(&stream.media_attr.source_uri);

            if hold {
                continue;
            }
            let (rtp_socket, rtcp_socket) = match &ice {
                Some(transport) => {
                    let component = (idx * 2 + 1) as u16;
                    (
                        MediaSocket::Ice {
                            transport: transport.clone(),
                            component,
                        },
                        Some(MediaSocket::Ice {
                            transport: transport.clone(),
                            component: component + 1,
                        }),
                    )
                }
                None => {
                    let (Some(remote_rtp), Some(local_rtp)) = (remote.addr, local.addr) else {
                        tracing::error!("[call:{}] Media #{} has no address", self.id, idx);
                        continue;
                    };
                    (
                        MediaSocket::Udp {
                            local_port: local_rtp.port(),
                            remote: remote_rtp,
                        },
                        remote.rtcp_addr.map(|r| MediaSocket::Udp {
                            local_port: local_rtp.port() + 1,
                            remote: r,
                        }),
                    )
                }
            };
            if let Err(e) = rtp.start(rtp_socket, rtcp_socket) {
                tracing::error!("[call:{}] Failed to start media #{}: {}", self.id, idx, e);
            }
        }

        let peer_holding = usable > 0 && all_on_hold;
        if peer_holding != self.peer_holding {
            self.peer_holding = peer_holding;
            self.emit(CallSignal::PeerHold(peer_holding));
        }
        self.set_media_state(if hold {
            MediaState::Held
        } else {
            MediaState::MediaActive
        });
        self.emit(CallSignal::MediaNegotiated(media_attributes_to_media_maps(
            &self.media_attribute_list(),
        )));

        self.waiting_for_ice_and_media = false;
        self.replay_remaining_request().await;
    }

    async fn replay_remaining_request(&mut self) {
        let request = mem::take(&mut self.remaining_request);
        match request {
            RemainingRequest::NoRequest => {}
            RemainingRequest::HoldOn => {
                tracing::debug!("[call:{}] Replaying queued hold", self.id);
                let cb = self.hold_cb.take();
                self.hold(cb).await;
            }
            RemainingRequest::HoldOff => {
                tracing::debug!("[call:{}] Replaying queued unhold", self.id);
                let cb = self.hold_cb.take();
                self.unhold(cb).await;
            }
            RemainingRequest::SwitchInput => {
                tracing::debug!("[call:{}] Replaying queued media change", self.id);
                if let Err(e) = self.reinvite_or_queue().await {
                    tracing::warn!("[call:{}] Queued re-invite failed: {}", self.id, e);
                }
            }
        }
    }

    // ── Hold ────────────────────────────────────────────────────

    pub async fn hold(&mut self, cb: Option<HoldCallback>) -> bool {
        if self.waiting_for_ice_and_media {
            tracing::debug!("[call:{}] Hold queued until media is up", self.id);
            self.queue_request(RemainingRequest::HoldOn, cb);
            return true;
        }
        if self.state != CallState::Active {
            tracing::warn!("[call:{}] Cannot hold in state {}", self.id, self.state);
            notify(cb, false);
            return false;
        }
        if self.is_connected() && !self.can_reinvite() {
            tracing::debug!("[call:{}] Hold queued until the dialog is confirmed", self.id);
            self.queue_request(RemainingRequest::HoldOn, cb);
            return true;
        }

        self.set_call_state(CallState::Hold);
        self.set_media_state(MediaState::HoldRequested);
        for stream in &mut self.rtp_streams {
            stream.media_attr.on_hold = true;
        }
        self.stop_all_media();

        let mut ok = true;
        if self.is_connected() {
            if let Err(e) = self.request_reinvite().await {
                tracing::warn!("[call:{}] Hold re-invite failed: {}", self.id, e);
                ok = false;
            }
        }
        notify(cb, ok);
        ok
    }

    pub async fn unhold(&mut self, cb: Option<HoldCallback>) -> bool {
        if self.waiting_for_ice_and_media {
            tracing::debug!("[call:{}] Unhold queued until media is up", self.id);
            self.queue_request(RemainingRequest::HoldOff, cb);
            return true;
        }
        if self.state != CallState::Hold {
            tracing::warn!("[call:{}] Cannot unhold in state {}", self.id, self.state);
            notify(cb, false);
            return false;
        }
        if self.is_connected() && !self.can_reinvite() {
            tracing::debug!("[call:{}] Unhold queued until the dialog is confirmed", self.id);
            self.queue_request(RemainingRequest::HoldOff, cb);
            return true;
        }

        for stream in &mut self.rtp_streams {
            stream.media_attr.on_hold = false;
        }
        self.set_call_state(CallState::Active);

        let mut ok = true;
        if self.is_connected() {
            if let Err(e) = self.request_reinvite().await {
                tracing::warn!("[call:{}] Unhold re-invite failed, holding again: {}", self.id, e);
                ok = false;
            }
        }
        if !ok {
            if self.waiting_for_ice_and_media {
                self.queue_request(RemainingRequest::HoldOn, None);
            } else {
                self.hold(None).await;
            }
        }
        notify(cb, ok);
        ok
    }

    /// Keep `request` for later. It replaces any queued one, whose hold
    /// callback is told it failed.
    fn queue_request(&mut self, request: RemainingRequest, cb: Option<HoldCallback>) {
        self.remaining_request = request;
        if let Some(previous) = mem::replace(&mut self.hold_cb, cb) {
            previous(false);
        }
    }

    // ── Teardown ────────────────────────────────────────────────

    pub async fn hangup(&mut self, code: u16) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("[call:{}] Hanging up ({})", self.id, code);
        self.terminate_invite(code);
        self.terminate_media().await;
        self.set_state(CallState::Over, ConnectionState::Disconnected, i32::from(code));
    }

    /// Decline an incoming call.
    pub async fn refuse(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Inactive {
            return Err(CallError::InvalidState(self.state));
        }
        self.hangup(SIP_DECLINE).await;
        Ok(())
    }

    pub async fn peer_hungup(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("[call:{}] Peer hung up", self.id);
        self.terminate_media().await;
        self.set_state(CallState::Over, ConnectionState::Disconnected, 0);
    }

    pub async fn peer_busy(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("[call:{}] Peer is busy", self.id);
        self.terminate_media().await;
        self.set_state(
            CallState::Busy,
            ConnectionState::Disconnected,
            i32::from(SIP_BUSY_HERE),
        );
    }

    /// End the call with an error cause.
    pub async fn on_failure(&mut self, cause: i32) {
        if self.state.is_terminal() {
            return;
        }
        tracing::error!("[call:{}] Call failed (cause {})", self.id, cause);
        self.terminate_invite(SIP_REQUEST_TERMINATED);
        self.terminate_media().await;
        self.set_state(CallState::Error, ConnectionState::Disconnected, cause);
    }

    fn terminate_invite(&self, code: u16) {
        if let Some(invite) = &self.invite {
            if let Err(e) = invite.terminate(code) {
                tracing::warn!("[call:{}] Failed to terminate dialog: {}", self.id, e);
            }
        }
    }

    async fn terminate_media(&mut self) {
        self.stop_all_media();
        self.waiting_for_ice_and_media = false;
        self.wait_for_ice_init = false;
        self.remaining_request = RemainingRequest::NoRequest;
        notify(self.hold_cb.take(), false);
        for ice in [self.tmp_ice_transport.take(), self.ice_transport.take()]
            .into_iter()
            .flatten()
        {
            ice.shutdown().await;
        }
        self.sdp.release_ports();
        self.set_media_state(MediaState::Terminated);
    }

    // ── Events ──────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Ice { transport, event } => {
                if !self.is_current_transport(&transport) {
                    tracing::trace!(
                        "[call:{}] Ignoring {:?} from stale {}",
                        self.id,
                        event,
                        transport
                    );
                    return;
                }
                self.on_ice_event(event).await;
            }
            CallEvent::InviteStateChanged(state) => self.on_invite_state_changed(state).await,
            CallEvent::OfferReceived(offer) => {
                if let Err(e) = self.on_reinvite_received(offer).await {
                    tracing::warn!("[call:{}] Re-invite handling failed: {}", self.id, e);
                }
            }
            CallEvent::AnswerReceived(answer) => {
                if let Err(e) = self.on_answer_received(answer).await {
                    tracing::error!("[call:{}] Negotiation failed: {}", self.id, e);
                    self.on_failure(e.failure_code()).await;
                }
            }
            CallEvent::ReinviteRejected(code) => self.on_reinvite_rejected(code).await,
            CallEvent::PeerHungup => self.peer_hungup().await,
            CallEvent::PeerBusy => self.peer_busy().await,
        }
    }

    async fn on_ice_event(&mut self, event: IceEvent) {
        match event {
            IceEvent::InitDone(true) => {
                if mem::take(&mut self.wait_for_ice_init) {
                    self.start_ice_media().await;
                }
            }
            IceEvent::InitDone(false) => {
                if mem::take(&mut self.wait_for_ice_init) {
                    self.on_failure(EIO).await;
                }
            }
            IceEvent::NegoDone(true) => self.on_ice_nego_succeed().await,
            IceEvent::NegoDone(false) => {
                tracing::error!("[call:{}] ICE negotiation failed", self.id);
                self.on_failure(EIO).await;
            }
        }
    }

    async fn on_invite_state_changed(&mut self, state: InviteState) {
        match state {
            InviteState::Early => self.set_connection_state(ConnectionState::Ringing),
            InviteState::Connecting => {
                if self.state == CallState::Inactive {
                    self.set_connection_state(ConnectionState::Connected);
                }
            }
            InviteState::Confirmed => {
                if self.state == CallState::Inactive {
                    self.set_connection_state(ConnectionState::Connected);
                }
                if !self.waiting_for_ice_and_media {
                    self.replay_remaining_request().await;
                }
            }
            InviteState::Disconnected => self.peer_hungup().await,
            InviteState::Null | InviteState::Calling | InviteState::Incoming => {}
        }
    }
}

impl Drop for SipCall {
    fn drop(&mut self) {
        for ice in [self.tmp_ice_transport.take(), self.ice_transport.take()]
            .into_iter()
            .flatten()
        {
            shutdown_later(ice);
        }
    }
}

fn notify(cb: Option<HoldCallback>, ok: bool) {
    if let Some(cb) = cb {
        cb(ok);
    }
}

/// Shut a transport down without blocking the call.
fn shutdown_later(ice: Arc<dyn IceTransport>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { ice.shutdown().await });
        }
        Err(_) => tracing::debug!("No runtime to shut down ICE transport {}", ice.name()),
    }
}
