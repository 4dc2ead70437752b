//! Loopback call test: two calls in one process, wired back to back.
//!
//! Each side gets a [`LoopbackInviteSession`]; a router task per direction
//! turns the SIP messages one side sends into events for the other, the way
//! a SIP stack would. Media flow is only set up, not exercised.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::calling::call_actor::CallHandle;
use crate::calling::ice::UdpIceTransportFactory;
use crate::calling::media_attribute::{
    media_attributes_to_media_maps, MediaAttribute, MediaMap, MediaType,
};
use crate::calling::ports::PortReservation;
use crate::calling::sdp_session::SdpSession;
use crate::calling::signaling::{
    InviteSession, InviteState, LoopbackInviteSession, SipMessage, SIP_BUSY_HERE, SIP_OK,
};
use crate::calling::sip_call::{CallConfig, CallEvent, CallSignal, CallSnapshot};
use crate::calling::{CallState, ConnectionState};

/// How long to wait for each negotiation step.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CallTestOptions {
    /// How long to keep the call up once media started.
    pub duration: Duration,
    pub video: bool,
    /// Put the call on hold and back once connected.
    pub hold: bool,
    /// Media offered by the caller. Overrides `video` when set.
    pub media: Option<Vec<MediaMap>>,
    /// Media the callee answers with; `None` accepts the offer as is.
    pub answer_media: Option<Vec<MediaMap>>,
    /// Callee declines the call instead of answering.
    pub refuse: bool,
    /// Caller mutes its video once connected.
    pub mute_video: bool,
    /// Caller switches its video input once connected.
    pub switch_input: Option<String>,
    /// Callee adds a video stream once connected and the caller accepts it.
    pub add_video: bool,
}

impl Default for CallTestOptions {
    fn default() -> Self {
        Self {
            duration: Duration::ZERO,
            video: false,
            hold: false,
            media: None,
            answer_media: None,
            refuse: false,
            mute_video: false,
            switch_input: None,
            add_video: false,
        }
    }
}

/// Result of a call test.
#[derive(Debug)]
pub struct CallTestResult {
    pub call_answered: bool,
    pub hold_ok: Option<bool>,
    pub unhold_ok: Option<bool>,
    pub callee_saw_peer_hold: bool,
    /// Each side's SRTP keys mirror the other's on every running stream.
    pub srtp_keys_match: bool,
    pub caller: CallSnapshot,
    pub callee: CallSnapshot,
}

/// One side of the loopback, as seen from the router.
#[derive(Clone)]
struct Peer {
    handle: CallHandle,
    invite: Arc<LoopbackInviteSession>,
}

/// Carry every message one side sends to the peer `to`.
fn spawn_router(mut from: mpsc::UnboundedReceiver<SipMessage>, to: Peer) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = from.recv().await {
            tracing::debug!("[loopback] {} -> {}", msg, to.handle.id());
            match msg {
                SipMessage::Invite { sdp } => {
                    let Some(offer) = parse(&sdp) else { continue };
                    to.invite.set_state(InviteState::Incoming);
                    if let Err(e) = to.handle.incoming(to.invite.clone(), offer).await {
                        tracing::error!("[loopback] {} refused the INVITE: {}", to.handle.id(), e);
                    }
                }
                SipMessage::Reinvite { sdp } => {
                    if let Some(offer) = parse(&sdp) {
                        to.handle.post(CallEvent::OfferReceived(offer));
                    }
                }
                SipMessage::Response { code, sdp } => {
                    let reinvite = to.invite.state() == InviteState::Confirmed;
                    match code {
                        200..=299 => {
                            to.invite.set_state(InviteState::Confirmed);
                            to.invite.reinvite_completed();
                            if let Err(e) = to.invite.send_ack() {
                                tracing::warn!(
                                    "[loopback] {} could not ACK: {}",
                                    to.handle.id(),
                                    e
                                );
                            }
                            if let Some(answer) = sdp.as_deref().and_then(parse) {
                                to.handle.post(CallEvent::AnswerReceived(answer));
                            }
                        }
                        _ if reinvite => {
                            to.invite.reinvite_completed();
                            to.handle.post(CallEvent::ReinviteRejected(code));
                        }
                        SIP_BUSY_HERE => {
                            to.invite.set_state(InviteState::Disconnected);
                            to.handle.post(CallEvent::PeerBusy);
                        }
                        _ => {
                            to.invite.set_state(InviteState::Disconnected);
                            to.handle.post(CallEvent::PeerHungup);
                        }
                    }
                }
                SipMessage::Ack => {
                    to.invite.set_state(InviteState::Confirmed);
                    to.handle.post(CallEvent::InviteStateChanged(InviteState::Confirmed));
                }
                SipMessage::Bye => {
                    to.invite.set_state(InviteState::Disconnected);
                    to.handle.post(CallEvent::InviteStateChanged(InviteState::Disconnected));
                }
            }
        }
    })
}

fn parse(sdp: &str) -> Option<SdpSession> {
    match SdpSession::parse(sdp) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("[loopback] Dropping message with bad SDP: {}", e);
            None
        }
    }
}

/// Wait for the first signal matching `pred`, dropping the others.
async fn wait_for(
    signals: &mut mpsc::UnboundedReceiver<CallSignal>,
    what: &str,
    pred: impl Fn(&CallSignal) -> bool,
) -> Result<CallSignal> {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, signals.recv()).await {
            Ok(Some(signal)) if pred(&signal) => return Ok(signal),
            Ok(Some(signal)) => tracing::trace!("[loopback] skipping {:?}", signal),
            Ok(None) => anyhow::bail!("Call ended while waiting for {}", what),
            Err(_) => anyhow::bail!("Timeout waiting for {} ({}s)", what, STEP_TIMEOUT.as_secs()),
        }
    }
}

fn is_state(signal: &CallSignal, state: CallState) -> bool {
    matches!(signal, CallSignal::StateChanged { call_state, .. } if *call_state == state)
}

fn is_negotiated(signal: &CallSignal) -> bool {
    matches!(signal, CallSignal::MediaNegotiated(_))
}

/// Whether both sides derived mirrored SRTP keys for every stream the caller
/// runs.
fn srtp_keys_agree(caller: &CallSnapshot, callee: &CallSnapshot) -> bool {
    let mut checked = 0;
    for stream in caller.streams.iter().filter(|s| s.running) {
        let peer = callee.streams.iter().find(|p| p.label == stream.label);
        let (Some(ours), Some(theirs)) = (&stream.srtp, peer.and_then(|p| p.srtp.as_ref())) else {
            return false;
        };
        let mirrored = ours.suite == theirs.suite
            && ours.local_rtp == theirs.remote_rtp
            && ours.local_rtcp == theirs.remote_rtcp
            && ours.remote_rtp == theirs.local_rtp
            && ours.remote_rtcp == theirs.local_rtcp;
        if !mirrored {
            return false;
        }
        checked += 1;
    }
    checked > 0
}

fn default_media(video: bool) -> Vec<MediaMap> {
    let mut attrs = vec![MediaAttribute::new(MediaType::Audio).with_label("audio_0")];
    if video {
        attrs.push(MediaAttribute::new(MediaType::Video).with_label("video_0"));
    }
    media_attributes_to_media_maps(&attrs)
}

/// Place a call between two in-process endpoints and report what each saw.
pub async fn run_call_test(
    config: &CallConfig,
    options: CallTestOptions,
) -> Result<CallTestResult> {
    let ports = Arc::new(PortReservation::new());
    let factory = Arc::new(UdpIceTransportFactory);

    let (caller, mut caller_signals, _caller_task) =
        CallHandle::spawn("caller", config.clone(), ports.clone(), factory.clone());
    let (callee, mut callee_signals, _callee_task) =
        CallHandle::spawn("callee", config.clone(), ports.clone(), factory);

    let (caller_invite, caller_rx) = LoopbackInviteSession::new("caller", InviteState::Null);
    let (callee_invite, callee_rx) = LoopbackInviteSession::new("callee", InviteState::Null);
    let caller_invite = Arc::new(caller_invite);
    let callee_invite = Arc::new(callee_invite);

    let caller_peer = Peer {
        handle: caller.clone(),
        invite: caller_invite.clone(),
    };
    let callee_peer = Peer {
        handle: callee.clone(),
        invite: callee_invite,
    };
    let routers = [
        spawn_router(caller_rx, callee_peer),
        spawn_router(callee_rx, caller_peer),
    ];

    let media = options
        .media
        .clone()
        .unwrap_or_else(|| default_media(options.video));
    tracing::info!("Calling with {} media", media.len());
    caller
        .start_outgoing(caller_invite as Arc<dyn InviteSession>, media)
        .await
        .context("Failed to place call")?;

    wait_for(&mut callee_signals, "incoming call", |s| {
        matches!(
            s,
            CallSignal::StateChanged {
                connection_state: ConnectionState::Ringing,
                ..
            }
        )
    })
    .await?;

    if options.refuse {
        callee.refuse().await.context("Callee failed to refuse")?;
        wait_for(&mut caller_signals, "caller hangup", |s| is_state(s, CallState::Over)).await?;
        let (caller_snapshot, callee_snapshot) =
            futures::future::try_join(caller.snapshot(), callee.snapshot()).await?;
        for router in routers {
            router.abort();
        }
        return Ok(CallTestResult {
            call_answered: false,
            hold_ok: None,
            unhold_ok: None,
            callee_saw_peer_hold: false,
            srtp_keys_match: false,
            caller: caller_snapshot,
            callee: callee_snapshot,
        });
    }

    callee
        .answer(options.answer_media.clone())
        .await
        .context("Callee failed to answer")?;

    let call_answered = wait_for(&mut caller_signals, "caller media", |s| {
        is_negotiated(s) || is_state(s, CallState::Error)
    })
    .await
    .map(|s| is_negotiated(&s))?;
    wait_for(&mut callee_signals, "callee media", is_negotiated).await?;

    let mut hold_ok = None;
    let mut unhold_ok = None;
    let mut callee_saw_peer_hold = false;
    if call_answered && options.hold {
        hold_ok = Some(caller.hold().await?);
        callee_saw_peer_hold =
            wait_for(&mut callee_signals, "peer hold", |s| *s == CallSignal::PeerHold(true))
                .await
                .is_ok();
        // Let the hold round settle before asking for the opposite
        wait_for(&mut caller_signals, "caller held media", is_negotiated).await?;
        unhold_ok = Some(caller.unhold().await?);
        wait_for(&mut callee_signals, "peer resume", |s| {
            *s == CallSignal::PeerHold(false)
        })
        .await?;
        wait_for(&mut caller_signals, "caller resumed media", is_negotiated).await?;
    }

    if call_answered && options.mute_video {
        let snapshot = caller.snapshot().await?;
        anyhow::ensure!(
            snapshot.streams.iter().any(|s| s.media_type == MediaType::Video),
            "Nothing to mute: the call has no video"
        );
        caller.mute_media(MediaType::Video, true).await?;
        wait_for(&mut callee_signals, "callee media after mute", is_negotiated).await?;
        wait_for(&mut caller_signals, "caller media after mute", is_negotiated).await?;
    }

    if call_answered {
        if let Some(source) = &options.switch_input {
            caller.switch_input(source).await?;
            wait_for(&mut callee_signals, "callee media after switch", is_negotiated).await?;
            wait_for(&mut caller_signals, "caller media after switch", is_negotiated).await?;
        }
    }

    if call_answered && options.add_video {
        callee.request_media_change(default_media(true)).await?;
        let signal = wait_for(&mut caller_signals, "media change request", |s| {
            matches!(s, CallSignal::MediaChangeRequested(_))
        })
        .await?;
        let CallSignal::MediaChangeRequested(requested) = signal else {
            anyhow::bail!("Unexpected signal while waiting for a media change");
        };
        caller.answer_media_change_request(requested).await?;
        wait_for(&mut caller_signals, "caller media with video", is_negotiated).await?;
        wait_for(&mut callee_signals, "callee media with video", is_negotiated).await?;
    }

    if !options.duration.is_zero() {
        tokio::time::sleep(options.duration).await;
    }

    let (caller_snapshot, callee_snapshot) =
        futures::future::try_join(caller.snapshot(), callee.snapshot()).await?;

    caller.hangup(SIP_OK);
    wait_for(&mut callee_signals, "callee hangup", |s| is_state(s, CallState::Over)).await?;
    for router in routers {
        router.abort();
    }

    Ok(CallTestResult {
        call_answered,
        hold_ok,
        unhold_ok,
        callee_saw_peer_hold,
        srtp_keys_match: srtp_keys_agree(&caller_snapshot, &callee_snapshot),
        caller: caller_snapshot,
        callee: callee_snapshot,
    })
}

/// Print a result as `key=value` lines.
pub fn print_result(result: &CallTestResult) {
    println!("call_answered={}", result.call_answered);
    println!("srtp_keys_match={}", result.srtp_keys_match);
    if let Some(ok) = result.hold_ok {
        println!("hold_ok={}", ok);
        println!("callee_saw_peer_hold={}", result.callee_saw_peer_hold);
    }
    if let Some(ok) = result.unhold_ok {
        println!("unhold_ok={}", ok);
    }
    for (side, snap) in [("caller", &result.caller), ("callee", &result.callee)] {
        println!("{}_state={}", side, snap.state);
        println!("{}_ice={}", side, snap.ice_running);
        println!("{}_reinvites={}", side, snap.reinvites);
        for stream in &snap.streams {
            println!(
                "{}_stream={} type={} ssrc={:08x} running={} sending={} secure={} remote={}",
                side,
                stream.label,
                stream.media_type,
                stream.ssrc,
                stream.running,
                stream.sending,
                stream.secure,
                stream
                    .remote
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".into())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media_attribute::keys;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config(ice: bool) -> CallConfig {
        CallConfig {
            ice_enabled: ice,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            published_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..CallConfig::default()
        }
    }

    #[tokio::test]
    async fn test_audio_call_without_ice() {
        let result = run_call_test(&loopback_config(false), CallTestOptions::default())
            .await
            .unwrap();
        assert!(result.call_answered);
        assert_eq!(result.caller.state, CallState::Active);
        assert_eq!(result.callee.state, CallState::Active);
        assert!(result.caller.streams[0].running);
        assert!(result.caller.streams[0].secure);
        assert!(!result.caller.ice_running);
        assert!(result.srtp_keys_match);
        assert_ne!(result.caller.streams[0].ssrc, result.callee.streams[0].ssrc);
    }

    #[tokio::test]
    async fn test_refused_call() {
        let options = CallTestOptions {
            refuse: true,
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(false), options).await.unwrap();
        assert!(!result.call_answered);
        assert_eq!(result.caller.state, CallState::Over);
        assert_eq!(result.callee.state, CallState::Over);
        assert!(result.caller.streams.iter().all(|s| !s.running));
    }

    #[tokio::test]
    async fn test_video_mute_and_input_switch() {
        let options = CallTestOptions {
            video: true,
            mute_video: true,
            switch_input: Some("camera://second".into()),
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(false), options).await.unwrap();
        assert_eq!(result.caller.reinvites, 2);
        assert_eq!(result.callee.reinvites, 0);
        let video = &result.caller.streams[1];
        assert_eq!(video.media_type, MediaType::Video);
        assert!(video.muted);
        assert!(video.running);
        assert!(result.srtp_keys_match);
    }

    #[tokio::test]
    async fn test_peer_adds_video() {
        let options = CallTestOptions {
            add_video: true,
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(false), options).await.unwrap();
        assert_eq!(result.callee.reinvites, 1);
        assert_eq!(result.caller.reinvites, 0);
        assert_eq!(result.caller.streams.len(), 2);
        assert!(result.caller.streams.iter().all(|s| s.running));
        assert!(result.callee.streams.iter().all(|s| s.running));
        assert!(result.srtp_keys_match);
    }

    #[tokio::test]
    async fn test_video_offer_answered_audio_only() {
        let mut answer = default_media(true);
        answer[1].insert(keys::ENABLED.into(), "false".into());
        let options = CallTestOptions {
            video: true,
            answer_media: Some(answer),
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(false), options).await.unwrap();

        assert!(result.call_answered);
        let caller = &result.caller.streams;
        assert_eq!(caller.len(), 2);
        assert!(caller[0].running);
        assert!(!caller[1].running);
        let callee = &result.callee.streams;
        assert!(callee[0].running);
        assert!(!callee[1].running);
    }

    #[tokio::test]
    async fn test_hold_round_trip() {
        let options = CallTestOptions {
            hold: true,
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(false), options).await.unwrap();
        assert_eq!(result.hold_ok, Some(true));
        assert!(result.callee_saw_peer_hold);
        assert_eq!(result.unhold_ok, Some(true));
        assert_eq!(result.caller.state, CallState::Active);
        assert_eq!(result.caller.reinvites, 2);
        assert!(result.caller.streams[0].running);
        assert!(!result.callee.peer_holding);
    }

    #[tokio::test]
    async fn test_audio_video_call_with_ice() {
        let options = CallTestOptions {
            video: true,
            ..CallTestOptions::default()
        };
        let result = run_call_test(&loopback_config(true), options).await.unwrap();
        assert!(result.call_answered);
        assert!(result.caller.ice_running);
        assert!(result.callee.ice_running);
        assert!(result.caller.streams.iter().all(|s| s.running && s.remote.is_some()));
    }
}
