//! Per-call task.
//!
//! Every operation on a [`SipCall`] goes through one tokio task fed by an
//! unbounded channel: client commands from [`CallHandle`] and network events
//! posted by ICE transports or the SIP layer are handled strictly in order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::ice::IceTransportFactory;
use super::media_attribute::{build_media_attributes_list, MediaAttribute, MediaMap, MediaType};
use super::ports::PortReservation;
use super::sdp_session::SdpSession;
use super::signaling::InviteSession;
use super::sip_call::{
    CallConfig, CallError, CallEvent, CallSignal, CallSnapshot, EventPoster, SipCall,
};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Commands processed by the call task.
pub enum CallCommand {
    StartOutgoing {
        invite: Arc<dyn InviteSession>,
        media: Vec<MediaAttribute>,
        reply: Reply<()>,
    },
    Incoming {
        invite: Arc<dyn InviteSession>,
        offer: SdpSession,
        reply: Reply<()>,
    },
    Answer {
        media: Option<Vec<MediaMap>>,
        reply: Reply<()>,
    },
    Hangup(u16),
    Refuse(Reply<()>),
    Hold(oneshot::Sender<bool>),
    Unhold(oneshot::Sender<bool>),
    MuteMedia {
        media_type: MediaType,
        mute: bool,
        reply: Reply<()>,
    },
    SwitchInput {
        source: String,
        reply: Reply<()>,
    },
    RequestMediaChange {
        media: Vec<MediaMap>,
        reply: Reply<()>,
    },
    AnswerMediaChangeRequest {
        media: Vec<MediaMap>,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<CallSnapshot>),
    Event(CallEvent),
}

/// Cloneable handle to a running call task.
#[derive(Clone)]
pub struct CallHandle {
    id: String,
    secure: bool,
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    /// Start the task of a new call.
    ///
    /// Returns the handle, the client signal stream and the task. The task
    /// ends once every handle is dropped.
    pub fn spawn(
        id: &str,
        config: CallConfig,
        ports: Arc<PortReservation>,
        ice_factory: Arc<dyn IceTransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<CallSignal>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        // Weak so that posted events don't keep the task alive
        let weak = tx.downgrade();
        let poster: EventPoster = Arc::new(move |event| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(CallCommand::Event(event));
            }
        });

        let secure = config.secure;
        let call = SipCall::new(id, config, ports, ice_factory, signal_tx, poster);
        let task = tokio::spawn(call_loop(call, rx));
        let handle = Self {
            id: id.to_string(),
            secure,
            tx,
        };
        (handle, signal_rx, task)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, cmd: CallCommand) -> Result<(), CallError> {
        self.tx.send(cmd).map_err(|_| {
            tracing::error!("[call:{}] Call task gone, command dropped", self.id);
            CallError::Closed
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    /// Post a network event.
    pub fn post(&self, event: CallEvent) {
        let _ = self.send(CallCommand::Event(event));
    }

    pub async fn start_outgoing(
        &self,
        invite: Arc<dyn InviteSession>,
        media: Vec<MediaMap>,
    ) -> Result<(), CallError> {
        let media = build_media_attributes_list(&media, self.secure);
        self.request(|reply| CallCommand::StartOutgoing {
            invite,
            media,
            reply,
        })
        .await
    }

    pub async fn incoming(
        &self,
        invite: Arc<dyn InviteSession>,
        offer: SdpSession,
    ) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Incoming {
            invite,
            offer,
            reply,
        })
        .await
    }

    pub async fn answer(&self, media: Option<Vec<MediaMap>>) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Answer { media, reply }).await
    }

    pub fn hangup(&self, code: u16) {
        let _ = self.send(CallCommand::Hangup(code));
    }

    pub async fn refuse(&self) -> Result<(), CallError> {
        self.request(CallCommand::Refuse).await
    }

    /// Resolves when the hold completes, which may be after a pending
    /// renegotiation.
    pub async fn hold(&self) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallCommand::Hold(tx))?;
        rx.await.map_err(|_| CallError::Closed)
    }

    pub async fn unhold(&self) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallCommand::Unhold(tx))?;
        rx.await.map_err(|_| CallError::Closed)
    }

    pub async fn mute_media(&self, media_type: MediaType, mute: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::MuteMedia {
            media_type,
            mute,
            reply,
        })
        .await
    }

    pub async fn switch_input(&self, source: &str) -> Result<(), CallError> {
        let source = source.to_string();
        self.request(|reply| CallCommand::SwitchInput { source, reply })
            .await
    }

    pub async fn request_media_change(&self, media: Vec<MediaMap>) -> Result<(), CallError> {
        self.request(|reply| CallCommand::RequestMediaChange { media, reply })
            .await
    }

    pub async fn answer_media_change_request(&self, media: Vec<MediaMap>) -> Result<(), CallError> {
        self.request(|reply| CallCommand::AnswerMediaChangeRequest { media, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallCommand::Snapshot(tx))?;
        rx.await.map_err(|_| CallError::Closed)
    }
}

async fn call_loop(mut call: SipCall, mut rx: mpsc::UnboundedReceiver<CallCommand>) {
    tracing::debug!("[call:{}] Task started", call.id());

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CallCommand::StartOutgoing {
                invite,
                media,
                reply,
            } => {
                let result = call.start_outgoing(invite, media).await;
                if let Some(e) = result.as_ref().err().filter(|e| e.is_fatal()) {
                    tracing::error!("[call:{}] Outgoing call failed: {}", call.id(), e);
                    call.on_failure(e.failure_code()).await;
                }
                let _ = reply.send(result);
            }
            CallCommand::Incoming {
                invite,
                offer,
                reply,
            } => {
                let _ = reply.send(call.on_incoming_call(invite, offer));
            }
            CallCommand::Answer { media, reply } => {
                let media = media.map(|m| build_media_attributes_list(&m, call_secure(&call)));
                let result = call.answer(media).await;
                if let Some(e) = result.as_ref().err().filter(|e| e.is_fatal()) {
                    call.on_failure(e.failure_code()).await;
                }
                let _ = reply.send(result);
            }
            CallCommand::Hangup(code) => call.hangup(code).await,
            CallCommand::Refuse(reply) => {
                let _ = reply.send(call.refuse().await);
            }
            CallCommand::Hold(reply) => {
                call.hold(Some(Box::new(move |ok| {
                    let _ = reply.send(ok);
                })))
                .await;
            }
            CallCommand::Unhold(reply) => {
                call.unhold(Some(Box::new(move |ok| {
                    let _ = reply.send(ok);
                })))
                .await;
            }
            CallCommand::MuteMedia {
                media_type,
                mute,
                reply,
            } => {
                let _ = reply.send(call.mute_media(media_type, mute).await);
            }
            CallCommand::SwitchInput { source, reply } => {
                let _ = reply.send(call.switch_input(&source).await);
            }
            CallCommand::RequestMediaChange { media, reply } => {
                let _ = reply.send(call.request_media_change(&media).await);
            }
            CallCommand::AnswerMediaChangeRequest { media, reply } => {
                let media = build_media_attributes_list(&media, call_secure(&call));
                let _ = reply.send(call.answer_media_change_request(media).await);
            }
            CallCommand::Snapshot(reply) => {
                let _ = reply.send(call.snapshot());
            }
            CallCommand::Event(event) => call.handle_event(event).await,
        }
    }

    tracing::debug!("[call:{}] Task finished", call.id());
}

fn call_secure(call: &SipCall) -> bool {
    call.config().secure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::ice::UdpIceTransportFactory;
    use crate::calling::media_attribute::{keys, values};
    use crate::calling::signaling::{InviteState, LoopbackInviteSession, SipMessage};
    use crate::calling::CallState;

    fn config() -> CallConfig {
        CallConfig {
            ice_enabled: false,
            ..CallConfig::default()
        }
    }

    fn audio_map() -> MediaMap {
        [
            (keys::MEDIA_TYPE, values::AUDIO),
            (keys::LABEL, "audio_0"),
            (keys::ENABLED, values::TRUE),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn test_commands_are_serialized() {
        let ports = Arc::new(PortReservation::new());
        let (call, _signals, _task) =
            CallHandle::spawn("t1", config(), ports.clone(), Arc::new(UdpIceTransportFactory));
        let (invite, mut sip) = LoopbackInviteSession::new("t1", InviteState::Null);

        tokio_test::assert_ok!(call.start_outgoing(Arc::new(invite), vec![audio_map()]).await);
        assert!(matches!(sip.try_recv().unwrap(), SipMessage::Invite { .. }));
        assert_eq!(ports.len(), 2);

        // Not answered yet
        assert!(!call.hold().await.unwrap());
        let snap = call.snapshot().await.unwrap();
        assert_eq!(snap.state, CallState::Inactive);
        assert_eq!(snap.streams.len(), 1);

        call.hangup(487);
        let snap = call.snapshot().await.unwrap();
        assert_eq!(snap.state, CallState::Over);
        assert!(ports.is_empty());
    }

    #[tokio::test]
    async fn test_task_ends_with_last_handle() {
        let ports = Arc::new(PortReservation::new());
        let (call, _signals, task) =
            CallHandle::spawn("t2", config(), ports, Arc::new(UdpIceTransportFactory));
        let other = call.clone();
        drop(call);
        tokio_test::assert_ok!(other.snapshot().await);
        drop(other);
        task.await.unwrap();
    }
}
