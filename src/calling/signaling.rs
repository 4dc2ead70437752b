//! SIP invite session seen from a call.
//!
//! The call never touches SIP transactions directly: it asks an
//! [`InviteSession`] to send offers and answers, and learns about peer
//! messages through events posted on its queue. [`LoopbackInviteSession`]
//! carries messages over a channel, for in-process calls and tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use super::sdp_session::SdpSession;

pub const SIP_OK: u16 = 200;
pub const SIP_BUSY_HERE: u16 = 486;
pub const SIP_REQUEST_TERMINATED: u16 = 487;
pub const SIP_NOT_ACCEPTABLE_HERE: u16 = 488;
pub const SIP_DECLINE: u16 = 603;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invite session is terminated")]
    Terminated,

    #[error("a re-invite is already pending")]
    TransactionPending,

    #[error("cannot send {0} in state {1:?}")]
    InvalidState(&'static str, InviteState),

    #[error("failed to send {0}")]
    SendFailed(&'static str),
}

/// Invite dialog state (RFC 3261 §13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Null,
    Calling,
    Incoming,
    Early,
    Connecting,
    Confirmed,
    Disconnected,
}

impl InviteState {
    pub fn is_terminated(self) -> bool {
        self == InviteState::Disconnected
    }
}

/// Messages exchanged by two loopback sessions.
#[derive(Debug, Clone)]
pub enum SipMessage {
    Invite { sdp: String },
    Reinvite { sdp: String },
    /// Final response to an INVITE or re-INVITE.
    Response { code: u16, sdp: Option<String> },
    Ack,
    Bye,
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Invite { .. } => f.write_str("INVITE"),
            SipMessage::Reinvite { .. } => f.write_str("re-INVITE"),
            SipMessage::Response { code, .. } => write!(f, "{} response", code),
            SipMessage::Ack => f.write_str("ACK"),
            SipMessage::Bye => f.write_str("BYE"),
        }
    }
}

/// What a call needs from its SIP dialog.
pub trait InviteSession: Send + Sync {
    fn state(&self) -> InviteState;

    /// Initial INVITE carrying our offer.
    fn send_invite(&self, offer: &SdpSession) -> Result<(), SignalingError>;

    /// In-dialog re-INVITE carrying a new offer.
    fn send_reinvite(&self, offer: &SdpSession) -> Result<(), SignalingError>;

    /// Final response to the pending (re-)INVITE.
    fn answer(&self, code: u16, sdp: Option<&SdpSession>) -> Result<(), SignalingError>;

    /// BYE when confirmed, otherwise a final error response.
    fn terminate(&self, code: u16) -> Result<(), SignalingError>;

    /// Forget a re-INVITE whose send failed or was abandoned.
    fn cancel_reinvite(&self);

    fn has_pending_reinvite(&self) -> bool;
}

/// Invite session writing its messages to a channel.
pub struct LoopbackInviteSession {
    name: String,
    state: Mutex<InviteState>,
    pending_reinvite: AtomicBool,
    fail_sends: AtomicBool,
    tx: mpsc::UnboundedSender<SipMessage>,
}

impl LoopbackInviteSession {
    pub fn new(name: &str, initial: InviteState) -> (Self, mpsc::UnboundedReceiver<SipMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            name: name.to_string(),
            state: Mutex::new(initial),
            pending_reinvite: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            tx,
        };
        (session, rx)
    }

    /// Update the dialog state from a received message.
    pub fn set_state(&self, state: InviteState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("[sip:{}] {:?} -> {:?}", self.name, *current, state);
            *current = state;
        }
    }

    /// The peer answered our re-INVITE.
    pub fn reinvite_completed(&self) {
        self.pending_reinvite.store(false, Ordering::SeqCst);
    }

    /// Acknowledge a 2xx final response.
    pub fn send_ack(&self) -> Result<(), SignalingError> {
        self.send("ACK", SipMessage::Ack)
    }

    /// Make every following send fail, to exercise recovery paths.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn send(&self, what: &'static str, msg: SipMessage) -> Result<(), SignalingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            tracing::warn!("[sip:{}] Dropping {} (send failure injected)", self.name, msg);
            return Err(SignalingError::SendFailed(what));
        }
        tracing::debug!("[sip:{}] Sending {}", self.name, msg);
        self.tx.send(msg).map_err(|_| SignalingError::SendFailed(what))
    }
}

impl InviteSession for LoopbackInviteSession {
    fn state(&self) -> InviteState {
        *self.state.lock()
    }

    fn send_invite(&self, offer: &SdpSession) -> Result<(), SignalingError> {
        let state = self.state();
        if state != InviteState::Null {
            return Err(SignalingError::InvalidState("INVITE", state));
        }
        self.send(
            "INVITE",
            SipMessage::Invite {
                sdp: offer.to_string(),
            },
        )?;
        self.set_state(InviteState::Calling);
        Ok(())
    }

    fn send_reinvite(&self, offer: &SdpSession) -> Result<(), SignalingError> {
        let state = self.state();
        if state.is_terminated() {
            return Err(SignalingError::Terminated);
        }
        if state != InviteState::Confirmed {
            return Err(SignalingError::InvalidState("re-INVITE", state));
        }
        if self.pending_reinvite.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::TransactionPending);
        }
        let sent = self.send(
            "re-INVITE",
            SipMessage::Reinvite {
                sdp: offer.to_string(),
            },
        );
        if sent.is_err() {
            self.pending_reinvite.store(false, Ordering::SeqCst);
        }
        sent
    }

    fn answer(&self, code: u16, sdp: Option<&SdpSession>) -> Result<(), SignalingError> {
        let state = self.state();
        if state.is_terminated() {
            return Err(SignalingError::Terminated);
        }
        self.send(
            "response",
            SipMessage::Response {
                code,
                sdp: sdp.map(ToString::to_string),
            },
        )?;
        // A 2xx to the initial INVITE waits for the ACK
        match code {
            200..=299 if state != InviteState::Confirmed => {
                self.set_state(InviteState::Connecting)
            }
            200..=299 => {}
            300..=699 if state != InviteState::Confirmed => {
                self.set_state(InviteState::Disconnected)
            }
            _ => {}
        }
        Ok(())
    }

    fn terminate(&self, code: u16) -> Result<(), SignalingError> {
        let state = self.state();
        let result = match state {
            InviteState::Disconnected => return Ok(()),
            InviteState::Incoming | InviteState::Early => self.send(
                "response",
                SipMessage::Response { code, sdp: None },
            ),
            _ => self.send("BYE", SipMessage::Bye),
        };
        self.set_state(InviteState::Disconnected);
        result
    }

    fn cancel_reinvite(&self) {
        if self.pending_reinvite.swap(false, Ordering::SeqCst) {
            tracing::debug!("[sip:{}] Re-INVITE cancelled", self.name);
        }
    }

    fn has_pending_reinvite(&self) -> bool {
        self.pending_reinvite.load(Ordering::SeqCst)
    }
}
