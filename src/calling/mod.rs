//! Call media negotiation: SDP offer/answer, ICE, and the per-call state
//! machine that ties them to RTP sessions.

pub mod call_actor;
pub mod call_test;
pub mod codec;
pub mod ice;
pub mod media_attribute;
pub mod ports;
pub mod rtp_session;
pub mod sdes;
pub mod sdp;
pub mod sdp_negotiator;
pub mod sdp_session;
pub mod signaling;
pub mod sip_call;
pub mod stun;

use std::fmt;

/// Call lifecycle state as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Inactive,
    Active,
    Hold,
    Busy,
    Error,
    Over,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Busy | CallState::Error | CallState::Over)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Inactive => "INACTIVE",
            CallState::Active => "ACTIVE",
            CallState::Hold => "HOLD",
            CallState::Busy => "BUSY",
            CallState::Error => "ERROR",
            CallState::Over => "OVER",
        };
        f.write_str(s)
    }
}

/// Signaling connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Trying,
    Progressing,
    Ringing,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Trying => "TRYING",
            ConnectionState::Progressing => "PROGRESSING",
            ConnectionState::Ringing => "RINGING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// Where the media of a call stands.
///
/// ```text
/// Idle ─► Negotiating ─► IceNegotiating ─► MediaActive ◄─► HoldRequested ─► Held
///                 └──────────────────────────┘                     ... ─► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaState {
    #[default]
    Idle,
    Negotiating,
    IceNegotiating,
    MediaActive,
    HoldRequested,
    Held,
    Terminated,
}
