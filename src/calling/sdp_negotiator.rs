//! RFC 3264 offer/answer negotiator.
//!
//! The negotiator only tracks which side offered and where the exchange
//! stands. The sessions themselves are owned by [`super::sdp::Sdp`] and handed
//! in at each step, so attributes added to the local session after the offer
//! was built (ICE credentials, candidates) are part of the negotiated result.
//!
//! ```text
//!   with_local_offer ──► LocalOffer ──set_remote_answer──► WaitNego ──negotiate──► Done
//!   with_remote_offer ─► RemoteOffer ─set_local_answer───► WaitNego
//! ```

use super::codec::TELEPHONE_EVENT_NAME;
use super::sdp_session::{
    MediaDirection, SdpError, SdpMedia, SdpSession, MAX_MEDIA,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegoState {
    LocalOffer,
    RemoteOffer,
    WaitNego,
    Done,
}

#[derive(Debug, Clone)]
pub struct SdpNegotiator {
    state: NegoState,
    local_is_offerer: bool,
}

impl SdpNegotiator {
    /// Start an exchange where we send the offer.
    pub fn with_local_offer(local: &SdpSession) -> Result<Self, SdpError> {
        local.validate()?;
        Ok(Self {
            state: NegoState::LocalOffer,
            local_is_offerer: true,
        })
    }

    /// Start an exchange answering a peer offer.
    pub fn with_remote_offer(remote: &SdpSession) -> Result<Self, SdpError> {
        check_remote(remote)?;
        Ok(Self {
            state: NegoState::RemoteOffer,
            local_is_offerer: false,
        })
    }

    pub fn state(&self) -> NegoState {
        self.state
    }

    pub fn local_is_offerer(&self) -> bool {
        self.local_is_offerer
    }

    pub fn set_local_answer(&mut self, local: &SdpSession) -> Result<(), SdpError> {
        if self.state != NegoState::RemoteOffer {
            return Err(SdpError::InvalidState(format!("{:?}", self.state)));
        }
        local.validate()?;
        self.state = NegoState::WaitNego;
        Ok(())
    }

    pub fn set_remote_answer(&mut self, remote: &SdpSession) -> Result<(), SdpError> {
        if self.state != NegoState::LocalOffer {
            return Err(SdpError::InvalidState(format!("{:?}", self.state)));
        }
        check_remote(remote)?;
        self.state = NegoState::WaitNego;
        Ok(())
    }

    /// Abandon a pending local offer.
    pub fn cancel_offer(&mut self) {
        if self.state == NegoState::LocalOffer {
            self.state = NegoState::Done;
        }
    }

    /// Run the negotiation. Returns the active (local, remote) sessions.
    pub fn negotiate(
        &mut self,
        local: &SdpSession,
        remote: &SdpSession,
    ) -> Result<(SdpSession, SdpSession), SdpError> {
        if self.state != NegoState::WaitNego {
            return Err(SdpError::InvalidState(format!("{:?}", self.state)));
        }
        let result = if self.local_is_offerer {
            negotiate_as_offerer(local, remote).map(|active| (active, remote.clone()))
        } else {
            negotiate_as_answerer(remote, local).map(|active| (active, remote.clone()))
        };
        // A failed negotiation also ends the exchange
        self.state = NegoState::Done;
        result
    }
}

fn check_remote(remote: &SdpSession) -> Result<(), SdpError> {
    if remote.media.len() > MAX_MEDIA {
        return Err(SdpError::TooManyMedia(remote.media.len()));
    }
    if remote.media.is_empty() {
        return Err(SdpError::Validation("remote session has no media".into()));
    }
    Ok(())
}

fn is_telephone_event(m: &SdpMedia, fmt: &str) -> bool {
    m.rtpmap(fmt)
        .map(|r| r.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT_NAME))
        .unwrap_or(false)
}

fn formats_match(a: &SdpMedia, a_fmt: &str, b: &SdpMedia, b_fmt: &str) -> bool {
    match (a.rtpmap(a_fmt), b.rtpmap(b_fmt)) {
        (Some(ra), Some(rb)) => {
            ra.encoding.eq_ignore_ascii_case(&rb.encoding) && ra.clock_rate == rb.clock_rate
        }
        // Static payload types may omit rtpmap
        _ => a_fmt == b_fmt && a_fmt.parse::<u8>().map(|pt| pt < 96).unwrap_or(false),
    }
}

fn rejected(template: &SdpMedia) -> SdpMedia {
    let mut m = template.clone();
    m.deactivate();
    m
}

/// Build the active local answer from the peer offer and our capabilities.
///
/// Media are paired by index. A pair is rejected (port 0) when either side is
/// disabled, the types or transports differ, or no codec is common.
fn negotiate_as_answerer(offer: &SdpSession, local: &SdpSession) -> Result<SdpSession, SdpError> {
    let mut answer = local.clone();
    answer.media.clear();
    let mut accepted = 0;

    for (i, om) in offer.media.iter().enumerate() {
        let Some(lm) = local.media.get(i) else {
            answer.media.push(rejected(om));
            continue;
        };
        if om.port == 0
            || lm.port == 0
            || om.media != lm.media
            || om.is_secure_transport() != lm.is_secure_transport()
        {
            tracing::debug!("Rejecting media #{} ({})", i, om.media);
            answer.media.push(rejected(lm));
            continue;
        }

        let mut am = lm.clone();
        am.formats.clear();
        am.attributes
            .retain(|a| a.name != "rtpmap" && a.name != "fmtp");
        let mut has_codec = false;

        for ofmt in &om.formats {
            let Some(lfmt) = lm
                .formats
                .iter()
                .find(|lfmt| formats_match(om, ofmt, lm, lfmt))
            else {
                continue;
            };
            if am.formats.contains(ofmt) {
                continue;
            }
            if !is_telephone_event(om, ofmt) {
                has_codec = true;
            }
            am.formats.push(ofmt.clone());
            if let Some(rtpmap) = lm.find_attr_with_fmt("rtpmap", lfmt) {
                let mut attr = rtpmap.clone();
                attr.value = Some(replace_fmt(rtpmap.value_str(), ofmt));
                am.add_attr(attr);
            }
            if let Some(fmtp) = lm.find_attr_with_fmt("fmtp", lfmt) {
                let mut attr = fmtp.clone();
                attr.value = Some(replace_fmt(fmtp.value_str(), ofmt));
                am.add_attr(attr);
            }
        }

        if !has_codec {
            tracing::debug!("No common codec for media #{} ({})", i, om.media);
            answer.media.push(rejected(lm));
            continue;
        }

        am.set_direction(MediaDirection::answer_to(om.direction(), lm.direction()));
        answer.media.push(am);
        accepted += 1;
    }

    if accepted == 0 {
        return Err(SdpError::Negotiation("no media accepted".into()));
    }
    Ok(answer)
}

/// Reduce our offer to what the peer accepted.
fn negotiate_as_offerer(offer: &SdpSession, answer: &SdpSession) -> Result<SdpSession, SdpError> {
    if offer.media.len() != answer.media.len() {
        return Err(SdpError::Negotiation(format!(
            "answer has {} media, offer had {}",
            answer.media.len(),
            offer.media.len()
        )));
    }

    let mut active = offer.clone();
    let mut accepted = 0;

    for (lm, am) in active.media.iter_mut().zip(answer.media.iter()) {
        if lm.port == 0 || am.port == 0 || lm.media != am.media {
            lm.deactivate();
            continue;
        }
        let source = lm.clone();
        lm.formats
            .retain(|fmt| am.formats.iter().any(|afmt| formats_match(&source, fmt, am, afmt)));
        for fmt in &source.formats {
            if !lm.formats.contains(fmt) {
                lm.remove_attr_with_fmt("rtpmap", fmt);
                lm.remove_attr_with_fmt("fmtp", fmt);
            }
        }
        if lm.formats.iter().all(|fmt| is_telephone_event(lm, fmt)) {
            lm.deactivate();
            continue;
        }
        accepted += 1;
    }

    if accepted == 0 {
        return Err(SdpError::Negotiation("peer rejected all media".into()));
    }
    Ok(active)
}

fn replace_fmt(value: &str, fmt: &str) -> String {
    match value.split_once(' ') {
        Some((_, rest)) => format!("{} {}", fmt, rest),
        None => fmt.to_string(),
    }
}
