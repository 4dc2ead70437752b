//! Locally supported codecs.
//!
//! The order of each list is the local preference order used when building
//! SDP format lists. Video payload types are dynamic and assigned from 96 in
//! list order; audio codecs use their static RFC 3551 numbers except Opus.

use super::media_attribute::MediaType;

/// First dynamic RTP payload type.
pub const DYNAMIC_PAYLOAD_BASE: u8 = 96;

/// Telephone-event (DTMF) payload type appended to every audio section.
pub const TELEPHONE_EVENT_PAYLOAD: u8 = 101;
pub const TELEPHONE_EVENT_NAME: &str = "telephone-event";
pub const TELEPHONE_EVENT_CLOCK_RATE: u32 = 8000;
/// fmtp value for the telephone-event format (events 0-15).
pub const TELEPHONE_EVENT_EVENTS: &str = "0-15";

/// H.264 constrained baseline, level 5.2, non-interleaved packetization.
pub const H264_DEFAULT_FMTP: &str = "profile-level-id=42e034;packetization-mode=1";

/// One codec as configured for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCodecInfo {
    pub name: String,
    pub media_type: MediaType,
    pub payload_type: u8,
    /// Rate the codec runs at internally.
    pub clock_rate: u32,
    pub channels: u8,
    /// fmtp parameters, empty when none.
    pub parameters: String,
}

impl AccountCodecInfo {
    fn audio(name: &str, payload_type: u8, clock_rate: u32, channels: u8) -> Self {
        Self {
            name: name.to_string(),
            media_type: MediaType::Audio,
            payload_type,
            clock_rate,
            channels,
            parameters: String::new(),
        }
    }

    fn video(name: &str, parameters: &str) -> Self {
        Self {
            name: name.to_string(),
            media_type: MediaType::Video,
            payload_type: 0,
            clock_rate: 90000,
            channels: 0,
            parameters: parameters.to_string(),
        }
    }

    /// G.722 samples at 16 kHz but RFC 3551 fixes its RTP clock at 8 kHz.
    pub fn is_g722(&self) -> bool {
        self.name.eq_ignore_ascii_case("G722")
    }

    /// Clock rate advertised in `a=rtpmap`.
    pub fn sdp_clock_rate(&self) -> u32 {
        if self.is_g722() {
            8000
        } else {
            self.clock_rate
        }
    }

    /// `a=rtpmap` value without the payload type prefix, e.g. `opus/48000/2`.
    pub fn rtpmap_encoding(&self) -> String {
        if self.media_type == MediaType::Audio && self.channels > 1 {
            format!("{}/{}/{}", self.name, self.sdp_clock_rate(), self.channels)
        } else {
            format!("{}/{}", self.name, self.sdp_clock_rate())
        }
    }

    /// Whether this codec matches an rtpmap encoding name and clock rate.
    ///
    /// Compares against the advertised rate, so G.722 only matches 8000.
    /// Video codecs match by name alone.
    pub fn matches_rtpmap(&self, name: &str, clock_rate: u32) -> bool {
        if !self.name.eq_ignore_ascii_case(name) {
            return false;
        }
        self.media_type == MediaType::Video || clock_rate == self.sdp_clock_rate()
    }
}

/// All codecs this build knows about, in default preference order.
pub fn system_codecs() -> Vec<AccountCodecInfo> {
    vec![
        AccountCodecInfo::audio("opus", 111, 48000, 2),
        AccountCodecInfo::audio("G722", 9, 16000, 1),
        AccountCodecInfo::audio("PCMU", 0, 8000, 1),
        AccountCodecInfo::audio("PCMA", 8, 8000, 1),
        AccountCodecInfo::video("H264", H264_DEFAULT_FMTP),
        AccountCodecInfo::video("VP8", ""),
        AccountCodecInfo::video("H265", ""),
    ]
}

pub fn default_audio_codecs() -> Vec<AccountCodecInfo> {
    codecs_by_name(&[], MediaType::Audio, false)
}

pub fn default_video_codecs(hardware_acceleration: bool) -> Vec<AccountCodecInfo> {
    codecs_by_name(&[], MediaType::Video, hardware_acceleration)
}

/// Select codecs of one media type in the order given by `names`.
///
/// An empty `names` selects every system codec of that type. Unknown names are
/// skipped with a warning. H265 is only kept with hardware acceleration.
pub fn codecs_by_name(
    names: &[String],
    media_type: MediaType,
    hardware_acceleration: bool,
) -> Vec<AccountCodecInfo> {
    let system: Vec<AccountCodecInfo> = system_codecs()
        .into_iter()
        .filter(|c| c.media_type == media_type)
        .collect();

    let mut selected: Vec<AccountCodecInfo> = if names.is_empty() {
        system
    } else {
        names
            .iter()
            .filter_map(|name| {
                let found = system.iter().find(|c| c.name.eq_ignore_ascii_case(name));
                if found.is_none() {
                    tracing::warn!("Unknown {} codec '{}' in configuration", media_type, name);
                }
                found.cloned()
            })
            .collect()
    };

    if media_type == MediaType::Video {
        selected = filter_hardware_codecs(selected, hardware_acceleration);
        assign_dynamic_payloads(&mut selected);
    }
    selected
}

/// Drop H265 unless hardware acceleration is enabled.
pub fn filter_hardware_codecs(
    codecs: Vec<AccountCodecInfo>,
    hardware_acceleration: bool,
) -> Vec<AccountCodecInfo> {
    if hardware_acceleration {
        return codecs;
    }
    codecs
        .into_iter()
        .filter(|c| !c.name.eq_ignore_ascii_case("H265"))
        .collect()
}

fn assign_dynamic_payloads(codecs: &mut [AccountCodecInfo]) {
    for (i, codec) in codecs.iter_mut().enumerate() {
        codec.payload_type = DYNAMIC_PAYLOAD_BASE + i as u8;
    }
}
