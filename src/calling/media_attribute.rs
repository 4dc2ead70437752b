//! Media attributes: the desired state of one logical media stream.
//!
//! The client API exchanges media as flat string maps ("media maps"). This
//! module converts between those maps and the typed `MediaAttribute` used by
//! the SDP engine and the call state machine.

use std::collections::HashMap;
use std::fmt;

/// Media kind carried by one SDP media section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    Audio,
    Video,
    #[default]
    None,
}

impl MediaType {
    /// SDP media token (`m=<token> ...`).
    pub fn as_sdp_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::None => "none",
        }
    }

    /// Parse an SDP media token. Unknown tokens map to `None`.
    pub fn from_sdp_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("audio") {
            MediaType::Audio
        } else if s.eq_ignore_ascii_case("video") {
            MediaType::Video
        } else {
            MediaType::None
        }
    }

    /// Value used in media maps (`MEDIA_TYPE_AUDIO` / `MEDIA_TYPE_VIDEO`).
    pub fn as_map_value(self) -> &'static str {
        match self {
            MediaType::Audio => values::AUDIO,
            MediaType::Video => values::VIDEO,
            MediaType::None => values::NONE,
        }
    }

    pub fn from_map_value(s: &str) -> Self {
        match s {
            values::AUDIO => MediaType::Audio,
            values::VIDEO => MediaType::Video,
            _ => MediaType::None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sdp_str())
    }
}

/// Generic string-keyed media description exchanged with the client layer.
pub type MediaMap = HashMap<String, String>;

/// Media map keys.
pub mod keys {
    pub const MEDIA_TYPE: &str = "MEDIA_TYPE";
    pub const LABEL: &str = "LABEL";
    pub const ENABLED: &str = "ENABLED";
    pub const MUTED: &str = "MUTED";
    pub const SOURCE: &str = "SOURCE";
    pub const ON_HOLD: &str = "ON_HOLD";
}

/// Media map values.
pub mod values {
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const AUDIO: &str = "MEDIA_TYPE_AUDIO";
    pub const VIDEO: &str = "MEDIA_TYPE_VIDEO";
    pub const NONE: &str = "MEDIA_TYPE_NONE";
}

/// Canonical string form of a boolean in media maps.
pub fn bool_to_str(val: bool) -> &'static str {
    if val {
        values::TRUE
    } else {
        values::FALSE
    }
}

/// Desired state of one media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttribute {
    pub media_type: MediaType,
    pub muted: bool,
    /// SRTP (SDES) required for this media.
    pub secure: bool,
    /// `false` means the media is not offered.
    pub enabled: bool,
    pub on_hold: bool,
    /// Capture source identifier (opaque).
    pub source_uri: String,
    /// Identifies the stream across renegotiations.
    pub label: String,
}

impl Default for MediaAttribute {
    fn default() -> Self {
        Self {
            media_type: MediaType::None,
            muted: false,
            secure: true,
            enabled: true,
            on_hold: false,
            source_uri: String::new(),
            label: String::new(),
        }
    }
}

impl MediaAttribute {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_uri = source.into();
        self
    }

    /// Build an attribute from a media map.
    ///
    /// Missing keys keep their default. Values that are not a valid boolean or
    /// media type are logged and ignored; this never fails.
    pub fn from_media_map(map: &MediaMap, secure: bool) -> Self {
        let mut attr = Self {
            secure,
            ..Self::default()
        };

        if let Some(media_type) = get_media_type(map) {
            attr.media_type = media_type;
        }
        if let Some(muted) = get_bool_value(map, keys::MUTED) {
            attr.muted = muted;
        }
        if let Some(enabled) = get_bool_value(map, keys::ENABLED) {
            attr.enabled = enabled;
        }
        if let Some(on_hold) = get_bool_value(map, keys::ON_HOLD) {
            attr.on_hold = on_hold;
        }
        if let Some(source) = map.get(keys::SOURCE) {
            attr.source_uri = source.clone();
        }
        if let Some(label) = map.get(keys::LABEL) {
            attr.label = label.clone();
        }
        attr
    }

    /// Serialize to a media map. All six keys are always present.
    pub fn to_media_map(&self) -> MediaMap {
        let mut map = MediaMap::with_capacity(6);
        map.insert(
            keys::MEDIA_TYPE.into(),
            self.media_type.as_map_value().into(),
        );
        map.insert(keys::LABEL.into(), self.label.clone());
        map.insert(keys::ENABLED.into(), bool_to_str(self.enabled).into());
        map.insert(keys::MUTED.into(), bool_to_str(self.muted).into());
        map.insert(keys::SOURCE.into(), self.source_uri.clone());
        map.insert(keys::ON_HOLD.into(), bool_to_str(self.on_hold).into());
        map
    }

    /// Copy every field from `src` except the label.
    pub fn update_from(&mut self, src: &MediaAttribute) {
        self.media_type = src.media_type;
        self.muted = src.muted;
        self.secure = src.secure;
        self.enabled = src.enabled;
        self.on_hold = src.on_hold;
        self.source_uri = src.source_uri.clone();
    }
}

impl fmt::Display for MediaAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] type={} enabled={} muted={} on_hold={} secure={} source={:?}",
            self.label,
            self.media_type,
            self.enabled,
            self.muted,
            self.on_hold,
            self.secure,
            self.source_uri
        )
    }
}

fn get_media_type(map: &MediaMap) -> Option<MediaType> {
    let Some(value) = map.get(keys::MEDIA_TYPE) else {
        tracing::warn!("[{}] key not found in media map", keys::MEDIA_TYPE);
        return None;
    };
    match MediaType::from_map_value(value) {
        MediaType::None => {
            tracing::error!("Invalid value [{}] for key {}", value, keys::MEDIA_TYPE);
            None
        }
        media_type => Some(media_type),
    }
}

fn get_bool_value(map: &MediaMap, key: &str) -> Option<bool> {
    let value = map.get(key)?;
    match value.as_str() {
        values::TRUE => Some(true),
        values::FALSE => Some(false),
        other => {
            tracing::error!("Invalid boolean value [{}] for key {}", other, key);
            None
        }
    }
}

/// Convert media maps to attributes, preserving order.
pub fn build_media_attributes_list(media_list: &[MediaMap], secure: bool) -> Vec<MediaAttribute> {
    media_list
        .iter()
        .map(|map| MediaAttribute::from_media_map(map, secure))
        .collect()
}

/// Inverse of [`build_media_attributes_list`].
pub fn media_attributes_to_media_maps(attrs: &[MediaAttribute]) -> Vec<MediaMap> {
    attrs.iter().map(MediaAttribute::to_media_map).collect()
}

pub fn has_media_type(attrs: &[MediaAttribute], media_type: MediaType) -> bool {
    attrs.iter().any(|a| a.media_type == media_type)
}

/// Label assigned to media derived from SDP: `<type>_<index within type>`.
pub fn generate_label(media_type: MediaType, index: usize) -> String {
    format!("{}_{}", media_type.as_sdp_str(), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> MediaMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_media_map() {
        let m = map(&[
            (keys::MEDIA_TYPE, values::VIDEO),
            (keys::LABEL, "video_0"),
            (keys::ENABLED, "true"),
            (keys::MUTED, "true"),
            (keys::SOURCE, "camera://0"),
            (keys::ON_HOLD, "false"),
        ]);
        let attr = MediaAttribute::from_media_map(&m, true);
        assert_eq!(attr.media_type, MediaType::Video);
        assert_eq!(attr.label, "video_0");
        assert!(attr.enabled);
        assert!(attr.muted);
        assert!(!attr.on_hold);
        assert!(attr.secure);
        assert_eq!(attr.source_uri, "camera://0");
    }

    #[test]
    fn test_invalid_bool_keeps_default() {
        let m = map(&[
            (keys::MEDIA_TYPE, values::AUDIO),
            (keys::MUTED, "yes"),
            (keys::ENABLED, "0"),
        ]);
        let attr = MediaAttribute::from_media_map(&m, false);
        assert_eq!(attr.media_type, MediaType::Audio);
        assert!(!attr.muted);
        assert!(attr.enabled);
        assert!(!attr.secure);
    }

    #[test]
    fn test_invalid_media_type_is_none() {
        let m = map(&[(keys::MEDIA_TYPE, "MEDIA_TYPE_TEXT")]);
        let attr = MediaAttribute::from_media_map(&m, true);
        assert_eq!(attr.media_type, MediaType::None);
    }

    #[test]
    fn test_media_map_roundtrip() {
        let m = map(&[
            (keys::MEDIA_TYPE, values::AUDIO),
            (keys::LABEL, "main audio"),
            (keys::ENABLED, "true"),
            (keys::MUTED, "false"),
            (keys::SOURCE, ""),
            (keys::ON_HOLD, "true"),
        ]);
        let back = MediaAttribute::from_media_map(&m, true).to_media_map();
        assert_eq!(back, m);
    }

    #[test]
    fn test_to_media_map_emits_all_keys() {
        let out = MediaAttribute::new(MediaType::Video).to_media_map();
        for key in [
            keys::MEDIA_TYPE,
            keys::LABEL,
            keys::ENABLED,
            keys::MUTED,
            keys::SOURCE,
            keys::ON_HOLD,
        ] {
            assert!(out.contains_key(key), "missing {}", key);
        }
        assert_eq!(out[keys::ENABLED], "true");
        assert_eq!(out[keys::MUTED], "false");
    }

    #[test]
    fn test_list_conversion_preserves_order() {
        let list = vec![
            map(&[(keys::MEDIA_TYPE, values::VIDEO), (keys::LABEL, "v")]),
            map(&[(keys::MEDIA_TYPE, values::AUDIO), (keys::LABEL, "a")]),
        ];
        let attrs = build_media_attributes_list(&list, true);
        assert_eq!(attrs[0].label, "v");
        assert_eq!(attrs[1].label, "a");
        assert!(has_media_type(&attrs, MediaType::Audio));
        assert!(!has_media_type(&attrs[..1], MediaType::Audio));

        let maps = media_attributes_to_media_maps(&attrs);
        assert_eq!(maps[0][keys::MEDIA_TYPE], values::VIDEO);
        assert_eq!(maps[1][keys::LABEL], "a");
    }

    #[test]
    fn test_update_from_keeps_label() {
        let mut a = MediaAttribute::new(MediaType::Audio).with_label("keep");
        let b = MediaAttribute::new(MediaType::Audio)
            .with_label("other")
            .with_muted(true)
            .with_source("file://x.wav");
        a.update_from(&b);
        assert_eq!(a.label, "keep");
        assert!(a.muted);
        assert_eq!(a.source_uri, "file://x.wav");
    }
}
