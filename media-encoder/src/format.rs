use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_HEVC: &str = "video/hevc";
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIME_AUDIO_OPUS: &str = "audio/opus";

/// Format keys understood by codecs and container writers.
pub mod keys {
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const BIT_RATE: &str = "bitrate";
    pub const BITRATE_MODE: &str = "bitrate-mode";
    pub const FRAME_RATE: &str = "frame-rate";
    pub const I_FRAME_INTERVAL: &str = "i-frame-interval";
    pub const COLOR_FORMAT: &str = "color-format";
    pub const SAMPLE_RATE: &str = "sample-rate";
    pub const CHANNEL_COUNT: &str = "channel-count";
    pub const AAC_PROFILE: &str = "aac-profile";
    pub const MAX_INPUT_SIZE: &str = "max-input-size";
    /// Raw `AVPixelFormat` value the encoder consumes.
    pub const PIXEL_FORMAT: &str = "pixel-format";
    /// Codec specific data (SPS/PPS, AudioSpecificConfig, ...).
    pub const CSD_0: &str = "csd-0";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with("video/") {
            Some(TrackKind::Video)
        } else if mime.starts_with("audio/") {
            Some(TrackKind::Audio)
        } else {
            None
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => f.write_str("video"),
            TrackKind::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormatValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
}

/// Mime type plus typed key/value parameters describing a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaFormat {
    mime: String,
    entries: BTreeMap<String, FormatValue>,
}

impl MediaFormat {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: mime.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn video(mime: &str, width: i32, height: i32) -> Self {
        let mut format = Self::new(mime);
        format.set_integer(keys::WIDTH, width as i64);
        format.set_integer(keys::HEIGHT, height as i64);
        format
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        let mut format = Self::new(mime);
        format.set_integer(keys::SAMPLE_RATE, sample_rate as i64);
        format.set_integer(keys::CHANNEL_COUNT, channel_count as i64);
        format
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn kind(&self) -> Option<TrackKind> {
        TrackKind::from_mime(&self.mime)
    }

    pub fn set_integer(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), FormatValue::Int(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.entries.insert(key.to_string(), FormatValue::Float(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), FormatValue::Str(value.to_string()));
    }

    pub fn set_bytes(&mut self, key: &str, value: Bytes) {
        self.entries.insert(key.to_string(), FormatValue::Bytes(value));
    }

    pub fn remove(&mut self, key: &str) -> Option<FormatValue> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(FormatValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(FormatValue::Float(v)) => Some(*v),
            Some(FormatValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&Bytes> {
        match self.entries.get(key) {
            Some(FormatValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{mime={}", self.mime)?;
        for (key, value) in &self.entries {
            match value {
                FormatValue::Int(v) => write!(f, ", {}={}", key, v)?,
                FormatValue::Float(v) => write!(f, ", {}={}", key, v)?,
                FormatValue::Str(v) => write!(f, ", {}={}", key, v)?,
                FormatValue::Bytes(v) => write!(f, ", {}=<{} bytes>", key, v.len())?,
            }
        }
        f.write_str("}")
    }
}
