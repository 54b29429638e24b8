use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, Result};

pub const DEFAULT_ENCODE_FRAME_RATE: u32 = 30;
pub const DEFAULT_KEY_FRAME_INTERVAL_SECS: u32 = 1;
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_AUDIO_CHANNELS: u32 = 2;
pub const DEFAULT_AUDIO_BITRATE: u32 = 128_000;
/// AAC low complexity object type.
pub const AAC_OBJECT_TYPE_LC: i64 = 2;

/// Rate control requested from the codec.
///
/// - `ConstantQuality` ignores the bitrate and lets the encoder balance quality
///   against size. Not every device supports it.
/// - `ConstantBitrate` holds the bitrate regardless of content.
/// - `VariableBitrate` targets the bitrate but spends more bits on high-motion
///   sections and fewer on static ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateMode {
    #[default]
    ConstantQuality,
    ConstantBitrate,
    VariableBitrate,
}

impl BitrateMode {
    /// Integer value stored under the `bitrate-mode` format key.
    pub fn as_format_value(&self) -> i64 {
        match self {
            BitrateMode::ConstantQuality => 0,
            BitrateMode::VariableBitrate => 1,
            BitrateMode::ConstantBitrate => 2,
        }
    }

    pub fn from_format_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(BitrateMode::ConstantQuality),
            1 => Some(BitrateMode::VariableBitrate),
            2 => Some(BitrateMode::ConstantBitrate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    /// Frames arrive through the codec's input surface.
    #[default]
    Surface,
    Yuv420Planar,
    Yuv420SemiPlanar,
}

impl ColorFormat {
    pub fn as_format_value(&self) -> i64 {
        match self {
            ColorFormat::Surface => 0x7F00_0789,
            ColorFormat::Yuv420Planar => 19,
            ColorFormat::Yuv420SemiPlanar => 21,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: i32,
    pub height: i32,
    // bps, None = 3 * width * height
    pub bitrate: Option<u32>,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
    pub color_format: ColorFormat,
    pub bitrate_mode: BitrateMode,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: None,
            frame_rate: DEFAULT_ENCODE_FRAME_RATE,
            key_frame_interval_secs: DEFAULT_KEY_FRAME_INTERVAL_SECS,
            color_format: ColorFormat::Surface,
            bitrate_mode: BitrateMode::ConstantQuality,
        }
    }
}

impl VideoConfig {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_bitrate_mode(mut self, mode: BitrateMode) -> Self {
        self.bitrate_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(EncoderError::Configuration(format!(
                "encode width or height is invalid, width: {}, height: {}",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(EncoderError::Configuration(
                "frame rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Target bitrate in bits per second.
    pub fn effective_bitrate(&self) -> u32 {
        self.bitrate.unwrap_or_else(|| {
            let derived = 3u64 * self.width.max(0) as u64 * self.height.max(0) as u64;
            derived.min(u32::MAX as u64) as u32
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channel_count: u32,
    pub bitrate: u32,
    pub aac_profile: i64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            channel_count: DEFAULT_AUDIO_CHANNELS,
            bitrate: DEFAULT_AUDIO_BITRATE,
            aac_profile: AAC_OBJECT_TYPE_LC,
        }
    }
}

impl AudioConfig {
    pub fn new(sample_rate: u32, channel_count: u32) -> Self {
        Self {
            sample_rate,
            channel_count,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || !(1..=8).contains(&self.channel_count) {
            return Err(EncoderError::Configuration(format!(
                "audio sample rate or channel count is invalid, sample_rate: {}, channels: {}",
                self.sample_rate, self.channel_count
            )));
        }
        Ok(())
    }

    /// Bytes of interleaved 16-bit PCM per second of audio.
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channel_count as u64 * 2
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncoderConfig {
    Video(VideoConfig),
    Audio(AudioConfig),
}

/// Coordinator settings: which tracks to encode and how long to wait on them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output: PathBuf,
    pub video: Option<VideoConfig>,
    pub audio: Option<AudioConfig>,
    pub drain_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub max_pending_samples: usize,
    pub input_queue_bound: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("output.mp4"),
            video: Some(VideoConfig::default()),
            audio: None,
            drain_timeout_ms: 10,
            stop_timeout_ms: 5_000,
            max_pending_samples: 256,
            input_queue_bound: 128,
        }
    }
}

impl PipelineConfig {
    pub fn encoders(&self) -> Vec<EncoderConfig> {
        let mut configs = Vec::new();
        if let Some(video) = &self.video {
            configs.push(EncoderConfig::Video(video.clone()));
        }
        if let Some(audio) = &self.audio {
            configs.push(EncoderConfig::Audio(audio.clone()));
        }
        configs
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_derived_from_resolution() {
        let config = VideoConfig::new(1280, 720);
        assert_eq!(config.effective_bitrate(), 2_764_800);
        assert_eq!(config.with_bitrate(1_000_000).effective_bitrate(), 1_000_000);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        for (w, h) in [(0, 720), (1280, 0), (-1, 720), (1280, -5)] {
            let err = VideoConfig::new(w, h).validate().unwrap_err();
            assert!(matches!(err, EncoderError::Configuration(_)), "{w}x{h}");
        }
        assert!(VideoConfig::new(2, 2).validate().is_ok());
    }

    #[test]
    fn test_audio_validation() {
        assert!(AudioConfig::default().validate().is_ok());
        assert!(AudioConfig::new(0, 2).validate().is_err());
        assert!(AudioConfig::new(48_000, 0).validate().is_err());
        assert!(AudioConfig::new(48_000, 9).validate().is_err());
    }

    #[test]
    fn test_pipeline_config_from_json() {
        let json = r#"{
            "output": "/tmp/out.mp4",
            "video": { "width": 640, "height": 480, "bitrate_mode": "variable_bitrate" },
            "audio": { "sample_rate": 48000 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        let video = config.video.as_ref().unwrap();
        assert_eq!(video.width, 640);
        assert_eq!(video.frame_rate, DEFAULT_ENCODE_FRAME_RATE);
        assert_eq!(video.bitrate_mode, BitrateMode::VariableBitrate);
        let audio = config.audio.as_ref().unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.channel_count, DEFAULT_AUDIO_CHANNELS);
        assert_eq!(config.stop_timeout_ms, 5_000);
        assert_eq!(config.encoders().len(), 2);
    }
}
