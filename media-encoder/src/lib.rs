/// Registers FFmpeg components. Call once at startup before building an
/// [`ffmpeg::FfmpegCodecFactory`] or [`output::FileWriter`].
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod audio;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod format;
pub mod muxer;
pub mod pipeline;
pub mod session;
pub mod surface;
pub mod video;
pub mod writer;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ffmpeg")]
pub mod hw;
#[cfg(feature = "ffmpeg")]
pub mod output;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

#[cfg(test)]
mod testing;

pub use config::{AudioConfig, BitrateMode, PipelineConfig, VideoConfig};
pub use error::{CodecError, EncoderError, MuxerError};
pub use pipeline::{Pipeline, PipelineState, RecordingSummary};
pub use surface::{PixelLayout, Surface, VideoFrame};
