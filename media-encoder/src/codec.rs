//! The codec capability consumed by [`CodecSession`](crate::session::CodecSession).
//!
//! A codec is driven through numbered input and output buffers: the caller
//! dequeues a free input slot, fills it and queues it back, and polls for
//! output slots which must be released once their bytes have been copied.
//! Surface-driven codecs skip the input side entirely and receive frames
//! through the [`Surface`] they hand out.

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use crate::{error::CodecError, format::MediaFormat, surface::Surface};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 1 << 1;
        const END_OF_STREAM = 1 << 2;
    }
}

/// Timing and layout of one compressed chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl SampleInfo {
    pub fn new(size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            offset: 0,
            size,
            presentation_time_us,
            flags,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }
}

/// A compressed sample copied out of a codec output buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedSample {
    pub data: Bytes,
    pub info: SampleInfo,
}

impl EncodedSample {
    pub fn new(data: Bytes, presentation_time_us: i64, flags: BufferFlags) -> Self {
        let info = SampleInfo::new(data.len(), presentation_time_us, flags);
        Self { data, info }
    }

    pub fn pts_us(&self) -> i64 {
        self.info.presentation_time_us
    }

    pub fn size(&self) -> usize {
        self.info.size
    }
}

/// Result of polling a codec for output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    Buffer { index: usize, info: SampleInfo },
    /// The negotiated output format is available via [`Codec::output_format`].
    FormatChanged,
    TryAgainLater,
}

pub trait Codec: Send {
    /// Configures the codec for encoding. May be called again after a failed
    /// attempt with a modified format.
    fn configure(&mut self, format: &MediaFormat) -> Result<(), CodecError>;

    /// Returns a drawable target feeding the codec directly. Only valid
    /// between `configure` and `start`.
    fn create_input_surface(&mut self) -> Result<Surface, CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    /// Waits up to `timeout` for a free input slot.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    /// Waits up to `timeout` for encoded output.
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent, CodecError>;

    fn output_format(&self) -> Result<MediaFormat, CodecError>;

    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError>;

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    /// Frees the codec instance. Called exactly once by the owning session.
    fn release(&mut self);
}

/// Creates codec instances by mime type.
pub trait CodecFactory: Send + Sync {
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError>;
}
