use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;

use crate::error::{CodecError, EncoderError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba,
    Yuv420p,
}

impl PixelLayout {
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelLayout::Rgba => pixels * 4,
            PixelLayout::Yuv420p => pixels + 2 * (pixels / 4),
        }
    }
}

/// A rendered frame handed to an input surface.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pts_us: i64,
}

impl VideoFrame {
    pub fn new(data: Bytes, width: u32, height: u32, layout: PixelLayout, pts_us: i64) -> Self {
        Self {
            data,
            width,
            height,
            layout,
            pts_us,
        }
    }
}

/// Codec-side receiver behind a [`Surface`].
pub trait FrameSink: Send + Sync {
    fn render(&self, frame: VideoFrame) -> Result<(), CodecError>;

    /// No further frames will follow; the codec must flush and emit its
    /// end-of-stream sample.
    fn signal_end_of_stream(&self) -> Result<(), CodecError>;
}

struct SurfaceInner {
    sink: Box<dyn FrameSink>,
    width: u32,
    height: u32,
    closed: AtomicBool,
    frames: AtomicU64,
}

/// Drawable target that feeds a codec directly, bypassing manual buffer
/// submission. Cheap to clone; all clones share one end-of-stream state.
#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl Surface {
    pub fn new(sink: impl FrameSink + 'static, width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                sink: Box::new(sink),
                width,
                height,
                closed: AtomicBool::new(false),
                frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of frames accepted so far.
    pub fn frame_count(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    pub fn draw(&self, frame: VideoFrame) -> Result<()> {
        if self.is_closed() {
            return Err(EncoderError::SurfaceClosed);
        }
        if frame.width != self.inner.width || frame.height != self.inner.height {
            return Err(EncoderError::Configuration(format!(
                "frame dimensions {}x{} don't match surface {}x{}",
                frame.width, frame.height, self.inner.width, self.inner.height
            )));
        }
        self.inner.sink.render(frame)?;
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting frames and pushes end-of-stream into the codec.
    /// Only the first call reaches the codec.
    pub fn signal_end_of_stream(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!(
            "surface {}x{} end of stream after {} frames",
            self.inner.width,
            self.inner.height,
            self.frame_count()
        );
        self.inner.sink.signal_end_of_stream()?;
        Ok(())
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
