use ffmpeg_next::{format::Pixel, frame, software::scaling};

use crate::surface::{PixelLayout, VideoFrame};

pub struct Scaler {
    context: scaling::Context,
    source: Pixel,
}

impl Scaler {
    pub fn new(source: Pixel, target: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            source,
            width,
            height,
            target,
            width,
            height,
            scaling::flag::Flags::BILINEAR,
        )?;
        Ok(Self { context, source })
    }

    pub fn source(&self) -> Pixel {
        self.source
    }

    pub fn run(&mut self, frame: &frame::Video, dst: &mut frame::Video) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

pub fn pixel_for_layout(layout: PixelLayout) -> Pixel {
    match layout {
        PixelLayout::Rgba => Pixel::RGBA,
        PixelLayout::Yuv420p => Pixel::YUV420P,
    }
}

/// Copies a tightly packed frame into an FFmpeg frame, honouring its line
/// strides.
pub fn to_av_frame(src: &VideoFrame) -> anyhow::Result<frame::Video> {
    let expected = src.layout.frame_size(src.width, src.height);
    anyhow::ensure!(
        src.data.len() == expected,
        "frame holds {} bytes, {}x{} {:?} needs {}",
        src.data.len(),
        src.width,
        src.height,
        src.layout,
        expected
    );

    let (w, h) = (src.width as usize, src.height as usize);
    // (bytes per row, rows) for every plane
    let planes: &[(usize, usize)] = match src.layout {
        PixelLayout::Rgba => &[(w * 4, h)],
        PixelLayout::Yuv420p => &[(w, h), (w / 2, h / 2), (w / 2, h / 2)],
    };

    let mut dst = frame::Video::new(pixel_for_layout(src.layout), src.width, src.height);
    let mut offset = 0;
    for (plane, &(row_bytes, rows)) in planes.iter().enumerate() {
        let stride = dst.stride(plane);
        let data = dst.data_mut(plane);
        for row in 0..rows {
            let start = row * stride;
            data[start..start + row_bytes].copy_from_slice(&src.data[offset..offset + row_bytes]);
            offset += row_bytes;
        }
    }
    dst.set_pts(Some(src.pts_us));
    Ok(dst)
}
