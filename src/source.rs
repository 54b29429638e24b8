//! Synthetic inputs: moving colour bars and a sine tone.

use bytes::Bytes;
use media_encoder::{PixelLayout, VideoFrame};

const BARS: [[u8; 3]; 7] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
];

pub struct TestPattern {
    width: u32,
    height: u32,
    frame_us: i64,
    index: i64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_us: 1_000_000 / frame_rate.max(1) as i64,
            index: 0,
        }
    }

    pub fn frame_duration_us(&self) -> i64 {
        self.frame_us
    }

    /// Renders the next frame; bars scroll one pixel column per frame.
    pub fn next_frame(&mut self) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_width = (w / BARS.len()).max(1);
        let shift = self.index as usize;
        let mut data = Vec::with_capacity(w * h * 4);
        for _ in 0..h {
            for x in 0..w {
                let [r, g, b] = BARS[((x + shift) / bar_width) % BARS.len()];
                data.extend_from_slice(&[r, g, b, 255]);
            }
        }
        let pts = self.index * self.frame_us;
        self.index += 1;
        VideoFrame::new(Bytes::from(data), self.width, self.height, PixelLayout::Rgba, pts)
    }
}

/// Interleaved 16-bit little-endian PCM.
pub struct Tone {
    sample_rate: u32,
    channels: u32,
    hz: f64,
    position: u64,
}

impl Tone {
    pub fn new(sample_rate: u32, channels: u32, hz: f64) -> Self {
        Self {
            sample_rate,
            channels,
            hz,
            position: 0,
        }
    }

    /// Next `samples` samples per channel, with the pts of the first one.
    pub fn next_chunk(&mut self, samples: usize) -> (Bytes, i64) {
        let pts = (self.position * 1_000_000 / self.sample_rate.max(1) as u64) as i64;
        let mut data = Vec::with_capacity(samples * self.channels as usize * 2);
        for i in 0..samples as u64 {
            let t = (self.position + i) as f64 / self.sample_rate as f64;
            let value = ((t * self.hz * std::f64::consts::TAU).sin() * 0.25 * i16::MAX as f64) as i16;
            for _ in 0..self.channels {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        self.position += samples as u64;
        (Bytes::from(data), pts)
    }
}
