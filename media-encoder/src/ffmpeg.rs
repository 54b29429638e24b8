//! FFmpeg-backed [`Codec`] implementation.
//!
//! Encoders open during `configure` so format and rate-control problems
//! surface before the pipeline starts. Video frames arrive through the input
//! surface over a bounded channel that the drain loop consumes. Audio arrives
//! as interleaved 16-bit PCM in manual input buffers and is re-chunked into
//! planar float frames of the encoder's frame size.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel},
    time::Duration,
};

use bytes::Bytes;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Packet, Rational, codec,
    format::{Sample, sample},
    frame,
};

use crate::{
    codec::{BufferFlags, Codec, CodecFactory, OutputEvent, SampleInfo},
    config::BitrateMode,
    error::CodecError,
    format::{MediaFormat, TrackKind, keys},
    hw,
    scaler::{self, Scaler},
    surface::{FrameSink, Surface, VideoFrame},
};

/// Bounded queue: a slow encoder back-pressures the renderer instead of
/// growing without limit.
const FRAME_QUEUE_BOUND: usize = 128;
const DEFAULT_CRF: &str = "23";
const DEFAULT_MAX_INPUT_SIZE: usize = 8192;
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;
const MICROSECONDS: i32 = 1_000_000;

/// Creates FFmpeg encoders by mime type.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegCodecFactory;

impl CodecFactory for FfmpegCodecFactory {
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        let software = hw::software_encoder(mime)
            .ok_or_else(|| CodecError::Unsupported(format!("no encoder for {}", mime)))?;
        let kind = TrackKind::from_mime(mime)
            .ok_or_else(|| CodecError::Unsupported(format!("unknown media type {}", mime)))?;
        Ok(Box::new(FfmpegCodec::new(mime, kind, software)))
    }
}

enum SurfaceCmd {
    Frame(VideoFrame),
    EndOfStream,
}

struct SurfaceSender {
    tx: SyncSender<SurfaceCmd>,
}

impl FrameSink for SurfaceSender {
    fn render(&self, frame: VideoFrame) -> Result<(), CodecError> {
        self.tx
            .send(SurfaceCmd::Frame(frame))
            .map_err(|_| CodecError::Runtime("encoder input surface released".to_string()))
    }

    fn signal_end_of_stream(&self) -> Result<(), CodecError> {
        self.tx
            .send(SurfaceCmd::EndOfStream)
            .map_err(|_| CodecError::Runtime("encoder input surface released".to_string()))
    }
}

enum Opened {
    Video(codec::encoder::Video),
    Audio(codec::encoder::Audio),
}

impl Opened {
    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        match self {
            Opened::Video(encoder) => encoder.send_eof(),
            Opened::Audio(encoder) => encoder.send_eof(),
        }
    }

    fn receive_packet(&mut self, packet: &mut Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            Opened::Video(encoder) => encoder.receive_packet(packet),
            Opened::Audio(encoder) => encoder.receive_packet(packet),
        }
    }

    fn extradata(&self) -> Option<Bytes> {
        let ptr = match self {
            Opened::Video(encoder) => unsafe { encoder.as_ptr() },
            Opened::Audio(encoder) => unsafe { encoder.as_ptr() },
        };
        unsafe {
            if ptr.is_null() || (*ptr).extradata.is_null() || (*ptr).extradata_size <= 0 {
                return None;
            }
            let data =
                std::slice::from_raw_parts((*ptr).extradata, (*ptr).extradata_size as usize);
            Some(Bytes::copy_from_slice(data))
        }
    }
}

enum Poll {
    Packet(Packet),
    Again,
    Eof,
}

/// PCM accumulated until a full encoder frame is available.
struct AudioFifo {
    channels: usize,
    sample_rate: u32,
    frame_size: usize,
    layout: ChannelLayout,
    planes: Vec<Vec<f32>>,
    /// Pts of the first buffered sample, in samples.
    next_pts: Option<i64>,
}

impl AudioFifo {
    fn push_s16(&mut self, bytes: &[u8], pts_us: i64) {
        if self.next_pts.is_none() || self.planes[0].is_empty() {
            self.next_pts = Some(pts_us * self.sample_rate as i64 / MICROSECONDS as i64);
        }
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            self.planes[i % self.channels].push(sample as f32 / 32768.0);
        }
    }

    fn buffered(&self) -> usize {
        self.planes[0].len()
    }

    /// Takes up to `frame_size` samples per channel as a planar float frame.
    fn take_frame(&mut self, samples: usize) -> frame::Audio {
        let samples = samples.min(self.buffered());
        let mut out = frame::Audio::new(Sample::F32(sample::Type::Planar), samples, self.layout);
        out.set_rate(self.sample_rate);
        let pts = self.next_pts.unwrap_or(0);
        out.set_pts(Some(pts));
        for (ch, plane) in self.planes.iter_mut().enumerate() {
            let dst = out.data_mut(ch);
            for (value, bytes) in plane.drain(..samples).zip(dst.chunks_exact_mut(4)) {
                bytes.copy_from_slice(&value.to_ne_bytes());
            }
        }
        self.next_pts = Some(pts + samples as i64);
        out
    }
}

pub struct FfmpegCodec {
    mime: String,
    kind: TrackKind,
    software: &'static str,
    codec_name: String,
    encoder: Option<Opened>,
    format: Option<MediaFormat>,
    surface_rx: Option<Receiver<SurfaceCmd>>,
    scaler: Option<Scaler>,
    audio: Option<AudioFifo>,
    started: bool,
    eof_sent: bool,
    eos_emitted: bool,
    format_reported: bool,
    stashed: Option<Packet>,
    last_pts_us: i64,
    output: Vec<u8>,
    output_busy: bool,
    input: Vec<u8>,
    input_busy: bool,
}

impl FfmpegCodec {
    pub fn new(mime: &str, kind: TrackKind, software: &'static str) -> Self {
        Self {
            mime: mime.to_string(),
            kind,
            software,
            codec_name: String::new(),
            encoder: None,
            format: None,
            surface_rx: None,
            scaler: None,
            audio: None,
            started: false,
            eof_sent: false,
            eos_emitted: false,
            format_reported: false,
            stashed: None,
            last_pts_us: 0,
            output: Vec::new(),
            output_busy: false,
            input: Vec::new(),
            input_busy: false,
        }
    }

    /// Name of the FFmpeg encoder that opened, empty before `configure`.
    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn candidates(&self) -> Vec<ffmpeg_next::Codec> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(codec) = hw::find_hw_encoder(self.software) {
            candidates.push(codec);
        }
        match ffmpeg_next::encoder::find_by_name(self.software) {
            Some(codec) => candidates.push(codec),
            None => log::warn!("software encoder {} not available", self.software),
        }
        candidates
    }

    fn open_video(
        codec: ffmpeg_next::Codec,
        format: &MediaFormat,
    ) -> Result<codec::encoder::Video, CodecError> {
        let name = codec.name().to_string();
        let width = format.integer(keys::WIDTH).unwrap_or(0);
        let height = format.integer(keys::HEIGHT).unwrap_or(0);
        if width % 2 != 0 || height % 2 != 0 {
            return Err(CodecError::Configuration(format!(
                "{} needs even dimensions, got {}x{}",
                name, width, height
            )));
        }
        let frame_rate = format.integer(keys::FRAME_RATE).unwrap_or(30).max(1) as i32;
        let bitrate = format.integer(keys::BIT_RATE).unwrap_or(0).max(0) as usize;
        let interval = format.integer(keys::I_FRAME_INTERVAL).unwrap_or(1).max(0) as u32;
        let mode = format
            .integer(keys::BITRATE_MODE)
            .and_then(BitrateMode::from_format_value);

        let mut encoder = codec::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| CodecError::Configuration(e.to_string()))?;
        encoder.set_width(width as u32);
        encoder.set_height(height as u32);
        encoder.set_format(hw::pixel_format_for_encoder(&name));
        encoder.set_frame_rate(Some(Rational::new(frame_rate, 1)));
        encoder.set_time_base(Rational::new(1, MICROSECONDS));
        encoder.set_gop((frame_rate as u32 * interval).max(1));
        // no reordering, so packets come out in presentation order
        encoder.set_max_b_frames(0);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if name == "libx264" {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
        }
        match mode {
            Some(BitrateMode::ConstantQuality) => {
                if !hw::supports_constant_quality(&name) {
                    return Err(CodecError::BitrateModeUnsupported(BitrateMode::ConstantQuality));
                }
                opts.set("crf", DEFAULT_CRF);
            }
            Some(BitrateMode::ConstantBitrate) => {
                encoder.set_bit_rate(bitrate);
                encoder.set_max_bit_rate(bitrate);
                if name == "libx264" {
                    opts.set("nal-hrd", "cbr");
                } else if hw::is_hw_encoder(&name) {
                    opts.set("rc", "cbr");
                }
            }
            Some(BitrateMode::VariableBitrate) | None => encoder.set_bit_rate(bitrate),
        }

        encoder
            .open_with(opts)
            .map_err(|e| CodecError::Configuration(format!("failed to open {}: {}", name, e)))
    }

    fn open_audio(
        codec: ffmpeg_next::Codec,
        format: &MediaFormat,
    ) -> Result<(codec::encoder::Audio, AudioFifo), CodecError> {
        let name = codec.name().to_string();
        let sample_rate = format.integer(keys::SAMPLE_RATE).unwrap_or(0) as u32;
        let channels = format.integer(keys::CHANNEL_COUNT).unwrap_or(0) as usize;
        let layout = match channels {
            1 => ChannelLayout::MONO,
            2 => ChannelLayout::STEREO,
            other => {
                return Err(CodecError::Configuration(format!(
                    "{} supports mono or stereo input, got {} channels",
                    name, other
                )));
            }
        };

        let mut encoder = codec::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| CodecError::Configuration(e.to_string()))?;
        encoder.set_rate(sample_rate as i32);
        encoder.set_channel_layout(layout);
        encoder.set_format(Sample::F32(sample::Type::Planar));
        encoder.set_time_base(Rational::new(1, sample_rate as i32));
        if let Some(bitrate) = format.integer(keys::BIT_RATE) {
            encoder.set_bit_rate(bitrate.max(0) as usize);
        }
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let encoder = encoder
            .open_with(Dictionary::new())
            .map_err(|e| CodecError::Configuration(format!("failed to open {}: {}", name, e)))?;
        let frame_size = match encoder.frame_size() as usize {
            0 => DEFAULT_AUDIO_FRAME_SIZE,
            n => n,
        };
        let fifo = AudioFifo {
            channels,
            sample_rate,
            frame_size,
            layout,
            planes: vec![Vec::new(); channels],
            next_pts: None,
        };
        Ok((encoder, fifo))
    }

    fn send_video(&mut self, frame: VideoFrame) -> Result<(), CodecError> {
        let Some(Opened::Video(encoder)) = self.encoder.as_mut() else {
            return Err(CodecError::Runtime("video encoder not open".to_string()));
        };
        let source = scaler::to_av_frame(&frame).map_err(|e| CodecError::Runtime(e.to_string()))?;
        let target = encoder.format();
        if source.format() == target {
            return encoder
                .send_frame(&source)
                .map_err(|e| CodecError::Runtime(e.to_string()));
        }

        if self.scaler.as_ref().map(|s| s.source()) != Some(source.format()) {
            self.scaler = Some(
                Scaler::new(source.format(), target, frame.width, frame.height)
                    .map_err(|e| CodecError::Runtime(e.to_string()))?,
            );
        }
        let mut converted = frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(&source, &mut converted)
                .map_err(|e| CodecError::Runtime(e.to_string()))?;
        }
        converted.set_pts(source.pts());
        encoder
            .send_frame(&converted)
            .map_err(|e| CodecError::Runtime(e.to_string()))
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        if self.eof_sent {
            return Ok(());
        }
        self.eof_sent = true;
        if let Some(encoder) = self.encoder.as_mut() {
            encoder
                .send_eof()
                .map_err(|e| CodecError::Runtime(e.to_string()))?;
        }
        Ok(())
    }

    /// Encodes every complete frame buffered in the fifo; on end of stream
    /// the short remainder too.
    fn send_audio(&mut self, flush: bool) -> Result<(), CodecError> {
        let (Some(Opened::Audio(encoder)), Some(fifo)) = (self.encoder.as_mut(), self.audio.as_mut())
        else {
            return Err(CodecError::Runtime("audio encoder not open".to_string()));
        };
        while fifo.buffered() >= fifo.frame_size || (flush && fifo.buffered() > 0) {
            let frame = fifo.take_frame(fifo.frame_size);
            encoder
                .send_frame(&frame)
                .map_err(|e| CodecError::Runtime(e.to_string()))?;
        }
        Ok(())
    }

    fn poll_packet(&mut self) -> Result<Poll, CodecError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(CodecError::Runtime("encoder not open".to_string()));
        };
        let mut packet = Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => Ok(Poll::Packet(packet)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(Poll::Again)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(Poll::Eof),
            Err(e) => Err(CodecError::Runtime(e.to_string())),
        }
    }

    /// Packet time in microseconds; audio packets count samples. Encoder
    /// priming can make the first audio packets negative.
    fn packet_pts_us(&self, packet: &Packet) -> Option<i64> {
        let pts = packet.pts().or(packet.dts())?;
        match &self.audio {
            Some(fifo) if fifo.sample_rate > 0 => {
                Some(pts * MICROSECONDS as i64 / fifo.sample_rate as i64)
            }
            _ => Some(pts),
        }
    }

    fn emit(&mut self, packet: Packet) -> OutputEvent {
        let pts_us = self.packet_pts_us(&packet).unwrap_or(self.last_pts_us);
        self.last_pts_us = pts_us;
        self.output.clear();
        self.output.extend_from_slice(packet.data().unwrap_or_default());
        let flags = if packet.is_key() {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::empty()
        };
        self.output_busy = true;
        OutputEvent::Buffer {
            index: 0,
            info: SampleInfo::new(self.output.len(), pts_us, flags),
        }
    }

    /// Moves one queued surface command into the encoder. Returns false when
    /// nothing arrived within `timeout`.
    fn pump_surface(&mut self, timeout: Duration) -> Result<bool, CodecError> {
        let Some(rx) = self.surface_rx.as_ref() else {
            std::thread::sleep(timeout);
            return Ok(false);
        };
        match rx.recv_timeout(timeout) {
            Ok(SurfaceCmd::Frame(frame)) => {
                self.send_video(frame)?;
                Ok(true)
            }
            Ok(SurfaceCmd::EndOfStream) | Err(RecvTimeoutError::Disconnected) => {
                self.send_eof()?;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
        }
    }
}

impl Codec for FfmpegCodec {
    fn configure(&mut self, format: &MediaFormat) -> Result<(), CodecError> {
        if self.started {
            return Err(CodecError::Runtime("codec already started".to_string()));
        }
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(CodecError::Unsupported(format!(
                "no FFmpeg encoder for {}",
                self.mime
            )));
        }

        let mut last_error = None;
        for codec in candidates {
            let name = codec.name().to_string();
            let opened = match self.kind {
                TrackKind::Video => Self::open_video(codec, format).map(|e| (Opened::Video(e), None)),
                TrackKind::Audio => {
                    Self::open_audio(codec, format).map(|(e, fifo)| (Opened::Audio(e), Some(fifo)))
                }
            };
            match opened {
                Ok((encoder, fifo)) => {
                    log::info!("encoder opened successfully: {}", name);
                    self.encoder = Some(encoder);
                    self.audio = fifo;
                    self.codec_name = name;
                    self.format = Some(format.clone());
                    let max_input = format
                        .integer(keys::MAX_INPUT_SIZE)
                        .map(|v| v.max(2) as usize)
                        .unwrap_or(DEFAULT_MAX_INPUT_SIZE);
                    self.input = vec![0; max_input & !1];
                    return Ok(());
                }
                Err(e) => {
                    if hw::is_hw_encoder(&name) {
                        log::warn!("hardware encoder {} failed: {}, falling back to {}", name, e, self.software);
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CodecError::Unsupported(self.mime.clone())))
    }

    fn create_input_surface(&mut self) -> Result<Surface, CodecError> {
        if self.kind != TrackKind::Video {
            return Err(CodecError::Unsupported("audio encoders have no input surface".to_string()));
        }
        let Some(format) = self.format.as_ref() else {
            return Err(CodecError::Runtime("codec not configured".to_string()));
        };
        if self.surface_rx.is_some() {
            return Err(CodecError::Runtime("input surface already created".to_string()));
        }
        let width = format.integer(keys::WIDTH).unwrap_or(0) as u32;
        let height = format.integer(keys::HEIGHT).unwrap_or(0) as u32;
        let (tx, rx) = sync_channel(FRAME_QUEUE_BOUND);
        self.surface_rx = Some(rx);
        Ok(Surface::new(SurfaceSender { tx }, width, height))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.encoder.is_none() {
            return Err(CodecError::Runtime("codec not configured".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError> {
        if self.audio.is_none() {
            return Err(CodecError::Unsupported("encoder takes input from its surface".to_string()));
        }
        if self.input_busy || self.eof_sent {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        self.input_busy = true;
        Ok(Some(0))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        if index != 0 || !self.input_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(&mut self.input)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if index != 0 || !self.input_busy || size > self.input.len() {
            return Err(CodecError::InvalidIndex(index));
        }
        self.input_busy = false;
        if let Some(fifo) = self.audio.as_mut() {
            fifo.push_s16(&self.input[..size], presentation_time_us);
        }
        let end_of_stream = flags.contains(BufferFlags::END_OF_STREAM);
        self.send_audio(end_of_stream)?;
        if end_of_stream {
            self.send_eof()?;
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent, CodecError> {
        if self.output_busy {
            return Err(CodecError::Runtime("previous output buffer not released".to_string()));
        }
        if !self.started {
            return Err(CodecError::Runtime("codec not started".to_string()));
        }
        if let Some(packet) = self.stashed.take() {
            return Ok(self.emit(packet));
        }
        if self.eos_emitted {
            std::thread::sleep(timeout);
            return Ok(OutputEvent::TryAgainLater);
        }

        loop {
            match self.poll_packet()? {
                Poll::Packet(packet) => {
                    if !self.format_reported {
                        self.format_reported = true;
                        self.stashed = Some(packet);
                        return Ok(OutputEvent::FormatChanged);
                    }
                    return Ok(self.emit(packet));
                }
                Poll::Eof => {
                    self.eos_emitted = true;
                    self.output.clear();
                    self.output_busy = true;
                    return Ok(OutputEvent::Buffer {
                        index: 0,
                        info: SampleInfo::new(0, self.last_pts_us, BufferFlags::END_OF_STREAM),
                    });
                }
                Poll::Again => {
                    // keep feeding while frames are queued on the surface
                    if self.kind == TrackKind::Video && !self.eof_sent {
                        if self.pump_surface(timeout)? {
                            continue;
                        }
                    } else {
                        std::thread::sleep(timeout);
                    }
                    return Ok(OutputEvent::TryAgainLater);
                }
            }
        }
    }

    fn output_format(&self) -> Result<MediaFormat, CodecError> {
        let mut format = self
            .format
            .clone()
            .ok_or_else(|| CodecError::Runtime("codec not configured".to_string()))?;
        format.remove(keys::BITRATE_MODE);
        format.remove(keys::MAX_INPUT_SIZE);
        format.set_string("encoder", &self.codec_name);
        if let Some(extradata) = self.encoder.as_ref().and_then(|e| e.extradata()) {
            format.set_bytes(keys::CSD_0, extradata);
        }
        if let Some(fifo) = &self.audio {
            format.set_integer("frame-size", fifo.frame_size as i64);
        }
        if let Some(Opened::Video(encoder)) = &self.encoder {
            let pixel: ffmpeg_next::ffi::AVPixelFormat = encoder.format().into();
            format.set_integer(keys::PIXEL_FORMAT, pixel as i64);
        }
        Ok(format)
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError> {
        if index != 0 || !self.output_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(&self.output)
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError> {
        if index != 0 || !self.output_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        self.output_busy = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.started = false;
        self.surface_rx = None;
        Ok(())
    }

    fn release(&mut self) {
        self.surface_rx = None;
        self.scaler = None;
        self.stashed = None;
        self.audio = None;
        if self.encoder.take().is_some() {
            log::debug!("{} released ({})", self.codec_name, self.mime);
        }
    }
}
